//! Administrative HTTP endpoints
//!
//! Lists blocked users and IPs and lifts blocks. The router performs no
//! authorization: mount it behind the host's admin authentication.

use std::convert::Infallible;
use std::net::SocketAddr;

use axum::{
    extract::{ConnectInfo, FromRequestParts, Path, Request, State},
    http::request::Parts,
    routing::{delete, get},
    Json, Router,
};
use serde::{Deserialize, Serialize};

use super::middleware::{format_peer, forwarded_for};
use super::service::{BlockedIp, BlockedUser, LoginBlocker};
use crate::tenant::TenantId;

/// Tenant of the request, if a [`TenantId`] extension was set upstream
#[derive(Debug, Clone)]
pub struct RequestTenant(pub Option<TenantId>);

impl RequestTenant {
    fn or_primary(self, blocker: &LoginBlocker) -> TenantId {
        self.0
            .unwrap_or_else(|| blocker.topology().primary().clone())
    }
}

impl<S> FromRequestParts<S> for RequestTenant
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(Self(parts.extensions.get::<TenantId>().cloned()))
    }
}

/// Response of the unblock endpoints
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnblockResponse {
    /// Whether any failure was on record
    pub unblocked: bool,
}

/// Response of `GET /current-ip`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CurrentIpResponse {
    /// Effective IP of the caller
    pub ip: String,
}

/// Build the admin router
///
/// | Method | Path | |
/// |--------|------|-|
/// | GET | `/blocked/users` | blocked users, most recent first |
/// | GET | `/blocked/ips` | blocked IPs, most recent first |
/// | DELETE | `/blocked/users/{username}` | unblock a user |
/// | DELETE | `/blocked/ips/{ip}` | unblock an IP |
/// | GET | `/current-ip` | the caller's effective IP |
pub fn router(blocker: LoginBlocker) -> Router {
    Router::new()
        .route("/blocked/users", get(list_users))
        .route("/blocked/ips", get(list_ips))
        .route("/blocked/users/{username}", delete(unblock_user))
        .route("/blocked/ips/{ip}", delete(unblock_ip))
        .route("/current-ip", get(current_ip))
        .with_state(blocker)
}

async fn list_users(
    State(blocker): State<LoginBlocker>,
    tenant: RequestTenant,
) -> Json<Vec<BlockedUser>> {
    let tenant = tenant.or_primary(&blocker);
    Json(blocker.list_blocked_users(&tenant))
}

async fn list_ips(
    State(blocker): State<LoginBlocker>,
    tenant: RequestTenant,
) -> Json<Vec<BlockedIp>> {
    let tenant = tenant.or_primary(&blocker);
    Json(blocker.list_blocked_ips(&tenant))
}

async fn unblock_user(
    State(blocker): State<LoginBlocker>,
    tenant: RequestTenant,
    Path(username): Path<String>,
) -> Json<UnblockResponse> {
    let tenant = tenant.or_primary(&blocker);
    Json(UnblockResponse {
        unblocked: blocker.unblock_user(&username, &tenant),
    })
}

async fn unblock_ip(
    State(blocker): State<LoginBlocker>,
    tenant: RequestTenant,
    Path(ip): Path<String>,
) -> Json<UnblockResponse> {
    let tenant = tenant.or_primary(&blocker);
    Json(UnblockResponse {
        unblocked: blocker.unblock_ip(&ip, &tenant),
    })
}

async fn current_ip(
    State(blocker): State<LoginBlocker>,
    tenant: RequestTenant,
    request: Request,
) -> Json<CurrentIpResponse> {
    let tenant = tenant.or_primary(&blocker);
    let remote_addr = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| format_peer(addr.ip()))
        .unwrap_or_default();
    let forwarded = forwarded_for(request.headers());
    Json(CurrentIpResponse {
        ip: blocker.current_effective_ip(&remote_addr, forwarded.as_deref(), &tenant),
    })
}
