//! Blocking middleware for automatic enforcement
//!
//! Optional convenience middleware that guards login routes. Extracts the
//! username from the JSON request body, rejects blocked users and IPs, and
//! records a failure whenever the inner handler answers 401.

use std::net::{IpAddr, SocketAddr};

use axum::{
    body::Body,
    extract::{ConnectInfo, Request, State},
    http::{header::CONTENT_TYPE, HeaderMap, StatusCode},
    middleware::Next,
    response::Response,
};
use tracing::debug;

use super::service::{LoginBlocker, LoginCheck};
use crate::error::Error;
use crate::ip::FORWARDED_FOR_HEADER;
use crate::tenant::TenantId;

const MAX_BODY_BYTES: usize = 1024 * 1024;

/// Middleware state for automatic blocking enforcement
///
/// Wraps a [`LoginBlocker`] and the JSON field holding the username. Apply to
/// login routes using `axum::middleware::from_fn_with_state`.
///
/// # Behavior
///
/// 1. Non-JSON requests, and JSON bodies without the field or with an empty
///    one, pass through
/// 2. The tenant is taken from a [`TenantId`] request extension, defaulting
///    to the primary tenant
/// 3. The remote address comes from `ConnectInfo<SocketAddr>`; serve the app
///    with `into_make_service_with_connect_info::<SocketAddr>()`
/// 4. A blocked user or IP gets HTTP 423 and the attempt counts as a failure
/// 5. A 401 from the inner handler records a failure
///
/// # Example
///
/// ```rust,ignore
/// use authblock::blocking::{BlockingMiddleware, LoginBlocker};
///
/// let mw = BlockingMiddleware::new(blocker, "username");
///
/// let app = Router::new()
///     .route("/login", post(login_handler))
///     .route_layer(axum::middleware::from_fn_with_state(
///         mw,
///         BlockingMiddleware::middleware,
///     ));
/// ```
#[derive(Clone, Debug)]
pub struct BlockingMiddleware {
    blocker: LoginBlocker,
    identity_field: String,
}

impl BlockingMiddleware {
    /// Create a new blocking middleware
    ///
    /// `identity_field` is the JSON field name holding the username.
    pub fn new(blocker: LoginBlocker, identity_field: &str) -> Self {
        Self {
            blocker,
            identity_field: identity_field.to_string(),
        }
    }

    /// Middleware function for axum
    ///
    /// Use with `axum::middleware::from_fn_with_state`.
    pub async fn middleware(
        State(mw): State<Self>,
        request: Request<Body>,
        next: Next,
    ) -> Result<Response, Error> {
        let is_json = request
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|ct| ct.contains("application/json"))
            .unwrap_or(false);

        if !is_json {
            return Ok(next.run(request).await);
        }

        let (parts, body) = request.into_parts();
        let bytes = axum::body::to_bytes(body, MAX_BODY_BYTES)
            .await
            .map_err(|e| Error::BadRequest(format!("Failed to read request body: {}", e)))?;

        let username = serde_json::from_slice::<serde_json::Value>(&bytes)
            .ok()
            .and_then(|v| v.get(&mw.identity_field).cloned())
            .and_then(|v| v.as_str().map(|s| s.to_string()))
            .filter(|s| !s.is_empty());

        let Some(username) = username else {
            let request = Request::from_parts(parts, Body::from(bytes));
            return Ok(next.run(request).await);
        };

        let tenant = parts
            .extensions
            .get::<TenantId>()
            .cloned()
            .unwrap_or_else(|| mw.blocker.topology().primary().clone());
        let remote_addr = parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| format_peer(addr.ip()))
            .unwrap_or_default();
        let forwarded_for = forwarded_for(&parts.headers);

        match mw
            .blocker
            .check_login(&username, &remote_addr, forwarded_for.as_deref(), &tenant)
        {
            LoginCheck::Allowed => {}
            LoginCheck::UserBlocked => return Err(Error::UserBlocked(username)),
            LoginCheck::IpBlocked => {
                let ip = mw.blocker.current_effective_ip(
                    &remote_addr,
                    forwarded_for.as_deref(),
                    &tenant,
                );
                return Err(Error::IpBlocked(ip));
            }
        }

        let request = Request::from_parts(parts, Body::from(bytes));
        let response = next.run(request).await;

        if response.status() == StatusCode::UNAUTHORIZED {
            debug!(tenant = %tenant, username = %username, "Login rejected by handler");
            mw.blocker
                .record_failure(&username, &remote_addr, forwarded_for.as_deref(), &tenant);
        }

        Ok(response)
    }
}

/// Textual peer address as matched against the trusted proxy list
///
/// IPv6 peers are bracketed (`[::1]`), IPv4-mapped IPv6 peers are unmapped.
pub fn format_peer(ip: IpAddr) -> String {
    match ip {
        IpAddr::V4(v4) => v4.to_string(),
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => v4.to_string(),
            None => format!("[{}]", v6),
        },
    }
}

/// Value of the forwarded-for header, if present and readable
pub fn forwarded_for(headers: &HeaderMap) -> Option<String> {
    headers
        .get(FORWARDED_FOR_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use axum::{routing::post, Json, Router};
    use serde_json::{json, Value};
    use tower::ServiceExt;

    use crate::blocking::config::{BlockingConfig, StaticConfigProvider};
    use crate::blocking::ledger::Dimension;
    use crate::tenant::{InMemoryUserDirectory, TenantTopology};

    fn blocker(max_user: u32, max_ip: u32) -> LoginBlocker {
        let config = BlockingConfig {
            max_user_attempts: max_user,
            user_block_time: Duration::from_secs(60),
            max_ip_attempts: max_ip,
            ip_block_time: Duration::from_secs(60),
            trusted_proxies: ["127.0.0.1".to_string()].into_iter().collect(),
            ..BlockingConfig::default()
        };
        LoginBlocker::new(
            TenantTopology::new("main"),
            Arc::new(StaticConfigProvider::new().with_tenant("main", config)),
            Arc::new(InMemoryUserDirectory::new()),
        )
    }

    async fn login(Json(body): Json<Value>) -> StatusCode {
        if body["password"] == "right" {
            StatusCode::OK
        } else {
            StatusCode::UNAUTHORIZED
        }
    }

    fn app(blocker: LoginBlocker) -> Router {
        let mw = BlockingMiddleware::new(blocker, "username");
        Router::new()
            .route("/login", post(login))
            .route_layer(axum::middleware::from_fn_with_state(
                mw,
                BlockingMiddleware::middleware,
            ))
    }

    fn request(body: Value, peer: &str) -> Request<Body> {
        let mut request = axum::http::Request::post("/login")
            .header(CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();
        let addr: SocketAddr = format!("{}:40000", peer).parse().unwrap();
        request.extensions_mut().insert(ConnectInfo(addr));
        request
    }

    async fn send(app: &Router, body: Value, peer: &str) -> (StatusCode, Value) {
        let response = app.clone().oneshot(request(body, peer)).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, json)
    }

    fn main_tenant() -> TenantId {
        TenantId::new("main")
    }

    #[tokio::test]
    async fn test_unauthorized_responses_record_failures() {
        let blocker = blocker(2, 0);
        let app = app(blocker.clone());
        let bad = json!({"username": "alice", "password": "wrong"});

        assert_eq!(send(&app, bad.clone(), "1.1.1.1").await.0, StatusCode::UNAUTHORIZED);
        assert_eq!(send(&app, bad.clone(), "1.1.1.1").await.0, StatusCode::UNAUTHORIZED);
        assert!(blocker.is_user_blocked("alice", &main_tenant()));

        // even the right password is refused while blocked
        let good = json!({"username": "alice", "password": "right"});
        let (status, body) = send(&app, good, "1.1.1.1").await;
        assert_eq!(status, StatusCode::LOCKED);
        assert_eq!(body["code"], "USER_BLOCKED");
        assert_eq!(
            blocker.ledger().attempt_count(Dimension::User, &main_tenant(), "alice"),
            3
        );
    }

    #[tokio::test]
    async fn test_blocked_ip_is_locked() {
        let blocker = blocker(0, 2);
        let app = app(blocker.clone());
        send(&app, json!({"username": "a", "password": "x"}), "5.5.5.5").await;
        send(&app, json!({"username": "b", "password": "x"}), "5.5.5.5").await;

        let (status, body) = send(&app, json!({"username": "c", "password": "right"}), "5.5.5.5").await;
        assert_eq!(status, StatusCode::LOCKED);
        assert_eq!(body["code"], "IP_BLOCKED");

        // another address is unaffected
        let (status, _) = send(&app, json!({"username": "c", "password": "right"}), "6.6.6.6").await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_successful_login_records_nothing() {
        let blocker = blocker(1, 1);
        let app = app(blocker.clone());
        let (status, _) = send(&app, json!({"username": "a", "password": "right"}), "5.5.5.5").await;
        assert_eq!(status, StatusCode::OK);
        assert!(blocker.list_blocked_users(&main_tenant()).is_empty());
        assert!(blocker.list_blocked_ips(&main_tenant()).is_empty());
    }

    #[tokio::test]
    async fn test_forwarded_header_from_trusted_proxy() {
        let blocker = blocker(0, 1);
        let app = app(blocker.clone());
        let mut req = request(json!({"username": "a", "password": "x"}), "127.0.0.1");
        req.headers_mut()
            .insert(FORWARDED_FOR_HEADER, "9.9.9.9, 127.0.0.1".parse().unwrap());
        app.clone().oneshot(req).await.unwrap();

        assert!(blocker.is_ip_blocked("9.9.9.9", None, &main_tenant()));
        assert!(!blocker.is_ip_blocked("127.0.0.1", None, &main_tenant()));
    }

    #[tokio::test]
    async fn test_tenant_extension_selects_partition() {
        let blocker = blocker(1, 0);
        let app = app(blocker.clone());
        let mut req = request(json!({"username": "a", "password": "x"}), "1.1.1.1");
        req.extensions_mut().insert(TenantId::new("sub"));
        app.clone().oneshot(req).await.unwrap();

        assert_eq!(
            blocker.ledger().attempt_count(Dimension::User, &TenantId::new("sub"), "a"),
            1
        );
        assert_eq!(
            blocker.ledger().attempt_count(Dimension::User, &main_tenant(), "a"),
            0
        );
    }

    #[tokio::test]
    async fn test_requests_without_identity_pass_through() {
        let blocker = blocker(1, 1);
        let app = app(blocker.clone());
        let (status, _) = send(&app, json!({"password": "x"}), "1.1.1.1").await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert!(blocker.list_blocked_ips(&main_tenant()).is_empty());

        let response = app
            .clone()
            .oneshot(
                axum::http::Request::post("/login")
                    .header(CONTENT_TYPE, "text/plain")
                    .body(Body::from("username=a"))
                    .unwrap(),
            )
            .await
            .unwrap();
        // the handler's Json extractor rejects it, untouched by the middleware
        assert_eq!(response.status(), StatusCode::UNSUPPORTED_MEDIA_TYPE);
    }

    #[tokio::test]
    async fn test_empty_username_is_not_tracked() {
        let blocker = blocker(2, 2);
        let app = app(blocker.clone());
        for _ in 0..3 {
            let (status, _) = send(&app, json!({"username": "", "password": "x"}), "5.5.5.5").await;
            assert_eq!(status, StatusCode::UNAUTHORIZED);
        }
        assert_eq!(
            blocker.ledger().attempt_count(Dimension::Ip, &main_tenant(), "5.5.5.5"),
            0
        );
        assert!(!blocker.is_ip_blocked("5.5.5.5", None, &main_tenant()));
    }

    #[test]
    fn test_format_peer() {
        assert_eq!(format_peer("10.0.0.1".parse().unwrap()), "10.0.0.1");
        assert_eq!(format_peer("::1".parse().unwrap()), "[::1]");
        assert_eq!(format_peer("::ffff:10.0.0.1".parse().unwrap()), "10.0.0.1");
    }
}
