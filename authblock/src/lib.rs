//! # authblock
//!
//! Brute-force login protection for multi-tenant services.
//!
//! Failed logins are counted per username and per client IP inside each
//! tenant's partition. Once a key reaches its tenant's threshold it stays
//! blocked until its most recent failure leaves the block window, or until an
//! administrator unblocks it. State lives in process memory only.
//!
//! ## Features
//!
//! - **Per-user and per-IP thresholds**, each with its own block window
//! - **Multi-tenant**: primary/secondary tenants, global users accounted in the primary
//! - **Proxy aware**: `X-Forwarded-For` honoured from trusted proxies only
//! - **Fail-open**: unconfigured tenants never block
//! - **axum integration**: login middleware returning 423, admin router
//! - **Layered configuration**: defaults, TOML files, environment
//!
//! ## Example
//!
//! ```rust,no_run
//! use authblock::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let config = Config::load()?;
//!     init_tracing(&config)?;
//!
//!     let blocker = LoginBlocker::new(
//!         config.blocking.topology(),
//!         Arc::new(config.blocking_provider()),
//!         Arc::new(InMemoryUserDirectory::new()),
//!     );
//!
//!     let login = BlockingMiddleware::new(blocker.clone(), "username");
//!     let app = Router::new()
//!         .route("/login", post(|| async { StatusCode::UNAUTHORIZED }))
//!         .route_layer(axum::middleware::from_fn_with_state(
//!             login,
//!             BlockingMiddleware::middleware,
//!         ))
//!         .nest("/admin", admin::router(blocker));
//!
//!     let listener = tokio::net::TcpListener::bind("0.0.0.0:8080").await?;
//!     axum::serve(
//!         listener,
//!         app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
//!     )
//!     .await?;
//!     Ok(())
//! }
//! ```

pub mod blocking;
pub mod clock;
pub mod config;
pub mod error;
pub mod ip;
pub mod observability;
pub mod tenant;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::blocking::{
        admin, BlockEvent, BlockNotification, BlockedIp, BlockedUser, BlockingConfig,
        BlockingMiddleware, BlockingSettings, CachedConfigProvider, ConfigProvider, Dimension,
        LoginBlocker, LoginCheck, StaticConfigProvider, TomlSettingsFile, UnblockReason,
    };
    pub use crate::clock::{Clock, ManualClock, SystemClock};
    pub use crate::config::Config;
    pub use crate::error::{Error, ErrorResponse, Result};
    pub use crate::observability::init_tracing;
    pub use crate::tenant::{InMemoryUserDirectory, TenantId, TenantTopology, UserDirectory};

    pub use axum::{
        http::StatusCode,
        routing::{delete, get, post},
        Json, Router,
    };
    pub use std::sync::Arc;
}
