//! Brute-force login blocking
//!
//! Counts failed logins per username and per client IP, partitioned by
//! tenant, and blocks a key once its failures reach the configured threshold.
//! A block lasts until the most recent failure is older than the block window
//! or an administrator lifts it.
//!
//! # Architecture
//!
//! - **Service approach**: Construct [`LoginBlocker`] once, pass via `State`
//! - **Middleware approach**: Use [`BlockingMiddleware`] for automatic enforcement
//! - **Administration**: Mount [`admin::router`] behind your admin auth
//! - **Notifications**: Register [`BlockNotification`] handlers for events
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use authblock::blocking::{LoginBlocker, StaticConfigProvider, BlockingConfig};
//!
//! let blocker = LoginBlocker::new(topology, Arc::new(provider), Arc::new(directory));
//!
//! // In your login handler:
//! match blocker.check_login(&username, &peer, forwarded, &tenant) {
//!     LoginCheck::UserBlocked => return Err(Error::UserBlocked(username)),
//!     LoginCheck::IpBlocked => return Err(Error::IpBlocked(peer)),
//!     LoginCheck::Allowed => {}
//! }
//!
//! if authenticate(&creds).await.is_err() {
//!     blocker.record_failure(&username, &peer, forwarded, &tenant);
//! }
//! ```

pub mod admin;
pub mod config;
pub mod ledger;
pub mod middleware;
pub mod notification;
pub mod service;

pub use config::{
    BlockingConfig, BlockingSettings, CachedConfigProvider, ConfigProvider, SettingsSource,
    StaticConfigProvider, TenantBlockingSettings, TomlSettingsFile,
};
pub use ledger::{check_and_evict, AttemptLedger, AttemptSequence, Dimension, FailureRecord, Verdict};
pub use middleware::BlockingMiddleware;
pub use notification::{BlockEvent, BlockNotification, UnblockReason};
pub use service::{BlockedIp, BlockedUser, LoginBlocker, LoginCheck};
