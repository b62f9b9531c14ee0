//! Block lifecycle notification hooks
//!
//! Handlers receive failure, threshold and unblock events. Events are
//! dispatched via `tokio::spawn` so they never delay the login response.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::ledger::Dimension;
use crate::tenant::TenantId;

/// Events emitted during the block lifecycle
///
/// Dispatched to [`BlockNotification`] handlers via fire-and-forget
/// `tokio::spawn`, so handlers should be lightweight and non-blocking.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum BlockEvent {
    /// A failed login was appended to the ledger
    FailureRecorded {
        /// Counted dimension
        dimension: Dimension,
        /// Partition the failure was recorded in
        tenant: TenantId,
        /// Username or effective IP
        key: String,
        /// Failures on record after the append
        attempt_count: usize,
        /// When the failure was recorded
        at: DateTime<Utc>,
    },
    /// A key's failures just reached the blocking threshold
    ThresholdReached {
        /// Counted dimension
        dimension: Dimension,
        /// Partition holding the key
        tenant: TenantId,
        /// Username or effective IP
        key: String,
        /// Configured threshold
        max_attempts: u32,
        /// Block window in seconds
        block_time_secs: u64,
    },
    /// A key is no longer blocked
    Unblocked {
        /// Counted dimension
        dimension: Dimension,
        /// Partition holding the key
        tenant: TenantId,
        /// Username or effective IP
        key: String,
        /// Why the block ended
        reason: UnblockReason,
    },
}

/// Reason a key was unblocked
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum UnblockReason {
    /// The last failure aged out of the block window
    Expired,
    /// An administrator removed the key's failures
    AdminAction,
}

impl std::fmt::Display for UnblockReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Expired => write!(f, "expired"),
            Self::AdminAction => write!(f, "admin_action"),
        }
    }
}

/// Trait for receiving block lifecycle notifications
///
/// Implement this to send alerts, write audit records or feed a firewall.
/// Handlers are invoked asynchronously and must not panic.
///
/// # Example
///
/// ```rust,ignore
/// use authblock::blocking::{BlockEvent, BlockNotification};
///
/// struct AlertNotifier;
///
/// #[async_trait]
/// impl BlockNotification for AlertNotifier {
///     async fn on_event(&self, event: BlockEvent) {
///         if let BlockEvent::ThresholdReached { key, .. } = event {
///             // page_security_team(&key).await;
///         }
///     }
/// }
/// ```
#[async_trait]
pub trait BlockNotification: Send + Sync + 'static {
    /// Called when a block lifecycle event occurs
    ///
    /// Runs inside `tokio::spawn`. Implementations handle their own errors.
    async fn on_event(&self, event: BlockEvent);
}
