//! Login blocking service
//!
//! [`LoginBlocker`] ties the per-tenant configuration, the tenant resolver,
//! the effective IP resolver and the [`AttemptLedger`] together. Every
//! operation is synchronous, performs no I/O and never fails: a tenant
//! without configuration simply has blocking disabled.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::config::{BlockingConfig, ConfigProvider};
use super::ledger::{AttemptLedger, Dimension, FailedAttempt, Verdict};
use super::notification::{BlockEvent, BlockNotification, UnblockReason};
use crate::clock::{Clock, SystemClock};
use crate::ip::resolve_effective_ip;
use crate::tenant::{resolve_user_tenant, TenantId, TenantTopology, UserDirectory};

/// A blocked username and its most recent failure
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockedUser {
    /// Blocked username
    pub username: String,
    /// Tenant partition listed
    pub tenant: TenantId,
    /// Most recent failed login
    pub last_attempt: DateTime<Utc>,
}

/// A blocked IP and its most recent failure
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockedIp {
    /// Blocked effective IP
    pub ip: String,
    /// Tenant partition listed
    pub tenant: TenantId,
    /// Most recent failed login
    pub last_attempt: DateTime<Utc>,
}

/// Outcome of the pre-authentication check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoginCheck {
    /// Credentials may be verified
    Allowed,
    /// The username is blocked
    UserBlocked,
    /// The effective client IP is blocked
    IpBlocked,
}

impl LoginCheck {
    /// Whether the attempt may proceed to credential verification
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed)
    }
}

/// Brute-force login protection
///
/// Construct once at startup and share via axum `State` or `Extension`;
/// clones share the same ledger.
///
/// # Example
///
/// ```rust,ignore
/// let blocker = LoginBlocker::new(
///     TenantTopology::new("main"),
///     Arc::new(StaticConfigProvider::new().with_tenant("main", config)),
///     Arc::new(InMemoryUserDirectory::new()),
/// );
///
/// // In your login handler:
/// if !blocker.check_login(&username, &peer, forwarded, &tenant).is_allowed() {
///     return Err(Error::UserBlocked(username));
/// }
/// if !credentials_ok {
///     blocker.record_failure(&username, &peer, forwarded, &tenant);
/// }
/// ```
#[derive(Clone)]
pub struct LoginBlocker {
    topology: TenantTopology,
    config: Arc<dyn ConfigProvider>,
    directory: Arc<dyn UserDirectory>,
    clock: Arc<dyn Clock>,
    ledger: Arc<AttemptLedger>,
    notifications: Vec<Arc<dyn BlockNotification>>,
}

impl std::fmt::Debug for LoginBlocker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoginBlocker")
            .field("topology", &self.topology)
            .field("notifications", &self.notifications.len())
            .finish_non_exhaustive()
    }
}

impl LoginBlocker {
    /// Create a blocker with an empty ledger and the system clock
    pub fn new(
        topology: TenantTopology,
        config: Arc<dyn ConfigProvider>,
        directory: Arc<dyn UserDirectory>,
    ) -> Self {
        Self {
            topology,
            config,
            directory,
            clock: Arc::new(SystemClock),
            ledger: Arc::new(AttemptLedger::new()),
            notifications: Vec::new(),
        }
    }

    /// Replace the time source
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Register a notification handler for block events
    ///
    /// Multiple handlers can be registered. Events are dispatched
    /// via `tokio::spawn` (fire-and-forget).
    pub fn with_notification(mut self, handler: Arc<dyn BlockNotification>) -> Self {
        self.notifications.push(handler);
        self
    }

    /// Tenant layout this blocker serves
    pub fn topology(&self) -> &TenantTopology {
        &self.topology
    }

    /// The underlying ledger
    pub fn ledger(&self) -> &AttemptLedger {
        &self.ledger
    }

    /// Record a failed login of `username` at `tenant`
    ///
    /// The user failure goes to the partition of the tenant owning the user.
    /// The IP failure goes to `tenant`'s partition unless the effective IP is
    /// whitelisted there. Empty usernames or addresses are ignored.
    pub fn record_failure(
        &self,
        username: &str,
        remote_addr: &str,
        forwarded_for: Option<&str>,
        tenant: &TenantId,
    ) {
        let config = self.config.blocking_config(tenant);
        let user_tenant = self.user_tenant(username, tenant);
        let ip = resolve_effective_ip(remote_addr, forwarded_for, &config.trusted_proxies);
        let tracked_ip = (!config.is_whitelisted(&ip)).then_some(ip.as_str());
        let now = self.clock.now();

        let counts = self.ledger.record_failure(
            FailedAttempt {
                user_tenant: &user_tenant,
                username,
                ip_tenant: tenant,
                ip: tracked_ip,
            },
            now,
        );

        debug!(
            tenant = %tenant,
            user_tenant = %user_tenant,
            username = username,
            ip = %ip,
            user_attempts = ?counts.user,
            ip_attempts = ?counts.ip,
            "Login failure recorded"
        );

        if let Some(count) = counts.user {
            self.after_append(Dimension::User, &user_tenant, username, count, &config, now);
        }
        if let (Some(count), Some(ip)) = (counts.ip, tracked_ip) {
            self.after_append(Dimension::Ip, tenant, ip, count, &config, now);
        }
    }

    /// Whether `username` is blocked at `tenant`
    ///
    /// Evicts the user's failures when the most recent one aged out.
    pub fn is_user_blocked(&self, username: &str, tenant: &TenantId) -> bool {
        let config = self.config.blocking_config(tenant);
        let user_tenant = self.user_tenant(username, tenant);
        self.check(Dimension::User, &user_tenant, username, &config)
    }

    /// Whether the effective client IP is blocked at `tenant`
    ///
    /// Evicts the IP's failures when the most recent one aged out.
    pub fn is_ip_blocked(
        &self,
        remote_addr: &str,
        forwarded_for: Option<&str>,
        tenant: &TenantId,
    ) -> bool {
        let config = self.config.blocking_config(tenant);
        let ip = resolve_effective_ip(remote_addr, forwarded_for, &config.trusted_proxies);
        if ip.is_empty() || config.is_whitelisted(&ip) {
            return false;
        }
        self.check(Dimension::Ip, tenant, &ip, &config)
    }

    /// Pre-authentication check
    ///
    /// An empty username is always allowed. The user block is checked before
    /// the IP block, and a rejected attempt is itself recorded as a failure so
    /// that an ongoing attack keeps the block fresh.
    pub fn check_login(
        &self,
        username: &str,
        remote_addr: &str,
        forwarded_for: Option<&str>,
        tenant: &TenantId,
    ) -> LoginCheck {
        if username.is_empty() {
            return LoginCheck::Allowed;
        }

        let verdict = if self.is_user_blocked(username, tenant) {
            info!(tenant = %tenant, username = username, "Skipping login: user is blocked");
            LoginCheck::UserBlocked
        } else if self.is_ip_blocked(remote_addr, forwarded_for, tenant) {
            info!(
                tenant = %tenant,
                username = username,
                ip = %self.current_effective_ip(remote_addr, forwarded_for, tenant),
                "Skipping login: IP is blocked"
            );
            LoginCheck::IpBlocked
        } else {
            LoginCheck::Allowed
        };

        if !verdict.is_allowed() {
            self.record_failure(username, remote_addr, forwarded_for, tenant);
        }
        verdict
    }

    /// Users of `tenant`'s partition at or above the threshold
    ///
    /// Most recent offender first.
    pub fn list_blocked_users(&self, tenant: &TenantId) -> Vec<BlockedUser> {
        let config = self.config.blocking_config(tenant);
        self.ledger
            .list_blocked(Dimension::User, tenant, config.max_user_attempts)
            .into_iter()
            .map(|(username, last_attempt)| BlockedUser {
                username,
                tenant: tenant.clone(),
                last_attempt,
            })
            .collect()
    }

    /// IPs of `tenant`'s partition at or above the threshold
    ///
    /// Most recent offender first.
    pub fn list_blocked_ips(&self, tenant: &TenantId) -> Vec<BlockedIp> {
        let config = self.config.blocking_config(tenant);
        self.ledger
            .list_blocked(Dimension::Ip, tenant, config.max_ip_attempts)
            .into_iter()
            .map(|(ip, last_attempt)| BlockedIp {
                ip,
                tenant: tenant.clone(),
                last_attempt,
            })
            .collect()
    }

    /// Forget every failure of `username`, returning whether any was tracked
    ///
    /// The user is looked up in the same partition [`Self::is_user_blocked`]
    /// consults.
    pub fn unblock_user(&self, username: &str, tenant: &TenantId) -> bool {
        let user_tenant = self.user_tenant(username, tenant);
        self.unblock(Dimension::User, &user_tenant, username)
    }

    /// Forget every failure of `ip` in `tenant`, returning whether any was tracked
    pub fn unblock_ip(&self, ip: &str, tenant: &TenantId) -> bool {
        self.unblock(Dimension::Ip, tenant, ip)
    }

    /// The IP failures of this request would be counted against
    pub fn current_effective_ip(
        &self,
        remote_addr: &str,
        forwarded_for: Option<&str>,
        tenant: &TenantId,
    ) -> String {
        let config = self.config.blocking_config(tenant);
        resolve_effective_ip(remote_addr, forwarded_for, &config.trusted_proxies)
    }

    fn user_tenant(&self, username: &str, tenant: &TenantId) -> TenantId {
        resolve_user_tenant(username, tenant, &self.topology, self.directory.as_ref())
    }

    fn check(
        &self,
        dimension: Dimension,
        tenant: &TenantId,
        key: &str,
        config: &BlockingConfig,
    ) -> bool {
        let (max_attempts, block_time) = config.limits(dimension);
        let now = self.clock.now();
        let verdict = self
            .ledger
            .evaluate(dimension, tenant, key, max_attempts, block_time, now);

        if let Verdict::Evicted { cleared } = verdict {
            debug!(
                dimension = %dimension,
                tenant = %tenant,
                key = key,
                cleared = cleared,
                "Stale login failures evicted"
            );
            if cleared >= max_attempts as usize {
                info!(dimension = %dimension, tenant = %tenant, key = key, "Block expired");
                self.notify(BlockEvent::Unblocked {
                    dimension,
                    tenant: tenant.clone(),
                    key: key.to_string(),
                    reason: UnblockReason::Expired,
                });
            }
        }

        verdict.is_blocked()
    }

    fn after_append(
        &self,
        dimension: Dimension,
        tenant: &TenantId,
        key: &str,
        count: usize,
        config: &BlockingConfig,
        now: DateTime<Utc>,
    ) {
        self.notify(BlockEvent::FailureRecorded {
            dimension,
            tenant: tenant.clone(),
            key: key.to_string(),
            attempt_count: count,
            at: now,
        });

        let (max_attempts, block_time) = config.limits(dimension);
        if max_attempts > 0 && count == max_attempts as usize {
            warn!(
                dimension = %dimension,
                tenant = %tenant,
                key = key,
                attempt_count = count,
                block_time_secs = block_time.as_secs(),
                "Blocked due to repeated login failures"
            );
            self.notify(BlockEvent::ThresholdReached {
                dimension,
                tenant: tenant.clone(),
                key: key.to_string(),
                max_attempts,
                block_time_secs: block_time.as_secs(),
            });
        }
    }

    fn unblock(&self, dimension: Dimension, tenant: &TenantId, key: &str) -> bool {
        let removed = self.ledger.unblock(dimension, tenant, key);
        if removed {
            info!(dimension = %dimension, tenant = %tenant, key = key, "Manually unblocked (admin)");
            self.notify(BlockEvent::Unblocked {
                dimension,
                tenant: tenant.clone(),
                key: key.to_string(),
                reason: UnblockReason::AdminAction,
            });
        }
        removed
    }

    /// Dispatch a notification event to all registered handlers
    fn notify(&self, event: BlockEvent) {
        if self.notifications.is_empty() {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            debug!(?event, "No async runtime, block notification skipped");
            return;
        };
        for handler in &self.notifications {
            let handler = Arc::clone(handler);
            let event = event.clone();
            runtime.spawn(async move {
                handler.on_event(event).await;
            });
        }
    }
}
