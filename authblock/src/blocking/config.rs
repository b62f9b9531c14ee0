//! Blocking configuration
//!
//! Per-tenant thresholds and block windows. The [`LoginBlocker`](super::LoginBlocker)
//! only sees immutable [`BlockingConfig`] snapshots handed out by a
//! [`ConfigProvider`]; where the values come from and when they are refreshed
//! is the provider's business.
//!
//! A snapshot with zeroed limits means "blocking disabled". Every provider in
//! this module degrades to that value instead of failing, so a broken
//! configuration never locks users out.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::{mapref::entry::Entry, DashMap};
use figment::{
    providers::{Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

use super::ledger::Dimension;
use crate::error::Result;
use crate::tenant::{TenantId, TenantTopology};

/// Immutable blocking parameters for one tenant
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlockingConfig {
    /// Failures before a user is blocked (0 disables user blocking)
    pub max_user_attempts: u32,
    /// How long a user stays blocked after the most recent failure
    pub user_block_time: Duration,
    /// Failures before an IP is blocked (0 disables IP blocking)
    pub max_ip_attempts: u32,
    /// How long an IP stays blocked after the most recent failure
    pub ip_block_time: Duration,
    /// IPs that are never tracked for IP blocking
    pub whitelisted_ips: HashSet<String>,
    /// Peers allowed to supply `X-Forwarded-For`
    pub trusted_proxies: HashSet<String>,
}

impl BlockingConfig {
    /// Snapshot with both dimensions disabled
    pub fn disabled() -> Self {
        Self::default()
    }

    /// Threshold and window for a dimension
    pub fn limits(&self, dimension: Dimension) -> (u32, Duration) {
        match dimension {
            Dimension::User => (self.max_user_attempts, self.user_block_time),
            Dimension::Ip => (self.max_ip_attempts, self.ip_block_time),
        }
    }

    /// Whether failures from `ip` are exempt from IP blocking
    pub fn is_whitelisted(&self, ip: &str) -> bool {
        self.whitelisted_ips.contains(ip)
    }
}

/// Stored blocking settings of a tenant
///
/// Block times are kept in seconds, as an administrator would enter them.
///
/// # Example (config.toml)
///
/// ```toml
/// [blocking.tenants.main]
/// max_user_attempts = 3
/// user_block_time_secs = 900
/// max_ip_attempts = 20
/// ip_block_time_secs = 600
/// ip_whitelist = ["192.168.1.10"]
/// trusted_proxies = ["127.0.0.1", "[::1]"]
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantBlockingSettings {
    /// Maximum failed attempts before a user is blocked
    #[serde(default = "default_max_user_attempts")]
    pub max_user_attempts: u32,

    /// Seconds a user stays blocked after the last failure
    #[serde(default = "default_user_block_time_secs")]
    pub user_block_time_secs: u64,

    /// Maximum failed attempts before an IP is blocked
    #[serde(default)]
    pub max_ip_attempts: u32,

    /// Seconds an IP stays blocked after the last failure
    #[serde(default)]
    pub ip_block_time_secs: u64,

    /// IPs that are never blocked
    #[serde(default)]
    pub ip_whitelist: Vec<String>,

    /// Proxies whose `X-Forwarded-For` header is honoured
    #[serde(default = "default_trusted_proxies")]
    pub trusted_proxies: Vec<String>,
}

impl TenantBlockingSettings {
    /// Validate the settings, returning an error message if invalid
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.max_user_attempts > 0 && self.user_block_time_secs == 0 {
            return Err(
                "user_block_time_secs must be greater than 0 when max_user_attempts is set"
                    .to_string(),
            );
        }
        if self.max_ip_attempts > 0 && self.ip_block_time_secs == 0 {
            return Err(
                "ip_block_time_secs must be greater than 0 when max_ip_attempts is set".to_string(),
            );
        }
        Ok(())
    }

    /// Build the runtime snapshot
    ///
    /// List entries are trimmed and blank entries dropped.
    pub fn snapshot(&self) -> BlockingConfig {
        BlockingConfig {
            max_user_attempts: self.max_user_attempts,
            user_block_time: Duration::from_secs(self.user_block_time_secs),
            max_ip_attempts: self.max_ip_attempts,
            ip_block_time: Duration::from_secs(self.ip_block_time_secs),
            whitelisted_ips: as_set(&self.ip_whitelist),
            trusted_proxies: as_set(&self.trusted_proxies),
        }
    }
}

impl Default for TenantBlockingSettings {
    fn default() -> Self {
        Self {
            max_user_attempts: default_max_user_attempts(),
            user_block_time_secs: default_user_block_time_secs(),
            max_ip_attempts: 0,
            ip_block_time_secs: 0,
            ip_whitelist: Vec::new(),
            trusted_proxies: default_trusted_proxies(),
        }
    }
}

fn as_set(values: &[String]) -> HashSet<String> {
    values
        .iter()
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .collect()
}

fn default_max_user_attempts() -> u32 {
    3
}

fn default_user_block_time_secs() -> u64 {
    900 // 15 minutes
}

fn default_trusted_proxies() -> Vec<String> {
    vec!["127.0.0.1".to_string(), "[::1]".to_string()]
}

fn default_primary_tenant() -> String {
    "main".to_string()
}

/// Blocking section of the application configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockingSettings {
    /// Name of the primary tenant
    #[serde(default = "default_primary_tenant")]
    pub primary_tenant: String,

    /// Settings per tenant name
    #[serde(default)]
    pub tenants: HashMap<String, TenantBlockingSettings>,
}

impl BlockingSettings {
    /// Tenant topology described by these settings
    pub fn topology(&self) -> TenantTopology {
        TenantTopology::new(self.primary_tenant.as_str())
    }

    /// Give the primary tenant the recommended settings if it has none
    pub fn with_primary_defaults(mut self) -> Self {
        self.tenants
            .entry(self.primary_tenant.clone())
            .or_default();
        self
    }

    /// Validate the settings, returning an error message if invalid
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.primary_tenant.trim().is_empty() {
            return Err("primary_tenant must not be empty".to_string());
        }
        for (name, tenant) in &self.tenants {
            if name.trim().is_empty() {
                return Err("tenant names must not be empty".to_string());
            }
            tenant
                .validate()
                .map_err(|e| format!("tenant '{}': {}", name, e))?;
        }
        Ok(())
    }
}

impl Default for BlockingSettings {
    fn default() -> Self {
        Self {
            primary_tenant: default_primary_tenant(),
            tenants: HashMap::new(),
        }
        .with_primary_defaults()
    }
}

/// Supplies configuration snapshots to the blocking engine
///
/// Must always answer: an unconfigured or unreadable tenant yields
/// [`BlockingConfig::disabled`].
pub trait ConfigProvider: Send + Sync + 'static {
    /// Current snapshot for `tenant`
    fn blocking_config(&self, tenant: &TenantId) -> Arc<BlockingConfig>;
}

/// Provider holding snapshots in memory
///
/// Snapshots can be replaced at any time; callers pick up the new value on
/// their next lookup.
#[derive(Debug, Default)]
pub struct StaticConfigProvider {
    configs: DashMap<TenantId, Arc<BlockingConfig>>,
    fallback: Arc<BlockingConfig>,
}

impl StaticConfigProvider {
    /// Create a provider with no tenants configured
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style [`set`](Self::set)
    pub fn with_tenant(self, tenant: impl Into<TenantId>, config: BlockingConfig) -> Self {
        self.set(tenant, config);
        self
    }

    /// Install or replace the snapshot of `tenant`
    pub fn set(&self, tenant: impl Into<TenantId>, config: BlockingConfig) {
        self.configs.insert(tenant.into(), Arc::new(config));
    }

    /// Drop the snapshot of `tenant`, disabling blocking there
    pub fn remove(&self, tenant: &TenantId) -> bool {
        self.configs.remove(tenant).is_some()
    }
}

impl ConfigProvider for StaticConfigProvider {
    fn blocking_config(&self, tenant: &TenantId) -> Arc<BlockingConfig> {
        self.configs
            .get(tenant)
            .map(|entry| Arc::clone(entry.value()))
            .unwrap_or_else(|| Arc::clone(&self.fallback))
    }
}

/// Backing store of tenant settings
pub trait SettingsSource: Send + Sync + 'static {
    /// Settings stored for `tenant`, `None` if the tenant has none of its own
    fn load(&self, tenant: &TenantId) -> Result<Option<TenantBlockingSettings>>;
}

impl SettingsSource for BlockingSettings {
    fn load(&self, tenant: &TenantId) -> Result<Option<TenantBlockingSettings>> {
        Ok(self.tenants.get(tenant.as_str()).cloned())
    }
}

/// Tenant settings kept in a TOML file that may be edited at runtime
///
/// The file is re-read on every load; pair it with a [`CachedConfigProvider`]
/// and flush the cache when the file changes.
///
/// ```toml
/// [tenants.main]
/// max_user_attempts = 5
///
/// [tenants.sub]
/// max_ip_attempts = 10
/// ip_block_time_secs = 60
/// ```
#[derive(Debug, Clone)]
pub struct TomlSettingsFile {
    path: PathBuf,
}

#[derive(Debug, Default, Deserialize)]
struct TenantsFile {
    #[serde(default)]
    tenants: HashMap<String, TenantBlockingSettings>,
}

impl TomlSettingsFile {
    /// Read settings from `path`
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    /// Path of the settings file
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SettingsSource for TomlSettingsFile {
    fn load(&self, tenant: &TenantId) -> Result<Option<TenantBlockingSettings>> {
        let mut file: TenantsFile = Figment::new().merge(Toml::file(&self.path)).extract()?;
        Ok(file.tenants.remove(tenant.as_str()))
    }
}

/// Caching provider over a [`SettingsSource`]
///
/// A tenant without settings of its own inherits the primary tenant's. Load
/// failures are logged and answered with the disabled snapshot; they are not
/// cached, so the next lookup retries.
pub struct CachedConfigProvider<S> {
    source: S,
    topology: TenantTopology,
    cache: DashMap<TenantId, Arc<BlockingConfig>>,
    // bumped before every flush; a load that overlaps a flush is not cached
    generation: AtomicU64,
}

impl<S: SettingsSource> CachedConfigProvider<S> {
    /// Create a provider reading from `source`
    pub fn new(source: S, topology: TenantTopology) -> Self {
        Self {
            source,
            topology,
            cache: DashMap::new(),
            generation: AtomicU64::new(0),
        }
    }

    /// The underlying settings source
    pub fn source(&self) -> &S {
        &self.source
    }

    /// Invalidate the cached snapshot of `tenant`
    ///
    /// Flushing the primary tenant flushes everything, since secondaries may
    /// have inherited its settings.
    pub fn flush_tenant(&self, tenant: &TenantId) {
        if self.topology.is_primary(tenant) {
            self.flush_all();
            return;
        }
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.cache.remove(tenant);
        info!(tenant = %tenant, "Cleared blocking config cache for tenant");
    }

    /// Invalidate every cached snapshot
    pub fn flush_all(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.cache.clear();
        info!("Cleared blocking config cache");
    }

    /// Whether `tenant` has settings of its own rather than inheriting the
    /// primary tenant's
    pub fn has_own_settings(&self, tenant: &TenantId) -> Result<bool> {
        Ok(self.source.load(tenant)?.is_some())
    }

    fn load(&self, tenant: &TenantId) -> Result<BlockingConfig> {
        let mut settings = self.source.load(tenant)?;
        if settings.is_none() && !self.topology.is_primary(tenant) {
            settings = self.source.load(self.topology.primary())?;
        }
        Ok(settings.map(|s| s.snapshot()).unwrap_or_default())
    }
}

impl<S: SettingsSource> ConfigProvider for CachedConfigProvider<S> {
    fn blocking_config(&self, tenant: &TenantId) -> Arc<BlockingConfig> {
        if let Some(cached) = self.cache.get(tenant) {
            return Arc::clone(cached.value());
        }

        let generation = self.generation.load(Ordering::SeqCst);
        match self.load(tenant) {
            Ok(config) => {
                let config = Arc::new(config);
                match self.cache.entry(tenant.clone()) {
                    Entry::Occupied(entry) => return Arc::clone(entry.get()),
                    Entry::Vacant(entry) => {
                        if self.generation.load(Ordering::SeqCst) == generation {
                            entry.insert(Arc::clone(&config));
                            debug!(tenant = %tenant, "Cached blocking config");
                        } else {
                            debug!(tenant = %tenant, "Config flushed during load, not cached");
                        }
                    }
                }
                config
            }
            Err(e) => {
                error!(
                    tenant = %tenant,
                    error = %e,
                    "Could not load blocking config, blocking disabled"
                );
                Arc::new(BlockingConfig::disabled())
            }
        }
    }
}
