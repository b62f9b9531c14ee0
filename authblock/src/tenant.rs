//! Tenant identity and username-to-tenant resolution
//!
//! A host runs one primary tenant and any number of secondary tenants.
//! Users defined in the primary tenant may log into secondary tenants, and
//! their failures are then accounted in the primary tenant's partition.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{PoisonError, RwLock};

use serde::{Deserialize, Serialize};

/// Identifier of an isolated tenant (realm, site, wiki...)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TenantId(String);

impl TenantId {
    /// Wrap a tenant name
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The tenant name
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TenantId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for TenantId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Primary/secondary layout of the tenants served by this process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TenantTopology {
    primary: TenantId,
}

impl TenantTopology {
    /// Create a topology around the given primary tenant
    pub fn new(primary: impl Into<TenantId>) -> Self {
        Self {
            primary: primary.into(),
        }
    }

    /// The primary tenant
    pub fn primary(&self) -> &TenantId {
        &self.primary
    }

    /// Whether `tenant` is the primary tenant
    pub fn is_primary(&self, tenant: &TenantId) -> bool {
        &self.primary == tenant
    }
}

/// Identity existence check supplied by the host
///
/// Must be cheap and non-blocking: it is called on every failure record and
/// user block check made from a secondary tenant.
pub trait UserDirectory: Send + Sync + 'static {
    /// Whether a user named `username` exists in `tenant`
    fn user_exists(&self, tenant: &TenantId, username: &str) -> bool;
}

impl<F> UserDirectory for F
where
    F: Fn(&TenantId, &str) -> bool + Send + Sync + 'static,
{
    fn user_exists(&self, tenant: &TenantId, username: &str) -> bool {
        self(tenant, username)
    }
}

/// In-memory user directory
#[derive(Debug, Default)]
pub struct InMemoryUserDirectory {
    users: RwLock<HashMap<TenantId, HashSet<String>>>,
}

impl InMemoryUserDirectory {
    /// Create an empty directory
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `username` in `tenant`
    pub fn add_user(&self, tenant: impl Into<TenantId>, username: impl Into<String>) {
        self.users
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(tenant.into())
            .or_default()
            .insert(username.into());
    }

    /// Remove `username` from `tenant`, returning whether it was present
    pub fn remove_user(&self, tenant: &TenantId, username: &str) -> bool {
        self.users
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .get_mut(tenant)
            .is_some_and(|users| users.remove(username))
    }
}

impl UserDirectory for InMemoryUserDirectory {
    fn user_exists(&self, tenant: &TenantId, username: &str) -> bool {
        self.users
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(tenant)
            .is_some_and(|users| users.contains(username))
    }
}

/// Pick the tenant whose user partition owns `username`'s failures
///
/// Local users and unknown names stay in `current`; a name only known to the
/// primary tenant is accounted there.
pub fn resolve_user_tenant(
    username: &str,
    current: &TenantId,
    topology: &TenantTopology,
    directory: &dyn UserDirectory,
) -> TenantId {
    if topology.is_primary(current) || directory.user_exists(current, username) {
        return current.clone();
    }
    if directory.user_exists(topology.primary(), username) {
        return topology.primary().clone();
    }
    current.clone()
}
