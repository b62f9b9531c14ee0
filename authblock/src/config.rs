//! Configuration management using Figment
//!
//! Configuration is loaded from multiple sources with the following precedence (highest to lowest):
//! 1. Environment variables (prefix: AUTHBLOCK_, `__` separates nested keys)
//! 2. Current working directory: ./config.toml
//! 3. XDG config directory: ~/.config/authblock/{service_name}/config.toml
//! 4. System directory: /etc/authblock/{service_name}/config.toml
//! 5. Default values
//!
//! Nested keys use a double underscore so that snake_case field names survive,
//! e.g. `AUTHBLOCK_BLOCKING__TENANTS__MAIN__MAX_USER_ATTEMPTS=5`.

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::blocking::{BlockingSettings, CachedConfigProvider};
use crate::error::{Error, Result};

const ENV_PREFIX: &str = "AUTHBLOCK_";
const CONFIG_DIR: &str = "authblock";

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Service configuration
    #[serde(default)]
    pub service: ServiceConfig,

    /// Login blocking configuration
    #[serde(default)]
    pub blocking: BlockingSettings,
}

/// Service-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Service name
    #[serde(default = "default_service_name")]
    pub name: String,

    /// Log level or `EnvFilter` directive (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Environment (dev, staging, production)
    #[serde(default = "default_environment")]
    pub environment: String,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            log_level: default_log_level(),
            environment: default_environment(),
        }
    }
}

fn default_service_name() -> String {
    "authblock".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_environment() -> String {
    "dev".to_string()
}

impl Config {
    /// Load configuration from all sources
    ///
    /// The service name is inferred from the binary name.
    pub fn load() -> Result<Self> {
        let service_name = std::env::current_exe()
            .ok()
            .and_then(|p| p.file_stem().map(|s| s.to_string_lossy().into_owned()))
            .unwrap_or_else(default_service_name);

        Self::load_for_service(&service_name)
    }

    /// Load configuration for a specific service name
    ///
    /// This is the recommended way to load config in production.
    pub fn load_for_service(service_name: &str) -> Result<Self> {
        let config_paths = Self::find_config_paths(service_name);

        tracing::debug!("Searching for config files in order:");
        for path in &config_paths {
            tracing::debug!("  - {}", path.display());
        }

        let mut defaults = Self::figment_defaults();
        defaults.service.name = service_name.to_string();
        let mut figment = Figment::new().merge(Serialized::defaults(defaults));

        // Lowest priority first so that later merges override
        for path in config_paths.iter().rev() {
            if path.exists() {
                tracing::info!("Loading configuration from: {}", path.display());
                figment = figment.merge(Toml::file(path));
            }
        }

        figment = figment.merge(Env::prefixed(ENV_PREFIX).split("__"));

        let mut config: Config = figment.extract()?;
        config.blocking = config.blocking.with_primary_defaults();
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific file
    ///
    /// This bypasses the search path. Environment variables still apply.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let mut config: Config = Figment::new()
            .merge(Serialized::defaults(Self::figment_defaults()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?;

        config.blocking = config.blocking.with_primary_defaults();
        config.validate()?;
        Ok(config)
    }

    /// Validate the loaded configuration
    pub fn validate(&self) -> Result<()> {
        if self.service.name.trim().is_empty() {
            return Err(Error::Internal("service.name must not be empty".to_string()));
        }
        self.blocking
            .validate()
            .map_err(|e| Error::Internal(format!("invalid blocking configuration: {}", e)))
    }

    /// A cached config provider over the `blocking` section
    pub fn blocking_provider(&self) -> CachedConfigProvider<BlockingSettings> {
        CachedConfigProvider::new(self.blocking.clone(), self.blocking.topology())
    }

    /// Defaults layered under the config files
    ///
    /// Tenant settings are left out: the primary tenant is only known after
    /// extraction, and gets the recommended settings then.
    fn figment_defaults() -> Self {
        let mut defaults = Config::default();
        defaults.blocking.tenants.clear();
        defaults
    }

    /// Find all possible config file paths for a service
    ///
    /// Returns paths in priority order (highest first).
    fn find_config_paths(service_name: &str) -> Vec<PathBuf> {
        let mut paths = vec![PathBuf::from("config.toml")];

        let config_file_path = Path::new(service_name).join("config.toml");
        if let Some(path) =
            xdg::BaseDirectories::with_prefix(CONFIG_DIR).find_config_file(&config_file_path)
        {
            paths.push(path);
        }

        paths.push(
            PathBuf::from("/etc")
                .join(CONFIG_DIR)
                .join(service_name)
                .join("config.toml"),
        );

        paths
    }
}
