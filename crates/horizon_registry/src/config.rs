//! Configuration management for the Horizon server registry.
//!
//! Settings are read from a TOML file, then overlaid with
//! `HORIZON_REGISTRY_*` environment variables, then with command-line flags.
//! A missing file is created with the defaults so operators have something
//! to edit.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use server_registry::{JoinPolicy, RegistryConfig};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// Application configuration loaded from TOML file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    /// Network settings
    #[serde(default)]
    pub server: ServerSettings,
    /// Liveness and registration defaults
    #[serde(default)]
    pub registry: RegistrySettings,
    /// Connection policy handed to joining clients
    #[serde(default)]
    pub join: JoinSettings,
    /// Logging settings
    #[serde(default)]
    pub logging: LoggingSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerSettings {
    /// Address the HTTP API binds to (e.g., "127.0.0.1:9001")
    pub bind_address: String,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1:9001".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistrySettings {
    /// Seconds of silence before a server is hidden from discovery
    pub soft_timeout_secs: u64,
    /// Seconds of silence before a server is removed
    pub hard_timeout_secs: u64,
    /// Seconds between eviction sweeps
    pub sweep_interval_secs: u64,
    /// Capacity assumed when a registration omits it
    pub default_capacity: u32,
    /// Region assumed when a registration omits it
    pub default_region: String,
    /// Directory for write-through persistence; unset keeps the registry in memory
    #[serde(skip_serializing_if = "Option::is_none")]
    pub persistence_dir: Option<String>,
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self {
            soft_timeout_secs: 60,
            hard_timeout_secs: 300,
            sweep_interval_secs: 300,
            default_capacity: 100,
            default_region: "default".to_string(),
            persistence_dir: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JoinSettings {
    pub connect_timeout_ms: u64,
    pub max_retries: u32,
    pub retry_backoff_ms: u64,
    pub token_ttl_secs: u64,
}

impl Default for JoinSettings {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 10_000,
            max_retries: 3,
            retry_backoff_ms: 1_000,
            token_ttl_secs: 300,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// Log level filter
    pub level: String,
    /// JSON formatting
    pub json_format: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json_format: false,
        }
    }
}

impl AppConfig {
    /// Loads configuration from a TOML file, creating it with defaults if missing.
    ///
    /// # Arguments
    ///
    /// * `path` - Path to the configuration file
    ///
    /// # Returns
    ///
    /// The loaded or default configuration, or an error if reading, parsing
    /// or creating the file failed.
    pub async fn load_from_file(path: &Path) -> Result<Self> {
        if tokio::fs::try_exists(path).await.unwrap_or(false) {
            let content = tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("Failed to read {}", path.display()))?;
            let config: AppConfig = toml::from_str(&content)
                .with_context(|| format!("Failed to parse {}", path.display()))?;
            Ok(config)
        } else {
            let default_config = AppConfig::default();
            let toml_content = toml::to_string_pretty(&default_config)?;
            tokio::fs::write(path, toml_content)
                .await
                .with_context(|| format!("Failed to create {}", path.display()))?;
            info!("Created default configuration file: {}", path.display());
            Ok(default_config)
        }
    }

    /// Converts the file settings into a registry configuration.
    pub fn to_registry_config(&self) -> Result<RegistryConfig> {
        Ok(RegistryConfig {
            bind_address: self
                .server
                .bind_address
                .parse()
                .with_context(|| format!("Invalid bind address: {}", self.server.bind_address))?,
            soft_timeout: Duration::from_secs(self.registry.soft_timeout_secs),
            hard_timeout: Duration::from_secs(self.registry.hard_timeout_secs),
            sweep_interval: Duration::from_secs(self.registry.sweep_interval_secs),
            default_capacity: self.registry.default_capacity,
            default_region: self.registry.default_region.clone(),
            join: JoinPolicy {
                connect_timeout: Duration::from_millis(self.join.connect_timeout_ms),
                max_retries: self.join.max_retries,
                retry_backoff: Duration::from_millis(self.join.retry_backoff_ms),
                token_ttl: Duration::from_secs(self.join.token_ttl_secs),
            },
            persistence_dir: self
                .registry
                .persistence_dir
                .as_deref()
                .filter(|dir| !dir.trim().is_empty())
                .map(PathBuf::from),
        })
    }

    /// Validates the file-level settings.
    ///
    /// Timeout relationships are checked again on the final
    /// [`RegistryConfig`] once environment overrides are applied.
    pub fn validate(&self) -> Result<(), String> {
        if self.server.bind_address.parse::<std::net::SocketAddr>().is_err() {
            return Err(format!("Invalid bind address: {}", &self.server.bind_address));
        }

        if self.join.token_ttl_secs == 0 {
            return Err("Join token TTL must be greater than zero".to_string());
        }

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            return Err(format!(
                "Invalid log level: {}. Must be one of: {valid_levels:?}",
                &self.logging.level
            ));
        }

        Ok(())
    }
}
