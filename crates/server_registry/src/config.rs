//! Registry configuration types and defaults.
//!
//! [`RegistryConfig`] carries every tunable of the registry. Values come from
//! [`Default`], can be overridden from `HORIZON_REGISTRY_*` environment
//! variables, and are checked by [`RegistryConfig::validate`] before use.

use crate::admission::JoinPolicy;
use crate::clock::StalenessPolicy;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

// Environment overrides, read by `RegistryConfig::apply_env`.
pub const ENV_BIND: &str = "HORIZON_REGISTRY_BIND";
pub const ENV_SOFT_TIMEOUT: &str = "HORIZON_REGISTRY_SOFT_TIMEOUT_SECS";
pub const ENV_HARD_TIMEOUT: &str = "HORIZON_REGISTRY_HARD_TIMEOUT_SECS";
pub const ENV_SWEEP_INTERVAL: &str = "HORIZON_REGISTRY_SWEEP_INTERVAL_SECS";
pub const ENV_DEFAULT_CAPACITY: &str = "HORIZON_REGISTRY_DEFAULT_CAPACITY";
pub const ENV_DEFAULT_REGION: &str = "HORIZON_REGISTRY_DEFAULT_REGION";
pub const ENV_PERSISTENCE_DIR: &str = "HORIZON_REGISTRY_PERSISTENCE_DIR";

/// Configuration structure for the server registry.
#[derive(Debug, Clone, PartialEq)]
pub struct RegistryConfig {
    /// The socket address the HTTP API binds to
    pub bind_address: SocketAddr,

    /// Silence after which a server is hidden from discovery
    pub soft_timeout: Duration,

    /// Silence after which a server is removed entirely
    pub hard_timeout: Duration,

    /// How often the eviction sweeper runs
    pub sweep_interval: Duration,

    /// Capacity assumed when a registration omits it
    pub default_capacity: u32,

    /// Region assumed when a registration omits it
    pub default_region: String,

    /// Connection policy returned with join grants
    pub join: JoinPolicy,

    /// Directory for write-through persistence; `None` keeps the registry volatile
    pub persistence_dir: Option<PathBuf>,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            bind_address: SocketAddr::from(([127, 0, 0, 1], 9001)),
            soft_timeout: Duration::from_secs(60),
            hard_timeout: Duration::from_secs(300),
            sweep_interval: Duration::from_secs(300),
            default_capacity: 100,
            default_region: "default".to_string(),
            join: JoinPolicy::default(),
            persistence_dir: None,
        }
    }
}

impl RegistryConfig {
    /// Defaults overlaid with environment overrides.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env();
        config
    }

    /// Applies `HORIZON_REGISTRY_*` overrides from the process environment.
    pub fn apply_env(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Applies overrides from an arbitrary key lookup.
    ///
    /// Values that fail to parse are logged and ignored.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(addr) = parse_var::<SocketAddr>(&lookup, ENV_BIND) {
            self.bind_address = addr;
        }
        if let Some(secs) = parse_var::<u64>(&lookup, ENV_SOFT_TIMEOUT) {
            self.soft_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_var::<u64>(&lookup, ENV_HARD_TIMEOUT) {
            self.hard_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_var::<u64>(&lookup, ENV_SWEEP_INTERVAL) {
            self.sweep_interval = Duration::from_secs(secs);
        }
        if let Some(capacity) = parse_var::<u32>(&lookup, ENV_DEFAULT_CAPACITY) {
            self.default_capacity = capacity;
        }
        if let Some(region) = lookup(ENV_DEFAULT_REGION).filter(|r| !r.trim().is_empty()) {
            self.default_region = region.trim().to_string();
        }
        if let Some(dir) = lookup(ENV_PERSISTENCE_DIR).filter(|d| !d.trim().is_empty()) {
            self.persistence_dir = Some(PathBuf::from(dir.trim()));
        }
    }

    pub fn staleness(&self) -> StalenessPolicy {
        StalenessPolicy::new(self.soft_timeout, self.hard_timeout)
    }

    /// Checks the configuration for internal consistency.
    pub fn validate(&self) -> Result<(), String> {
        if self.soft_timeout.is_zero() {
            return Err("Soft timeout must be greater than zero".to_string());
        }
        if self.hard_timeout <= self.soft_timeout {
            return Err(format!(
                "Hard timeout ({:?}) must be greater than soft timeout ({:?})",
                self.hard_timeout, self.soft_timeout
            ));
        }
        if self.sweep_interval.is_zero() {
            return Err("Sweep interval must be greater than zero".to_string());
        }
        if self.default_capacity == 0 {
            return Err("Default capacity must be greater than zero".to_string());
        }
        if self.default_region.trim().is_empty() {
            return Err("Default region cannot be empty".to_string());
        }
        Ok(())
    }
}

fn parse_var<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse::<T>() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!("Ignoring invalid value for {}: {:?}", key, raw);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = RegistryConfig::default();
        assert_eq!(config.bind_address.to_string(), "127.0.0.1:9001");
        assert_eq!(config.soft_timeout, Duration::from_secs(60));
        assert_eq!(config.hard_timeout, Duration::from_secs(300));
        assert_eq!(config.sweep_interval, Duration::from_secs(300));
        assert_eq!(config.default_capacity, 100);
        assert_eq!(config.default_region, "default");
        assert!(config.persistence_dir.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_overrides() {
        let mut config = RegistryConfig::default();
        config.apply_overrides(lookup_from(&[
            (ENV_BIND, "0.0.0.0:7000"),
            (ENV_SOFT_TIMEOUT, "15"),
            (ENV_HARD_TIMEOUT, "45"),
            (ENV_SWEEP_INTERVAL, " 5 "),
            (ENV_DEFAULT_CAPACITY, "64"),
            (ENV_DEFAULT_REGION, "us-east"),
            (ENV_PERSISTENCE_DIR, "/var/lib/registry"),
        ]));

        assert_eq!(config.bind_address.to_string(), "0.0.0.0:7000");
        assert_eq!(config.soft_timeout, Duration::from_secs(15));
        assert_eq!(config.hard_timeout, Duration::from_secs(45));
        assert_eq!(config.sweep_interval, Duration::from_secs(5));
        assert_eq!(config.default_capacity, 64);
        assert_eq!(config.default_region, "us-east");
        assert_eq!(config.persistence_dir, Some(PathBuf::from("/var/lib/registry")));
    }

    #[test]
    fn test_invalid_overrides_are_ignored() {
        let mut config = RegistryConfig::default();
        config.apply_overrides(lookup_from(&[
            (ENV_SOFT_TIMEOUT, "soon"),
            (ENV_DEFAULT_CAPACITY, "-1"),
            (ENV_DEFAULT_REGION, "   "),
        ]));
        assert_eq!(config, RegistryConfig::default());
    }

    #[test]
    fn test_validation() {
        let mut config = RegistryConfig::default();
        config.hard_timeout = config.soft_timeout;
        assert!(config.validate().unwrap_err().contains("Hard timeout"));

        let mut config = RegistryConfig::default();
        config.soft_timeout = Duration::ZERO;
        assert!(config.validate().is_err());

        let mut config = RegistryConfig::default();
        config.sweep_interval = Duration::ZERO;
        assert!(config.validate().is_err());

        let mut config = RegistryConfig::default();
        config.default_capacity = 0;
        assert!(config.validate().is_err());

        let mut config = RegistryConfig::default();
        config.default_region = String::new();
        assert!(config.validate().is_err());
    }
}
