use anyhow::bail;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use pkg_constants::state::{
    HEARTBEAT_INTERVAL_SECS, HEARTBEAT_TTL_SECS, LEASE_RENEW_INTERVAL_DIVISOR, LEASE_TTL_SECS,
    NODE_DISCOVERY_INTERVAL_SECS, SHUTDOWN_TIMEOUT_SECS, STARTUP_GRACE_SECS, STORE_TIMEOUT_SECS,
};

/// Timing parameters of the lease coordinator. Fixed for the lifetime of a manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseConfig {
    pub lease_ttl: Duration,
    pub renewal_interval: Duration,
    pub heartbeat_ttl: Duration,
    pub heartbeat_interval: Duration,
    pub node_discovery_interval: Duration,
    /// Time spent in `init` before the instance contends for new leases.
    pub startup_grace: Duration,
    /// Bound on every individual store call.
    pub store_timeout: Duration,
    /// Bound on the whole best-effort cleanup in `stop()`.
    pub shutdown_timeout: Duration,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            lease_ttl: Duration::from_secs(LEASE_TTL_SECS),
            renewal_interval: Duration::from_secs(LEASE_TTL_SECS / LEASE_RENEW_INTERVAL_DIVISOR),
            heartbeat_ttl: Duration::from_secs(HEARTBEAT_TTL_SECS),
            heartbeat_interval: Duration::from_secs(HEARTBEAT_INTERVAL_SECS),
            node_discovery_interval: Duration::from_secs(NODE_DISCOVERY_INTERVAL_SECS),
            startup_grace: Duration::from_secs(STARTUP_GRACE_SECS),
            store_timeout: Duration::from_secs(STORE_TIMEOUT_SECS),
            shutdown_timeout: Duration::from_secs(SHUTDOWN_TIMEOUT_SECS),
        }
    }
}

impl LeaseConfig {
    /// Reject timing combinations that would let a healthy owner lose its lease.
    pub fn validate(&self) -> anyhow::Result<()> {
        let required = [
            ("lease_ttl", self.lease_ttl),
            ("renewal_interval", self.renewal_interval),
            ("heartbeat_ttl", self.heartbeat_ttl),
            ("heartbeat_interval", self.heartbeat_interval),
            ("node_discovery_interval", self.node_discovery_interval),
            ("store_timeout", self.store_timeout),
            ("shutdown_timeout", self.shutdown_timeout),
        ];
        for (name, value) in required {
            if value.is_zero() {
                bail!("{} must be greater than zero", name);
            }
        }
        if self.renewal_interval >= self.lease_ttl {
            bail!(
                "renewal_interval ({:?}) must be shorter than lease_ttl ({:?})",
                self.renewal_interval,
                self.lease_ttl
            );
        }
        if self.heartbeat_interval >= self.heartbeat_ttl {
            bail!(
                "heartbeat_interval ({:?}) must be shorter than heartbeat_ttl ({:?})",
                self.heartbeat_interval,
                self.heartbeat_ttl
            );
        }
        Ok(())
    }
}

/// Coordinator configuration file (YAML).
///
/// Example `config.yaml`:
/// ```yaml
/// redis-url: redis://10.0.0.5:6379
/// node-name: api-1
/// poll-interval-secs: 5
/// lease-ttl-secs: 30
/// targets:
///   - session-a
///   - session-b
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CoordinatorConfigFile {
    #[serde(default, alias = "redis-url")]
    pub redis_url: Option<String>,
    #[serde(default, alias = "node-name")]
    pub node_name: Option<String>,
    #[serde(default)]
    pub targets: Vec<String>,
    #[serde(default, alias = "poll-interval-secs")]
    pub poll_interval_secs: Option<u64>,
    #[serde(default, alias = "lease-ttl-secs")]
    pub lease_ttl_secs: Option<u64>,
    #[serde(default, alias = "renewal-interval-secs")]
    pub renewal_interval_secs: Option<u64>,
    #[serde(default, alias = "heartbeat-ttl-secs")]
    pub heartbeat_ttl_secs: Option<u64>,
    #[serde(default, alias = "heartbeat-interval-secs")]
    pub heartbeat_interval_secs: Option<u64>,
    #[serde(default, alias = "node-discovery-interval-secs")]
    pub node_discovery_interval_secs: Option<u64>,
    #[serde(default, alias = "startup-grace-secs")]
    pub startup_grace_secs: Option<u64>,
    #[serde(default, alias = "store-timeout-secs")]
    pub store_timeout_secs: Option<u64>,
}

impl CoordinatorConfigFile {
    /// Overlay the file's timing values on the defaults.
    ///
    /// When only the lease TTL is given, the renewal interval follows it at TTL/3.
    pub fn lease_config(&self) -> LeaseConfig {
        let defaults = LeaseConfig::default();
        let secs = |v: Option<u64>, fallback: Duration| v.map(Duration::from_secs).unwrap_or(fallback);

        let lease_ttl = secs(self.lease_ttl_secs, defaults.lease_ttl);
        let renewal_fallback = if self.lease_ttl_secs.is_some() {
            lease_ttl / LEASE_RENEW_INTERVAL_DIVISOR as u32
        } else {
            defaults.renewal_interval
        };

        LeaseConfig {
            lease_ttl,
            renewal_interval: secs(self.renewal_interval_secs, renewal_fallback),
            heartbeat_ttl: secs(self.heartbeat_ttl_secs, defaults.heartbeat_ttl),
            heartbeat_interval: secs(self.heartbeat_interval_secs, defaults.heartbeat_interval),
            node_discovery_interval: secs(
                self.node_discovery_interval_secs,
                defaults.node_discovery_interval,
            ),
            startup_grace: secs(self.startup_grace_secs, defaults.startup_grace),
            store_timeout: secs(self.store_timeout_secs, defaults.store_timeout),
            shutdown_timeout: defaults.shutdown_timeout,
        }
    }
}

/// Load a YAML config file, returning the default if the file doesn't exist.
pub fn load_config_file<T: serde::de::DeserializeOwned + Default>(path: &str) -> anyhow::Result<T> {
    let content = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Ok(T::default());
        }
        Err(e) => return Err(e.into()),
    };
    let config: T = serde_yaml::from_str(&content)?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_design() {
        let cfg = LeaseConfig::default();
        assert_eq!(cfg.lease_ttl, Duration::from_secs(30));
        assert_eq!(cfg.renewal_interval, Duration::from_secs(10));
        assert_eq!(cfg.heartbeat_ttl, Duration::from_secs(30));
        assert_eq!(cfg.heartbeat_interval, Duration::from_secs(10));
        assert_eq!(cfg.node_discovery_interval, Duration::from_secs(10));
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn validate_rejects_bad_timings() {
        let cfg = LeaseConfig {
            renewal_interval: Duration::from_secs(30),
            ..LeaseConfig::default()
        };
        assert!(cfg.validate().is_err());

        let cfg = LeaseConfig {
            heartbeat_interval: Duration::from_secs(45),
            ..LeaseConfig::default()
        };
        assert!(cfg.validate().is_err());

        let cfg = LeaseConfig {
            store_timeout: Duration::ZERO,
            ..LeaseConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn parses_kebab_case_file() {
        let yaml = r#"
redis-url: redis://cache:6379
node-name: api-1
lease-ttl-secs: 12
targets:
  - s1
  - s2
"#;
        let file: CoordinatorConfigFile = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(file.redis_url.as_deref(), Some("redis://cache:6379"));
        assert_eq!(file.node_name.as_deref(), Some("api-1"));
        assert_eq!(file.targets, vec!["s1", "s2"]);

        let cfg = file.lease_config();
        assert_eq!(cfg.lease_ttl, Duration::from_secs(12));
        assert_eq!(cfg.renewal_interval, Duration::from_secs(4));
        assert_eq!(cfg.heartbeat_ttl, Duration::from_secs(30));
    }

    #[test]
    fn missing_file_yields_defaults() {
        let file: CoordinatorConfigFile =
            load_config_file("/nonexistent/pollcoord/config.yaml").unwrap();
        assert!(file.redis_url.is_none());
        assert!(file.targets.is_empty());
        assert_eq!(file.lease_config(), LeaseConfig::default());
    }
}
