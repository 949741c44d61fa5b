//! Daemon runtime constants.

/// Default location of the YAML config file.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/pollcoord/config.yaml";

/// Default coordination store endpoint.
pub const DEFAULT_REDIS_URL: &str = "redis://127.0.0.1:6379";

/// How often the polling driver walks the target registry, in seconds.
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 5;

/// Environment variable overriding the generated instance ID.
pub const NODE_NAME_ENV: &str = "SD_NODE_NAME";

/// Environment variable consulted first for the log filter.
pub const LOG_FILTER_ENV: &str = "POLLCOORD_LOG";
