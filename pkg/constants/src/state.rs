//! Coordination store key layout and lease timing constants.

/// Key prefix for per-target polling leases: `poll:lease:{target_id}`.
pub const LEASE_KEY_PREFIX: &str = "poll:lease:";

/// Key prefix for instance heartbeats: `poll:node:{instance_id}`.
pub const NODE_KEY_PREFIX: &str = "poll:node:";

/// How long a polling lease is valid without renewal, in seconds.
pub const LEASE_TTL_SECS: u64 = 30;

/// Owned leases are renewed every `TTL / LEASE_RENEW_INTERVAL_DIVISOR` seconds.
pub const LEASE_RENEW_INTERVAL_DIVISOR: u64 = 3;

/// How long a heartbeat key lives without a refresh, in seconds.
pub const HEARTBEAT_TTL_SECS: u64 = 30;

/// Heartbeat refresh cadence, in seconds.
pub const HEARTBEAT_INTERVAL_SECS: u64 = 10;

/// Live-node discovery (and rebalance) cadence, in seconds.
pub const NODE_DISCOVERY_INTERVAL_SECS: u64 = 10;

/// Time a freshly started instance stays in `init` before contending for leases.
pub const STARTUP_GRACE_SECS: u64 = 10;

/// Upper bound for a single store round trip, in seconds.
pub const STORE_TIMEOUT_SECS: u64 = 5;

/// Upper bound for best-effort cleanup during shutdown, in seconds.
pub const SHUTDOWN_TIMEOUT_SECS: u64 = 5;

/// Number of lease events kept in the in-process event log.
pub const EVENT_LOG_CAPACITY: usize = 1024;
