use async_trait::async_trait;
use std::future::Future;
use std::time::Duration;

use pkg_constants::state::{LEASE_KEY_PREFIX, NODE_KEY_PREFIX};

/// Failures talking to the coordination store.
///
/// Ownership conflicts are not errors: conditional operations report them as `Ok(false)`.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("store call timed out after {0:?}")]
    Timeout(Duration),
    #[error("store backend error: {0}")]
    Backend(String),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Key-value operations the lease coordinator needs from the shared store.
///
/// Every method is a single round trip. The two `compare_and_*` methods must be
/// atomic on the store side; a read-then-write pair would race with other owners.
#[async_trait]
pub trait CoordinationStore: Send + Sync {
    /// Write `value` with expiry only if `key` does not exist. Returns true if written.
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<bool>;

    /// Unconditionally write `value` with expiry. Used for this instance's own heartbeat only.
    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<()>;

    async fn get(&self, key: &str) -> StoreResult<Option<String>>;

    /// Unconditionally delete `key`. Used for this instance's own heartbeat only.
    async fn delete(&self, key: &str) -> StoreResult<()>;

    /// Re-arm the expiry of `key` only if its value equals `expected`.
    async fn compare_and_extend(&self, key: &str, expected: &str, ttl: Duration)
    -> StoreResult<bool>;

    /// Delete `key` only if its value equals `expected`.
    async fn compare_and_delete(&self, key: &str, expected: &str) -> StoreResult<bool>;

    /// All live keys starting with `prefix`, in no particular order.
    async fn scan_prefix(&self, prefix: &str) -> StoreResult<Vec<String>>;
}

/// Run one store call, failing with [`StoreError::Timeout`] if it exceeds `limit`.
pub async fn bounded<T, F>(limit: Duration, call: F) -> StoreResult<T>
where
    F: Future<Output = StoreResult<T>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(StoreError::Timeout(limit)),
    }
}

/// Store key holding the lease for a poll target.
pub fn lease_key(target_id: &str) -> String {
    format!("{}{}", LEASE_KEY_PREFIX, target_id)
}

/// Store key holding an instance heartbeat.
pub fn node_key(instance_id: &str) -> String {
    format!("{}{}", NODE_KEY_PREFIX, instance_id)
}

/// Extract the instance ID from a heartbeat key. `None` for keys that don't carry one.
pub fn instance_id_from_node_key(key: &str) -> Option<&str> {
    key.strip_prefix(NODE_KEY_PREFIX)
        .filter(|id| !id.is_empty() && !id.contains(char::is_whitespace))
}

/// Extract the target ID from a lease key.
pub fn target_id_from_lease_key(key: &str) -> Option<&str> {
    key.strip_prefix(LEASE_KEY_PREFIX).filter(|id| !id.is_empty())
}
