//! Instance identity and heartbeat registration.
//!
//! Heartbeats exist purely so peers can discover each other; they carry no
//! ownership semantics and never touch lease keys.

use chrono::Utc;
use std::sync::LazyLock;
use std::time::Duration;
use sysinfo::System;
use tracing::{debug, warn};

use pkg_constants::state::NODE_KEY_PREFIX;
use pkg_state::client::{
    CoordinationStore, StoreError, StoreResult, instance_id_from_node_key, node_key,
};
use pkg_types::node::{HeartbeatData, NodeStatus};

/// Process start time in nanoseconds, captured once.
static PROCESS_START_NANOS: LazyLock<i64> =
    LazyLock::new(|| Utc::now().timestamp_nanos_opt().unwrap_or_default());

/// Build this process's instance ID.
///
/// An operator-supplied `node_name` is used verbatim. Otherwise the ID is
/// `{hostname}-{process_start_nanos}-{8 random hex chars}`, which is never
/// reused by a later process on the same host because the start time differs.
pub fn generate_instance_id(node_name: Option<&str>) -> String {
    if let Some(name) = node_name.map(str::trim).filter(|n| !n.is_empty()) {
        return name.to_string();
    }

    let hostname: String = System::host_name()
        .unwrap_or_else(|| "unknown".to_string())
        .chars()
        .map(|c| if c.is_whitespace() { '-' } else { c })
        .collect();
    let random = uuid::Uuid::new_v4().simple().to_string();

    format!("{}-{}-{}", hostname, *PROCESS_START_NANOS, &random[..8])
}

/// Write this instance's heartbeat key with the given expiry. Idempotent.
pub async fn register_heartbeat(
    store: &dyn CoordinationStore,
    instance_id: &str,
    data: &HeartbeatData,
    ttl: Duration,
) -> StoreResult<()> {
    let value = data
        .to_json()
        .map_err(|e| StoreError::Backend(format!("encode heartbeat: {}", e)))?;
    store.set_with_ttl(&node_key(instance_id), &value, ttl).await
}

/// Re-arm the heartbeat. A missed refresh simply re-creates the record.
pub async fn refresh_heartbeat(
    store: &dyn CoordinationStore,
    instance_id: &str,
    data: &HeartbeatData,
    ttl: Duration,
) -> StoreResult<()> {
    register_heartbeat(store, instance_id, data, ttl).await
}

/// Best-effort removal on graceful shutdown; the key expires on its own otherwise.
pub async fn remove_heartbeat(store: &dyn CoordinationStore, instance_id: &str) {
    if let Err(e) = store.delete(&node_key(instance_id)).await {
        warn!(instance_id, error = %e, "failed to remove heartbeat");
    }
}

/// Instance IDs with a live heartbeat, sorted. Keys that don't encode an ID are skipped.
pub async fn get_live_nodes(store: &dyn CoordinationStore) -> StoreResult<Vec<String>> {
    let keys = store.scan_prefix(NODE_KEY_PREFIX).await?;
    let mut nodes: Vec<String> = keys
        .iter()
        .filter_map(|key| {
            let id = instance_id_from_node_key(key);
            if id.is_none() {
                debug!(key = %key, "skipping malformed heartbeat key");
            }
            id.map(str::to_string)
        })
        .collect();
    nodes.sort();
    nodes.dedup();
    Ok(nodes)
}

/// A peer's self-reported status. Missing or unreadable heartbeats count as offline.
pub async fn node_status(
    store: &dyn CoordinationStore,
    instance_id: &str,
) -> StoreResult<NodeStatus> {
    let Some(raw) = store.get(&node_key(instance_id)).await? else {
        return Ok(NodeStatus::Offline);
    };
    match HeartbeatData::from_json(&raw) {
        Ok(data) => Ok(data.status),
        Err(e) => {
            debug!(instance_id, error = %e, "unreadable heartbeat value");
            Ok(NodeStatus::Offline)
        }
    }
}
