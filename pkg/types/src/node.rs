use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// --- Node status ---

/// Self-reported status of a coordinator instance.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    /// Started, still inside its startup grace period.
    Init,
    /// Fully participating in lease acquisition and rebalancing.
    Online,
    /// No heartbeat present (never registered, shut down or expired).
    Offline,
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeStatus::Init => write!(f, "init"),
            NodeStatus::Online => write!(f, "online"),
            NodeStatus::Offline => write!(f, "offline"),
        }
    }
}

// --- Persisted heartbeat value ---

/// Value stored under `poll:node:{instance_id}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HeartbeatData {
    pub status: NodeStatus,
    pub startup_time: DateTime<Utc>,
}

impl HeartbeatData {
    pub fn to_json(&self) -> anyhow::Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(raw: &str) -> anyhow::Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }
}
