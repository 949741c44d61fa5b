use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// This instance's view of one polling lease.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LeaseState {
    /// The lease is held and the last renewal succeeded.
    Owned,
    /// The last renewal failed; the target must not be polled until reconciled.
    Uncertain,
}

impl std::fmt::Display for LeaseState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LeaseState::Owned => write!(f, "owned"),
            LeaseState::Uncertain => write!(f, "uncertain"),
        }
    }
}

/// Local metadata about a lease this instance holds (or held until a renewal failed).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaseInfo {
    pub target_id: String,
    pub state: LeaseState,
    /// When this instance acquired the lease
    pub acquired_at: DateTime<Utc>,
    /// When the lease was last renewed successfully
    pub last_renewed_at: DateTime<Utc>,
    /// Set while the lease is `Uncertain`
    #[serde(default)]
    pub uncertain_since: Option<DateTime<Utc>>,
}

// --- Lease lifecycle events ---

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum LeaseEventKind {
    Acquired,
    AcquireFailed,
    Renewed,
    RenewFailed,
    /// Given up voluntarily (driver request, rebalance or shutdown).
    Released,
    /// The lease key vanished before this instance could renew it.
    Expired,
    /// Another instance holds the key, or certainty about ownership was lost.
    Lost,
}

impl LeaseEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            LeaseEventKind::Acquired => "acquired",
            LeaseEventKind::AcquireFailed => "acquire_failed",
            LeaseEventKind::Renewed => "renewed",
            LeaseEventKind::RenewFailed => "renew_failed",
            LeaseEventKind::Released => "released",
            LeaseEventKind::Expired => "expired",
            LeaseEventKind::Lost => "lost",
        }
    }
}

impl std::fmt::Display for LeaseEventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One structured lease lifecycle event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaseEvent {
    pub seq: u64,
    pub kind: LeaseEventKind,
    pub instance_id: String,
    pub target_id: String,
    pub timestamp: DateTime<Utc>,
    /// Free-form context: release reason, competing owner or error text.
    #[serde(default)]
    pub detail: Option<String>,
}
