use chrono::Utc;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use pkg_types::lease::{LeaseEvent, LeaseEventKind};

/// In-memory log of lease lifecycle events with monotonic sequence numbers.
///
/// Every event is also emitted as one `tracing` event under the `lease_event`
/// target, so it reaches whatever subscriber the host process installed.
#[derive(Clone)]
pub struct LeaseEventLog {
    inner: Arc<Mutex<EventLogInner>>,
    sender: broadcast::Sender<LeaseEvent>,
}

struct EventLogInner {
    seq: u64,
    /// Ring buffer of recent events (capped)
    events: VecDeque<LeaseEvent>,
    max_events: usize,
}

impl LeaseEventLog {
    /// Create a new event log with the given capacity for recent events.
    pub fn new(max_events: usize) -> Self {
        let (sender, _) = broadcast::channel(1024);
        Self {
            inner: Arc::new(Mutex::new(EventLogInner {
                seq: 0,
                events: VecDeque::with_capacity(max_events),
                max_events,
            })),
            sender,
        }
    }

    /// Record and publish one event.
    pub fn emit(
        &self,
        kind: LeaseEventKind,
        instance_id: &str,
        target_id: &str,
        detail: Option<String>,
    ) -> LeaseEvent {
        let event = {
            let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            inner.seq += 1;
            let event = LeaseEvent {
                seq: inner.seq,
                kind,
                instance_id: instance_id.to_string(),
                target_id: target_id.to_string(),
                timestamp: Utc::now(),
                detail,
            };
            if inner.events.len() >= inner.max_events {
                inner.events.pop_front();
            }
            inner.events.push_back(event.clone());
            event
        };

        log_event(&event);
        // No receivers is fine
        let _ = self.sender.send(event.clone());
        event
    }

    /// Get the current sequence number.
    pub fn current_seq(&self) -> u64 {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).seq
    }

    /// Get all retained events with a sequence number above `from_seq`.
    pub fn events_since(&self, from_seq: u64) -> Vec<LeaseEvent> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner
            .events
            .iter()
            .filter(|e| e.seq > from_seq)
            .cloned()
            .collect()
    }

    /// Retained events of one kind for one target.
    pub fn events_for(&self, target_id: &str, kind: LeaseEventKind) -> Vec<LeaseEvent> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner
            .events
            .iter()
            .filter(|e| e.target_id == target_id && e.kind == kind)
            .cloned()
            .collect()
    }

    /// Subscribe to receive new events as they are emitted.
    pub fn subscribe(&self) -> broadcast::Receiver<LeaseEvent> {
        self.sender.subscribe()
    }
}

fn log_event(event: &LeaseEvent) {
    let detail = event.detail.as_deref().unwrap_or("");
    match event.kind {
        LeaseEventKind::Acquired | LeaseEventKind::Released | LeaseEventKind::Expired => {
            info!(
                target: "lease_event",
                kind = %event.kind,
                instance_id = %event.instance_id,
                target_id = %event.target_id,
                timestamp = %event.timestamp,
                detail,
                "lease {}", event.kind
            );
        }
        LeaseEventKind::RenewFailed | LeaseEventKind::Lost => {
            warn!(
                target: "lease_event",
                kind = %event.kind,
                instance_id = %event.instance_id,
                target_id = %event.target_id,
                timestamp = %event.timestamp,
                detail,
                "lease {}", event.kind
            );
        }
        LeaseEventKind::Renewed | LeaseEventKind::AcquireFailed => {
            debug!(
                target: "lease_event",
                kind = %event.kind,
                instance_id = %event.instance_id,
                target_id = %event.target_id,
                timestamp = %event.timestamp,
                detail,
                "lease {}", event.kind
            );
        }
    }
}
