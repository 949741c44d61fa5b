//! Distributed polling lease manager.
//!
//! Each coordinator instance runs one [`LeaseManager`]. Ownership of a poll
//! target is a `poll:lease:{target}` key whose value is the owner's instance
//! ID. Acquisition is a set-if-absent; renewal and release are conditional on
//! the stored value still being ours, so no instance can disturb another's lease.
//!
//! Local state is a cache. It is only trusted while renewals keep succeeding:
//! a failed renewal makes the lease `Uncertain` and it stops counting as owned
//! straight away (fail-closed).

use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use pkg_constants::state::EVENT_LOG_CAPACITY;
use pkg_scheduler::{is_preferred, preferred_owner};
use pkg_state::client::{CoordinationStore, StoreError, bounded, lease_key};
use pkg_types::config::LeaseConfig;
use pkg_types::lease::{LeaseEventKind, LeaseInfo, LeaseState};
use pkg_types::node::{HeartbeatData, NodeStatus};

use crate::events::LeaseEventLog;
use crate::identity;

#[derive(Debug, thiserror::Error)]
pub enum LeaseError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("lease manager already started")]
    AlreadyStarted,
    #[error("lease manager not started")]
    NotStarted,
}

pub type Result<T> = std::result::Result<T, LeaseError>;

/// Local record of one lease incarnation.
#[derive(Debug, Clone)]
struct LeaseEntry {
    state: LeaseState,
    /// Distinguishes incarnations of the same target so late renewal results
    /// never touch a lease acquired after they were issued.
    generation: u64,
    acquired_at: DateTime<Utc>,
    last_renewed_at: DateTime<Utc>,
    /// When the last successful renewal (or the acquire) was *issued*.
    renewed_at: Instant,
    uncertain_since: Option<DateTime<Utc>>,
}

impl LeaseEntry {
    fn owned(generation: u64, issued: Instant) -> Self {
        let now = Utc::now();
        Self {
            state: LeaseState::Owned,
            generation,
            acquired_at: now,
            last_renewed_at: now,
            renewed_at: issued,
            uncertain_since: None,
        }
    }

    /// Owned and renewed within one TTL of the store's view.
    fn is_fresh(&self, config: &LeaseConfig) -> bool {
        self.state == LeaseState::Owned && self.renewed_at.elapsed() < config.lease_ttl
    }

    fn info(&self, target_id: &str) -> LeaseInfo {
        LeaseInfo {
            target_id: target_id.to_string(),
            state: self.state,
            acquired_at: self.acquired_at,
            last_renewed_at: self.last_renewed_at,
            uncertain_since: self.uncertain_since,
        }
    }
}

struct Background {
    shutdown: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

struct Inner {
    instance_id: String,
    store: Arc<dyn CoordinationStore>,
    config: LeaseConfig,
    startup_time: DateTime<Utc>,
    started: AtomicBool,
    online: AtomicBool,
    generation: AtomicU64,
    leases: Mutex<HashMap<String, LeaseEntry>>,
    live_nodes: RwLock<Vec<String>>,
    /// Peers that reported `online` at the last discovery.
    ready_peers: RwLock<HashSet<String>>,
    /// Targets this instance shed during rebalancing: the peer it was
    /// handed to and when this instance may contend for it again.
    shed: Mutex<HashMap<String, (String, Instant)>>,
    events: LeaseEventLog,
}

/// Coordinates polling leases for one instance. Explicitly constructed and
/// handed to the polling driver; all methods take `&self` and are safe to call
/// concurrently.
pub struct LeaseManager {
    inner: Arc<Inner>,
    background: Mutex<Option<Background>>,
}

impl LeaseManager {
    /// Create a manager with a generated instance ID (or `node_name` verbatim, if given).
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        config: LeaseConfig,
        node_name: Option<&str>,
    ) -> Self {
        Self::with_instance_id(identity::generate_instance_id(node_name), store, config)
    }

    pub fn with_instance_id(
        instance_id: impl Into<String>,
        store: Arc<dyn CoordinationStore>,
        config: LeaseConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                instance_id: instance_id.into(),
                store,
                config,
                startup_time: Utc::now(),
                started: AtomicBool::new(false),
                online: AtomicBool::new(false),
                generation: AtomicU64::new(0),
                leases: Mutex::new(HashMap::new()),
                live_nodes: RwLock::new(Vec::new()),
                ready_peers: RwLock::new(HashSet::new()),
                shed: Mutex::new(HashMap::new()),
                events: LeaseEventLog::new(EVENT_LOG_CAPACITY),
            }),
            background: Mutex::new(None),
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.inner.instance_id
    }

    pub fn events(&self) -> &LeaseEventLog {
        &self.inner.events
    }

    /// Whether this instance has left its startup grace period.
    pub fn is_ready(&self) -> bool {
        self.inner.is_ready()
    }

    /// Register the heartbeat, take a first look at live nodes and start the
    /// heartbeat, renewal and rebalance loops.
    pub async fn start(&self) -> Result<()> {
        let inner = &self.inner;
        if inner
            .started
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(LeaseError::AlreadyStarted);
        }

        let grace = inner.config.startup_grace;
        inner.online.store(grace.is_zero(), Ordering::SeqCst);

        if let Err(e) = inner.refresh_heartbeat().await {
            inner.started.store(false, Ordering::SeqCst);
            return Err(e.into());
        }

        if let Err(e) = inner.refresh_live_nodes().await {
            warn!(instance_id = %inner.instance_id, error = %e, "initial node discovery failed");
        }

        let (shutdown, rx) = watch::channel(false);
        let mut handles = vec![
            tokio::spawn(inner.clone().heartbeat_loop(rx.clone())),
            tokio::spawn(inner.clone().renewal_loop(rx.clone())),
            tokio::spawn(inner.clone().rebalance_loop(rx.clone())),
        ];
        if !grace.is_zero() {
            handles.push(tokio::spawn(inner.clone().promote_after_grace(rx)));
        }
        *self.lock_background() = Some(Background { shutdown, handles });

        info!(
            instance_id = %inner.instance_id,
            lease_ttl = ?inner.config.lease_ttl,
            renewal_interval = ?inner.config.renewal_interval,
            heartbeat_interval = ?inner.config.heartbeat_interval,
            node_discovery_interval = ?inner.config.node_discovery_interval,
            "lease manager started"
        );
        Ok(())
    }

    /// Stop the background loops, then release every lease and remove the
    /// heartbeat, all within `shutdown_timeout`. Whatever doesn't make it
    /// expires on its own.
    pub async fn stop(&self) {
        let Some(background) = self.lock_background().take() else {
            return;
        };
        let inner = &self.inner;
        let limit = inner.config.shutdown_timeout;

        let _ = background.shutdown.send(true);
        for mut handle in background.handles {
            if tokio::time::timeout(limit, &mut handle).await.is_err() {
                warn!(instance_id = %inner.instance_id, "background loop did not stop in time");
                handle.abort();
            }
        }

        let targets: Vec<String> = inner.lock_leases().keys().cloned().collect();
        let releases = join_all(
            targets
                .iter()
                .map(|target| inner.release_with_reason(target, "shutdown")),
        );
        if tokio::time::timeout(limit, releases).await.is_err() {
            warn!(instance_id = %inner.instance_id, "lease release timed out during shutdown");
        }
        inner.lock_leases().clear();

        if tokio::time::timeout(
            limit,
            identity::remove_heartbeat(inner.store.as_ref(), &inner.instance_id),
        )
        .await
        .is_err()
        {
            warn!(instance_id = %inner.instance_id, "heartbeat removal timed out during shutdown");
        }

        inner.started.store(false, Ordering::SeqCst);
        info!(
            instance_id = %inner.instance_id,
            leases_released = targets.len(),
            "lease manager stopped"
        );
    }

    /// Try to take the lease for `target_id`.
    ///
    /// `Ok(true)` if the lease was taken now or is already ours, `Ok(false)` if
    /// another instance holds it. An unheld key is taken whoever its preferred
    /// owner is, except during startup grace and for a target this instance
    /// just shed to an online peer. Every failure emits `AcquireFailed`.
    /// Never retries; the caller owns the cadence.
    pub async fn try_acquire(&self, target_id: &str) -> Result<bool> {
        let inner = &self.inner;
        if !inner.started.load(Ordering::SeqCst) {
            return Err(LeaseError::NotStarted);
        }
        if inner.is_owned(target_id) {
            return Ok(true);
        }

        let key = lease_key(target_id);
        let id = inner.instance_id.as_str();
        let ttl = inner.config.lease_ttl;
        let limit = inner.config.store_timeout;

        if !inner.is_ready() {
            debug!(instance_id = id, target_id, "not contending for leases during startup grace");
            inner.emit(
                LeaseEventKind::AcquireFailed,
                target_id,
                Some("startup grace".to_string()),
            );
            return Ok(false);
        }
        if let Some(peer) = inner.shed_to(target_id) {
            debug!(
                instance_id = id,
                target_id,
                preferred_owner = %peer,
                "lease recently handed to its preferred owner"
            );
            inner.emit(
                LeaseEventKind::AcquireFailed,
                target_id,
                Some(format!("deferred to {}", peer)),
            );
            return Ok(false);
        }

        let issued = Instant::now();
        match bounded(limit, inner.store.set_if_absent(&key, id, ttl)).await {
            Ok(true) => {
                inner.insert_owned(target_id, issued, None);
                inner.emit(LeaseEventKind::Acquired, target_id, None);
                return Ok(true);
            }
            Ok(false) => {}
            Err(e) => {
                inner.emit(LeaseEventKind::AcquireFailed, target_id, Some(e.to_string()));
                return Err(e.into());
            }
        }

        // Idempotent re-entry: the key may already carry our ID (e.g. a lease
        // that went uncertain locally but was never lost in the store).
        let owner = match bounded(limit, inner.store.get(&key)).await {
            Ok(owner) => owner,
            Err(e) => {
                inner.emit(LeaseEventKind::AcquireFailed, target_id, Some(e.to_string()));
                return Err(e.into());
            }
        };
        let detail = match owner {
            Some(owner) if owner == id => {
                let issued = Instant::now();
                match bounded(limit, inner.store.compare_and_extend(&key, id, ttl)).await {
                    Ok(true) => {
                        inner.insert_owned(target_id, issued, Some("already held"));
                        return Ok(true);
                    }
                    Ok(false) => "lease changed hands".to_string(),
                    Err(e) => {
                        inner.emit(LeaseEventKind::AcquireFailed, target_id, Some(e.to_string()));
                        return Err(e.into());
                    }
                }
            }
            Some(owner) => format!("held by {}", owner),
            None => "lease expired before it could be read".to_string(),
        };
        inner.emit(LeaseEventKind::AcquireFailed, target_id, Some(detail));
        Ok(false)
    }

    /// Cached ownership check: no store round trip.
    pub fn is_owned(&self, target_id: &str) -> bool {
        self.inner.is_owned(target_id)
    }

    /// Whether the last renewal of this target failed and ownership is being reconciled.
    pub fn is_uncertain(&self, target_id: &str) -> bool {
        self.inner
            .lock_leases()
            .get(target_id)
            .is_some_and(|e| e.state == LeaseState::Uncertain)
    }

    /// Ownership check against the store, for use right before an irreversible action.
    ///
    /// A locally owned lease that the store no longer attributes to us is dropped.
    pub async fn is_owned_strict(&self, target_id: &str) -> Result<bool> {
        let inner = &self.inner;
        let owner = bounded(inner.config.store_timeout, inner.store.get(&lease_key(target_id)))
            .await?;
        if owner.as_deref() == Some(inner.instance_id.as_str()) {
            return Ok(inner.is_owned(target_id));
        }

        if inner.remove_entry(target_id, None) {
            let (kind, detail) = match owner {
                Some(other) => (LeaseEventKind::Lost, format!("taken over by {}", other)),
                None => (LeaseEventKind::Expired, "key missing on strict check".to_string()),
            };
            inner.emit(kind, target_id, Some(detail));
        }
        Ok(false)
    }

    /// Give up the lease. Local ownership ends immediately; the store key is
    /// deleted only if it still carries our ID.
    pub async fn release(&self, target_id: &str) -> Result<()> {
        self.inner.release_with_reason(target_id, "voluntary").await
    }

    /// Targets currently owned (fresh `Owned` entries), sorted.
    pub fn owned_targets(&self) -> Vec<String> {
        let inner = &self.inner;
        let mut targets: Vec<String> = inner
            .lock_leases()
            .iter()
            .filter(|(_, e)| e.is_fresh(&inner.config))
            .map(|(t, _)| t.clone())
            .collect();
        targets.sort();
        targets
    }

    pub fn lease_info(&self, target_id: &str) -> Option<LeaseInfo> {
        self.inner
            .lock_leases()
            .get(target_id)
            .map(|e| e.info(target_id))
    }

    /// Current owner of a lease according to the store.
    pub async fn lease_owner(&self, target_id: &str) -> Result<Option<String>> {
        let inner = &self.inner;
        Ok(bounded(inner.config.store_timeout, inner.store.get(&lease_key(target_id))).await?)
    }

    /// Last discovered live nodes (stale by at most one discovery interval).
    pub fn live_nodes(&self) -> Vec<String> {
        self.inner.cached_nodes()
    }

    /// Scan the store for live nodes and update the cache.
    pub async fn refresh_live_nodes(&self) -> Result<Vec<String>> {
        Ok(self.inner.refresh_live_nodes().await?)
    }

    /// Preferred owner of `target_id` among the cached live nodes.
    pub async fn preferred_owner(&self, target_id: &str) -> Result<Option<String>> {
        let nodes = self.nodes_for_placement().await?;
        Ok(preferred_owner(target_id, &nodes).map(str::to_string))
    }

    pub async fn is_preferred_owner(&self, target_id: &str) -> Result<bool> {
        let nodes = self.nodes_for_placement().await?;
        Ok(is_preferred(self.instance_id(), target_id, &nodes))
    }

    /// Cached live nodes, scanning the store once if nothing was discovered yet.
    async fn nodes_for_placement(&self) -> Result<Vec<String>> {
        let nodes = self.inner.cached_nodes();
        if !nodes.is_empty() {
            return Ok(nodes);
        }
        Ok(self.inner.refresh_live_nodes().await?)
    }

    /// A peer's self-reported status.
    pub async fn node_status(&self, instance_id: &str) -> Result<NodeStatus> {
        let inner = &self.inner;
        Ok(bounded(
            inner.config.store_timeout,
            identity::node_status(inner.store.as_ref(), instance_id),
        )
        .await?)
    }

    pub async fn is_node_ready(&self, instance_id: &str) -> Result<bool> {
        Ok(self.node_status(instance_id).await? == NodeStatus::Online)
    }

    /// Stop the background loops without releasing anything, as a crashed process would.
    #[cfg(test)]
    pub(crate) fn halt(&self) {
        if let Some(background) = self.lock_background().take() {
            for handle in background.handles {
                handle.abort();
            }
        }
    }

    fn lock_background(&self) -> MutexGuard<'_, Option<Background>> {
        self.background.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Inner {
    fn lock_leases(&self) -> MutexGuard<'_, HashMap<String, LeaseEntry>> {
        self.leases.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn is_ready(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    fn is_owned(&self, target_id: &str) -> bool {
        self.lock_leases()
            .get(target_id)
            .is_some_and(|e| e.is_fresh(&self.config))
    }

    fn emit(&self, kind: LeaseEventKind, target_id: &str, detail: Option<String>) {
        self.events.emit(kind, &self.instance_id, target_id, detail);
    }

    fn cached_nodes(&self) -> Vec<String> {
        self.live_nodes
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn heartbeat_data(&self) -> HeartbeatData {
        HeartbeatData {
            status: if self.is_ready() {
                NodeStatus::Online
            } else {
                NodeStatus::Init
            },
            startup_time: self.startup_time,
        }
    }

    async fn refresh_heartbeat(&self) -> std::result::Result<(), StoreError> {
        bounded(
            self.config.store_timeout,
            identity::refresh_heartbeat(
                self.store.as_ref(),
                &self.instance_id,
                &self.heartbeat_data(),
                self.config.heartbeat_ttl,
            ),
        )
        .await
    }

    async fn refresh_live_nodes(&self) -> std::result::Result<Vec<String>, StoreError> {
        let nodes = bounded(
            self.config.store_timeout,
            identity::get_live_nodes(self.store.as_ref()),
        )
        .await?;

        let peers = nodes.iter().filter(|n| **n != self.instance_id);
        let statuses = join_all(peers.map(|peer| async move {
            let status = bounded(
                self.config.store_timeout,
                identity::node_status(self.store.as_ref(), peer),
            )
            .await;
            (peer, status)
        }))
        .await;

        let mut ready = HashSet::new();
        for (peer, status) in statuses {
            match status {
                Ok(NodeStatus::Online) => {
                    ready.insert(peer.clone());
                }
                Ok(_) => {}
                Err(e) => {
                    debug!(instance_id = %self.instance_id, peer = %peer, error = %e, "peer status unknown");
                }
            }
        }

        debug!(
            instance_id = %self.instance_id,
            node_count = nodes.len(),
            ready_peers = ready.len(),
            nodes = ?nodes,
            "node discovery refreshed"
        );
        *self.live_nodes.write().unwrap_or_else(|e| e.into_inner()) = nodes.clone();
        *self.ready_peers.write().unwrap_or_else(|e| e.into_inner()) = ready;
        Ok(nodes)
    }

    /// The online peer that should own `target_id` instead of this instance, if any.
    fn handover_target(&self, target_id: &str) -> Option<String> {
        let nodes = self.cached_nodes();
        let preferred = preferred_owner(target_id, &nodes)?;
        if preferred == self.instance_id {
            return None;
        }
        let ready = self.ready_peers.read().unwrap_or_else(|e| e.into_inner());
        ready.contains(preferred).then(|| preferred.to_string())
    }

    /// The peer a recently shed target was handed to, while the cooldown
    /// runs and that peer is still online.
    fn shed_to(&self, target_id: &str) -> Option<String> {
        let mut shed = self.shed.lock().unwrap_or_else(|e| e.into_inner());
        let (peer, until) = shed.get(target_id)?;
        let online = self
            .ready_peers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains(peer);
        if online && Instant::now() < *until {
            return Some(peer.clone());
        }
        shed.remove(target_id);
        None
    }

    /// Record a freshly confirmed lease, replacing any previous incarnation.
    fn insert_owned(&self, target_id: &str, issued: Instant, reentry: Option<&str>) {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let mut entry = LeaseEntry::owned(generation, issued);
        {
            let mut leases = self.lock_leases();
            if reentry.is_some() {
                if let Some(previous) = leases.get(target_id) {
                    entry.acquired_at = previous.acquired_at;
                }
            }
            leases.insert(target_id.to_string(), entry);
        }
        if let Some(detail) = reentry {
            self.emit(LeaseEventKind::Acquired, target_id, Some(detail.to_string()));
        }
    }

    /// Remove the entry for `target_id`, only if it is still `generation` when one is given.
    fn remove_entry(&self, target_id: &str, generation: Option<u64>) -> bool {
        let mut leases = self.lock_leases();
        match leases.get(target_id) {
            Some(e) if generation.is_none_or(|g| g == e.generation) => {
                leases.remove(target_id);
                true
            }
            _ => false,
        }
    }

    fn mark_renewed(&self, target_id: &str, generation: u64, issued: Instant) -> bool {
        let mut leases = self.lock_leases();
        match leases.get_mut(target_id) {
            Some(e) if e.generation == generation => {
                e.state = LeaseState::Owned;
                e.renewed_at = issued;
                e.last_renewed_at = Utc::now();
                e.uncertain_since = None;
                true
            }
            _ => false,
        }
    }

    fn mark_uncertain(&self, target_id: &str, generation: u64) -> bool {
        let mut leases = self.lock_leases();
        match leases.get_mut(target_id) {
            Some(e) if e.generation == generation => {
                if e.state != LeaseState::Uncertain {
                    e.uncertain_since = Some(Utc::now());
                }
                e.state = LeaseState::Uncertain;
                true
            }
            _ => false,
        }
    }

    fn entries_in(&self, state: LeaseState) -> Vec<(String, u64)> {
        self.lock_leases()
            .iter()
            .filter(|(_, e)| e.state == state)
            .map(|(t, e)| (t.clone(), e.generation))
            .collect()
    }

    async fn release_with_reason(&self, target_id: &str, reason: &str) -> Result<()> {
        let held = self.remove_entry(target_id, None);
        let outcome = bounded(
            self.config.store_timeout,
            self.store
                .compare_and_delete(&lease_key(target_id), &self.instance_id),
        )
        .await;

        match outcome {
            Ok(deleted) => {
                if held || deleted {
                    let detail = if deleted {
                        reason.to_string()
                    } else {
                        format!("{}; key no longer held", reason)
                    };
                    self.emit(LeaseEventKind::Released, target_id, Some(detail));
                }
                Ok(())
            }
            Err(e) => {
                if held {
                    self.emit(
                        LeaseEventKind::Released,
                        target_id,
                        Some(format!("{}; store delete failed: {}", reason, e)),
                    );
                }
                Err(e.into())
            }
        }
    }

    /// Extend every owned lease, concurrently and each within `store_timeout`.
    async fn renew_owned(&self) {
        let owned = self.entries_in(LeaseState::Owned);
        if owned.is_empty() {
            return;
        }
        let id = self.instance_id.as_str();
        let ttl = self.config.lease_ttl;

        join_all(owned.iter().map(|(target_id, generation)| async move {
            let issued = Instant::now();
            let key = lease_key(target_id);
            let outcome = bounded(
                self.config.store_timeout,
                self.store.compare_and_extend(&key, id, ttl),
            )
            .await;

            match outcome {
                Ok(true) => {
                    if self.mark_renewed(target_id, *generation, issued) {
                        self.emit(LeaseEventKind::Renewed, target_id, None);
                    }
                }
                Ok(false) => {
                    if self.mark_uncertain(target_id, *generation) {
                        self.emit(
                            LeaseEventKind::RenewFailed,
                            target_id,
                            Some("stored owner differs".to_string()),
                        );
                        self.emit(
                            LeaseEventKind::Lost,
                            target_id,
                            Some("lease no longer held".to_string()),
                        );
                    }
                }
                Err(e) => {
                    if self.mark_uncertain(target_id, *generation) {
                        self.emit(LeaseEventKind::RenewFailed, target_id, Some(e.to_string()));
                        self.emit(
                            LeaseEventKind::Lost,
                            target_id,
                            Some(format!("ownership unconfirmed: {}", e)),
                        );
                    }
                }
            }
        }))
        .await;
    }

    /// Settle every uncertain lease against the store: restore it if the key
    /// is still ours, forget it otherwise. Store errors leave it uncertain.
    async fn reconcile_uncertain(&self) {
        let uncertain = self.entries_in(LeaseState::Uncertain);
        if uncertain.is_empty() {
            return;
        }
        let id = self.instance_id.as_str();
        let limit = self.config.store_timeout;

        join_all(uncertain.iter().map(|(target_id, generation)| async move {
            let key = lease_key(target_id);
            let owner = match bounded(limit, self.store.get(&key)).await {
                Ok(owner) => owner,
                Err(e) => {
                    debug!(instance_id = id, target_id = %target_id, error = %e, "lease still uncertain");
                    return;
                }
            };

            match owner {
                None => {
                    if self.remove_entry(target_id, Some(*generation)) {
                        self.emit(LeaseEventKind::Expired, target_id, None);
                    }
                }
                Some(other) if other != id => {
                    if self.remove_entry(target_id, Some(*generation)) {
                        self.emit(
                            LeaseEventKind::Lost,
                            target_id,
                            Some(format!("taken over by {}", other)),
                        );
                    }
                }
                Some(_) => {
                    let issued = Instant::now();
                    match bounded(
                        limit,
                        self.store.compare_and_extend(&key, id, self.config.lease_ttl),
                    )
                    .await
                    {
                        Ok(true) => {
                            if self.mark_renewed(target_id, *generation, issued) {
                                self.emit(
                                    LeaseEventKind::Renewed,
                                    target_id,
                                    Some("reconciled".to_string()),
                                );
                            }
                        }
                        Ok(false) => {
                            if self.remove_entry(target_id, Some(*generation)) {
                                self.emit(
                                    LeaseEventKind::Lost,
                                    target_id,
                                    Some("lease changed hands during reconciliation".to_string()),
                                );
                            }
                        }
                        Err(e) => {
                            debug!(instance_id = id, target_id = %target_id, error = %e, "lease still uncertain");
                        }
                    }
                }
            }
        }))
        .await;
    }

    /// Shed owned leases whose preferred owner is another online instance and
    /// stay off them for a cooldown. Advisory only: any failure just keeps the
    /// lease for now.
    async fn rebalance(&self) {
        let nodes = match self.refresh_live_nodes().await {
            Ok(nodes) => nodes,
            Err(e) => {
                warn!(instance_id = %self.instance_id, error = %e, "node discovery refresh failed");
                return;
            }
        };
        if !self.is_ready() || !nodes.contains(&self.instance_id) {
            debug!(instance_id = %self.instance_id, "skipping rebalance");
            return;
        }

        let owned: Vec<String> = self
            .entries_in(LeaseState::Owned)
            .into_iter()
            .map(|(target_id, _)| target_id)
            .collect();

        // One discovery interval per other peer: every non-preferred peer
        // that picks the target up in between has shed it too by then.
        let others = nodes.len().saturating_sub(1).clamp(1, 64) as u32;
        let cooldown = self.config.node_discovery_interval * others;

        for target_id in owned {
            // Only hand over to a peer that is online; one still in init keeps waiting.
            let Some(preferred) = self.handover_target(&target_id) else {
                continue;
            };

            match self.release_with_reason(&target_id, "rebalance").await {
                Ok(()) => {
                    info!(
                        instance_id = %self.instance_id,
                        target_id = %target_id,
                        preferred_owner = %preferred,
                        "lease released for rebalancing"
                    );
                    self.shed
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .insert(target_id, (preferred, Instant::now() + cooldown));
                }
                Err(e) => warn!(
                    instance_id = %self.instance_id,
                    target_id = %target_id,
                    error = %e,
                    "failed to release non-preferred lease"
                ),
            }
        }
    }

    async fn heartbeat_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.config.heartbeat_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick fires immediately; start() has just written the heartbeat.
        interval.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = interval.tick() => {}
            }
            if let Err(e) = self.refresh_heartbeat().await {
                warn!(instance_id = %self.instance_id, error = %e, "heartbeat refresh failed");
            }
        }
    }

    async fn renewal_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.config.renewal_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        interval.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = interval.tick() => {}
            }
            self.renew_owned().await;
            self.reconcile_uncertain().await;
        }
    }

    async fn rebalance_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.config.node_discovery_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        interval.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = interval.tick() => {}
            }
            self.rebalance().await;
        }
    }

    async fn promote_after_grace(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        tokio::select! {
            _ = shutdown.changed() => return,
            _ = tokio::time::sleep(self.config.startup_grace) => {}
        }
        self.online.store(true, Ordering::SeqCst);
        info!(
            instance_id = %self.instance_id,
            grace_period = ?self.config.startup_grace,
            "node status transitioned to online"
        );
        if let Err(e) = self.refresh_heartbeat().await {
            warn!(instance_id = %self.instance_id, error = %e, "heartbeat refresh failed");
        }
    }
}
