//! Polling driver: the loop that turns leases into poll calls.
//!
//! Each cycle lists the current targets, contends for every one of them and
//! polls the ones this instance owns. Targets that left the registry are
//! released so their keys don't linger until expiry.

use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::lease::LeaseManager;

/// Source of the poll targets that exist right now.
#[async_trait]
pub trait TargetRegistry: Send + Sync {
    async fn list_targets(&self) -> anyhow::Result<Vec<String>>;
}

/// Performs one poll of a target this instance owns.
#[async_trait]
pub trait Poller: Send + Sync {
    async fn poll(&self, target_id: &str) -> anyhow::Result<()>;
}

/// Fixed target list, replaceable at runtime.
#[derive(Default)]
pub struct StaticRegistry {
    targets: RwLock<Vec<String>>,
}

impl StaticRegistry {
    pub fn new<I, S>(targets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            targets: RwLock::new(targets.into_iter().map(Into::into).collect()),
        }
    }

    pub fn set_targets<I, S>(&self, targets: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        *self.targets.write().unwrap_or_else(|e| e.into_inner()) =
            targets.into_iter().map(Into::into).collect();
    }
}

#[async_trait]
impl TargetRegistry for StaticRegistry {
    async fn list_targets(&self) -> anyhow::Result<Vec<String>> {
        Ok(self
            .targets
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone())
    }
}

/// Outcome of one driver cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DriverCycle {
    pub polled: usize,
    /// Owned targets paused because their last renewal failed.
    pub skipped_uncertain: usize,
    pub not_owned: usize,
    pub errors: usize,
    /// Owned targets released because they left the registry.
    pub released: usize,
}

pub struct PollingDriver {
    manager: Arc<LeaseManager>,
    registry: Arc<dyn TargetRegistry>,
    poller: Arc<dyn Poller>,
    interval: Duration,
    /// Targets whose ownership was confirmed against the store since they were acquired.
    verified: Mutex<HashSet<String>>,
}

impl PollingDriver {
    pub fn new(
        manager: Arc<LeaseManager>,
        registry: Arc<dyn TargetRegistry>,
        poller: Arc<dyn Poller>,
        interval: Duration,
    ) -> Self {
        Self {
            manager,
            registry,
            poller,
            interval,
            verified: Mutex::new(HashSet::new()),
        }
    }

    /// Run the driver loop until `shutdown` flips to true.
    pub fn start(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            info!(
                "PollingDriver started for {} (interval={}s)",
                self.manager.instance_id(),
                self.interval.as_secs()
            );
            let mut interval = tokio::time::interval(self.interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = interval.tick() => {}
                }
                match self.run_once().await {
                    Ok(cycle) => debug!(
                        polled = cycle.polled,
                        skipped_uncertain = cycle.skipped_uncertain,
                        not_owned = cycle.not_owned,
                        errors = cycle.errors,
                        released = cycle.released,
                        "driver cycle complete"
                    ),
                    Err(e) => warn!("PollingDriver cycle error: {}", e),
                }
            }
            info!("PollingDriver stopped");
        })
    }

    /// One pass over the registry.
    pub async fn run_once(&self) -> anyhow::Result<DriverCycle> {
        let targets = self.registry.list_targets().await?;
        let wanted: HashSet<&str> = targets.iter().map(String::as_str).collect();
        let mut cycle = DriverCycle::default();

        // Anything not owned right now has to be re-verified once it comes back.
        self.lock_verified()
            .retain(|target| self.manager.is_owned(target));

        for target_id in self.manager.owned_targets() {
            if wanted.contains(target_id.as_str()) {
                continue;
            }
            self.lock_verified().remove(&target_id);
            match self.manager.release(&target_id).await {
                Ok(()) => {
                    info!("Released lease for removed target {}", target_id);
                    cycle.released += 1;
                }
                Err(e) => {
                    warn!("Failed to release removed target {}: {}", target_id, e);
                    cycle.errors += 1;
                }
            }
        }

        for target_id in &targets {
            if self.manager.is_uncertain(target_id) {
                debug!(target_id = %target_id, "lease uncertain, pausing polls");
                cycle.skipped_uncertain += 1;
                continue;
            }

            match self.manager.try_acquire(target_id).await {
                Ok(true) => {}
                Ok(false) => {
                    cycle.not_owned += 1;
                    continue;
                }
                Err(e) => {
                    warn!(target_id = %target_id, error = %e, "lease acquisition failed");
                    cycle.errors += 1;
                    continue;
                }
            }

            let verified = self.lock_verified().contains(target_id);
            if !verified {
                match self.manager.is_owned_strict(target_id).await {
                    Ok(true) => {
                        self.lock_verified().insert(target_id.clone());
                    }
                    Ok(false) => {
                        cycle.not_owned += 1;
                        continue;
                    }
                    Err(e) => {
                        warn!(target_id = %target_id, error = %e, "ownership check failed");
                        cycle.errors += 1;
                        continue;
                    }
                }
            }

            match self.poller.poll(target_id).await {
                Ok(()) => cycle.polled += 1,
                Err(e) => {
                    warn!(target_id = %target_id, error = %e, "poll failed");
                    cycle.errors += 1;
                }
            }
        }

        Ok(cycle)
    }

    fn lock_verified(&self) -> std::sync::MutexGuard<'_, HashSet<String>> {
        self.verified.lock().unwrap_or_else(|e| e.into_inner())
    }
}
