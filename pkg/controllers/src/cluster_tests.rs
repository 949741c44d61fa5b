//! Several lease managers sharing one in-memory store, driven on a paused clock.

use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

use pkg_state::client::CoordinationStore;
use pkg_state::memory::MemoryStore;
use pkg_types::config::LeaseConfig;
use pkg_types::lease::LeaseEventKind;

use crate::driver::{Poller, PollingDriver, StaticRegistry};
use crate::lease::LeaseManager;

fn config() -> LeaseConfig {
    LeaseConfig {
        startup_grace: Duration::ZERO,
        ..LeaseConfig::default()
    }
}

async fn cluster(store: &MemoryStore, ids: &[&str]) -> Vec<Arc<LeaseManager>> {
    let mut managers = Vec::new();
    for id in ids {
        let m = Arc::new(LeaseManager::with_instance_id(
            *id,
            Arc::new(store.clone()),
            config(),
        ));
        m.start().await.unwrap();
        managers.push(m);
    }
    for m in &managers {
        m.refresh_live_nodes().await.unwrap();
    }
    managers
}

fn targets(n: usize) -> Vec<String> {
    (1..=n).map(|i| format!("target-{}", i)).collect()
}

/// Every manager contends for every target, as each driver would.
async fn contend_all(managers: &[Arc<LeaseManager>], targets: &[String]) {
    for m in managers {
        for t in targets {
            let _ = m.try_acquire(t).await;
        }
    }
}

#[derive(Default)]
struct CountingPoller {
    polls: AtomicUsize,
}

#[async_trait]
impl Poller for CountingPoller {
    async fn poll(&self, _target_id: &str) -> anyhow::Result<()> {
        self.polls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

async fn start_manager(store: &MemoryStore, id: &str) -> Arc<LeaseManager> {
    let m = Arc::new(LeaseManager::with_instance_id(
        id,
        Arc::new(store.clone()),
        config(),
    ));
    m.start().await.unwrap();
    m
}

async fn stop_all(managers: &[Arc<LeaseManager>]) {
    for m in managers {
        m.stop().await;
    }
}

#[tokio::test(start_paused = true)]
async fn test_leases_balance_across_nodes() {
    let store = MemoryStore::new();
    let managers = cluster(&store, &["node-a", "node-b", "node-c"]).await;
    let targets = targets(9);

    for _ in 0..12 {
        contend_all(&managers, &targets).await;
        tokio::time::sleep(Duration::from_secs(5)).await;
    }

    let counts: Vec<usize> = managers.iter().map(|m| m.owned_targets().len()).collect();
    assert_eq!(counts.iter().sum::<usize>(), 9, "counts: {:?}", counts);
    assert_eq!(counts, vec![3, 3, 3]);

    for t in &targets {
        let preferred = managers[0].preferred_owner(t).await.unwrap().unwrap();
        let owner = store.get(&format!("poll:lease:{}", t)).await.unwrap();
        assert_eq!(owner.as_deref(), Some(preferred.as_str()), "target {}", t);
    }
    stop_all(&managers).await;
}

#[tokio::test(start_paused = true)]
async fn test_at_most_one_owner_at_any_time() {
    let store = MemoryStore::new();
    let managers = cluster(&store, &["node-a", "node-b", "node-c"]).await;
    let targets = targets(6);

    for step in 0..90 {
        if step % 5 == 0 {
            contend_all(&managers, &targets).await;
        }
        for t in &targets {
            let owners: Vec<&str> = managers
                .iter()
                .filter(|m| m.is_owned(t))
                .map(|m| m.instance_id())
                .collect();
            assert!(owners.len() <= 1, "{} owned by {:?} at step {}", t, owners, step);
            if let [owner] = owners.as_slice() {
                let stored = store.get(&format!("poll:lease:{}", t)).await.unwrap();
                assert_eq!(stored.as_deref(), Some(*owner));
            }
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
    stop_all(&managers).await;
}

#[tokio::test(start_paused = true)]
async fn test_crashed_owner_is_replaced_within_ttl() {
    let store = MemoryStore::new();
    let managers = cluster(&store, &["node-a", "node-b"]).await;
    let (a, b) = (&managers[0], &managers[1]);

    assert!(a.try_acquire("target-5").await.unwrap());
    assert!(!b.try_acquire("target-5").await.unwrap());
    a.halt();

    let mut taken_over_after = None;
    for second in 1..=40 {
        tokio::time::sleep(Duration::from_secs(1)).await;
        if b.try_acquire("target-5").await.unwrap() {
            taken_over_after = Some(second);
            break;
        }
    }
    let second = taken_over_after.expect("target never changed hands");
    assert!(second >= 30, "lease taken over early, after {}s", second);
    assert_eq!(
        store.get("poll:lease:target-5").await.unwrap().as_deref(),
        Some("node-b")
    );
    b.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_failover_with_offset_start_and_drivers_running() {
    let store = MemoryStore::new();
    let registry = Arc::new(StaticRegistry::new(["target-5"]));
    let interval = Duration::from_secs(5);

    let a = start_manager(&store, "node-a").await;
    let poller_a = Arc::new(CountingPoller::default());
    let (stop_a, rx_a) = watch::channel(false);
    let driver_a = Arc::new(PollingDriver::new(
        a.clone(),
        registry.clone(),
        poller_a.clone(),
        interval,
    ))
    .start(rx_a);

    // node-b's heartbeat, renewal, discovery and driver timers all run 3.5s behind node-a's.
    tokio::time::sleep(Duration::from_millis(3500)).await;
    let b = start_manager(&store, "node-b").await;
    let poller_b = Arc::new(CountingPoller::default());
    let (stop_b, rx_b) = watch::channel(false);
    let driver_b = Arc::new(PollingDriver::new(
        b.clone(),
        registry.clone(),
        poller_b.clone(),
        interval,
    ))
    .start(rx_b);

    // Crash node-a just after its renewal at 20s pushed the key out to 50s.
    tokio::time::sleep(Duration::from_secs(17)).await;
    assert!(a.is_owned("target-5"));
    assert!(!b.is_owned("target-5"));
    assert!(poller_a.polls.load(Ordering::SeqCst) >= 4);
    assert_eq!(poller_b.polls.load(Ordering::SeqCst), 0);
    a.halt();
    stop_a.send(true).unwrap();
    driver_a.await.unwrap();

    let crashed_at = Instant::now();
    for _ in 0..60 {
        if b.is_owned("target-5") {
            break;
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
    let took = crashed_at.elapsed();
    let limit = config().lease_ttl + config().renewal_interval;
    assert!(b.is_owned("target-5"), "target never changed hands");
    assert!(took <= limit, "takeover took {:?}", took);
    assert!(poller_b.polls.load(Ordering::SeqCst) >= 1);
    assert_eq!(
        store.get("poll:lease:target-5").await.unwrap().as_deref(),
        Some("node-b")
    );

    stop_b.send(true).unwrap();
    driver_b.await.unwrap();
    b.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_non_preferred_instance_takes_unowned_target() {
    let store = MemoryStore::new();
    let managers = cluster(&store, &["node-a", "node-b"]).await;
    let (a, b) = (&managers[0], &managers[1]);

    // target-5 hashes to node-a, but nobody holds it yet.
    assert!(b.try_acquire("target-5").await.unwrap());
    assert_eq!(
        store.get("poll:lease:target-5").await.unwrap().as_deref(),
        Some("node-b")
    );
    assert!(!a.try_acquire("target-5").await.unwrap());
    let failed = a.events().events_for("target-5", LeaseEventKind::AcquireFailed);
    assert_eq!(failed.last().unwrap().detail.as_deref(), Some("held by node-b"));

    // node-b's rebalance at 10s hands it to node-a and stays off it for a while.
    tokio::time::sleep(Duration::from_secs(11)).await;
    assert!(!b.is_owned("target-5"));
    let released = b.events().events_for("target-5", LeaseEventKind::Released);
    assert_eq!(released[0].detail.as_deref(), Some("rebalance"));
    assert!(!b.try_acquire("target-5").await.unwrap());
    let failed = b.events().events_for("target-5", LeaseEventKind::AcquireFailed);
    assert_eq!(failed.last().unwrap().detail.as_deref(), Some("deferred to node-a"));

    assert!(a.try_acquire("target-5").await.unwrap());
    stop_all(&managers).await;
}

#[tokio::test(start_paused = true)]
async fn test_shed_target_is_retaken_when_preferred_owner_never_claims_it() {
    let store = MemoryStore::new();
    let managers = cluster(&store, &["node-a", "node-b"]).await;
    let b = &managers[1];

    assert!(b.try_acquire("target-5").await.unwrap());
    tokio::time::sleep(Duration::from_secs(11)).await;
    assert!(!b.is_owned("target-5"));
    assert!(!b.try_acquire("target-5").await.unwrap());

    // The cooldown ran out at 20s and node-a never contended.
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(store.get("poll:lease:target-5").await.unwrap(), None);
    assert!(b.try_acquire("target-5").await.unwrap());
    stop_all(&managers).await;
}

#[tokio::test(start_paused = true)]
async fn test_graceful_stop_hands_over_without_waiting_for_ttl() {
    let store = MemoryStore::new();
    let managers = cluster(&store, &["node-a", "node-b"]).await;
    let (a, b) = (&managers[0], &managers[1]);

    assert!(b.try_acquire("target-1").await.unwrap());
    b.stop().await;

    a.refresh_live_nodes().await.unwrap();
    assert_eq!(a.live_nodes(), vec!["node-a"]);
    assert!(a.try_acquire("target-1").await.unwrap());
    a.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_stale_instance_cannot_release_new_owner() {
    let store = MemoryStore::new();
    let managers = cluster(&store, &["node-a", "node-b"]).await;
    let (a, b) = (&managers[0], &managers[1]);

    assert!(a.try_acquire("target-5").await.unwrap());
    a.halt();
    tokio::time::sleep(Duration::from_secs(31)).await;
    assert!(!a.is_owned("target-5"));
    assert!(b.try_acquire("target-5").await.unwrap());

    a.release("target-5").await.unwrap();
    assert!(b.is_owned("target-5"));
    assert_eq!(
        store.get("poll:lease:target-5").await.unwrap().as_deref(),
        Some("node-b")
    );
    b.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_store_outage_fails_closed_everywhere() {
    let store = MemoryStore::new();
    let managers = cluster(&store, &["node-a", "node-b", "node-c"]).await;
    let targets = targets(9);
    contend_all(&managers, &targets).await;

    let held: Vec<(usize, Vec<String>)> = managers
        .iter()
        .map(|m| m.owned_targets())
        .enumerate()
        .collect();
    assert_eq!(held.iter().map(|(_, t)| t.len()).sum::<usize>(), 9);

    store.set_available(false);
    tokio::time::sleep(Duration::from_secs(35)).await;

    for (i, owned) in held {
        let m = &managers[i];
        assert!(m.owned_targets().is_empty());
        for t in owned {
            assert!(!m.is_owned(&t));
            assert!(!m.events().events_for(&t, LeaseEventKind::Lost).is_empty());
        }
    }
    for m in &managers {
        m.halt();
    }
}

#[tokio::test(start_paused = true)]
async fn test_new_node_waits_out_startup_grace() {
    let store = MemoryStore::new();
    let managers = cluster(&store, &["node-a"]).await;
    let a = &managers[0];
    let targets = targets(9);
    contend_all(&managers, &targets).await;
    assert_eq!(a.owned_targets().len(), 9);

    let late = Arc::new(LeaseManager::with_instance_id(
        "node-b",
        Arc::new(store.clone()),
        LeaseConfig {
            startup_grace: Duration::from_secs(10),
            ..LeaseConfig::default()
        },
    ));
    late.start().await.unwrap();

    // node-b is visible but still in init: node-a keeps everything.
    tokio::time::sleep(Duration::from_secs(9)).await;
    a.refresh_live_nodes().await.unwrap();
    assert_eq!(a.live_nodes(), vec!["node-a", "node-b"]);
    assert_eq!(a.owned_targets().len(), 9);

    for _ in 0..6 {
        contend_all(&[a.clone(), late.clone()], &targets).await;
        tokio::time::sleep(Duration::from_secs(5)).await;
    }
    assert!(!late.owned_targets().is_empty());
    assert_eq!(
        a.owned_targets().len() + late.owned_targets().len(),
        9
    );
    a.stop().await;
    late.stop().await;
}
