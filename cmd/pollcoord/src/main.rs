use async_trait::async_trait;
use clap::Parser;
use pkg_constants::runtime::{
    DEFAULT_CONFIG_PATH, DEFAULT_POLL_INTERVAL_SECS, DEFAULT_REDIS_URL, NODE_NAME_ENV,
};
use pkg_controllers::driver::{Poller, PollingDriver, StaticRegistry};
use pkg_controllers::lease::LeaseManager;
use pkg_state::redis_store::RedisStore;
use pkg_types::config::{CoordinatorConfigFile, load_config_file};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};

mod logging;

#[derive(Parser, Debug)]
#[command(name = "pollcoord", about = "Distributed polling lease coordinator")]
struct Cli {
    /// Path to YAML config file
    #[arg(long, short, default_value = DEFAULT_CONFIG_PATH)]
    config: String,

    /// Coordination store URL
    #[arg(long)]
    redis_url: Option<String>,

    /// Fixed instance ID (generated from hostname and start time if unset)
    #[arg(long, env = NODE_NAME_ENV)]
    node_name: Option<String>,

    /// Seconds between polling driver cycles
    #[arg(long)]
    poll_interval: Option<u64>,

    /// Poll target, repeatable; added to the targets in the config file
    #[arg(long = "target")]
    targets: Vec<String>,

    /// Emit logs as JSON lines
    #[arg(long)]
    log_json: bool,
}

/// Stand-in poller: records each poll in the log.
struct LogPoller;

#[async_trait]
impl Poller for LogPoller {
    async fn poll(&self, target_id: &str) -> anyhow::Result<()> {
        info!(target_id, "poll");
        Ok(())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    logging::init(cli.log_json);

    // Load config file (returns defaults if file not found)
    let file_cfg: CoordinatorConfigFile = load_config_file(&cli.config)?;
    info!("Config file: {}", cli.config);

    // Merge: CLI args > config file > defaults
    let lease_config = file_cfg.lease_config();
    lease_config.validate()?;
    let redis_url = cli
        .redis_url
        .or(file_cfg.redis_url)
        .unwrap_or_else(|| DEFAULT_REDIS_URL.to_string());
    let node_name = cli.node_name.or(file_cfg.node_name);
    let poll_interval = Duration::from_secs(
        cli.poll_interval
            .or(file_cfg.poll_interval_secs)
            .unwrap_or(DEFAULT_POLL_INTERVAL_SECS)
            .max(1),
    );
    let mut targets = file_cfg.targets;
    targets.extend(cli.targets);
    targets.sort();
    targets.dedup();

    let store = RedisStore::connect(&redis_url).await?;
    let manager = Arc::new(LeaseManager::new(
        Arc::new(store),
        lease_config,
        node_name.as_deref(),
    ));

    info!("Starting pollcoord");
    info!("  Instance:  {}", manager.instance_id());
    info!("  Store:     {}", redis_url);
    info!("  Targets:   {}", targets.len());
    info!("  Interval:  {}s", poll_interval.as_secs());

    manager.start().await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let driver = Arc::new(PollingDriver::new(
        manager.clone(),
        Arc::new(StaticRegistry::new(targets)),
        Arc::new(LogPoller),
        poll_interval,
    ));
    let driver_handle = driver.start(shutdown_rx);

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    let _ = shutdown_tx.send(true);
    if let Err(e) = driver_handle.await {
        warn!("Polling driver task failed: {}", e);
    }
    manager.stop().await;

    Ok(())
}
