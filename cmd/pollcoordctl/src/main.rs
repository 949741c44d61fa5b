use clap::{Parser, Subcommand};
use pkg_constants::runtime::DEFAULT_REDIS_URL;
use pkg_constants::state::LEASE_KEY_PREFIX;
use pkg_controllers::identity::get_live_nodes;
use pkg_scheduler::preferred_owner;
use pkg_state::client::{CoordinationStore, lease_key, node_key, target_id_from_lease_key};
use pkg_state::redis_store::RedisStore;
use pkg_types::node::HeartbeatData;
use tracing::info;

#[derive(Parser)]
#[command(name = "pollcoordctl", about = "Inspect polling lease coordination state")]
struct Cli {
    /// Coordination store URL
    #[arg(long, env = "POLLCOORD_REDIS_URL", default_value = DEFAULT_REDIS_URL)]
    redis_url: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List live coordinator instances
    Nodes,
    /// List all held leases
    Leases,
    /// Show the current owner of a target's lease
    Owner { target: String },
    /// Show which live instance should own a target
    Preferred { target: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();

    info!("Connecting to {}", cli.redis_url);
    let store = RedisStore::connect(&cli.redis_url).await?;

    match &cli.command {
        Commands::Nodes => {
            let nodes = get_live_nodes(&store).await?;

            println!("{:<48} {:<8} {}", "INSTANCE", "STATUS", "STARTED");
            for id in &nodes {
                let heartbeat = store
                    .get(&node_key(id))
                    .await?
                    .and_then(|raw| HeartbeatData::from_json(&raw).ok());
                match heartbeat {
                    Some(hb) => println!(
                        "{:<48} {:<8} {}",
                        id,
                        hb.status,
                        hb.startup_time.format("%Y-%m-%d %H:%M:%S")
                    ),
                    None => println!("{:<48} {:<8} {}", id, "unknown", "-"),
                }
            }

            if nodes.is_empty() {
                println!("(no live nodes)");
            }
        }
        Commands::Leases => {
            let nodes = get_live_nodes(&store).await?;
            let mut keys = store.scan_prefix(LEASE_KEY_PREFIX).await?;
            keys.sort();

            println!("{:<32} {:<48} {}", "TARGET", "OWNER", "PREFERRED");
            let mut shown = 0;
            for key in &keys {
                let Some(target) = target_id_from_lease_key(key) else {
                    continue;
                };
                // The lease may have expired between the scan and the read.
                let Some(owner) = store.get(key).await? else {
                    continue;
                };
                println!(
                    "{:<32} {:<48} {}",
                    target,
                    owner,
                    preferred_owner(target, &nodes).unwrap_or("-")
                );
                shown += 1;
            }

            if shown == 0 {
                println!("(no leases held)");
            }
        }
        Commands::Owner { target } => match store.get(&lease_key(target)).await? {
            Some(owner) => println!("{}", owner),
            None => {
                eprintln!("No instance holds the lease for {}", target);
                std::process::exit(1);
            }
        },
        Commands::Preferred { target } => {
            let nodes = get_live_nodes(&store).await?;
            match preferred_owner(target, &nodes) {
                Some(owner) => println!("{}", owner),
                None => {
                    eprintln!("No live nodes");
                    std::process::exit(1);
                }
            }
        }
    }

    Ok(())
}
