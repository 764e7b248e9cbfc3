//! Remote IPAM daemon entry point.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use log::{error, info};
use tokio::signal;

use remote_ipam::allocator::{DiskStore, StoreAllocatorFactory};
use remote_ipam::config::ServerConfig;
use remote_ipam::resolv_conf;
use remote_ipam::server::{run_server, ServerState};

/// Directory below `dataDir` that holds the address reservations.
const STORE_DIR: &str = "server";

#[derive(Debug, Parser)]
#[command(version, about = "Serves IPAM delegations from remote-ipam plugins")]
struct Args {
    /// Path to the configuration file (JSON, or TOML with a .toml suffix).
    #[arg(long)]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    env_logger::init();

    let args = Args::parse();
    let cfg = ServerConfig::load(&args.config)?;
    info!("Starting remote IPAM daemon with config: {:?}", cfg);

    // The resolver file is read once; results carry this snapshot.
    let dns = match &cfg.resolv_conf {
        Some(path) => {
            let dns = resolv_conf::parse_file(path)?;
            info!("Loaded {} nameservers from {:?}", dns.nameservers.len(), path);
            Some(dns)
        }
        None => None,
    };

    let store = DiskStore::open(cfg.data_dir.join(STORE_DIR)).await?;
    info!("Keeping allocations in {:?}", store.dir());
    let allocators = StoreAllocatorFactory::new(Arc::new(store));
    let state = Arc::new(ServerState::new(&cfg, dns, allocators));

    tokio::select! {
        result = run_server(cfg.listen, state) => {
            if let Err(e) = result {
                error!("Delegation endpoint failed: {}", e);
                return Err(e);
            }
        }
        result = signal::ctrl_c() => match result {
            Ok(()) => info!("Received Ctrl+C, shutting down..."),
            Err(err) => error!("Unable to listen for shutdown signal: {}", err),
        },
    }

    info!("Shutdown complete.");
    Ok(())
}
