//! Standalone collaboration server.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use trellis_collab::{ServerConfig, ServerError, SyncServer};

#[derive(Parser, Debug)]
#[command(name = "trellis-server", about = "Real-time diagram sync server")]
struct Args {
    /// Address to listen on
    #[arg(long, default_value = "127.0.0.1:9090")]
    bind: String,
    /// RocksDB directory; snapshots stay in memory when omitted
    #[arg(long)]
    storage: Option<PathBuf>,
    #[arg(long, default_value_t = 5)]
    persist_interval_secs: u64,
    /// Per-room broadcast buffer
    #[arg(long, default_value_t = 256)]
    broadcast_capacity: usize,
}

impl From<Args> for ServerConfig {
    fn from(args: Args) -> Self {
        Self {
            bind_addr: args.bind,
            broadcast_capacity: args.broadcast_capacity,
            persist_interval: Duration::from_secs(args.persist_interval_secs.max(1)),
            storage_path: args.storage,
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), ServerError> {
    env_logger::init();

    let config = ServerConfig::from(Args::parse());
    log::info!(
        "Starting trellis-server on {} (storage: {})",
        config.bind_addr,
        config
            .storage_path
            .as_ref()
            .map_or_else(|| "memory".to_string(), |p| p.display().to_string())
    );

    let server = SyncServer::new(config)?;
    tokio::select! {
        result = server.run() => result,
        _ = tokio::signal::ctrl_c() => {
            log::info!("Shutting down; saving open rooms");
            server.persist_now().await;
            Ok(())
        }
    }
}
