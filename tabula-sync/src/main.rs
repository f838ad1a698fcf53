//! `tabula-sync` — real-time document sync server.
//!
//! In-memory database and pub/sub; configuration from the environment
//! (`TABULA_SYNC_BIND_ADDR`, `TABULA_SYNC_HEARTBEAT_SECS`), log level from
//! `RUST_LOG`.

use std::sync::Arc;

use tabula_sync::{MemoryDatabase, MemoryPubSub, ServerConfig, SyncServer};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = ServerConfig::from_env();
    log::info!("Starting tabula-sync on {}", config.bind_addr);

    let server = Arc::new(SyncServer::new(
        config,
        Arc::new(MemoryDatabase::new()),
        Arc::new(MemoryPubSub::new()),
    ));

    let signal = server.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::info!("Shutdown requested");
            signal.shutdown();
        }
    });

    server.run().await
}
