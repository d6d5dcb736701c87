//! Store hub: shared keys, lists and pub/sub for whiteboard nodes.
//!
//! Configured through `BOARD_HUB_ADDR`, `BOARD_HUB_DATA` (RocksDB directory;
//! in-memory when unset) and `BOARD_HUB_CHANNEL_CAPACITY`.

use board_collab::hub::{HubConfig, HubError, HubServer};

#[tokio::main]
async fn main() -> Result<(), HubError> {
    env_logger::init();

    let config = HubConfig::from_env();
    match &config.storage_path {
        Some(path) => log::info!("Persisting to {}", path.display()),
        None => log::warn!("BOARD_HUB_DATA not set; state is lost on exit"),
    }

    HubServer::new(config)?.run().await
}
