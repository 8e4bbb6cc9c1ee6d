//! Development relay for the AgroLink realtime channel.
//!
//! Configured through `AGROLINK_RELAY_*` variables, logging through
//! `RUST_LOG`.

use agrolink_realtime::{RelayConfig, RelayServer};
use log::info;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    env_logger::init();

    let config = RelayConfig::from_env()?;
    if config.accepted_tokens.is_none() {
        log::warn!("AGROLINK_RELAY_TOKENS not set; any bearer token is accepted");
    }

    let server = RelayServer::bind(config).await?;
    info!("Starting AgroLink relay on {}", server.local_addr()?);

    tokio::select! {
        result = server.run() => result,
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down");
            Ok(())
        }
    }
}
