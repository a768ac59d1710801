//! Culvert client binary.
//!
//! Keeps tunnels pooled against the configured servers until interrupted.

use anyhow::Result;
use clap::Parser;
use culvert_client::{Client, Config};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::parse();

    let _ = FmtSubscriber::builder()
        .with_max_level(if config.debug {
            Level::DEBUG
        } else {
            Level::INFO
        })
        .with_target(false)
        .try_init();

    if config.id.contains('_') {
        anyhow::bail!("client id must not contain underscores: {}", config.id);
    }

    info!("Starting culvert-client v{}", env!("CARGO_PKG_VERSION"));
    for target in &config.targets {
        info!("Target: {}", target);
    }
    info!(
        "Pool: idle {} / max {}",
        config.pool_idle_size, config.pool_max_size
    );

    let mut client = Client::new(config);
    info!("Pool key: {}", client.pool_key());

    client.start();
    client
        .run(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Received Ctrl+C, closing pools");
        })
        .await;

    info!("Shutdown complete");
    Ok(())
}
