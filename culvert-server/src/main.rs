//! Culvert server binary.
//!
//! Runs on a public host: accepts tunnel registrations from clients behind
//! NAT and proxies external HTTP requests back through their pools.

mod config;
mod dispatch;
mod handlers;
mod metrics;
mod pool;
mod shutdown;
mod tunnel;
mod upstreams;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use config::ServerConfig;
use dispatch::Dispatcher;
use handlers::AppState;
use pool::PoolRegistry;
use shutdown::GracefulShutdown;
use upstreams::AllowedIps;

#[tokio::main]
async fn main() -> Result<()> {
    let config = ServerConfig::parse();

    let _ = FmtSubscriber::builder()
        .with_max_level(if config.debug {
            Level::DEBUG
        } else {
            Level::INFO
        })
        .with_target(false)
        .try_init();

    info!("Starting culvert-server v{}", env!("CARGO_PKG_VERSION"));
    info!("Listening on {}", config.addr);
    info!("Proxy endpoint: {}", config.request_route());
    match &config.id_header {
        Some(header) => info!("Client id header: {}", header),
        None => match &config.default_client_id {
            Some(id) => info!("No id header; all requests go to client {:?}", id),
            None => warn!("No id header and no default client; proxying is disabled"),
        },
    }

    let config = Arc::new(config);
    let registry = Arc::new(PoolRegistry::new());
    let dispatcher = Arc::new(Dispatcher::start(registry.clone()));

    let allowed = Arc::new(AllowedIps::new(config.upstreams.clone()).await);
    upstreams::log_allowlist(&allowed);
    let refresh_task = upstreams::start_refresh_task(allowed.clone());

    // Idle sweeper; also keeps the pool gauges fresh.
    let sweeper = {
        let registry = registry.clone();
        let interval = config.sweep_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                pool::sweep(&registry).await;

                let sizes = registry.sizes();
                let idle = sizes.values().map(|size| size.idle).sum();
                let running = sizes.values().map(|size| size.running).sum();
                metrics::set_pool_gauges(sizes.len(), idle, running);
            }
        })
    };

    let metrics_handle = match config.metrics_port {
        Some(port) => match metrics::ServerMetrics::new() {
            Ok(server_metrics) => {
                let server_metrics = Arc::new(server_metrics);
                Some(tokio::spawn(async move {
                    if let Err(err) = metrics::run_metrics_server(port, server_metrics).await {
                        tracing::error!("Metrics server error: {err}");
                    }
                }))
            }
            Err(err) => {
                warn!("Failed to initialize metrics: {err}");
                None
            }
        },
        None => {
            info!("Metrics endpoint disabled (set CULVERT_METRICS_PORT to enable)");
            None
        }
    };

    let state = AppState::new(
        config.clone(),
        registry.clone(),
        dispatcher,
        allowed.clone(),
    );
    let app = handlers::router(state);

    let listener = tokio::net::TcpListener::bind(&config.addr).await?;
    info!("Server is ready to accept connections");

    let server = tokio::spawn(async move {
        if let Err(err) = axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        {
            tracing::error!("Server error: {err}");
        }
    });

    let graceful = GracefulShutdown::new(config.shutdown_timeout_secs);
    graceful.wait_for_signal().await;

    info!(
        "Draining in-flight exchanges (timeout: {}s)...",
        config.shutdown_timeout_secs
    );
    if graceful.drain(&registry).await {
        info!("All exchanges drained");
    } else {
        warn!("Shutdown timeout reached, forcing shutdown");
    }

    registry.close_all().await;

    server.abort();
    sweeper.abort();
    refresh_task.abort();
    if let Some(handle) = metrics_handle {
        handle.abort();
    }

    info!("Shutdown complete");
    Ok(())
}
