//! Graceful shutdown: signal handling and exchange draining.

use std::time::Duration;

use tokio::time::{sleep, timeout};
use tracing::{debug, info};

use crate::pool::PoolRegistry;

pub struct GracefulShutdown {
    drain_timeout: Duration,
}

impl GracefulShutdown {
    pub fn new(timeout_secs: u64) -> Self {
        Self {
            drain_timeout: Duration::from_secs(timeout_secs),
        }
    }

    /// Wait for Ctrl+C or SIGTERM.
    pub async fn wait_for_signal(&self) {
        let ctrl_c = async {
            tokio::signal::ctrl_c()
                .await
                .expect("failed to install Ctrl+C handler");
        };

        #[cfg(unix)]
        let terminate = async {
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install SIGTERM handler")
                .recv()
                .await;
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => info!("Received Ctrl+C, initiating graceful shutdown"),
            _ = terminate => info!("Received SIGTERM, initiating graceful shutdown"),
        }
    }

    /// Wait until no exchange is in flight, bounded by the drain timeout.
    /// Returns false when the timeout was hit with work still running.
    pub async fn drain(&self, registry: &PoolRegistry) -> bool {
        let wait = async {
            loop {
                let running = registry.total_running();
                if running == 0 {
                    return;
                }
                debug!(running, "waiting for exchanges to finish");
                sleep(Duration::from_millis(100)).await;
            }
        };

        timeout(self.drain_timeout, wait).await.is_ok()
    }
}
