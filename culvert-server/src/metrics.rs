//! Prometheus metrics for the tunnel server.

#![allow(dead_code)]

use axum::{routing::get, Router};
use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::Arc;
use tracing::info;

/// Metrics recorder wrapper.
pub struct ServerMetrics {
    handle: PrometheusHandle,
}

impl ServerMetrics {
    /// Install the Prometheus recorder. Fails if one is already installed.
    pub fn new() -> Result<Self, Box<dyn std::error::Error + Send + Sync>> {
        let handle = PrometheusBuilder::new().install_recorder()?;
        Ok(Self { handle })
    }

    pub fn render(&self) -> String {
        self.handle.render()
    }
}

/// Record a successful client registration.
pub fn record_registration() {
    counter!("culvert_registrations_total").increment(1);
}

/// Record a rejected registration: bad key, failed upgrade, or a malformed
/// greeting.
pub fn record_registration_failure() {
    counter!("culvert_registration_failures_total").increment(1);
}

/// Record one proxied request.
pub fn record_request(status: u16, duration_ms: f64) {
    let status_class = format!("{}xx", status / 100);
    counter!("culvert_requests_total", "status_class" => status_class).increment(1);
    histogram!("culvert_request_duration_ms").record(duration_ms);
}

/// Record a dispatch that found no idle tunnel.
pub fn record_dispatch_miss() {
    counter!("culvert_dispatch_misses_total").increment(1);
}

/// Record a tunnel evicted by the idle sweeper.
pub fn record_sweep_eviction() {
    counter!("culvert_sweep_evictions_total").increment(1);
}

/// Refresh the pool gauges from a registry snapshot.
pub fn set_pool_gauges(pools: usize, idle: usize, running: usize) {
    gauge!("culvert_pools").set(pools as f64);
    gauge!("culvert_tunnels", "state" => "idle").set(idle as f64);
    gauge!("culvert_tunnels", "state" => "running").set(running as f64);
}

/// Serve `/metrics` on its own port.
pub async fn run_metrics_server(
    port: u16,
    metrics: Arc<ServerMetrics>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let app = Router::new().route(
        "/metrics",
        get(move || {
            let metrics = metrics.clone();
            async move { metrics.render() }
        }),
    );

    let addr = format!("0.0.0.0:{port}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Metrics server listening on {}", addr);

    axum::serve(listener, app).await?;
    Ok(())
}
