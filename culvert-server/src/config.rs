//! Server configuration.

use std::time::Duration;

use clap::Parser;

/// Culvert server - accept tunnel registrations from clients behind NAT and
/// proxy public HTTP requests back through them.
#[derive(Parser, Debug, Clone)]
#[command(name = "culvert-server")]
#[command(author, version, about, long_about = None)]
pub struct ServerConfig {
    /// Listen address for the HTTP surface
    #[arg(long, env = "CULVERT_ADDR", default_value = "0.0.0.0:8080")]
    pub addr: String,

    /// Shared secret clients must present to register
    #[arg(long, env = "CULVERT_SECRET", default_value = "")]
    pub secret_key: String,

    /// Header naming the target client on proxied requests.
    /// When set, requests without it are rejected.
    #[arg(long, env = "CULVERT_ID_HEADER")]
    pub id_header: Option<String>,

    /// Client all requests go to when no id header is configured
    #[arg(long, env = "CULVERT_DEFAULT_CLIENT")]
    pub default_client_id: Option<String>,

    /// Path segment of the proxy endpoint
    #[arg(long, env = "CULVERT_REQUEST_PATH", default_value = "request")]
    pub request_path: String,

    /// Seconds one proxied exchange may take end to end
    #[arg(long, env = "CULVERT_TIMEOUT", default_value_t = 30)]
    pub timeout_secs: u64,

    /// Seconds to wait for the dispatcher to hand out a tunnel
    #[arg(long, env = "CULVERT_DISPATCH_TIMEOUT", default_value_t = 2)]
    pub dispatch_timeout_secs: u64,

    /// Seconds between idle-tunnel ping sweeps
    #[arg(long, env = "CULVERT_SWEEP_INTERVAL", default_value_t = 30)]
    pub sweep_interval_secs: u64,

    /// CIDRs, IPs, or hostnames allowed to use this server (empty allows all)
    #[arg(long = "upstream", env = "CULVERT_UPSTREAMS", value_delimiter = ',')]
    pub upstreams: Vec<String>,

    /// Where unmatched or denied requests are redirected; 401 when unset
    #[arg(long, env = "CULVERT_REDIRECT_URL")]
    pub redirect_url: Option<String>,

    /// Port for the Prometheus metrics endpoint
    #[arg(long, env = "CULVERT_METRICS_PORT")]
    pub metrics_port: Option<u16>,

    /// Seconds to wait for in-flight exchanges on shutdown
    #[arg(long, env = "CULVERT_SHUTDOWN_TIMEOUT", default_value_t = 30)]
    pub shutdown_timeout_secs: u64,

    /// Enable debug logging
    #[arg(long, env = "CULVERT_DEBUG")]
    pub debug: bool,
}

impl ServerConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn dispatch_timeout(&self) -> Duration {
        Duration::from_secs(self.dispatch_timeout_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    /// The absolute path of the proxy endpoint.
    pub fn request_route(&self) -> String {
        format!("/{}", self.request_path.trim_start_matches('/'))
    }
}

#[cfg(test)]
pub(crate) fn test_config(secret: &str) -> ServerConfig {
    ServerConfig {
        addr: "127.0.0.1:0".into(),
        secret_key: secret.into(),
        id_header: Some(culvert_core::CLIENT_ID_HEADER.into()),
        default_client_id: None,
        request_path: "request".into(),
        timeout_secs: 10,
        dispatch_timeout_secs: 2,
        sweep_interval_secs: 10,
        upstreams: Vec::new(),
        redirect_url: None,
        metrics_port: None,
        shutdown_timeout_secs: 5,
        debug: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_route_is_normalized() {
        let mut config = test_config("");
        assert_eq!(config.request_route(), "/request");
        config.request_path = "/proxy".into();
        assert_eq!(config.request_route(), "/proxy");
    }
}
