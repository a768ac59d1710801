//! Client configuration.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;

use crate::handler::RequestHandler;

pub const DEFAULT_POOL_IDLE_SIZE: usize = 10;
pub const DEFAULT_POOL_MAX_SIZE: usize = 100;

/// Culvert client - keep a pool of outbound tunnels registered with a public
/// culvert server so it can proxy HTTP requests back to this network.
#[derive(Parser, Clone)]
#[command(name = "culvert-client")]
#[command(author, version, about, long_about = None)]
pub struct Config {
    /// WebSocket registration URLs, in failover order
    #[arg(
        long = "target",
        env = "CULVERT_TARGETS",
        value_delimiter = ',',
        default_value = "ws://127.0.0.1:8080/register"
    )]
    pub targets: Vec<String>,

    /// Client identifier; the server pools connections under it.
    /// Must not contain underscores.
    #[arg(long, env = "CULVERT_ID")]
    pub id: String,

    /// Optional client name, used only in logs
    #[arg(long, env = "CULVERT_NAME")]
    pub name: Option<String>,

    /// Shared secret sent in the registration header
    #[arg(long, env = "CULVERT_SECRET", default_value = "")]
    pub secret_key: String,

    /// Minimum count of idle tunnels to maintain per target
    #[arg(long, env = "CULVERT_POOL_IDLE_SIZE", default_value_t = DEFAULT_POOL_IDLE_SIZE)]
    pub pool_idle_size: usize,

    /// Maximum tunnels to keep per target
    #[arg(long, env = "CULVERT_POOL_MAX_SIZE", default_value_t = DEFAULT_POOL_MAX_SIZE)]
    pub pool_max_size: usize,

    /// Seconds between pool maintenance ticks (minimum 1)
    #[arg(long, env = "CULVERT_CLEAN_INTERVAL", default_value_t = 1)]
    pub clean_interval_secs: u64,

    /// Seconds added to the reconnect delay on every failed dial
    #[arg(long, env = "CULVERT_BACKOFF", default_value_t = 1)]
    pub backoff_secs: u64,

    /// Ceiling for the reconnect delay
    #[arg(long, env = "CULVERT_MAX_BACKOFF", default_value_t = 30)]
    pub max_backoff_secs: u64,

    /// Delay the backoff snaps to after crossing the ceiling.
    /// Set equal to the ceiling to pin it there.
    #[arg(long, env = "CULVERT_BACKOFF_RESET", default_value_t = 10)]
    pub backoff_reset_secs: u64,

    /// Try targets one at a time instead of all at once
    #[arg(long, env = "CULVERT_ROUND_ROBIN")]
    pub round_robin: bool,

    /// Seconds a target may stay unreachable before rotating to the next one
    #[arg(long, env = "CULVERT_RETRY_INTERVAL", default_value_t = 60)]
    pub retry_interval_secs: u64,

    /// Enable debug logging
    #[arg(long, env = "CULVERT_DEBUG")]
    pub debug: bool,

    /// Optional handler invoked for every proxied request in place of the
    /// default HTTP client. Not settable from the command line.
    #[arg(skip)]
    pub handler: Option<Arc<dyn RequestHandler>>,
}

impl Config {
    /// Apply the documented clamps: the clean interval never drops below one
    /// second and round-robin is meaningless with a single target.
    pub fn normalized(mut self) -> Self {
        if self.clean_interval_secs < 1 {
            self.clean_interval_secs = 1;
        }

        if self.targets.len() <= 1 {
            self.round_robin = false;
        }

        self
    }

    pub fn clean_interval(&self) -> Duration {
        Duration::from_secs(self.clean_interval_secs)
    }

    pub fn backoff(&self) -> Duration {
        Duration::from_secs(self.backoff_secs)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_secs(self.max_backoff_secs)
    }

    pub fn backoff_reset(&self) -> Duration {
        Duration::from_secs(self.backoff_reset_secs)
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_secs(self.retry_interval_secs)
    }

    /// The name to use in logs.
    pub fn log_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("targets", &self.targets)
            .field("id", &self.id)
            .field("name", &self.name)
            .field("pool_idle_size", &self.pool_idle_size)
            .field("pool_max_size", &self.pool_max_size)
            .field("round_robin", &self.round_robin)
            .field("handler", &self.handler.as_ref().map(|_| "custom"))
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
pub(crate) fn test_config(id: &str, targets: Vec<String>) -> Config {
    Config {
        targets,
        id: id.to_string(),
        name: None,
        secret_key: String::new(),
        pool_idle_size: DEFAULT_POOL_IDLE_SIZE,
        pool_max_size: DEFAULT_POOL_MAX_SIZE,
        clean_interval_secs: 1,
        backoff_secs: 1,
        max_backoff_secs: 30,
        backoff_reset_secs: 10,
        round_robin: false,
        retry_interval_secs: 60,
        debug: false,
        handler: None,
    }
    .normalized()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalization_clamps_clean_interval() {
        let mut config = test_config("c", vec!["ws://a/register".into()]);
        config.clean_interval_secs = 0;
        let config = config.normalized();
        assert_eq!(config.clean_interval(), Duration::from_secs(1));
    }

    #[test]
    fn round_robin_forced_off_for_single_target() {
        let mut config = test_config("c", vec!["ws://a/register".into()]);
        config.round_robin = true;
        assert!(!config.normalized().round_robin);
    }

    #[test]
    fn round_robin_kept_for_multiple_targets() {
        let mut config =
            test_config("c", vec!["ws://a/register".into(), "ws://b/register".into()]);
        config.round_robin = true;
        assert!(config.normalized().round_robin);
    }
}
