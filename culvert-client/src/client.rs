//! Client supervisor.
//!
//! Owns one pool per target, or one pool at a time in round-robin mode, and
//! restarts pools against the next target when one reports its target
//! unreachable.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::info;

use culvert_core::hash_key_id;

use crate::config::Config;
use crate::pool::{start_pool, PoolEvent, PoolHandle, PoolSize};

/// Connects to one or more culvert servers and keeps tunnels pooled against
/// them so the servers can send HTTP requests back through.
pub struct Client {
    config: Arc<Config>,
    pools: HashMap<String, PoolHandle>,
    target: usize,
    events_tx: mpsc::Sender<PoolEvent>,
    events_rx: mpsc::Receiver<PoolEvent>,
}

impl Client {
    pub fn new(config: Config) -> Self {
        let (events_tx, events_rx) = mpsc::channel(8);
        Self {
            config: Arc::new(config.normalized()),
            pools: HashMap::new(),
            target: 0,
            events_tx,
            events_rx,
        }
    }

    /// The key this client's pools are registered under on the server.
    pub fn pool_key(&self) -> String {
        hash_key_id(&self.config.secret_key, &self.config.id)
    }

    /// Open the initial pools: all targets at once, or only the current one
    /// in round-robin mode.
    pub fn start(&mut self) {
        if !self.config.round_robin {
            for target in self.config.targets.clone() {
                self.start_pool_for(target);
            }
            return;
        }

        let target = self.current_target();
        self.start_pool_for(target);
    }

    /// Run until `shutdown` resolves, rotating round-robin pools as they
    /// give up on their targets. Pools are fully closed before this returns.
    pub async fn run(mut self, shutdown: impl Future<Output = ()>) {
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                event = self.events_rx.recv() => match event {
                    Some(PoolEvent::Rotate { target }) => self.rotate(target).await,
                    None => break,
                },
                _ = &mut shutdown => break,
            }
        }

        self.shutdown().await;
    }

    /// Close every pool. No tunnel survives and no new dial can start after
    /// this returns.
    pub async fn shutdown(&mut self) {
        for (_, pool) in self.pools.drain() {
            pool.shutdown().await;
        }
    }

    /// Counters for every open pool, keyed by target.
    pub async fn sizes(&self) -> HashMap<String, PoolSize> {
        let mut sizes = HashMap::new();
        for (target, pool) in &self.pools {
            if let Some(size) = pool.size().await {
                sizes.insert(target.clone(), size);
            }
        }
        sizes
    }

    fn current_target(&self) -> String {
        self.config.targets[self.target % self.config.targets.len()].clone()
    }

    fn start_pool_for(&mut self, target: String) {
        info!(client = self.config.log_name(), %target, "starting pool");
        let pool = start_pool(self.config.clone(), target.clone(), self.events_tx.clone());
        self.pools.insert(target, pool);
    }

    async fn rotate(&mut self, target: String) {
        // The pool already stopped itself; this joins its loop.
        if let Some(pool) = self.pools.remove(&target) {
            pool.shutdown().await;
        }

        self.target = (self.target + 1) % self.config.targets.len();
        let next = self.current_target();
        info!(client = self.config.log_name(), from = %target, to = %next, "rotating target");
        self.start_pool_for(next);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_config;
    use crate::testutil::fake_server;
    use std::time::{Duration, Instant};

    #[tokio::test]
    async fn all_targets_get_a_pool_without_round_robin() {
        let first = fake_server().await;
        let second = fake_server().await;
        let mut config = test_config("clientA", vec![first.clone(), second.clone()]);
        config.pool_idle_size = 1;

        let mut client = Client::new(config);
        client.start();

        tokio::time::sleep(Duration::from_millis(300)).await;

        let sizes = client.sizes().await;
        assert_eq!(sizes.len(), 2);
        assert!(sizes[&first].idle >= 1);
        assert!(sizes[&second].idle >= 1);

        client.shutdown().await;
    }

    #[tokio::test]
    async fn round_robin_fails_over_to_reachable_target() {
        // Nothing listens on the first target.
        let bad = "ws://127.0.0.1:9/register".to_string();
        let good = fake_server().await;

        let mut config = test_config("clientA", vec![bad, good.clone()]);
        config.round_robin = true;
        config.retry_interval_secs = 0;
        config.pool_idle_size = 1;

        let mut client = Client::new(config);
        client.start();

        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            if let Ok(Some(PoolEvent::Rotate { target })) =
                tokio::time::timeout(Duration::from_millis(500), client.events_rx.recv()).await
            {
                client.rotate(target).await;
            }

            let sizes = client.sizes().await;
            if sizes.get(&good).map(|size| size.idle >= 1).unwrap_or(false) {
                break;
            }

            assert!(
                Instant::now() < deadline,
                "failover never reached the good target"
            );
        }

        client.shutdown().await;
    }

    #[test]
    fn pool_key_matches_server_derivation() {
        let mut config = test_config("clientA", vec!["ws://a/register".into()]);
        config.secret_key = "k".into();
        let client = Client::new(config);
        assert_eq!(client.pool_key(), hash_key_id("k", "clientA"));
    }
}
