//! The pool registry: tunnels grouped by hashed client identity.
//!
//! Pools are mutated under short lock sections only; the atomic hand-out in
//! [`ServerPool::take_idle`] guarantees a tunnel is never given to two
//! requests. The sweeper pings idle tunnels so a vanished client does not
//! leave dead sockets behind.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use dashmap::DashMap;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

use culvert_core::protocol::{Greeting, TunnelStatus};

use crate::metrics;
use crate::tunnel::ServerTunnel;

/// Counters for one pool, as reported by `/status`.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct PoolSizeSnapshot {
    pub idle: usize,
    pub running: usize,
    pub total: usize,
    /// Idle target announced by the client's greeting.
    pub idle_target: usize,
    /// Cap announced by the client's greeting.
    pub max_size: usize,
}

/// The tunnels registered under one client identity.
pub struct ServerPool {
    pub key: String,
    tunnels: Mutex<Vec<Arc<ServerTunnel>>>,
    idle_target: AtomicUsize,
    max_size: AtomicUsize,
}

impl ServerPool {
    fn new(key: String, greeting: &Greeting) -> Self {
        Self {
            key,
            tunnels: Mutex::new(Vec::new()),
            idle_target: AtomicUsize::new(greeting.idle_size),
            max_size: AtomicUsize::new(greeting.max_size),
        }
    }

    fn push(&self, tunnel: Arc<ServerTunnel>, greeting: &Greeting) {
        // The latest greeting wins; a reconfigured client updates its pool.
        self.idle_target.store(greeting.idle_size, Ordering::Relaxed);
        self.max_size.store(greeting.max_size, Ordering::Relaxed);
        self.tunnels.lock().unwrap().push(tunnel);
    }

    /// Hand out one idle tunnel, flipped to RUNNING atomically. Scans in
    /// registration order, so the pick is deterministic.
    pub fn take_idle(&self) -> Option<Arc<ServerTunnel>> {
        let tunnels = self.tunnels.lock().unwrap();
        tunnels.iter().find(|tunnel| tunnel.claim_idle()).cloned()
    }

    fn remove(&self, id: Uuid) -> bool {
        let mut tunnels = self.tunnels.lock().unwrap();
        let before = tunnels.len();
        tunnels.retain(|tunnel| tunnel.id != id);
        tunnels.len() < before
    }

    fn is_empty(&self) -> bool {
        self.tunnels.lock().unwrap().is_empty()
    }

    pub fn snapshot_tunnels(&self) -> Vec<Arc<ServerTunnel>> {
        self.tunnels.lock().unwrap().clone()
    }

    pub fn size(&self) -> PoolSizeSnapshot {
        let tunnels = self.tunnels.lock().unwrap();
        let mut size = PoolSizeSnapshot {
            total: tunnels.len(),
            idle_target: self.idle_target.load(Ordering::Relaxed),
            max_size: self.max_size.load(Ordering::Relaxed),
            ..PoolSizeSnapshot::default()
        };

        for tunnel in tunnels.iter() {
            match tunnel.status() {
                TunnelStatus::Idle => size.idle += 1,
                TunnelStatus::Running => size.running += 1,
                TunnelStatus::Connecting | TunnelStatus::Closed => {}
            }
        }

        size
    }
}

/// All pools, keyed by hashed client identity.
#[derive(Default)]
pub struct PoolRegistry {
    pools: DashMap<String, Arc<ServerPool>>,
}

impl PoolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a tunnel, creating the pool on first registration.
    pub fn register(&self, pool_key: &str, tunnel: Arc<ServerTunnel>, greeting: &Greeting) {
        let pool = self
            .pools
            .entry(pool_key.to_string())
            .or_insert_with(|| {
                info!(pool = %pool_key, client = %greeting.client_id, "creating pool");
                Arc::new(ServerPool::new(pool_key.to_string(), greeting))
            })
            .clone();

        debug!(pool = %pool_key, tunnel = %tunnel.id, "tunnel registered");
        pool.push(tunnel, greeting);
    }

    /// One idle tunnel for the client, or `None` when the pool is absent or
    /// has nothing idle.
    pub fn take_idle(&self, pool_key: &str) -> Option<Arc<ServerTunnel>> {
        let pool = self.pools.get(pool_key)?.clone();
        pool.take_idle()
    }

    /// Drop a tunnel; a pool that empties out is dropped with it.
    pub fn remove(&self, pool_key: &str, id: Uuid) {
        let removed = match self.pools.get(pool_key) {
            Some(pool) => pool.remove(id),
            None => return,
        };

        if removed {
            debug!(pool = %pool_key, tunnel = %id, "tunnel removed");
        }

        if self
            .pools
            .remove_if(pool_key, |_, pool| pool.is_empty())
            .is_some()
        {
            info!(pool = %pool_key, "pool emptied, dropping");
        }
    }

    pub fn pool_count(&self) -> usize {
        self.pools.len()
    }

    pub fn snapshot(&self) -> Vec<Arc<ServerPool>> {
        self.pools.iter().map(|entry| entry.value().clone()).collect()
    }

    /// Per-pool counters for `/status` and the metrics gauges.
    pub fn sizes(&self) -> BTreeMap<String, PoolSizeSnapshot> {
        self.pools
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().size()))
            .collect()
    }

    /// Exchanges currently in flight, used by the shutdown drain.
    pub fn total_running(&self) -> usize {
        self.sizes().values().map(|size| size.running).sum()
    }

    /// Close every tunnel and drop every pool.
    pub async fn close_all(&self) {
        for pool in self.snapshot() {
            for tunnel in pool.snapshot_tunnels() {
                tunnel.close().await;
            }
        }
        self.pools.clear();
    }
}

/// One sweep pass: evict closed tunnels and ping the idle ones.
///
/// An idle tunnel is claimed with the same compare-exchange the dispatcher
/// uses, so a sweep never races an exchange onto the same socket.
pub async fn sweep(registry: &PoolRegistry) {
    for pool in registry.snapshot() {
        for tunnel in pool.snapshot_tunnels() {
            match tunnel.status() {
                TunnelStatus::Closed => {
                    registry.remove(&pool.key, tunnel.id);
                    metrics::record_sweep_eviction();
                }
                TunnelStatus::Idle => {
                    if !tunnel.claim_idle() {
                        continue;
                    }
                    if tunnel.ping().await {
                        tunnel.release();
                    } else {
                        debug!(pool = %pool.key, tunnel = %tunnel.id, "idle tunnel failed ping");
                        tunnel.close().await;
                        registry.remove(&pool.key, tunnel.id);
                        metrics::record_sweep_eviction();
                    }
                }
                TunnelStatus::Connecting | TunnelStatus::Running => {}
            }
        }
    }
}
