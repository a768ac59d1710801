//! The pool of tunnels held against one target.
//!
//! A single connector loop owns the tunnel set. Tunnels never touch the set
//! themselves; a dying serve loop mails a removal request instead. The loop
//! answers to a maintenance ticker, the mailbox, and a shutdown signal, and
//! is the only place a tunnel is ever dialed.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use culvert_core::protocol::TunnelStatus;

use crate::config::Config;
use crate::tunnel::Tunnel;

/// Mail handled by the connector loop.
#[derive(Debug)]
pub(crate) enum PoolMsg {
    /// A tunnel died; drop it from the set.
    Remove(Uuid),
    /// Snapshot the pool counters.
    Size(oneshot::Sender<PoolSize>),
}

/// Raised by a pool toward its owning client.
#[derive(Debug)]
pub(crate) enum PoolEvent {
    /// The target has been unreachable longer than the retry interval; the
    /// client should start a pool against the next target. The pool has
    /// already shut itself down when this is received.
    Rotate { target: String },
}

/// Open tunnels per status, plus lifetime counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolSize {
    pub connecting: usize,
    pub idle: usize,
    pub running: usize,
    pub total: usize,
    pub disconnects: u64,
}

impl std::fmt::Display for PoolSize {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "connecting {}, idle {}, running {}, total {}",
            self.connecting, self.idle, self.running, self.total
        )
    }
}

/// Owner-side handle to a running pool.
pub struct PoolHandle {
    target: String,
    mailbox: mpsc::Sender<PoolMsg>,
    shutdown: Option<oneshot::Sender<()>>,
    join: JoinHandle<()>,
}

impl PoolHandle {
    pub fn target(&self) -> &str {
        &self.target
    }

    /// Ask the connector loop for its current counters.
    pub async fn size(&self) -> Option<PoolSize> {
        let (reply, answer) = oneshot::channel();
        self.mailbox.send(PoolMsg::Size(reply)).await.ok()?;
        answer.await.ok()
    }

    /// Stop the connector loop and close every tunnel. Resolves only once
    /// the loop has exited, so no dial can happen after this returns.
    pub async fn shutdown(self) {
        let PoolHandle { shutdown, join, .. } = self;
        if let Some(signal) = shutdown {
            let _ = signal.send(());
        }
        let _ = join.await;
    }
}

/// Create and start a pool against one target.
pub(crate) fn start_pool(
    config: Arc<Config>,
    target: String,
    events: mpsc::Sender<PoolEvent>,
) -> PoolHandle {
    let (mailbox_tx, mailbox_rx) = mpsc::channel(32);
    let (shutdown_tx, shutdown_rx) = oneshot::channel();

    let connector = Connector {
        target: target.clone(),
        tunnels: Vec::new(),
        disconnects: 0,
        last_try: None,
        backoff: Duration::ZERO,
        last_success: Instant::now(),
        mailbox: mailbox_tx.clone(),
        events,
        config,
    };

    let join = tokio::spawn(connector.run(mailbox_rx, shutdown_rx));

    PoolHandle {
        target,
        mailbox: mailbox_tx,
        shutdown: Some(shutdown_tx),
        join,
    }
}

/// How many tunnels to dial this tick.
///
/// Aims for the idle target, always tries at least one when the pool is
/// empty, and never exceeds the cap.
fn plan_connections(idle: usize, total: usize, idle_target: usize, max: usize) -> usize {
    let mut to_create = idle_target.saturating_sub(idle);

    if total == 0 && to_create == 0 {
        to_create = 1;
    }

    if total + to_create > max {
        to_create = max.saturating_sub(total);
    }

    to_create
}

/// The delay after one more failed dial: grow by `base`, snapping to `reset`
/// once past `max`.
fn next_backoff(current: Duration, base: Duration, max: Duration, reset: Duration) -> Duration {
    let next = current + base;
    if next > max {
        reset
    } else {
        next
    }
}

struct Connector {
    target: String,
    tunnels: Vec<Tunnel>,
    disconnects: u64,
    last_try: Option<Instant>,
    backoff: Duration,
    last_success: Instant,
    mailbox: mpsc::Sender<PoolMsg>,
    events: mpsc::Sender<PoolEvent>,
    config: Arc<Config>,
}

impl Connector {
    async fn run(
        mut self,
        mut mailbox: mpsc::Receiver<PoolMsg>,
        mut shutdown: oneshot::Receiver<()>,
    ) {
        // The first tick fires immediately and doubles as the initial
        // connection attempt.
        let mut ticker = tokio::time::interval(self.config.clean_interval());

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if self.maintain().await {
                        info!(target = %self.target, "target unreachable too long, rotating");
                        let _ = self
                            .events
                            .send(PoolEvent::Rotate { target: self.target.clone() })
                            .await;
                        break;
                    }
                }
                message = mailbox.recv() => match message {
                    Some(PoolMsg::Remove(id)) => self.remove(id),
                    Some(PoolMsg::Size(reply)) => {
                        let _ = reply.send(self.size());
                    }
                    None => break,
                },
                _ = &mut shutdown => break,
            }
        }

        self.close_all().await;
        debug!(target = %self.target, "pool stopped");
    }

    /// One maintenance pass. Returns true when round-robin should move on to
    /// the next target.
    async fn maintain(&mut self) -> bool {
        let now = Instant::now();

        if let Some(last_try) = self.last_try {
            if now.duration_since(last_try) < self.backoff {
                return false;
            }
        }
        self.last_try = Some(now);

        // A tunnel that died without managing to mail its removal still
        // leaves the set here.
        let before = self.tunnels.len();
        self.tunnels
            .retain(|tunnel| tunnel.status() != TunnelStatus::Closed);
        self.disconnects += (before - self.tunnels.len()) as u64;

        let size = self.size();
        let to_create = plan_connections(
            size.idle,
            size.total,
            self.config.pool_idle_size,
            self.config.pool_max_size,
        );

        if self.config.round_robin {
            if to_create == 0 || size.total > 0 {
                self.last_success = now;
            } else if now.duration_since(self.last_success) > self.config.retry_interval() {
                return true;
            }
        }

        for _ in 0..to_create {
            match Tunnel::connect(self.config.clone(), &self.target, self.mailbox.clone()).await {
                Ok(tunnel) => {
                    debug!(target = %self.target, tunnel = %tunnel.id, "tunnel added to pool");
                    self.tunnels.push(tunnel);
                    self.backoff = self.config.backoff();
                    self.last_success = Instant::now();
                }
                Err(err) => {
                    warn!(target = %self.target, %err, "connecting tunnel");
                    self.backoff = next_backoff(
                        self.backoff,
                        self.config.backoff(),
                        self.config.max_backoff(),
                        self.config.backoff_reset(),
                    );
                    // No further attempts this tick.
                    break;
                }
            }
        }

        false
    }

    fn remove(&mut self, id: Uuid) {
        let before = self.tunnels.len();
        self.tunnels.retain(|tunnel| tunnel.id != id);
        if self.tunnels.len() < before {
            self.disconnects += 1;
            debug!(target = %self.target, tunnel = %id, "tunnel removed from pool");
        }
    }

    fn size(&self) -> PoolSize {
        let mut size = PoolSize {
            total: self.tunnels.len(),
            disconnects: self.disconnects,
            ..PoolSize::default()
        };

        for tunnel in &self.tunnels {
            match tunnel.status() {
                TunnelStatus::Connecting => size.connecting += 1,
                TunnelStatus::Idle => size.idle += 1,
                TunnelStatus::Running => size.running += 1,
                TunnelStatus::Closed => {}
            }
        }

        size
    }

    async fn close_all(&mut self) {
        for tunnel in &self.tunnels {
            tunnel.close().await;
        }
        self.tunnels.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_config;
    use crate::testutil::fake_server;

    #[test]
    fn plan_reaches_for_the_idle_target() {
        assert_eq!(plan_connections(3, 5, 10, 100), 7);
        assert_eq!(plan_connections(10, 10, 10, 100), 0);
    }

    #[test]
    fn plan_always_dials_once_when_empty() {
        // Even a zero idle target gets one connection attempt.
        assert_eq!(plan_connections(0, 0, 0, 100), 1);
    }

    #[test]
    fn plan_respects_the_cap() {
        assert_eq!(plan_connections(0, 98, 10, 100), 2);
        assert_eq!(plan_connections(0, 100, 10, 100), 0);
    }

    #[test]
    fn backoff_grows_then_snaps_to_reset() {
        let base = Duration::from_secs(5);
        let max = Duration::from_secs(30);
        let reset = Duration::from_secs(10);

        let mut backoff = Duration::ZERO;
        let mut observed = Vec::new();
        for _ in 0..8 {
            backoff = next_backoff(backoff, base, max, reset);
            observed.push(backoff.as_secs());
        }

        assert_eq!(observed, vec![5, 10, 15, 20, 25, 30, 10, 15]);
    }

    #[test]
    fn backoff_can_be_pinned_at_max() {
        let base = Duration::from_secs(5);
        let max = Duration::from_secs(10);

        let mut backoff = Duration::ZERO;
        for _ in 0..5 {
            // reset == max keeps the delay at the ceiling.
            backoff = next_backoff(backoff, base, max, max);
        }
        assert_eq!(backoff, max);
    }

    #[tokio::test]
    async fn pool_fills_to_the_idle_target() {
        let target = fake_server().await;
        let mut config = test_config("clientA", vec![target.clone()]);
        config.pool_idle_size = 2;
        config.pool_max_size = 4;

        let (events, _events_rx) = mpsc::channel(4);
        let pool = start_pool(Arc::new(config), target, events);

        // First tick fires immediately; give the dials a moment.
        tokio::time::sleep(Duration::from_millis(300)).await;

        let size = pool.size().await.unwrap();
        assert_eq!(size.idle, 2);
        assert_eq!(size.total, 2);

        pool.shutdown().await;
    }

    #[tokio::test]
    async fn unreachable_round_robin_target_rotates() {
        // Nothing listens on this port.
        let target = "ws://127.0.0.1:9/register".to_string();
        let mut config = test_config(
            "clientA",
            vec![target.clone(), "ws://127.0.0.1:10/register".into()],
        );
        config.round_robin = true;
        config.retry_interval_secs = 0;
        let config = config.normalized();
        assert!(config.round_robin);

        let (events, mut events_rx) = mpsc::channel(4);
        let pool = start_pool(Arc::new(config), target.clone(), events);

        let event = tokio::time::timeout(Duration::from_secs(5), events_rx.recv())
            .await
            .expect("rotation event in time")
            .expect("pool loop alive");
        match event {
            PoolEvent::Rotate { target: rotated } => assert_eq!(rotated, target),
        }

        pool.shutdown().await;
    }
}
