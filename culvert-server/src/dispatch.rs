//! The dispatcher: binds waiting HTTP requests to idle tunnels.
//!
//! A single loop drains two queues: dispatch requests from the proxy
//! handler, and registrations from completed handshakes. Keeping both on one
//! loop means every registry insertion and every hand-out decision is
//! serialized; the dispatcher itself holds no tunnel state and re-asks the
//! registry on every request.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use culvert_core::protocol::Greeting;

use crate::metrics;
use crate::pool::PoolRegistry;
use crate::tunnel::ServerTunnel;

/// One waiting HTTP request. Lives until a tunnel is delivered or the
/// requester gives up on the reply slot.
#[derive(Debug)]
pub struct DispatchRequest {
    pub pool_key: String,
    pub reply: oneshot::Sender<Option<Arc<ServerTunnel>>>,
}

/// A tunnel that finished the registration handshake.
pub struct Registration {
    pub pool_key: String,
    pub tunnel: Arc<ServerTunnel>,
    pub greeting: Greeting,
}

/// Handle for talking to the dispatcher loop.
pub struct Dispatcher {
    dispatch_tx: mpsc::Sender<DispatchRequest>,
    register_tx: mpsc::Sender<Registration>,
    _join: JoinHandle<()>,
}

impl Dispatcher {
    pub fn start(registry: Arc<PoolRegistry>) -> Self {
        let (dispatch_tx, dispatch_rx) = mpsc::channel(64);
        let (register_tx, register_rx) = mpsc::channel(16);

        let join = tokio::spawn(run(registry, dispatch_rx, register_rx));

        Self {
            dispatch_tx,
            register_tx,
            _join: join,
        }
    }

    /// Ask for an idle tunnel. `None` means no pool, nothing idle, or the
    /// dispatcher did not answer within `wait`.
    pub async fn dispatch(&self, pool_key: String, wait: Duration) -> Option<Arc<ServerTunnel>> {
        let (reply, answer) = oneshot::channel();
        self.dispatch_tx
            .send(DispatchRequest { pool_key, reply })
            .await
            .ok()?;

        tokio::time::timeout(wait, answer).await.ok()?.ok()?
    }

    /// Queue a registered tunnel for insertion into the registry.
    pub async fn register(&self, registration: Registration) {
        let _ = self.register_tx.send(registration).await;
    }
}

async fn run(
    registry: Arc<PoolRegistry>,
    mut dispatch_rx: mpsc::Receiver<DispatchRequest>,
    mut register_rx: mpsc::Receiver<Registration>,
) {
    loop {
        tokio::select! {
            request = dispatch_rx.recv() => match request {
                Some(request) => {
                    let tunnel = registry.take_idle(&request.pool_key);
                    if tunnel.is_none() {
                        debug!(pool = %request.pool_key, "no idle tunnel");
                        metrics::record_dispatch_miss();
                    }
                    // The requester may have timed out already.
                    let _ = request.reply.send(tunnel);
                }
                None => break,
            },
            registration = register_rx.recv() => match registration {
                Some(registration) => {
                    info!(
                        pool = %registration.pool_key,
                        client = %registration.greeting.client_id,
                        tunnel = %registration.tunnel.id,
                        "tunnel joined pool"
                    );
                    registry.register(
                        &registration.pool_key,
                        registration.tunnel,
                        &registration.greeting,
                    );
                }
                None => break,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use culvert_core::protocol::TunnelStatus;

    fn greeting(client_id: &str) -> Greeting {
        Greeting {
            client_id: client_id.into(),
            idle_size: 1,
            max_size: 2,
        }
    }

    #[tokio::test]
    async fn unknown_client_gets_none() {
        let registry = Arc::new(PoolRegistry::new());
        let dispatcher = Dispatcher::start(registry);

        let tunnel = dispatcher
            .dispatch("nobody".into(), Duration::from_secs(1))
            .await;
        assert!(tunnel.is_none());
    }

    #[tokio::test]
    async fn registered_tunnel_is_dispatched_running() {
        let registry = Arc::new(PoolRegistry::new());
        let dispatcher = Dispatcher::start(registry.clone());

        dispatcher
            .register(Registration {
                pool_key: "pool-a".into(),
                tunnel: ServerTunnel::detached("pool-a"),
                greeting: greeting("a"),
            })
            .await;

        // The registration queue drains asynchronously; retry briefly.
        let mut taken = None;
        for _ in 0..50 {
            taken = dispatcher
                .dispatch("pool-a".into(), Duration::from_secs(1))
                .await;
            if taken.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let tunnel = taken.expect("tunnel dispatched");
        assert_eq!(tunnel.status(), TunnelStatus::Running);

        // The only tunnel is running now; a second ask comes back empty.
        assert!(dispatcher
            .dispatch("pool-a".into(), Duration::from_secs(1))
            .await
            .is_none());
    }
}
