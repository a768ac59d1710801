//! Server-side tunnel: an idle WebSocket waiting to carry one HTTP exchange.
//!
//! The whole socket lives behind an async mutex. An exchange holds the lock
//! from the first request frame until the response terminator, which the
//! one-exchange-per-tunnel rule requires anyway; the sweeper only touches
//! sockets it has claimed through the status word first, so the lock is
//! never contended by two owners.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::ws::{Message, WebSocket};
use axum::http::{HeaderName, HeaderValue, StatusCode};
use axum::response::Response;
use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;

use culvert_core::protocol::{encode_headers, Headers, RequestHead, ResponseHead, TunnelStatus};
use culvert_core::TunnelError;

const PONG_TIMEOUT: Duration = Duration::from_secs(5);

/// One registered tunnel, owned by its pool.
pub struct ServerTunnel {
    pub id: Uuid,
    pub pool_key: String,
    status: AtomicU8,
    socket: Arc<Mutex<Option<WebSocket>>>,
}

impl std::fmt::Debug for ServerTunnel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerTunnel")
            .field("id", &self.id)
            .field("pool_key", &self.pool_key)
            .field("status", &self.status())
            .finish()
    }
}

impl ServerTunnel {
    pub fn new(socket: WebSocket, pool_key: String) -> Arc<Self> {
        Arc::new(Self {
            id: Uuid::new_v4(),
            pool_key,
            status: AtomicU8::new(TunnelStatus::Idle.as_u8()),
            socket: Arc::new(Mutex::new(Some(socket))),
        })
    }

    /// A tunnel with no socket, for exercising the status machinery.
    #[cfg(test)]
    pub(crate) fn detached(pool_key: &str) -> Arc<Self> {
        Arc::new(Self {
            id: Uuid::new_v4(),
            pool_key: pool_key.to_string(),
            status: AtomicU8::new(TunnelStatus::Idle.as_u8()),
            socket: Arc::new(Mutex::new(None)),
        })
    }

    pub fn status(&self) -> TunnelStatus {
        TunnelStatus::from_u8(self.status.load(Ordering::SeqCst))
    }

    /// Atomically flip IDLE to RUNNING. The winner of this race owns the
    /// tunnel for one exchange; nobody else may touch the socket.
    pub fn claim_idle(&self) -> bool {
        self.status
            .compare_exchange(
                TunnelStatus::Idle.as_u8(),
                TunnelStatus::Running.as_u8(),
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok()
    }

    /// Hand a claimed tunnel back. A close in the meantime wins.
    pub fn release(&self) {
        let _ = self.status.compare_exchange(
            TunnelStatus::Running.as_u8(),
            TunnelStatus::Idle.as_u8(),
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
    }

    pub fn mark_closed(&self) {
        self.status
            .store(TunnelStatus::Closed.as_u8(), Ordering::SeqCst);
    }

    /// Idempotent: mark the tunnel dead and tear the socket down if nobody
    /// is mid-exchange on it.
    pub async fn close(&self) {
        self.mark_closed();
        if let Ok(mut guard) = self.socket.try_lock() {
            if let Some(socket) = guard.as_mut() {
                let _ = socket.send(Message::Close(None)).await;
            }
            *guard = None;
        }
    }

    /// Serialize `head`, `headers`, and `body` down the tunnel, then stream
    /// the response back as an HTTP response.
    ///
    /// The socket guard travels inside the returned body: the tunnel only
    /// returns to IDLE once the terminator frame arrives. Any failure or a
    /// deadline hit closes the tunnel instead, since a half-drained body
    /// leaves the frame stream unusable.
    pub async fn proxy_request(
        self: Arc<Self>,
        head: RequestHead,
        headers: Headers,
        body: Body,
        timeout: Duration,
    ) -> Result<Response, TunnelError> {
        let deadline = Instant::now() + timeout;
        let mut guard = self.socket.clone().lock_owned().await;

        let exchange = async {
            let socket = guard
                .as_mut()
                .ok_or_else(|| TunnelError::Protocol("tunnel has no socket".into()))?;
            send_request_frames(socket, &head, &headers, body).await?;
            read_response_head(socket, deadline).await
        };

        let response_head = match exchange.await {
            Ok(head) => head,
            Err(err) => {
                self.mark_closed();
                return Err(err);
            }
        };

        let mut builder = Response::builder().status(
            StatusCode::from_u16(response_head.status_code)
                .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
        );

        for (name, values) in &response_head.header {
            // Hop-by-hop headers do not survive the tunnel.
            let lower = name.to_ascii_lowercase();
            if lower == "transfer-encoding" || lower == "connection" || lower == "keep-alive" {
                continue;
            }
            for value in values {
                if let (Ok(name), Ok(value)) = (
                    HeaderName::try_from(name.as_str()),
                    HeaderValue::try_from(value.as_str()),
                ) {
                    builder = builder.header(name, value);
                }
            }
        }

        let stream = response_body_stream(guard, self, deadline);
        builder
            .body(Body::from_stream(stream))
            .map_err(|err| TunnelError::Protocol(format!("building response: {err}")))
    }

    /// Probe a claimed tunnel. Returns false when the far side is gone.
    pub async fn ping(&self) -> bool {
        let mut guard = self.socket.lock().await;
        let Some(socket) = guard.as_mut() else {
            return false;
        };

        if socket.send(Message::Ping(b"sweep".to_vec())).await.is_err() {
            return false;
        }

        let deadline = Instant::now() + PONG_TIMEOUT;
        loop {
            match tokio::time::timeout_at(deadline, socket.recv()).await {
                Ok(Some(Ok(Message::Pong(_)))) => return true,
                Ok(Some(Ok(Message::Ping(_)))) => continue,
                // Nothing else arrives unsolicited on a conforming client.
                _ => return false,
            }
        }
    }
}

async fn send_request_frames(
    socket: &mut WebSocket,
    head: &RequestHead,
    headers: &Headers,
    body: Body,
) -> Result<(), TunnelError> {
    socket
        .send(Message::Text(head.encode()))
        .await
        .map_err(|err| TunnelError::TunnelWrite(err.to_string()))?;

    socket
        .send(Message::Text(encode_headers(headers)?))
        .await
        .map_err(|err| TunnelError::TunnelWrite(err.to_string()))?;

    let mut stream = body.into_data_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk
            .map_err(|err| TunnelError::TunnelWrite(format!("reading request body: {err}")))?;
        if chunk.is_empty() {
            continue;
        }
        socket
            .send(Message::Binary(chunk.to_vec()))
            .await
            .map_err(|err| TunnelError::TunnelWrite(err.to_string()))?;
    }

    socket
        .send(Message::Binary(Vec::new()))
        .await
        .map_err(|err| TunnelError::TunnelWrite(err.to_string()))
}

async fn read_response_head(
    socket: &mut WebSocket,
    deadline: Instant,
) -> Result<ResponseHead, TunnelError> {
    loop {
        let message = tokio::time::timeout_at(deadline, socket.recv())
            .await
            .map_err(|_| TunnelError::Protocol("timed out waiting for response head".into()))?;

        match message {
            Some(Ok(Message::Text(frame))) => return ResponseHead::parse(&frame),
            Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
            Some(Ok(_)) => {
                return Err(TunnelError::Protocol(
                    "expected response head frame".into(),
                ))
            }
            Some(Err(err)) => {
                return Err(TunnelError::Io(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    err.to_string(),
                )))
            }
            None => {
                return Err(TunnelError::Protocol(
                    "tunnel closed before response head".into(),
                ))
            }
        }
    }
}

struct BodyStreamState {
    guard: OwnedMutexGuard<Option<WebSocket>>,
    tunnel: Arc<ServerTunnel>,
    deadline: Instant,
    done: bool,
}

impl Drop for BodyStreamState {
    fn drop(&mut self) {
        if !self.done {
            // The requester went away mid-body; the remaining frames would
            // desynchronize the next exchange.
            debug!(tunnel = %self.tunnel.id, "response body dropped early, closing tunnel");
            self.tunnel.mark_closed();
        }
    }
}

fn response_body_stream(
    guard: OwnedMutexGuard<Option<WebSocket>>,
    tunnel: Arc<ServerTunnel>,
    deadline: Instant,
) -> impl Stream<Item = Result<Bytes, std::io::Error>> {
    let state = BodyStreamState {
        guard,
        tunnel,
        deadline,
        done: false,
    };

    futures_util::stream::unfold(state, |mut state| async move {
        if state.done {
            return None;
        }

        loop {
            let Some(socket) = state.guard.as_mut() else {
                state.done = true;
                state.tunnel.mark_closed();
                return Some((Err(stream_error("tunnel has no socket")), state));
            };

            let message = match tokio::time::timeout_at(state.deadline, socket.recv()).await {
                Ok(message) => message,
                Err(_) => {
                    state.done = true;
                    state.tunnel.mark_closed();
                    return Some((Err(stream_error("response timed out")), state));
                }
            };

            match message {
                Some(Ok(Message::Binary(chunk))) if chunk.is_empty() => {
                    // Terminator: the exchange is complete.
                    state.done = true;
                    state.tunnel.release();
                    return None;
                }
                Some(Ok(Message::Binary(chunk))) => {
                    return Some((Ok(Bytes::from(chunk)), state));
                }
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
                Some(Err(err)) => {
                    state.done = true;
                    state.tunnel.mark_closed();
                    return Some((Err(stream_error(&err.to_string())), state));
                }
                Some(Ok(_)) | None => {
                    state.done = true;
                    state.tunnel.mark_closed();
                    return Some((Err(stream_error("tunnel closed mid-body")), state));
                }
            }
        }
    })
}

fn stream_error(message: &str) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::Other, message.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn claim_is_exclusive_until_release() {
        let tunnel = ServerTunnel::detached("pool");
        assert_eq!(tunnel.status(), TunnelStatus::Idle);

        assert!(tunnel.claim_idle());
        assert_eq!(tunnel.status(), TunnelStatus::Running);
        assert!(!tunnel.claim_idle());

        tunnel.release();
        assert_eq!(tunnel.status(), TunnelStatus::Idle);
        assert!(tunnel.claim_idle());
    }

    #[test]
    fn close_beats_release() {
        let tunnel = ServerTunnel::detached("pool");
        assert!(tunnel.claim_idle());

        tunnel.mark_closed();
        tunnel.release();
        assert_eq!(tunnel.status(), TunnelStatus::Closed);
        assert!(!tunnel.claim_idle());
    }
}
