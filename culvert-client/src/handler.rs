//! The request-handler capability.
//!
//! A client normally replays proxied requests with the default HTTP client,
//! but an embedding application can install a [`RequestHandler`] and answer
//! them in-process instead. The handler receives the decoded request and a
//! [`ResponseSink`] that frames whatever it writes back onto the tunnel.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use futures_util::future::BoxFuture;
use futures_util::SinkExt;
use tokio_tungstenite::tungstenite::Message;

use culvert_core::protocol::{Headers, ResponseHead};
use culvert_core::TunnelError;

use crate::tunnel::SharedWriter;

/// A proxied HTTP request as decoded from the tunnel frames.
#[derive(Debug, Clone)]
pub struct ProxiedRequest {
    pub method: String,
    pub url: String,
    pub headers: Headers,
    pub body: Bytes,
}

/// Answers proxied requests in place of the default HTTP client.
pub trait RequestHandler: Send + Sync + 'static {
    fn handle(
        &self,
        request: ProxiedRequest,
        sink: ResponseSink,
    ) -> BoxFuture<'static, Result<(), TunnelError>>;
}

impl<F, Fut> RequestHandler for F
where
    F: Fn(ProxiedRequest, ResponseSink) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), TunnelError>> + Send + 'static,
{
    fn handle(
        &self,
        request: ProxiedRequest,
        sink: ResponseSink,
    ) -> BoxFuture<'static, Result<(), TunnelError>> {
        Box::pin(self(request, sink))
    }
}

/// Progress flags the tunnel keeps while a handler owns the sink, so it can
/// tell a pre-head failure (still fixable with an error head) from a
/// mid-body one (truncation).
#[derive(Clone)]
pub(crate) struct SinkState {
    pub head_sent: Arc<AtomicBool>,
    pub finished: Arc<AtomicBool>,
}

/// Writes one response onto the tunnel: a head, then body chunks, then the
/// empty-binary terminator on [`finish`](ResponseSink::finish).
///
/// The underlying write lock is held one frame at a time.
pub struct ResponseSink {
    writer: SharedWriter,
    state: SinkState,
}

impl ResponseSink {
    pub(crate) fn new(writer: SharedWriter) -> (Self, SinkState) {
        let state = SinkState {
            head_sent: Arc::new(AtomicBool::new(false)),
            finished: Arc::new(AtomicBool::new(false)),
        };
        (
            Self {
                writer,
                state: state.clone(),
            },
            state,
        )
    }

    /// Send the response head. May be called at most once.
    pub async fn send_head(
        &mut self,
        status_code: u16,
        header: Headers,
        content_length: i64,
    ) -> Result<(), TunnelError> {
        if self.state.head_sent.swap(true, Ordering::SeqCst) {
            return Err(TunnelError::Protocol(
                "response head already sent".into(),
            ));
        }

        let head = ResponseHead {
            status_code,
            header,
            content_length,
        };
        self.write(Message::Text(head.encode()?)).await
    }

    /// Send one body chunk. Sends an implicit `200` head first if none was
    /// written. Empty chunks are dropped: an empty binary frame is the
    /// terminator and only [`finish`](ResponseSink::finish) sends it.
    pub async fn send_body(&mut self, chunk: &[u8]) -> Result<(), TunnelError> {
        if chunk.is_empty() {
            return Ok(());
        }

        if !self.state.head_sent.load(Ordering::SeqCst) {
            self.send_head(200, Headers::new(), -1).await?;
        }

        self.write(Message::Binary(chunk.to_vec())).await
    }

    /// Terminate the response. Sends an implicit `200` head if the handler
    /// never wrote one.
    pub async fn finish(mut self) -> Result<(), TunnelError> {
        if !self.state.head_sent.load(Ordering::SeqCst) {
            self.send_head(200, Headers::new(), 0).await?;
        }

        self.write(Message::Binary(Vec::new())).await?;
        self.state.finished.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn write(&self, message: Message) -> Result<(), TunnelError> {
        let mut writer = self.writer.lock().await;
        writer
            .send(message)
            .await
            .map_err(|err| TunnelError::TunnelWrite(err.to_string()))
    }
}
