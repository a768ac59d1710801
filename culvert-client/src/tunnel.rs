//! Client-side tunnel: one WebSocket running the per-connection state
//! machine.
//!
//! The serve loop is the sole reader of the socket. While idle it blocks on
//! the next inbound message; a text head frame starts an exchange, which is
//! replayed against the configured [`RequestHandler`] or the default HTTP
//! client and streamed back through the same socket. All writes go through a
//! shared lock held one frame at a time so response frames never interleave
//! with a concurrent pong or close.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use http_body_util::{BodyExt, Full};
use hyper_util::rt::TokioIo;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};
use uuid::Uuid;

use culvert_core::protocol::{
    parse_headers, Greeting, Headers, RequestHead, ResponseHead, TunnelStatus, CLIENT_ERROR_CODE,
    HANDSHAKE_TIMEOUT, PROXY_ERROR_CODE, SECRET_HEADER,
};
use culvert_core::TunnelError;

use crate::config::Config;
use crate::handler::{ProxiedRequest, RequestHandler, ResponseSink};
use crate::pool::PoolMsg;

pub(crate) type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
pub(crate) type SharedWriter = Arc<Mutex<SplitSink<WsStream, Message>>>;
type WsReader = SplitStream<WsStream>;

/// One registered tunnel, owned by its pool.
pub(crate) struct Tunnel {
    pub id: Uuid,
    status: Arc<AtomicU8>,
    writer: SharedWriter,
    serve: JoinHandle<()>,
}

impl Tunnel {
    /// Dial the target, send the greeting, and start the serve loop.
    ///
    /// A failure here leaves nothing behind; the tunnel only exists once the
    /// greeting went out.
    pub async fn connect(
        config: Arc<Config>,
        target: &str,
        mailbox: mpsc::Sender<PoolMsg>,
    ) -> Result<Self, TunnelError> {
        let mut request = target
            .into_client_request()
            .map_err(|err| TunnelError::InvalidData(format!("target url: {err}")))?;

        if !config.secret_key.is_empty() {
            let value = HeaderValue::from_str(&config.secret_key)
                .map_err(|err| TunnelError::InvalidData(format!("secret key: {err}")))?;
            request.headers_mut().insert(SECRET_HEADER, value);
        }

        let (stream, _) = tokio::time::timeout(HANDSHAKE_TIMEOUT, connect_async(request))
            .await
            .map_err(|_| TunnelError::HandshakeTimeout)?
            .map_err(map_dial_error)?;

        let (mut writer, reader) = stream.split();

        let greeting = Greeting {
            client_id: config.id.clone(),
            idle_size: config.pool_idle_size,
            max_size: config.pool_max_size,
        };
        writer
            .send(Message::Text(greeting.encode()))
            .await
            .map_err(|err| TunnelError::TunnelWrite(err.to_string()))?;

        let id = Uuid::new_v4();
        let status = Arc::new(AtomicU8::new(TunnelStatus::Idle.as_u8()));
        let writer = Arc::new(Mutex::new(writer));

        let serve = tokio::spawn(serve(
            id,
            reader,
            writer.clone(),
            status.clone(),
            config,
            mailbox,
        ));

        debug!(tunnel = %id, %target, "tunnel registered");

        Ok(Self {
            id,
            status,
            writer,
            serve,
        })
    }

    pub fn status(&self) -> TunnelStatus {
        TunnelStatus::from_u8(self.status.load(Ordering::SeqCst))
    }

    /// Idempotent: sends a close frame and stops the serve loop.
    pub async fn close(&self) {
        let previous = self
            .status
            .swap(TunnelStatus::Closed.as_u8(), Ordering::SeqCst);
        if TunnelStatus::from_u8(previous) == TunnelStatus::Closed {
            return;
        }

        {
            let mut writer = self.writer.lock().await;
            let _ = writer.send(Message::Close(None)).await;
        }
        self.serve.abort();
    }
}

fn map_dial_error(err: WsError) -> TunnelError {
    match err {
        WsError::Http(response) if response.status().as_u16() == PROXY_ERROR_CODE => {
            TunnelError::InvalidKey
        }
        err => TunnelError::Io(std::io::Error::new(
            std::io::ErrorKind::Other,
            err.to_string(),
        )),
    }
}

async fn serve(
    id: Uuid,
    mut reader: WsReader,
    writer: SharedWriter,
    status: Arc<AtomicU8>,
    config: Arc<Config>,
    mailbox: mpsc::Sender<PoolMsg>,
) {
    loop {
        let message = match reader.next().await {
            Some(Ok(message)) => message,
            Some(Err(err)) => {
                debug!(tunnel = %id, %err, "tunnel read failed");
                break;
            }
            None => break,
        };

        match message {
            Message::Text(head) => {
                status.store(TunnelStatus::Running.as_u8(), Ordering::SeqCst);
                match run_exchange(&head, &mut reader, &writer, &config).await {
                    Ok(()) => status.store(TunnelStatus::Idle.as_u8(), Ordering::SeqCst),
                    Err(err) => {
                        warn!(tunnel = %id, client = config.log_name(), %err, "exchange failed");
                        break;
                    }
                }
            }
            Message::Ping(payload) => {
                let mut writer = writer.lock().await;
                if writer.send(Message::Pong(payload)).await.is_err() {
                    break;
                }
            }
            Message::Pong(_) => {}
            Message::Close(_) => {
                debug!(tunnel = %id, "server closed tunnel");
                break;
            }
            Message::Binary(_) | Message::Frame(_) => {
                warn!(tunnel = %id, "binary frame while awaiting request head");
                close_protocol_error(&writer).await;
                break;
            }
        }
    }

    status.store(TunnelStatus::Closed.as_u8(), Ordering::SeqCst);
    let _ = mailbox.send(PoolMsg::Remove(id)).await;
}

/// Run one request/response exchange, starting from an already-received head
/// frame. `Ok` means the tunnel may return to idle; `Err` poisons it.
async fn run_exchange(
    head: &str,
    reader: &mut WsReader,
    writer: &SharedWriter,
    config: &Arc<Config>,
) -> Result<(), TunnelError> {
    let head = match RequestHead::parse(head) {
        Ok(head) => head,
        Err(err) => {
            close_protocol_error(writer).await;
            return Err(err);
        }
    };

    let headers = match reader.next().await {
        Some(Ok(Message::Text(frame))) => match parse_headers(&frame) {
            Ok(headers) => headers,
            Err(err) => {
                close_protocol_error(writer).await;
                return Err(err);
            }
        },
        Some(Ok(_)) => {
            close_protocol_error(writer).await;
            return Err(TunnelError::Protocol("expected headers frame".into()));
        }
        Some(Err(err)) => {
            return Err(TunnelError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                err.to_string(),
            )))
        }
        None => {
            return Err(TunnelError::Protocol(
                "socket closed before headers frame".into(),
            ))
        }
    };

    // The body is consumed before anything else happens so a failure past
    // this point cannot desynchronize the frame stream.
    let body = read_body(reader, writer).await?;

    match config.handler.clone() {
        Some(handler) => run_handler_exchange(head, headers, body, writer, handler).await,
        None => run_default_exchange(head, headers, body, writer).await,
    }
}

/// Read binary body frames until the empty terminator.
async fn read_body(reader: &mut WsReader, writer: &SharedWriter) -> Result<Bytes, TunnelError> {
    let mut body = Vec::new();

    loop {
        match reader.next().await {
            Some(Ok(Message::Binary(chunk))) => {
                if chunk.is_empty() {
                    return Ok(Bytes::from(body));
                }
                body.extend_from_slice(&chunk);
            }
            Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {}
            Some(Ok(_)) => {
                close_protocol_error(writer).await;
                return Err(TunnelError::Protocol(
                    "unexpected frame in request body".into(),
                ));
            }
            Some(Err(err)) => {
                return Err(TunnelError::Io(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    err.to_string(),
                )))
            }
            None => {
                return Err(TunnelError::Protocol("socket closed mid-request".into()));
            }
        }
    }
}

/// Replay the request against the installed handler.
async fn run_handler_exchange(
    head: RequestHead,
    headers: Headers,
    body: Bytes,
    writer: &SharedWriter,
    handler: Arc<dyn RequestHandler>,
) -> Result<(), TunnelError> {
    let request = ProxiedRequest {
        method: head.method,
        url: head.url,
        headers,
        body,
    };
    let (sink, state) = ResponseSink::new(writer.clone());

    match handler.handle(request, sink).await {
        Ok(()) => {
            if !state.finished.load(Ordering::SeqCst) {
                // The handler forgot the terminator; the exchange still has
                // to end cleanly for the next one to start.
                if !state.head_sent.load(Ordering::SeqCst) {
                    let head = ResponseHead::error(200, 0);
                    write_frame(writer, Message::Text(head.encode()?)).await?;
                }
                write_frame(writer, Message::Binary(Vec::new())).await?;
            }
            Ok(())
        }
        Err(err) if state.head_sent.load(Ordering::SeqCst) => {
            // Head already on the wire: the requester gets a truncated body.
            Err(err)
        }
        Err(err) => {
            send_error_response(writer, CLIENT_ERROR_CODE, &err.to_string()).await
        }
    }
}

/// Replay the request with the default HTTP client against the request URL.
async fn run_default_exchange(
    head: RequestHead,
    headers: Headers,
    body: Bytes,
    writer: &SharedWriter,
) -> Result<(), TunnelError> {
    let response = match call_upstream(&head, &headers, body).await {
        Ok(response) => response,
        Err(err) => {
            debug!(url = %head.url, %err, "upstream call failed");
            return send_error_response(writer, CLIENT_ERROR_CODE, &err.to_string()).await;
        }
    };

    let mut header = Headers::new();
    for (name, value) in response.headers() {
        if let Ok(value) = value.to_str() {
            header
                .entry(name.as_str().to_string())
                .or_default()
                .push(value.to_string());
        }
    }

    let content_length = response
        .headers()
        .get(hyper::header::CONTENT_LENGTH)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse().ok())
        .unwrap_or(-1);

    let response_head = ResponseHead {
        status_code: response.status().as_u16(),
        header,
        content_length,
    };
    write_frame(writer, Message::Text(response_head.encode()?)).await?;

    // The head is on the wire; from here a failure can only truncate.
    let mut body = response.into_body();
    while let Some(frame) = body.frame().await {
        match frame {
            Ok(frame) => {
                if let Ok(data) = frame.into_data() {
                    if !data.is_empty() {
                        write_frame(writer, Message::Binary(data.to_vec())).await?;
                    }
                }
            }
            Err(err) => {
                return Err(TunnelError::UpstreamError(format!(
                    "reading upstream body: {err}"
                )))
            }
        }
    }

    write_frame(writer, Message::Binary(Vec::new())).await
}

/// One HTTP/1.1 call against the URL named in the request head.
async fn call_upstream(
    head: &RequestHead,
    headers: &Headers,
    body: Bytes,
) -> Result<hyper::Response<hyper::body::Incoming>, TunnelError> {
    let uri: hyper::Uri = head
        .url
        .parse()
        .map_err(|err| TunnelError::UpstreamError(format!("request url: {err}")))?;

    let host = uri
        .host()
        .ok_or_else(|| TunnelError::UpstreamError(format!("request url has no host: {}", head.url)))?
        .to_string();
    let port = uri.port_u16().unwrap_or(80);

    let stream = TcpStream::connect((host.as_str(), port))
        .await
        .map_err(|err| TunnelError::UpstreamError(format!("connecting upstream: {err}")))?;
    let io = TokioIo::new(stream);

    let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
        .await
        .map_err(|err| TunnelError::UpstreamError(format!("upstream handshake: {err}")))?;

    tokio::spawn(async move {
        if let Err(err) = conn.await {
            debug!(%err, "upstream connection error");
        }
    });

    let request = build_upstream_request(head, headers, &uri, body)?;

    sender
        .send_request(request)
        .await
        .map_err(|err| TunnelError::UpstreamError(format!("upstream request: {err}")))
}

fn build_upstream_request(
    head: &RequestHead,
    headers: &Headers,
    uri: &hyper::Uri,
    body: Bytes,
) -> Result<hyper::Request<Full<Bytes>>, TunnelError> {
    let method = hyper::Method::from_bytes(head.method.as_bytes())
        .map_err(|err| TunnelError::InvalidData(format!("request method: {err}")))?;

    let path = uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");

    let mut builder = hyper::Request::builder().method(method).uri(path);

    let mut has_host = false;
    for (name, values) in headers {
        // Hop-by-hop headers describe the tunnel leg, not the upstream one.
        let lower = name.to_ascii_lowercase();
        if matches!(
            lower.as_str(),
            "transfer-encoding" | "connection" | "keep-alive" | "upgrade" | "te" | "trailer"
        ) {
            continue;
        }
        if lower == "host" {
            has_host = true;
        }
        for value in values {
            builder = builder.header(name.as_str(), value.as_str());
        }
    }

    if !has_host {
        if let Some(authority) = uri.authority() {
            builder = builder.header(hyper::header::HOST, authority.as_str());
        }
    }

    builder
        .body(Full::new(body))
        .map_err(|err| TunnelError::InvalidData(format!("building upstream request: {err}")))
}

/// Synthesize a full error response (head, body, terminator). Used for
/// failures that happen before any response byte went out, which leaves the
/// tunnel reusable.
async fn send_error_response(
    writer: &SharedWriter,
    status: u16,
    message: &str,
) -> Result<(), TunnelError> {
    let head = ResponseHead::error(status, message.len() as i64);
    write_frame(writer, Message::Text(head.encode()?)).await?;
    if !message.is_empty() {
        write_frame(writer, Message::Binary(message.as_bytes().to_vec())).await?;
    }
    write_frame(writer, Message::Binary(Vec::new())).await
}

async fn write_frame(writer: &SharedWriter, message: Message) -> Result<(), TunnelError> {
    let mut writer = writer.lock().await;
    writer
        .send(message)
        .await
        .map_err(|err| TunnelError::TunnelWrite(err.to_string()))
}

async fn close_protocol_error(writer: &SharedWriter) {
    let frame = CloseFrame {
        code: CloseCode::Protocol,
        reason: "out-of-order frame".into(),
    };
    let mut writer = writer.lock().await;
    let _ = writer.send(Message::Close(Some(frame))).await;
}
