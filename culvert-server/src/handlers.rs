//! The server's HTTP surface: proxying, registration, status, and the
//! fallback for everything else.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::body::Body;
use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, Request, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Json, Redirect, Response};
use axum::routing::{any, get};
use axum::Router;
use futures_util::future::BoxFuture;
use serde::Serialize;
use tracing::{debug, warn};

use culvert_core::protocol::{Greeting, Headers, RequestHead, PROTOCOL_VIOLATION};
use culvert_core::{hash_key_id, secrets_match, TunnelError, HANDSHAKE_TIMEOUT, SECRET_HEADER};

use crate::config::ServerConfig;
use crate::dispatch::{Dispatcher, Registration};
use crate::metrics;
use crate::pool::{PoolRegistry, PoolSizeSnapshot};
use crate::tunnel::ServerTunnel;
use crate::upstreams::AllowedIps;

/// Header a requester may set to override the destination URL.
pub const PROXY_DESTINATION_HEADER: &str = "x-proxy-destination";

/// Pluggable registration authenticator. The returned secret replaces the
/// configured one as the pool-key salt for this client.
pub trait KeyValidator: Send + Sync + 'static {
    fn validate<'a>(&'a self, headers: &'a HeaderMap)
        -> BoxFuture<'a, Result<String, TunnelError>>;
}

/// Shared state behind every route.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ServerConfig>,
    pub registry: Arc<PoolRegistry>,
    pub dispatcher: Arc<Dispatcher>,
    pub key_validator: Option<Arc<dyn KeyValidator>>,
    pub allowed: Arc<AllowedIps>,
    pub started: Instant,
}

impl AppState {
    pub fn new(
        config: Arc<ServerConfig>,
        registry: Arc<PoolRegistry>,
        dispatcher: Arc<Dispatcher>,
        allowed: Arc<AllowedIps>,
    ) -> Self {
        Self {
            config,
            registry,
            dispatcher,
            key_validator: None,
            allowed,
            started: Instant::now(),
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route(&state.config.request_route(), any(handle_request))
        .route("/register", get(handle_register))
        .route("/status", get(handle_status))
        .route("/health", get(handle_health))
        .fallback(handle_fallback)
        .layer(middleware::from_fn_with_state(
            state.clone(),
            require_allowed_ip,
        ))
        .with_state(state)
}

async fn require_allowed_ip(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    request: Request,
    next: Next,
) -> Response {
    if state.allowed.contains(addr.ip()) {
        next.run(request).await
    } else {
        debug!(%addr, "denied by allowlist");
        deny_response(&state.config)
    }
}

fn deny_response(config: &ServerConfig) -> Response {
    match &config.redirect_url {
        Some(url) => Redirect::temporary(url).into_response(),
        None => StatusCode::UNAUTHORIZED.into_response(),
    }
}

async fn handle_health() -> &'static str {
    "OK"
}

async fn handle_fallback(State(state): State<AppState>) -> Response {
    deny_response(&state.config)
}

#[derive(Serialize)]
struct StatusReport {
    uptime_secs: u64,
    pools: BTreeMap<String, PoolSizeSnapshot>,
}

async fn handle_status(State(state): State<AppState>) -> Json<StatusReport> {
    Json(StatusReport {
        uptime_secs: state.started.elapsed().as_secs(),
        pools: state.registry.sizes(),
    })
}

/// Proxy one external HTTP request through an idle tunnel.
async fn handle_request(State(state): State<AppState>, request: Request) -> Response {
    let started = Instant::now();

    match proxy(&state, request).await {
        Ok(response) => {
            let duration_ms = started.elapsed().as_secs_f64() * 1000.0;
            metrics::record_request(response.status().as_u16(), duration_ms);
            response
        }
        Err(err) => {
            let duration_ms = started.elapsed().as_secs_f64() * 1000.0;
            warn!(%err, "proxy error");
            metrics::record_request(err.http_status(), duration_ms);
            proxy_error_response(err.http_status(), &err)
        }
    }
}

async fn proxy(state: &AppState, request: Request) -> Result<Response, TunnelError> {
    let (parts, body) = request.into_parts();

    // The caller can point the exchange at any URL; otherwise the incoming
    // URI is replayed as-is.
    let destination = match parts.headers.get(PROXY_DESTINATION_HEADER) {
        Some(value) => {
            let raw = value.to_str().map_err(|err| {
                TunnelError::InvalidData(format!("parsing {PROXY_DESTINATION_HEADER}: {err}"))
            })?;
            raw.parse::<axum::http::Uri>()
                .map_err(|err| {
                    TunnelError::InvalidData(format!("parsing {PROXY_DESTINATION_HEADER}: {err}"))
                })?
                .to_string()
        }
        None => parts.uri.to_string(),
    };

    let client_id = client_id(&state.config, &parts.headers)?;

    if state.registry.pool_count() == 0 {
        return Err(TunnelError::NoProxyTarget("no pools registered".into()));
    }

    let pool_key = hash_key_id(&state.config.secret_key, &client_id);
    let tunnel = state
        .dispatcher
        .dispatch(pool_key, state.config.dispatch_timeout())
        .await
        .ok_or(TunnelError::NoProxyTarget(client_id))?;

    let head = RequestHead::new(parts.method.as_str(), destination);
    let mut headers = Headers::new();
    for (name, value) in &parts.headers {
        // The host header names this proxy, not the destination.
        if name.as_str() == "host" {
            continue;
        }
        if let Ok(value) = value.to_str() {
            headers
                .entry(name.as_str().to_string())
                .or_default()
                .push(value.to_string());
        }
    }

    debug!(tunnel = %tunnel.id, method = %head.method, url = %head.url, "proxying request");

    match tunnel
        .clone()
        .proxy_request(head, headers, body, state.config.timeout())
        .await
    {
        Ok(response) => Ok(response),
        Err(err) => {
            // The frame stream is suspect; throw the tunnel away.
            tunnel.close().await;
            state.registry.remove(&tunnel.pool_key, tunnel.id);
            Err(TunnelError::TunnelWrite(format!(
                "tunneling failure, connection closed: {err}"
            )))
        }
    }
}

/// Resolve the target client for a proxied request.
///
/// With an id header configured the header is mandatory. Without one,
/// requests go to the configured default client; configuring neither makes
/// the proxy endpoint unusable by design.
fn client_id(config: &ServerConfig, headers: &HeaderMap) -> Result<String, TunnelError> {
    if let Some(id_header) = &config.id_header {
        return headers
            .get(id_header.as_str())
            .and_then(|value| value.to_str().ok())
            .filter(|value| !value.is_empty())
            .map(str::to_string)
            .ok_or(TunnelError::NoClientID);
    }

    config
        .default_client_id
        .clone()
        .ok_or(TunnelError::NoClientID)
}

fn proxy_error_response(status: u16, err: &TunnelError) -> Response {
    Response::builder()
        .status(StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR))
        .header(header::CONTENT_TYPE, "text/plain")
        .body(Body::from(err.to_string()))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

/// Accept a client registration: authenticate, upgrade, read the greeting,
/// and hand the socket to the dispatcher.
async fn handle_register(
    State(state): State<AppState>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    // Authentication happens before the upgrade so a bad key is an ordinary
    // HTTP error the client can observe.
    let salt = match validate_key(&state, &headers).await {
        Ok(salt) => salt,
        Err(err) => {
            warn!(%err, "registration rejected");
            metrics::record_registration_failure();
            return proxy_error_response(err.http_status(), &err);
        }
    };

    ws.on_upgrade(move |socket| register_tunnel(state, socket, salt))
}

async fn validate_key(state: &AppState, headers: &HeaderMap) -> Result<String, TunnelError> {
    if let Some(validator) = &state.key_validator {
        return validator.validate(headers).await;
    }

    let provided = headers
        .get(SECRET_HEADER)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("");

    if !secrets_match(provided, &state.config.secret_key) {
        return Err(TunnelError::InvalidKey);
    }

    // No extra salt in the default setup.
    Ok(String::new())
}

async fn register_tunnel(state: AppState, mut socket: WebSocket, salt: String) {
    let greeting = match read_greeting(&mut socket).await {
        Ok(greeting) => greeting,
        Err(err) => {
            warn!(%err, "registration failed");
            metrics::record_registration_failure();
            let _ = socket
                .send(Message::Close(Some(CloseFrame {
                    code: PROTOCOL_VIOLATION,
                    reason: "invalid greeting".into(),
                })))
                .await;
            return;
        }
    };

    let salt = if salt.is_empty() {
        state.config.secret_key.clone()
    } else {
        salt
    };
    let pool_key = hash_key_id(&salt, &greeting.client_id);
    let tunnel = ServerTunnel::new(socket, pool_key.clone());

    metrics::record_registration();
    state
        .dispatcher
        .register(Registration {
            pool_key,
            tunnel,
            greeting,
        })
        .await;
}

async fn read_greeting(socket: &mut WebSocket) -> Result<Greeting, TunnelError> {
    let message = tokio::time::timeout(HANDSHAKE_TIMEOUT, socket.recv())
        .await
        .map_err(|_| TunnelError::HandshakeTimeout)?;

    match message {
        Some(Ok(Message::Text(text))) => Greeting::parse(&text),
        Some(Ok(_)) => Err(TunnelError::InvalidData(
            "greeting must be a text message".into(),
        )),
        Some(Err(err)) => Err(TunnelError::InvalidData(format!("reading greeting: {err}"))),
        None => Err(TunnelError::InvalidData(
            "socket closed before greeting".into(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_config;
    use bytes::Bytes;
    use culvert_client::{ProxiedRequest, ResponseSink};
    use culvert_core::CLIENT_ID_HEADER;
    use futures_util::{SinkExt, StreamExt};
    use http_body_util::BodyExt;
    use hyper_util::rt::TokioIo;
    use std::time::Duration;
    use tokio_tungstenite::tungstenite::client::IntoClientRequest;
    use tokio_tungstenite::tungstenite::http::HeaderValue;
    use tokio_tungstenite::tungstenite::{Error as WsError, Message as WsMessage};

    async fn start_server(config: ServerConfig) -> (String, AppState) {
        let config = Arc::new(config);
        let registry = Arc::new(PoolRegistry::new());
        let dispatcher = Arc::new(Dispatcher::start(registry.clone()));
        let allowed = Arc::new(AllowedIps::new(Vec::new()).await);
        let state = AppState::new(config, registry, dispatcher, allowed);

        let app = router(state.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let _ = axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .await;
        });

        (addr.to_string(), state)
    }

    async fn http_request(
        addr: &str,
        method: &str,
        path: &str,
        headers: &[(&str, &str)],
        body: &[u8],
    ) -> (StatusCode, String) {
        let stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        let io = TokioIo::new(stream);
        let (mut sender, conn) = hyper::client::conn::http1::handshake(io).await.unwrap();
        tokio::spawn(async move {
            let _ = conn.await;
        });

        let mut builder = hyper::Request::builder()
            .method(method)
            .uri(path)
            .header("host", addr);
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        let request = builder
            .body(http_body_util::Full::new(Bytes::copy_from_slice(body)))
            .unwrap();

        let response = sender.send_request(request).await.unwrap();
        let status = response.status();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        (status, String::from_utf8_lossy(&body).into_owned())
    }

    fn client_config(addr: &str, secret: &str) -> culvert_client::Config {
        culvert_client::Config {
            targets: vec![format!("ws://{addr}/register")],
            id: "clientA".into(),
            name: None,
            secret_key: secret.into(),
            pool_idle_size: 2,
            pool_max_size: 4,
            clean_interval_secs: 1,
            backoff_secs: 1,
            max_backoff_secs: 30,
            backoff_reset_secs: 10,
            round_robin: false,
            retry_interval_secs: 60,
            debug: false,
            handler: None,
        }
    }

    async fn wait_for_idle(state: &AppState, pool_key: &str, idle: usize) {
        for _ in 0..100 {
            if state
                .registry
                .sizes()
                .get(pool_key)
                .map(|size| size.idle == idle)
                .unwrap_or(false)
            {
                return;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        panic!(
            "pool {pool_key} never reached idle={idle}: {:?}",
            state.registry.sizes()
        );
    }

    #[tokio::test]
    async fn happy_path_round_trip() {
        let (addr, state) = start_server(test_config("k")).await;

        let mut config = client_config(&addr, "k");
        config.handler = Some(Arc::new(
            |request: ProxiedRequest, mut sink: ResponseSink| async move {
                let mut header = Headers::new();
                header.insert("x-upstream".into(), vec![request.url.clone()]);
                sink.send_head(200, header, 2).await?;
                sink.send_body(b"hi").await?;
                sink.finish().await
            },
        ));
        let mut client = culvert_client::Client::new(config);
        let pool_key = client.pool_key();
        client.start();

        wait_for_idle(&state, &pool_key, 2).await;

        let (status, body) = http_request(
            &addr,
            "GET",
            "/request",
            &[
                (CLIENT_ID_HEADER, "clientA"),
                (PROXY_DESTINATION_HEADER, "http://upstream.local/hello"),
            ],
            b"",
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "hi");

        // The tunnel goes back to idle once the exchange completes.
        wait_for_idle(&state, &pool_key, 2).await;

        client.shutdown().await;
    }

    #[tokio::test]
    async fn request_body_reaches_the_handler() {
        let (addr, state) = start_server(test_config("k")).await;

        let mut config = client_config(&addr, "k");
        config.handler = Some(Arc::new(
            |request: ProxiedRequest, mut sink: ResponseSink| async move {
                sink.send_head(201, Headers::new(), request.body.len() as i64)
                    .await?;
                sink.send_body(&request.body).await?;
                sink.finish().await
            },
        ));
        let mut client = culvert_client::Client::new(config);
        let pool_key = client.pool_key();
        client.start();

        wait_for_idle(&state, &pool_key, 2).await;

        let (status, body) = http_request(
            &addr,
            "POST",
            "/request",
            &[(CLIENT_ID_HEADER, "clientA")],
            b"payload bytes",
        )
        .await;

        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body, "payload bytes");

        client.shutdown().await;
    }

    #[tokio::test]
    async fn unknown_client_is_a_526_no_proxy_target() {
        let (addr, state) = start_server(test_config("k")).await;

        // Register a real client so the registry is not empty.
        let mut client = culvert_client::Client::new(client_config(&addr, "k"));
        let pool_key = client.pool_key();
        client.start();
        wait_for_idle(&state, &pool_key, 2).await;

        let (status, body) = http_request(
            &addr,
            "GET",
            "/request",
            &[(CLIENT_ID_HEADER, "ghost")],
            b"",
        )
        .await;

        assert_eq!(status.as_u16(), 526);
        assert!(body.contains("no proxy target"), "body: {body}");

        client.shutdown().await;
    }

    #[tokio::test]
    async fn missing_id_header_is_rejected() {
        let (addr, _state) = start_server(test_config("k")).await;

        let (status, body) = http_request(&addr, "GET", "/request", &[], b"").await;

        assert_eq!(status.as_u16(), 526);
        assert!(body.contains("no client identified"), "body: {body}");
    }

    #[tokio::test]
    async fn default_client_serves_unlabelled_requests() {
        let mut config = test_config("k");
        config.id_header = None;
        config.default_client_id = Some("clientA".into());
        let (addr, state) = start_server(config).await;

        let mut config = client_config(&addr, "k");
        config.handler = Some(Arc::new(
            |_request: ProxiedRequest, mut sink: ResponseSink| async move {
                sink.send_body(b"default pool").await?;
                sink.finish().await
            },
        ));
        let mut client = culvert_client::Client::new(config);
        let pool_key = client.pool_key();
        client.start();
        wait_for_idle(&state, &pool_key, 2).await;

        let (status, body) = http_request(&addr, "GET", "/request", &[], b"").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "default pool");

        client.shutdown().await;
    }

    #[tokio::test]
    async fn bad_secret_is_rejected_before_upgrade() {
        let (addr, state) = start_server(test_config("k")).await;

        let mut request = format!("ws://{addr}/register")
            .into_client_request()
            .unwrap();
        request
            .headers_mut()
            .insert(SECRET_HEADER, HeaderValue::from_static("wrong"));

        match tokio_tungstenite::connect_async(request).await {
            Err(WsError::Http(response)) => assert_eq!(response.status().as_u16(), 526),
            other => panic!("expected HTTP 526 rejection, got {other:?}"),
        }

        assert_eq!(state.registry.pool_count(), 0);
    }

    #[tokio::test]
    async fn malformed_greeting_closes_with_protocol_error() {
        let (addr, state) = start_server(test_config("k")).await;

        let mut request = format!("ws://{addr}/register")
            .into_client_request()
            .unwrap();
        request
            .headers_mut()
            .insert(SECRET_HEADER, HeaderValue::from_static("k"));

        let (mut ws, _) = tokio_tungstenite::connect_async(request).await.unwrap();
        ws.send(WsMessage::Text("clientA_ten_100".into()))
            .await
            .unwrap();

        let code = loop {
            match ws.next().await {
                Some(Ok(WsMessage::Close(Some(frame)))) => break Some(u16::from(frame.code)),
                Some(Ok(WsMessage::Close(None))) | None => break None,
                Some(Ok(_)) => continue,
                Some(Err(_)) => break None,
            }
        };

        if let Some(code) = code {
            assert_eq!(code, PROTOCOL_VIOLATION);
        }
        assert_eq!(state.registry.pool_count(), 0);
    }

    #[tokio::test]
    async fn status_endpoint_reports_pools() {
        let (addr, state) = start_server(test_config("k")).await;

        let mut client = culvert_client::Client::new(client_config(&addr, "k"));
        let pool_key = client.pool_key();
        client.start();
        wait_for_idle(&state, &pool_key, 2).await;

        let (status, body) = http_request(&addr, "GET", "/status", &[], b"").await;
        assert_eq!(status, StatusCode::OK);

        let report: serde_json::Value = serde_json::from_str(&body).unwrap();
        let pool = &report["pools"][&pool_key];
        assert_eq!(pool["idle"], 2);
        assert_eq!(pool["idle_target"], 2);
        assert_eq!(pool["max_size"], 4);

        client.shutdown().await;
    }

    #[tokio::test]
    async fn fallback_is_unauthorized_without_redirect() {
        let (addr, _state) = start_server(test_config("k")).await;
        let (status, _) = http_request(&addr, "GET", "/nowhere", &[], b"").await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn fallback_redirects_when_configured() {
        let mut config = test_config("k");
        config.redirect_url = Some("https://example.com/".into());
        let (addr, _state) = start_server(config).await;

        let (status, _) = http_request(&addr, "GET", "/nowhere", &[], b"").await;
        assert_eq!(status, StatusCode::TEMPORARY_REDIRECT);
    }

    #[tokio::test]
    async fn health_endpoint_is_open() {
        let (addr, _state) = start_server(test_config("k")).await;
        let (status, body) = http_request(&addr, "GET", "/health", &[], b"").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "OK");
    }
}
