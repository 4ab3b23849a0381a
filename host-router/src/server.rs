use std::convert::Infallible;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use http::header::{HeaderName, HeaderValue, CONTENT_LENGTH, HOST, UPGRADE};
use http::{Request, Response, StatusCode};
use hyper::body::{Body, Incoming};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tokio::sync::{oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, error, info};

use crate::access_log::{AccessLog, LogEntry};
use crate::buffer::BufferPool;
use crate::config::RouterConfig;
use crate::error::RouterResult;
use crate::forward::{self, full_body, ProxyBody, ProxyHttpClient};
use crate::hijack;
use crate::resolver::{Resolution, Resolver};
use crate::routes::RoutesBackend;

const PING_HOST: &str = "__ping__";

/// Shared, request-independent pieces of the proxy: resolver, pooled
/// upstream client, buffer pool, and the collaborator handles.
pub(crate) struct RouterState {
    pub(crate) resolver: Resolver,
    pub(crate) routes: Arc<dyn RoutesBackend>,
    pub(crate) client: ProxyHttpClient,
    pub(crate) buffers: BufferPool,
    pub(crate) access_log: Option<AccessLog>,
    pub(crate) request_id_header: Option<HeaderName>,
    pub(crate) request_timeout: Duration,
    pub(crate) dial_timeout: Duration,
    pub(crate) dead_backend_ttl: u64,
    pub(crate) marking_disabled: bool,
}

/// Transient per-request state: created at dispatch, completed by the
/// resolver, consumed by the recorder.
pub(crate) struct RequestRecord {
    pub(crate) authority: String,
    pub(crate) host: String,
    pub(crate) debug: bool,
    pub(crate) start: Instant,
    pub(crate) set_id: String,
    pub(crate) backend: Option<String>,
    pub(crate) index: usize,
    pub(crate) len: usize,
    pub(crate) backend_elapsed: Duration,
}

impl RequestRecord {
    fn new(authority: String, debug: bool) -> Self {
        let host = host_key(&authority).to_string();
        Self {
            authority,
            host,
            debug,
            start: Instant::now(),
            set_id: String::new(),
            backend: None,
            index: 0,
            len: 0,
            backend_elapsed: Duration::ZERO,
        }
    }

    fn apply(&mut self, resolution: Resolution) {
        self.set_id = resolution.set_id;
        self.backend = Some(resolution.backend);
        self.index = resolution.index;
        self.len = resolution.len;
    }
}

impl fmt::Display for RequestRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.host, self.backend.as_deref().unwrap_or("?"))
    }
}

/// The host-routed reverse proxy server.
pub struct HostRouter {
    listen_addr: SocketAddr,
    state: Arc<RouterState>,
}

impl HostRouter {
    pub fn new(
        config: RouterConfig,
        routes: Arc<dyn RoutesBackend>,
        access_log: Option<AccessLog>,
    ) -> RouterResult<Self> {
        let request_id_header = if config.request_id_header.is_empty() {
            None
        } else {
            Some(
                HeaderName::from_bytes(config.request_id_header.as_bytes())
                    .map_err(http::Error::from)?,
            )
        };

        let state = RouterState {
            resolver: Resolver::new(Arc::clone(&routes)),
            routes,
            client: forward::build_client(config.dial_timeout),
            buffers: BufferPool::new(),
            access_log,
            request_id_header,
            request_timeout: config.request_timeout,
            dial_timeout: config.dial_timeout,
            dead_backend_ttl: config.dead_backend_ttl,
            marking_disabled: config.disable_dead_marking,
        };

        Ok(Self {
            listen_addr: config.listen_addr,
            state: Arc::new(state),
        })
    }

    /// Binds the listener and spawns the accept loop. Existing connections
    /// are left to finish after shutdown; only the accept loop stops.
    pub async fn start(&self) -> RouterResult<ServerHandle> {
        let listener = TcpListener::bind(self.listen_addr).await?;
        let local_addr = listener.local_addr()?;
        let (shutdown_tx, mut shutdown_rx) = watch::channel(());
        let (finished_tx, finished_rx) = oneshot::channel();

        let state = Arc::clone(&self.state);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    accepted = listener.accept() => {
                        let (stream, peer) = match accepted {
                            Ok(conn) => conn,
                            Err(err) => {
                                error!(error = %err, "accept failed");
                                continue;
                            }
                        };
                        let _ = stream.set_nodelay(true);
                        let state = Arc::clone(&state);
                        tokio::spawn(serve_connection(state, stream, peer));
                    }
                }
            }
            let _ = finished_tx.send(());
        });

        info!(addr = %local_addr, "proxy listening");
        Ok(ServerHandle {
            shutdown_tx,
            finished_rx,
            local_addr,
        })
    }
}

pub struct ServerHandle {
    shutdown_tx: watch::Sender<()>,
    finished_rx: oneshot::Receiver<()>,
    local_addr: SocketAddr,
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(());
        let _ = self.finished_rx.await;
    }
}

async fn serve_connection(state: Arc<RouterState>, stream: tokio::net::TcpStream, peer: SocketAddr) {
    let service = service_fn(move |req| {
        let state = Arc::clone(&state);
        async move { Ok::<_, Infallible>(handle(state, peer, req).await) }
    });

    if let Err(err) = http1::Builder::new()
        .serve_connection(TokioIo::new(stream), service)
        .with_upgrades()
        .await
    {
        debug!(peer = %peer, error = %err, "connection closed with error");
    }
}

/// Classifies one inbound request: liveness probe, WebSocket upgrade, or
/// plain HTTP forward.
async fn handle(
    state: Arc<RouterState>,
    peer: SocketAddr,
    mut req: Request<Incoming>,
) -> Response<ProxyBody> {
    let authority = raw_authority(&req);

    if authority == PING_HOST && req.uri().path() == "/" {
        return forward::synthetic(StatusCode::OK, full_body(b"OK"));
    }

    let start_wall = Utc::now();
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let proto = req.version();

    // The debug header is client-controlled and must never travel upstream.
    let x_debug_router = HeaderName::from_static("x-debug-router");
    let debug = req
        .headers()
        .get(&x_debug_router)
        .and_then(|value| value.to_str().ok())
        .map(|value| !value.is_empty())
        .unwrap_or(false);
    req.headers_mut().remove(x_debug_router);

    let mut record = RequestRecord::new(authority, debug);
    match state.resolver.resolve(&record.host).await {
        Ok(resolution) => record.apply(resolution),
        Err(err) => {
            error!(request = %record, path = %path, error = %err, "failed to choose backend");
        }
    }

    let is_upgrade = req
        .headers()
        .get(UPGRADE)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false);

    let mut response = if is_upgrade {
        match hijack::hijack(&state, peer, &mut record, req).await {
            Ok(response) => response,
            Err(err) => {
                error!(request = %record, path = %path, error = %err, "websocket proxy failed");
                forward::synthetic(StatusCode::BAD_GATEWAY, forward::empty_body())
            }
        }
    } else {
        let response = forward::forward(&state, &mut record, req).await;
        if let Some(log) = &state.access_log {
            log.message_raw(LogEntry {
                start: start_wall,
                method,
                authority: record.authority.clone(),
                path,
                proto,
                status: response.status(),
                content_length: content_length(&response),
                backend_elapsed: record.backend_elapsed,
                total_elapsed: record.start.elapsed(),
                set_id: record.set_id.clone(),
                backend_index: record.index,
            });
        }
        response
    };

    if record.debug {
        apply_debug_headers(&mut response, &record);
    }
    response
}

fn apply_debug_headers(response: &mut Response<ProxyBody>, record: &RequestRecord) {
    let headers = response.headers_mut();
    if let Ok(value) = HeaderValue::from_str(record.backend.as_deref().unwrap_or_default()) {
        headers.insert(HeaderName::from_static("x-debug-backend-url"), value);
    }
    if let Ok(value) = HeaderValue::from_str(&record.index.to_string()) {
        headers.insert(HeaderName::from_static("x-debug-backend-id"), value);
    }
    if let Ok(value) = HeaderValue::from_str(&record.host) {
        headers.insert(HeaderName::from_static("x-debug-frontend-key"), value);
    }
}

fn content_length(response: &Response<ProxyBody>) -> Option<u64> {
    if let Some(value) = response.headers().get(CONTENT_LENGTH) {
        if let Some(length) = value.to_str().ok().and_then(|v| v.parse().ok()) {
            return Some(length);
        }
    }
    response.body().size_hint().exact()
}

/// The authority the client addressed: the request target's authority when
/// present, otherwise the Host header.
fn raw_authority(req: &Request<Incoming>) -> String {
    req.uri()
        .authority()
        .map(|authority| authority.as_str().to_string())
        .or_else(|| {
            req.headers()
                .get(HOST)
                .and_then(|value| value.to_str().ok())
                .map(str::to_string)
        })
        .unwrap_or_default()
}

/// Routing key: the authority with any port suffix removed. IPv6 literals
/// lose their brackets along with the port.
fn host_key(authority: &str) -> &str {
    if let Some(rest) = authority.strip_prefix('[') {
        if let Some(end) = rest.find(']') {
            return &rest[..end];
        }
    }
    match authority.rfind(':') {
        Some(index)
            if authority[..index].find(':').is_none()
                && authority[index + 1..].bytes().all(|b| b.is_ascii_digit()) =>
        {
            &authority[..index]
        }
        _ => authority,
    }
}
