use std::net::IpAddr;
use std::sync::Once;
use std::time::Duration;

use bytes::Bytes;
use http::header::{HeaderName, HeaderValue, HOST};
use http::uri::{Authority, PathAndQuery, Scheme};
use http::{Request, Response, StatusCode, Uri};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::Incoming;
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use tokio::time::Instant;
use tracing::error;
use url::Url;

use crate::error::RouterError;
use crate::server::{RequestRecord, RouterState};

/// Idle upstream sockets kept per host by the pooled client.
const MAX_IDLE_PER_HOST: usize = 100;

/// TCP keep-alive probe interval for pooled connections.
const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(30);

pub(crate) type ProxyBody = BoxBody<Bytes, hyper::Error>;

pub(crate) type ProxyHttpClient = Client<HttpsConnector<HttpConnector>, Incoming>;

pub(crate) fn empty_body() -> ProxyBody {
    Empty::<Bytes>::new().map_err(|never| match never {}).boxed()
}

pub(crate) fn full_body(bytes: &'static [u8]) -> ProxyBody {
    Full::new(Bytes::from_static(bytes))
        .map_err(|never| match never {})
        .boxed()
}

pub(crate) fn synthetic(status: StatusCode, body: ProxyBody) -> Response<ProxyBody> {
    let mut response = Response::new(body);
    *response.status_mut() = status;
    response
}

fn no_route_response() -> Response<ProxyBody> {
    synthetic(StatusCode::BAD_REQUEST, full_body(b"no such route"))
}

pub(crate) fn build_client(dial_timeout: Duration) -> ProxyHttpClient {
    static INSTALL: Once = Once::new();
    INSTALL.call_once(|| {
        let _ = rustls::crypto::ring::default_provider().install_default();
    });

    let mut connector = HttpConnector::new();
    connector.enforce_http(false);
    connector.set_nodelay(true);
    connector.set_keepalive(Some(KEEP_ALIVE_INTERVAL));
    if !dial_timeout.is_zero() {
        connector.set_connect_timeout(Some(dial_timeout));
    }

    let https = HttpsConnectorBuilder::new()
        .with_webpki_roots()
        .https_or_http()
        .enable_http1()
        .wrap_connector(connector);

    Client::builder(TokioExecutor::new())
        .pool_max_idle_per_host(MAX_IDLE_PER_HOST)
        .build(https)
}

/// Streams the request to the backend chosen for this record and streams
/// the response back. Transport failures synthesize a `503` and, when the
/// error is a non-temporary connect failure, advise the routes backend that
/// the backend is dead. A request that never resolved a backend is answered
/// with `400 no such route` without touching the network.
pub(crate) async fn forward(
    state: &RouterState,
    record: &mut RequestRecord,
    req: Request<Incoming>,
) -> Response<ProxyBody> {
    let path = req.uri().path().to_string();

    let target = match record.backend.as_deref().map(upstream_target) {
        Some(Some(target)) => target,
        Some(None) => {
            error!(request = %record, path = %path, error = %RouterError::InvalidRoute, "invalid backend url");
            return no_route_response();
        }
        None => return no_route_response(),
    };

    let outgoing = match rewrite_request(state, record, req, &target) {
        Ok(outgoing) => outgoing,
        Err(err) => {
            error!(request = %record, path = %path, error = %err, "failed to build upstream request");
            return no_route_response();
        }
    };

    let backend_started = Instant::now();
    let exchange = state.client.request(outgoing);
    let result = if state.request_timeout.is_zero() {
        Ok(exchange.await)
    } else {
        tokio::time::timeout(state.request_timeout, exchange).await
    };
    record.backend_elapsed = backend_started.elapsed();

    match result {
        Ok(Ok(mut response)) => {
            strip_hop_headers(response.headers_mut());
            response.map(BodyExt::boxed)
        }
        Ok(Err(err)) => {
            let mark_dead = should_mark_dead(&err);
            error!(
                request = %record,
                path = %path,
                marked_dead = mark_dead,
                error = %RouterError::Upstream(err),
                "error in backend request"
            );
            if mark_dead && !state.marking_disabled {
                mark_backend_dead(state, record, &path).await;
            }
            synthetic(StatusCode::SERVICE_UNAVAILABLE, empty_body())
        }
        Err(_) => {
            // Our timer fired first. Dropping the exchange future cancels
            // the in-flight request; a local timeout is not a liveness
            // signal, so the backend is never marked dead here.
            error!(
                request = %record,
                path = %path,
                error = %RouterError::Timeout(state.request_timeout),
                "request timed out"
            );
            synthetic(StatusCode::SERVICE_UNAVAILABLE, empty_body())
        }
    }
}

async fn mark_backend_dead(state: &RouterState, record: &RequestRecord, path: &str) {
    let backend = record.backend.as_deref().unwrap_or_default();
    if let Err(err) = state
        .routes
        .mark_dead(
            &record.host,
            backend,
            record.index,
            record.len,
            state.dead_backend_ttl,
        )
        .await
    {
        error!(
            request = %record,
            path = %path,
            error = %err,
            "failed to mark dead backend in routes backend"
        );
    }
}

fn rewrite_request(
    state: &RouterState,
    record: &RequestRecord,
    req: Request<Incoming>,
    target: &UpstreamTarget,
) -> Result<Request<Incoming>, RouterError> {
    let (mut parts, body) = req.into_parts();

    let path_and_query = parts
        .uri
        .path_and_query()
        .cloned()
        .unwrap_or_else(|| PathAndQuery::from_static("/"));
    let mut uri_parts = http::uri::Parts::default();
    uri_parts.scheme = Some(target.scheme.clone());
    uri_parts.authority = Some(target.authority.clone());
    uri_parts.path_and_query = Some(path_and_query);
    parts.uri = Uri::from_parts(uri_parts).map_err(http::Error::from)?;

    strip_hop_headers(&mut parts.headers);

    // The client-supplied authority never picks the upstream, but it is
    // preserved in X-Host for the upstream's own virtual-host dispatch.
    // Literal-IP upstreams keep the original Host untouched.
    let upstream_host = target.authority.host();
    if !is_ip_literal(upstream_host) {
        if let Ok(original) = HeaderValue::from_str(&record.authority) {
            parts
                .headers
                .insert(HeaderName::from_static("x-host"), original);
        }
        if let Ok(host) = HeaderValue::from_str(upstream_host) {
            parts.headers.insert(HOST, host);
        }
    }

    if let Some(name) = &state.request_id_header {
        if !parts.headers.contains_key(name) {
            let id = uuid::Uuid::new_v4().to_string();
            if let Ok(value) = HeaderValue::from_str(&id) {
                parts.headers.insert(name.clone(), value);
            }
        }
    }

    Ok(Request::from_parts(parts, body))
}

pub(crate) struct UpstreamTarget {
    pub(crate) scheme: Scheme,
    pub(crate) authority: Authority,
}

/// Splits a configured backend URL into scheme and authority. A backend
/// with no host component (a bare authority) is forced onto plain HTTP.
/// `None` means the route cannot be used at all.
pub(crate) fn upstream_target(backend: &str) -> Option<UpstreamTarget> {
    match Url::parse(backend) {
        Ok(url) if url.has_host() => {
            let scheme = Scheme::try_from(url.scheme()).ok()?;
            let host = url.host_str()?;
            let authority = match url.port() {
                Some(port) => format!("{host}:{port}").parse().ok()?,
                None => host.parse().ok()?,
            };
            Some(UpstreamTarget { scheme, authority })
        }
        _ => {
            let authority: Authority = backend.parse().ok()?;
            Some(UpstreamTarget {
                scheme: Scheme::HTTP,
                authority,
            })
        }
    }
}

pub(crate) fn is_ip_literal(host: &str) -> bool {
    host.trim_start_matches('[')
        .trim_end_matches(']')
        .parse::<IpAddr>()
        .is_ok()
}

fn strip_hop_headers(headers: &mut http::HeaderMap) {
    const HOP_HEADERS: &[&str] = &[
        "connection",
        "keep-alive",
        "proxy-authenticate",
        "proxy-authorization",
        "te",
        "trailer",
        "transfer-encoding",
        "upgrade",
        "proxy-connection",
    ];
    for name in HOP_HEADERS {
        headers.remove(*name);
    }
}

/// Whether a failed exchange should flag the backend as dead. The transport
/// must report a concrete OS error, in any phase of the exchange, and that
/// error must not be a transient kind: resets and timeouts under load never
/// cascade into removing healthy upstreams.
fn should_mark_dead(err: &hyper_util::client::legacy::Error) -> bool {
    match io_error_kind(err) {
        Some(kind) => !is_transient_kind(kind),
        None => false,
    }
}

fn is_transient_kind(kind: std::io::ErrorKind) -> bool {
    use std::io::ErrorKind;
    matches!(
        kind,
        ErrorKind::TimedOut
            | ErrorKind::WouldBlock
            | ErrorKind::Interrupted
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::BrokenPipe
            | ErrorKind::UnexpectedEof
    )
}

fn io_error_kind(err: &(dyn std::error::Error + 'static)) -> Option<std::io::ErrorKind> {
    let mut source = err.source();
    while let Some(cause) = source {
        if let Some(io_err) = cause.downcast_ref::<std::io::Error>() {
            return Some(io_err.kind());
        }
        source = cause.source();
    }
    None
}
