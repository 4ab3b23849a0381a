#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http::{HeaderMap, Method, Request, Response, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo};
use tokio::io::AsyncReadExt;
use tokio::net::TcpListener;

use host_router::{
    BoxError, HostRouter, RouteSnapshot, RouterConfig, RoutesBackend, ServerHandle,
};

pub type TestClient = Client<HttpConnector, Full<Bytes>>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MarkCall {
    pub host: String,
    pub backend: String,
    pub index: usize,
    pub len: usize,
    pub ttl: u64,
}

/// In-memory stand-in for the routes backend, recording every mark call.
pub struct MemoryRoutes {
    routes: Mutex<HashMap<String, RouteSnapshot>>,
    marks: Mutex<Vec<MarkCall>>,
}

impl MemoryRoutes {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            routes: Mutex::new(HashMap::new()),
            marks: Mutex::new(Vec::new()),
        })
    }

    pub fn set_route(&self, host: &str, id: &str, backends: &[String], dead: &[usize]) {
        self.routes.lock().unwrap().insert(
            host.to_string(),
            RouteSnapshot {
                id: id.to_string(),
                backends: backends.to_vec(),
                dead: dead.iter().copied().collect(),
            },
        );
    }

    pub fn marks(&self) -> Vec<MarkCall> {
        self.marks.lock().unwrap().clone()
    }
}

#[async_trait]
impl RoutesBackend for MemoryRoutes {
    async fn backends(&self, host: &str) -> Result<RouteSnapshot, BoxError> {
        self.routes
            .lock()
            .unwrap()
            .get(host)
            .cloned()
            .ok_or_else(|| format!("no mapping for {host}").into())
    }

    async fn mark_dead(
        &self,
        host: &str,
        backend: &str,
        index: usize,
        len: usize,
        ttl_secs: u64,
    ) -> Result<(), BoxError> {
        self.marks.lock().unwrap().push(MarkCall {
            host: host.to_string(),
            backend: backend.to_string(),
            index,
            len,
            ttl: ttl_secs,
        });
        Ok(())
    }
}

pub async fn start_proxy(
    routes: Arc<MemoryRoutes>,
    configure: impl FnOnce(&mut RouterConfig),
) -> ServerHandle {
    let mut config = RouterConfig {
        listen_addr: "127.0.0.1:0".parse().unwrap(),
        log_path: "none".to_string(),
        dial_timeout: Duration::from_secs(5),
        request_timeout: Duration::from_secs(5),
        ..RouterConfig::default()
    };
    configure(&mut config);

    let router = HostRouter::new(config, routes, None).expect("build proxy");
    router.start().await.expect("start proxy")
}

pub fn http_client() -> TestClient {
    Client::builder(TokioExecutor::new()).build_http()
}

pub async fn proxy_request(
    client: &TestClient,
    proxy: SocketAddr,
    host: &str,
    path: &str,
    headers: &[(&str, &str)],
) -> (StatusCode, HeaderMap, Bytes) {
    let mut builder = Request::builder()
        .uri(format!("http://{proxy}{path}"))
        .header(http::header::HOST, host);
    for (name, value) in headers {
        builder = builder.header(*name, *value);
    }
    let request = builder.body(Full::new(Bytes::new())).expect("build request");

    let response = client.request(request).await.expect("proxy request");
    let (parts, body) = response.into_parts();
    let bytes = body.collect().await.expect("read body").to_bytes();
    (parts.status, parts.headers, bytes)
}

#[derive(Debug, Clone)]
pub struct CapturedRequest {
    pub method: Method,
    pub path: String,
    pub headers: HeaderMap,
}

/// A real HTTP/1.1 backend that records what it receives.
pub struct TestBackend {
    pub addr: SocketAddr,
    requests: Arc<Mutex<Vec<CapturedRequest>>>,
}

impl TestBackend {
    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn requests(&self) -> Vec<CapturedRequest> {
        self.requests.lock().unwrap().clone()
    }
}

pub async fn spawn_backend(reply: &'static str) -> TestBackend {
    spawn_backend_with_status(StatusCode::OK, reply).await
}

pub async fn spawn_backend_with_status(status: StatusCode, reply: &'static str) -> TestBackend {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind backend");
    let addr = listener.local_addr().expect("backend addr");
    let requests = Arc::new(Mutex::new(Vec::new()));

    let captured = Arc::clone(&requests);
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            let captured = Arc::clone(&captured);
            tokio::spawn(async move {
                let service = service_fn(move |req: Request<Incoming>| {
                    let captured = Arc::clone(&captured);
                    async move {
                        captured.lock().unwrap().push(CapturedRequest {
                            method: req.method().clone(),
                            path: req.uri().path().to_string(),
                            headers: req.headers().clone(),
                        });
                        Ok::<_, hyper::Error>(
                            Response::builder()
                                .status(status)
                                .body(Full::new(Bytes::from_static(reply.as_bytes())))
                                .expect("build backend response"),
                        )
                    }
                });
                let _ = http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .await;
            });
        }
    });

    TestBackend { addr, requests }
}

/// A backend that accepts connections and then never answers.
pub async fn spawn_stalled_backend() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind backend");
    let addr = listener.local_addr().expect("backend addr");
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let mut sink = [0u8; 1024];
                while let Ok(n) = stream.read(&mut sink).await {
                    if n == 0 {
                        break;
                    }
                }
            });
        }
    });
    addr
}

/// An address that actively refuses connections.
pub async fn refused_addr() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind probe");
    let addr = listener.local_addr().expect("probe addr");
    drop(listener);
    addr
}
