use std::net::SocketAddr;

use http::header::{HeaderName, HeaderValue, HOST};
use http::{Request, Response, StatusCode};
use hyper::body::Incoming;
use hyper::upgrade::Upgraded;
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, error};
use url::Url;

use crate::buffer::BufferPool;
use crate::error::{RouterError, RouterResult};
use crate::forward::{empty_body, ProxyBody};
use crate::server::{RequestRecord, RouterState};

/// Tunnels a WebSocket upgrade request: dials the backend over raw TCP,
/// relays the original request, and on a `101` splices bytes in both
/// directions until either side closes. The request timeout does not apply
/// (these connections are long-lived by design) and splice errors never
/// mark a backend dead, since they may be ordinary client disconnects.
pub(crate) async fn hijack(
    state: &RouterState,
    peer: SocketAddr,
    record: &mut RequestRecord,
    mut req: Request<Incoming>,
) -> RouterResult<Response<ProxyBody>> {
    let backend = record.backend.clone().ok_or(RouterError::InvalidRoute)?;
    let (host, port) = dial_authority(&backend).ok_or(RouterError::InvalidRoute)?;

    let dial = TcpStream::connect((host.as_str(), port));
    let stream = if state.dial_timeout.is_zero() {
        dial.await
    } else {
        tokio::time::timeout(state.dial_timeout, dial)
            .await
            .unwrap_or_else(|_| {
                Err(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "connect timed out",
                ))
            })
    }
    .map_err(RouterError::HijackDial)?;
    let _ = stream.set_nodelay(true);

    // The client-side byte stream is claimed up front; hyper hands it over
    // once the 101 response below has been written.
    let client_upgrade = hyper::upgrade::on(&mut req);

    append_forwarded_for(&mut req, peer);
    let host_header = if host.contains(':') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    };
    if let Ok(value) = HeaderValue::from_str(&host_header) {
        req.headers_mut().insert(HOST, value);
    }

    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream)).await?;
    let conn_desc = record.to_string();
    tokio::spawn(async move {
        if let Err(err) = conn.with_upgrades().await {
            debug!(request = %conn_desc, error = %err, "websocket upstream connection closed");
        }
    });

    let mut response = sender.send_request(req).await?;

    if response.status() != StatusCode::SWITCHING_PROTOCOLS {
        return Ok(response.map(http_body_util::BodyExt::boxed));
    }

    let upstream_upgrade = hyper::upgrade::on(&mut response);
    let pool = state.buffers.clone();
    let splice_desc = record.to_string();
    tokio::spawn(async move {
        match tokio::try_join!(client_upgrade, upstream_upgrade) {
            Ok((client_io, upstream_io)) => splice(client_io, upstream_io, pool).await,
            Err(err) => {
                error!(request = %splice_desc, error = %err, "websocket upgrade failed");
            }
        }
    });

    let (parts, _body) = response.into_parts();
    Ok(Response::from_parts(parts, empty_body()))
}

/// Resolves the dial target for a backend URL, defaulting the port from the
/// scheme. Bare authorities dial as-is on port 80.
pub(crate) fn dial_authority(backend: &str) -> Option<(String, u16)> {
    match Url::parse(backend) {
        Ok(url) if url.has_host() => {
            let host = strip_brackets(url.host_str()?).to_string();
            let port = url.port_or_known_default().unwrap_or(80);
            Some((host, port))
        }
        _ => {
            let authority: http::uri::Authority = backend.parse().ok()?;
            let host = strip_brackets(authority.host()).to_string();
            Some((host, authority.port_u16().unwrap_or(80)))
        }
    }
}

fn strip_brackets(host: &str) -> &str {
    host.trim_start_matches('[').trim_end_matches(']')
}

/// Appends the client peer IP to any existing X-Forwarded-For chain.
fn append_forwarded_for(req: &mut Request<Incoming>, peer: SocketAddr) {
    let forwarded_for = HeaderName::from_static("x-forwarded-for");
    let client_ip = peer.ip().to_string();
    let prior: Vec<&str> = req
        .headers()
        .get_all(&forwarded_for)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .collect();
    let chain = if prior.is_empty() {
        client_ip
    } else {
        format!("{}, {}", prior.join(", "), client_ip)
    };
    if let Ok(value) = HeaderValue::from_str(&chain) {
        req.headers_mut().insert(forwarded_for, value);
    }
}

async fn splice(client_io: Upgraded, upstream_io: Upgraded, pool: BufferPool) {
    let (client_read, client_write) = tokio::io::split(TokioIo::new(client_io));
    let (upstream_read, upstream_write) = tokio::io::split(TokioIo::new(upstream_io));

    let mut inbound = tokio::spawn(copy_stream(client_read, upstream_write, pool.clone()));
    let mut outbound = tokio::spawn(copy_stream(upstream_read, client_write, pool));

    // First termination wins; aborting the other loop drops its stream half
    // and unblocks the peer on socket closure.
    tokio::select! {
        result = &mut inbound => {
            outbound.abort();
            log_splice_end("client", result);
        }
        result = &mut outbound => {
            inbound.abort();
            log_splice_end("upstream", result);
        }
    }
}

fn log_splice_end(side: &str, result: Result<std::io::Result<()>, tokio::task::JoinError>) {
    match result {
        Ok(Ok(())) => debug!(side, "websocket splice closed"),
        Ok(Err(err)) => debug!(side, error = %err, "websocket splice ended"),
        Err(err) => debug!(side, error = %err, "websocket splice task failed"),
    }
}

async fn copy_stream<R, W>(mut reader: R, mut writer: W, pool: BufferPool) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut slab = pool.acquire();
    let result = loop {
        match reader.read(&mut slab).await {
            Ok(0) => break Ok(()),
            Ok(n) => {
                if let Err(err) = writer.write_all(&slab[..n]).await {
                    break Err(err);
                }
                if let Err(err) = writer.flush().await {
                    break Err(err);
                }
            }
            Err(err) => break Err(err),
        }
    };
    pool.release(slab);
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dial_authority_uses_explicit_ports() {
        assert_eq!(
            dial_authority("http://app-1.internal:8080"),
            Some(("app-1.internal".to_string(), 8080))
        );
        assert_eq!(
            dial_authority("10.0.0.1:9000"),
            Some(("10.0.0.1".to_string(), 9000))
        );
    }

    #[test]
    fn dial_authority_defaults_port_from_scheme() {
        assert_eq!(
            dial_authority("http://app-1.internal"),
            Some(("app-1.internal".to_string(), 80))
        );
        assert_eq!(
            dial_authority("https://app-1.internal"),
            Some(("app-1.internal".to_string(), 443))
        );
        assert_eq!(dial_authority("app-1"), Some(("app-1".to_string(), 80)));
    }

    #[test]
    fn dial_authority_strips_ipv6_brackets() {
        assert_eq!(
            dial_authority("http://[::1]:9000"),
            Some(("::1".to_string(), 9000))
        );
    }

    #[test]
    fn dial_authority_rejects_unusable_backends() {
        assert_eq!(dial_authority(""), None);
        assert_eq!(dial_authority("not a backend"), None);
    }

    #[tokio::test]
    async fn copy_stream_moves_bytes_and_recycles_slabs() {
        let pool = BufferPool::new();
        let (mut input, reader) = tokio::io::duplex(64);
        let (writer, mut output) = tokio::io::duplex(64);

        let copy = tokio::spawn(copy_stream(reader, writer, pool.clone()));
        input.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        output.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        drop(input);
        copy.await.unwrap().unwrap();
        // The slab went back to the free list once the copy loop finished.
        let slab = pool.acquire();
        assert_eq!(slab.len(), crate::buffer::SLAB_SIZE);
    }
}
