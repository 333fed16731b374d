//! Front HTTP server
//!
//! Every request is matched against the [`MappingTable`]. Matching requests
//! are forwarded to the instance with the route prefix stripped; everything
//! else goes to the control API.

use crate::api::{self, ApiState};
use crate::error::{json_error_response, ProxyErrorCode};
use crate::mapping::{MappingTable, ResolvedRoute};
use crate::pool::{ConnectionPool, PoolConfig};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty};
use hyper::body::{Bytes, Incoming};
use hyper::header::HeaderValue;
use hyper::service::service_fn;
use hyper::upgrade::Upgraded;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const X_REQUEST_ID: &str = "x-request-id";
const X_FORWARDED_FOR: &str = "x-forwarded-for";
const X_FORWARDED_HOST: &str = "x-forwarded-host";
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";
/// Route prefix that was stripped, so applications can build absolute URLs
const X_FORWARDED_PREFIX: &str = "x-forwarded-prefix";

/// Per-connection view of the server state
struct Shared {
    mappings: Arc<MappingTable>,
    api: Arc<ApiState>,
    pool: Arc<ConnectionPool>,
    request_timeout: Duration,
    endpoint_prefix: String,
}

pub struct ProxyServer {
    bind_addr: SocketAddr,
    shared: Arc<Shared>,
    shutdown_rx: watch::Receiver<bool>,
    tls_acceptor: Option<TlsAcceptor>,
}

impl ProxyServer {
    pub fn new(
        bind_addr: SocketAddr,
        api: Arc<ApiState>,
        shutdown_rx: watch::Receiver<bool>,
        pool_config: PoolConfig,
        request_timeout: Duration,
    ) -> Self {
        let mappings = Arc::clone(api.lifecycle.mappings());
        let endpoint_prefix = api.lifecycle.settings().endpoint_prefix.clone();
        Self {
            bind_addr,
            shared: Arc::new(Shared {
                mappings,
                api,
                pool: Arc::new(ConnectionPool::new(pool_config)),
                request_timeout,
                endpoint_prefix,
            }),
            shutdown_rx,
            tls_acceptor: None,
        }
    }

    pub fn with_tls(mut self, acceptor: TlsAcceptor) -> Self {
        self.tls_acceptor = Some(acceptor);
        self
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.shared.pool
    }

    pub fn tls_enabled(&self) -> bool {
        self.tls_acceptor.is_some()
    }

    /// Bind and serve until the shutdown channel flips to true
    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve on an already bound listener
    pub async fn serve(self, listener: TcpListener) -> anyhow::Result<()> {
        let protocol = if self.tls_acceptor.is_some() { "HTTPS" } else { "HTTP" };
        info!(addr = %listener.local_addr()?, protocol, "Proxy server listening (HTTP/1.1 and HTTP/2)");

        let mut shutdown_rx = self.shutdown_rx.clone();
        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let shared = Arc::clone(&self.shared);
                            let tls_acceptor = self.tls_acceptor.clone();

                            tokio::spawn(async move {
                                if let Some(acceptor) = tls_acceptor {
                                    match acceptor.accept(stream).await {
                                        Ok(tls_stream) => {
                                            if let Err(e) = handle_connection(tls_stream, addr, shared, true).await {
                                                debug!(addr = %addr, error = %e, "TLS connection error");
                                            }
                                        }
                                        Err(e) => {
                                            debug!(addr = %addr, error = %e, "TLS handshake failed");
                                        }
                                    }
                                } else if let Err(e) = handle_connection(stream, addr, shared, false).await {
                                    debug!(addr = %addr, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Proxy server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn handle_connection<S>(
    stream: S,
    addr: SocketAddr,
    shared: Arc<Shared>,
    is_tls: bool,
) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);
    let service = service_fn(move |req: Request<Incoming>| {
        let shared = Arc::clone(&shared);
        async move { handle_request(req, shared, addr, is_tls).await }
    });

    AutoBuilder::new(TokioExecutor::new())
        .http1()
        .preserve_header_case(true)
        .http2()
        .max_concurrent_streams(250)
        .serve_connection_with_upgrades(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

    Ok(())
}

async fn handle_request(
    mut req: Request<Incoming>,
    shared: Arc<Shared>,
    client_addr: SocketAddr,
    is_tls: bool,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error> {
    let Some(resolved) = shared.mappings.resolve(req.uri().path()) else {
        if is_under(req.uri().path(), &shared.endpoint_prefix) {
            debug!(path = %req.uri().path(), "No route for instance path");
            return Ok(json_error_response(
                ProxyErrorCode::NoRoute,
                "No running instance for this path",
            ));
        }
        return Ok(api::handle_api_request(req, Arc::clone(&shared.api)).await);
    };

    let request_id = req
        .headers()
        .get(X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    // This proxy is the first trusted hop, so client supplied values are overwritten
    let headers = req.headers_mut();
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        headers.insert(X_REQUEST_ID, value);
    }
    if let Ok(value) = HeaderValue::from_str(&client_addr.ip().to_string()) {
        headers.insert(X_FORWARDED_FOR, value);
    }
    if let Some(host) = headers.get(hyper::header::HOST).cloned() {
        headers.insert(X_FORWARDED_HOST, host);
    }
    let proto = if is_tls { "https" } else { "http" };
    headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static(proto));
    if let Ok(value) = HeaderValue::from_str(&resolved.route.prefix) {
        headers.insert(X_FORWARDED_PREFIX, value);
    }

    let path_and_query = forwarded_path(&resolved, req.uri().query());
    let instance_id = resolved.route.instance_id.as_str();
    let target = resolved.route.target.as_str();
    debug!(
        instance_id,
        target,
        method = %req.method(),
        path = %path_and_query,
        request_id,
        "Proxying request"
    );

    if is_upgrade_request(&req) {
        return handle_upgrade(req, &resolved, path_and_query, request_id).await;
    }

    let result = tokio::time::timeout(
        shared.request_timeout,
        shared.pool.send_request(req, target, &path_and_query),
    )
    .await;

    match result {
        Ok(Ok(response)) => Ok(response),
        Ok(Err(e)) => {
            error!(instance_id, target, error = %e, "Failed to forward request");
            Ok(json_error_response(
                ProxyErrorCode::ConnectionFailed,
                "Failed to connect to instance",
            ))
        }
        Err(_) => {
            warn!(
                instance_id,
                target,
                timeout_secs = shared.request_timeout.as_secs(),
                "Request timed out"
            );
            Ok(json_error_response(
                ProxyErrorCode::RequestTimeout,
                format!(
                    "Request timed out after {} seconds",
                    shared.request_timeout.as_secs()
                ),
            ))
        }
    }
}

/// Whether `path` is `prefix` itself or below it
fn is_under(path: &str, prefix: &str) -> bool {
    match path.strip_prefix(prefix) {
        Some(rest) => rest.is_empty() || rest.starts_with('/'),
        None => false,
    }
}

/// Path sent to the instance: the remainder after the route prefix plus the
/// original query string
fn forwarded_path(resolved: &ResolvedRoute, query: Option<&str>) -> String {
    match query {
        Some(query) => format!("{}?{}", resolved.remaining_path, query),
        None => resolved.remaining_path.clone(),
    }
}

fn is_upgrade_request(req: &Request<Incoming>) -> bool {
    let has_upgrade_connection = req
        .headers()
        .get(hyper::header::CONNECTION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_lowercase().contains("upgrade"))
        .unwrap_or(false);

    has_upgrade_connection && req.headers().contains_key(hyper::header::UPGRADE)
}

/// `host:port` part of an `http://host:port` target
fn target_authority(target: &str) -> &str {
    target
        .strip_prefix("http://")
        .unwrap_or(target)
        .trim_end_matches('/')
}

/// Bytes the instance sent right behind its 101 head are delivered before
/// the two streams are joined.
async fn forward_bidirectional(
    client: Upgraded,
    mut backend: TcpStream,
    early_data: Vec<u8>,
    instance_id: &str,
    request_id: &str,
) {
    let mut client_io = TokioIo::new(client);
    if !early_data.is_empty() {
        if let Err(e) = client_io.write_all(&early_data).await {
            debug!(instance_id, request_id, error = %e, "Client went away after upgrade");
            return;
        }
    }
    match tokio::io::copy_bidirectional(&mut client_io, &mut backend).await {
        Ok((client_to_backend, backend_to_client)) => {
            debug!(
                instance_id,
                request_id,
                client_to_backend,
                backend_to_client,
                "Upgraded connection closed normally"
            );
        }
        Err(e) => {
            debug!(instance_id, request_id, error = %e, "Upgraded connection closed with error");
        }
    }
}

/// Raw HTTP/1.1 upgrade request for the instance. The client's Host header
/// is replaced by the instance authority.
fn build_upgrade_request(req: &Request<Incoming>, path_and_query: &str, authority: &str) -> Vec<u8> {
    let mut request = format!("{} {} HTTP/1.1\r\n", req.method(), path_and_query);
    for (name, value) in req.headers() {
        if name == hyper::header::HOST {
            continue;
        }
        if let Ok(v) = value.to_str() {
            request.push_str(&format!("{}: {}\r\n", name, v));
        }
    }
    request.push_str(&format!("Host: {}\r\n\r\n", authority));
    request.into_bytes()
}

/// Status and headers of the instance's reply to an upgrade request
/// Largest response head accepted from an instance during an upgrade
const MAX_UPGRADE_HEAD: usize = 64 * 1024;

/// Read a response head up to and including the blank line. Returns the head
/// and whatever arrived after it, or `None` if the stream ended first.
async fn read_response_head<R: AsyncRead + Unpin>(
    stream: &mut R,
) -> std::io::Result<Option<(Vec<u8>, Vec<u8>)>> {
    let mut buf = Vec::with_capacity(4096);
    let mut chunk = [0u8; 4096];
    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Ok(None);
        }
        // The terminator may straddle two reads
        let search_from = buf.len().saturating_sub(3);
        buf.extend_from_slice(&chunk[..n]);
        if let Some(pos) = buf[search_from..].windows(4).position(|w| w == b"\r\n\r\n") {
            let rest = buf.split_off(search_from + pos + 4);
            return Ok(Some((buf, rest)));
        }
        if buf.len() > MAX_UPGRADE_HEAD {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "upgrade response head too large",
            ));
        }
    }
}

fn parse_upgrade_response(data: &[u8]) -> Option<(StatusCode, Vec<(String, String)>)> {
    let response_str = std::str::from_utf8(data).ok()?;
    let mut lines = response_str.lines();

    // HTTP/1.1 101 Switching Protocols
    let status_line = lines.next()?;
    let status_code: u16 = status_line.split_whitespace().nth(1)?.parse().ok()?;
    let status = StatusCode::from_u16(status_code).ok()?;

    let mut headers = Vec::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            headers.push((name.trim().to_string(), value.trim().to_string()));
        }
    }

    Some((status, headers))
}

fn empty_response(status: StatusCode, headers: &[(String, String)]) -> Response<BoxBody<Bytes, hyper::Error>> {
    let mut response = Response::new(Empty::<Bytes>::new().map_err(|never| match never {}).boxed());
    *response.status_mut() = status;
    for (name, value) in headers {
        let lower = name.to_lowercase();
        if lower == "content-length" || lower == "transfer-encoding" {
            continue;
        }
        if let (Ok(name), Ok(value)) = (
            hyper::header::HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            response.headers_mut().append(name, value);
        }
    }
    response
}

async fn handle_upgrade(
    req: Request<Incoming>,
    resolved: &ResolvedRoute,
    path_and_query: String,
    request_id: String,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error> {
    let instance_id = resolved.route.instance_id.clone();
    let authority = target_authority(&resolved.route.target).to_string();
    debug!(instance_id, request_id, authority, "Handling upgrade request");

    let raw_request = build_upgrade_request(&req, &path_and_query, &authority);

    let mut backend_stream = match TcpStream::connect(&authority).await {
        Ok(stream) => stream,
        Err(e) => {
            error!(instance_id, authority, error = %e, "Failed to connect to instance for upgrade");
            return Ok(json_error_response(
                ProxyErrorCode::ConnectionFailed,
                "Failed to connect to instance",
            ));
        }
    };

    if let Err(e) = backend_stream.write_all(&raw_request).await {
        error!(instance_id, error = %e, "Failed to send upgrade request to instance");
        return Ok(json_error_response(
            ProxyErrorCode::ConnectionFailed,
            "Failed to send upgrade request",
        ));
    }

    let (head, early_data) = match read_response_head(&mut backend_stream).await {
        Ok(Some(parts)) => parts,
        Ok(None) => {
            error!(instance_id, "Instance closed connection before answering upgrade");
            return Ok(json_error_response(
                ProxyErrorCode::ConnectionFailed,
                "Instance closed connection",
            ));
        }
        Err(e) => {
            error!(instance_id, error = %e, "Failed to read upgrade response");
            return Ok(json_error_response(
                ProxyErrorCode::ConnectionFailed,
                "Failed to read instance response",
            ));
        }
    };

    let Some((status, response_headers)) = parse_upgrade_response(&head) else {
        error!(instance_id, "Failed to parse upgrade response");
        return Ok(json_error_response(
            ProxyErrorCode::ConnectionFailed,
            "Invalid upgrade response from instance",
        ));
    };

    if status != StatusCode::SWITCHING_PROTOCOLS {
        warn!(instance_id, status = %status, "Instance rejected upgrade request");
        return Ok(empty_response(status, &response_headers));
    }

    info!(instance_id, request_id, "Upgrade successful");
    let response = empty_response(StatusCode::SWITCHING_PROTOCOLS, &response_headers);

    tokio::spawn(async move {
        match hyper::upgrade::on(req).await {
            Ok(upgraded) => {
                forward_bidirectional(
                    upgraded,
                    backend_stream,
                    early_data,
                    &instance_id,
                    &request_id,
                )
                .await;
            }
            Err(e) => {
                error!(instance_id, error = %e, "Failed to upgrade client connection");
            }
        }
    });

    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapping::Route;

    #[test]
    fn test_is_under() {
        assert!(is_under("/endpoint", "/endpoint"));
        assert!(is_under("/endpoint/abc", "/endpoint"));
        assert!(!is_under("/endpoints", "/endpoint"));
        assert!(!is_under("/api/proxy", "/endpoint"));
    }

    #[test]
    fn test_forwarded_path() {
        let resolved = ResolvedRoute {
            route: Route {
                prefix: "/endpoint/abc".to_string(),
                target: "http://127.0.0.1:9000".to_string(),
                instance_id: "abc".to_string(),
            },
            remaining_path: "/tree".to_string(),
        };
        assert_eq!(forwarded_path(&resolved, None), "/tree");
        assert_eq!(forwarded_path(&resolved, Some("a=1&b=2")), "/tree?a=1&b=2");
    }

    #[test]
    fn test_target_authority() {
        assert_eq!(target_authority("http://10.1.2.3:8888"), "10.1.2.3:8888");
        assert_eq!(target_authority("http://svc:80/"), "svc:80");
        assert_eq!(target_authority("host:1"), "host:1");
    }

    #[test]
    fn test_parse_upgrade_response() {
        let raw = b"HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\r\n";
        let (status, headers) = parse_upgrade_response(raw).unwrap();
        assert_eq!(status, StatusCode::SWITCHING_PROTOCOLS);
        assert_eq!(headers.len(), 2);
        assert_eq!(headers[0], ("Upgrade".to_string(), "websocket".to_string()));

        assert!(parse_upgrade_response(b"garbage").is_none());
    }

    #[tokio::test]
    async fn test_read_response_head_keeps_trailing_bytes() {
        let mut stream: &[u8] =
            b"HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\n\r\nhello";
        let (head, rest) = read_response_head(&mut stream).await.unwrap().unwrap();
        assert!(head.ends_with(b"\r\n\r\n"));
        assert_eq!(rest, b"hello");
        let (status, _) = parse_upgrade_response(&head).unwrap();
        assert_eq!(status, StatusCode::SWITCHING_PROTOCOLS);
    }

    #[tokio::test]
    async fn test_read_response_head_across_reads() {
        let (mut client, mut server) = tokio::io::duplex(64);
        let writer = tokio::spawn(async move {
            let padding = format!("X-Padding: {}\r\n", "a".repeat(5000));
            server.write_all(b"HTTP/1.1 101 Switching Protocols\r\n").await.unwrap();
            server.write_all(padding.as_bytes()).await.unwrap();
            server.write_all(b"\r").await.unwrap();
            server.write_all(b"\n\r\nab").await.unwrap();
        });
        let (head, mut rest) = read_response_head(&mut client).await.unwrap().unwrap();
        writer.await.unwrap();
        client.read_to_end(&mut rest).await.unwrap();
        assert!(head.len() > 5000);
        assert!(head.ends_with(b"\r\n\r\n"));
        assert_eq!(rest, b"ab");
    }

    #[tokio::test]
    async fn test_read_response_head_eof() {
        let mut stream: &[u8] = b"HTTP/1.1 101 Switching";
        assert!(read_response_head(&mut stream).await.unwrap().is_none());
    }
}
