//! End-to-end tests of the front server: control API, routing and upgrades

use async_trait::async_trait;
use gantry::api::ApiState;
use gantry::backend::{BackendDriver, BackendError, ContainerRecord};
use gantry::catalog::SpecCatalog;
use gantry::events::NullSink;
use gantry::lifecycle::{LifecycleOrchestrator, LifecycleSettings};
use gantry::mapping::MappingTable;
use gantry::pool::PoolConfig;
use gantry::proxy::ProxyServer;
use gantry::registry::{Instance, ProxyRegistry};
use gantry::spec::{ApplicationSpec, ResolvedSpec};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

const TOKEN: &str = "secret-token";

/// Every instance points at the same in-process echo backend
struct EchoDriver {
    target: String,
}

#[async_trait]
impl BackendDriver for EchoDriver {
    fn kind(&self) -> &'static str {
        "echo"
    }

    async fn provision(&self, spec: &ResolvedSpec) -> Result<Vec<ContainerRecord>, BackendError> {
        let ports: BTreeMap<String, u16> =
            spec.ports.iter().map(|p| (p.name.clone(), p.port)).collect();
        Ok(vec![ContainerRecord::new(spec.instance_id.clone(), ports)])
    }

    async fn deprovision(&self, _instance: &Instance) -> Result<(), BackendError> {
        Ok(())
    }

    async fn is_ready(&self, container: &mut ContainerRecord) -> Result<bool, BackendError> {
        container.targets = container
            .ports
            .keys()
            .map(|name| (name.clone(), self.target.clone()))
            .collect();
        container.ready = true;
        Ok(true)
    }
}

/// Raw HTTP/1.1 backend. Plain requests get a body describing what arrived;
/// upgrade requests get a 101 with a greeting in the same write, then an
/// echo of every byte.
async fn start_echo_backend() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(async move {
                let head = read_head(&mut stream).await;
                let request_line = head.lines().next().unwrap_or_default().to_string();
                let header = |name: &str| {
                    head.lines()
                        .filter_map(|l| l.split_once(':'))
                        .find(|(k, _)| k.trim().eq_ignore_ascii_case(name))
                        .map(|(_, v)| v.trim().to_string())
                        .unwrap_or_default()
                };

                if header("upgrade").eq_ignore_ascii_case("websocket") {
                    let _ = stream
                        .write_all(
                            b"HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\r\nhello",
                        )
                        .await;
                    let mut buf = [0u8; 1024];
                    while let Ok(n) = stream.read(&mut buf).await {
                        if n == 0 || stream.write_all(&buf[..n]).await.is_err() {
                            break;
                        }
                    }
                    return;
                }

                let body = format!(
                    "line={}\nprefix={}\nfor={}\nhost={}\n",
                    request_line,
                    header("x-forwarded-prefix"),
                    header("x-forwarded-for"),
                    header("host"),
                );
                let response = format!(
                    "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    body.len(),
                    body
                );
                let _ = stream.write_all(response.as_bytes()).await;
            });
        }
    });
    addr
}

async fn read_head(stream: &mut TcpStream) -> String {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        match stream.read(&mut byte).await {
            Ok(1) => head.push(byte[0]),
            _ => break,
        }
    }
    String::from_utf8_lossy(&head).to_string()
}

struct TestServer {
    addr: SocketAddr,
    lifecycle: Arc<LifecycleOrchestrator>,
    _shutdown: watch::Sender<bool>,
}

async fn start_server() -> TestServer {
    let backend = start_echo_backend().await;
    let lifecycle = Arc::new(LifecycleOrchestrator::new(
        Arc::new(EchoDriver {
            target: format!("http://{}", backend),
        }),
        Arc::new(ProxyRegistry::new()),
        Arc::new(MappingTable::new()),
        Arc::new(NullSink),
        LifecycleSettings::default(),
    ));
    let catalog = Arc::new(SpecCatalog::new(vec![ApplicationSpec::new(
        "echo", "echo:latest", 8080,
    )]));
    let api = Arc::new(ApiState::new(catalog, lifecycle.clone(), TOKEN.to_string()));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = ProxyServer::new(
        addr,
        api,
        shutdown_rx,
        PoolConfig::default(),
        Duration::from_secs(5),
    );
    tokio::spawn(async move {
        let _ = server.serve(listener).await;
    });

    TestServer {
        addr,
        lifecycle,
        _shutdown: shutdown_tx,
    }
}

/// Send a raw request and read the whole response
async fn send(addr: SocketAddr, request: String) -> String {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(request.as_bytes()).await.unwrap();
    let mut response = String::new();
    tokio::time::timeout(Duration::from_secs(5), stream.read_to_string(&mut response))
        .await
        .unwrap()
        .unwrap();
    response
}

async fn api_call(addr: SocketAddr, method: &str, path: &str, body: &str) -> String {
    send(
        addr,
        format!(
            "{} {} HTTP/1.1\r\nHost: localhost\r\nAuthorization: Bearer {}\r\nX-Gantry-User: jack\r\nX-Gantry-Groups: scientists\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            method,
            path,
            TOKEN,
            body.len(),
            body
        ),
    )
    .await
}

async fn http_get(addr: SocketAddr, path: &str) -> String {
    send(
        addr,
        format!(
            "GET {} HTTP/1.1\r\nHost: gantry.local\r\nConnection: close\r\n\r\n",
            path
        ),
    )
    .await
}

fn body_json(response: &str) -> serde_json::Value {
    let body = response.split("\r\n\r\n").nth(1).unwrap_or_default();
    serde_json::from_str(body).unwrap()
}

#[tokio::test]
async fn test_health_and_version_need_no_token() {
    let server = start_server().await;

    let response = http_get(server.addr, "/health").await;
    assert!(response.starts_with("HTTP/1.1 200"));
    assert!(response.ends_with("ok"));

    let response = http_get(server.addr, "/version").await;
    assert_eq!(body_json(&response)["name"], "gantry");
}

#[tokio::test]
async fn test_api_requires_token() {
    let server = start_server().await;

    let response = http_get(server.addr, "/api/specs").await;
    assert!(response.starts_with("HTTP/1.1 401"));
    assert!(response.contains("X-Proxy-Error: UNAUTHORIZED") || response.contains("x-proxy-error: UNAUTHORIZED"));

    let response = api_call(server.addr, "GET", "/api/specs", "").await;
    assert!(response.starts_with("HTTP/1.1 200"));
    assert_eq!(body_json(&response)["specs"][0]["id"], "echo");
}

#[tokio::test]
async fn test_start_proxy_and_stop() {
    let server = start_server().await;

    let response = api_call(server.addr, "POST", "/api/proxy/echo", "{}").await;
    assert!(response.starts_with("HTTP/1.1 201"), "{}", response);
    let instance = body_json(&response);
    let id = instance["id"].as_str().unwrap().to_string();
    assert_eq!(instance["state"], "up");
    assert_eq!(instance["routes"][0], format!("/endpoint/{}", id));

    let response = http_get(server.addr, &format!("/endpoint/{}/notebooks/a.ipynb?raw=1", id)).await;
    assert!(response.starts_with("HTTP/1.1 200"), "{}", response);
    assert!(response.contains("line=GET /notebooks/a.ipynb?raw=1 HTTP/1.1"));
    assert!(response.contains(&format!("prefix=/endpoint/{}", id)));
    assert!(response.contains("for=127.0.0.1"));

    let response = api_call(server.addr, "GET", "/api/proxy", "").await;
    assert_eq!(body_json(&response)["count"], 1);

    let response = api_call(server.addr, "DELETE", &format!("/api/proxy/{}", id), "").await;
    assert!(response.starts_with("HTTP/1.1 200"), "{}", response);
    assert!(server.lifecycle.registry().is_empty());

    let response = http_get(server.addr, &format!("/endpoint/{}/notebooks", id)).await;
    assert!(response.starts_with("HTTP/1.1 404"));
    assert!(response.contains("NO_ROUTE"));
}

#[tokio::test]
async fn test_api_errors() {
    let server = start_server().await;

    let response = api_call(server.addr, "POST", "/api/proxy/missing", "{}").await;
    assert!(response.starts_with("HTTP/1.1 404"));
    assert!(response.contains("UNKNOWN_SPEC"));

    let response = api_call(
        server.addr,
        "POST",
        "/api/proxy/echo",
        r#"{"parameters": {"size": "large"}}"#,
    )
    .await;
    assert!(response.starts_with("HTTP/1.1 400"));
    assert!(response.contains("SPEC_VALIDATION"));

    let response = api_call(server.addr, "POST", "/api/proxy/echo", "not json").await;
    assert!(response.starts_with("HTTP/1.1 400"));

    let response = api_call(server.addr, "DELETE", "/api/proxy/nope", "").await;
    assert!(response.starts_with("HTTP/1.1 404"));
    assert!(response.contains("INSTANCE_NOT_FOUND"));
}

#[tokio::test]
async fn test_websocket_upgrade_is_tunnelled() {
    let server = start_server().await;
    let response = api_call(server.addr, "POST", "/api/proxy/echo", "{}").await;
    let id = body_json(&response)["id"].as_str().unwrap().to_string();

    let mut stream = TcpStream::connect(server.addr).await.unwrap();
    let request = format!(
        "GET /endpoint/{}/ws HTTP/1.1\r\nHost: gantry.local\r\nConnection: Upgrade\r\nUpgrade: websocket\r\nSec-WebSocket-Version: 13\r\nSec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\r\n",
        id
    );
    stream.write_all(request.as_bytes()).await.unwrap();

    let head = read_head(&mut stream).await;
    assert!(head.starts_with("HTTP/1.1 101"), "{}", head);

    // Sent by the backend together with its 101 head
    let mut greeting = [0u8; 5];
    tokio::time::timeout(Duration::from_secs(5), stream.read_exact(&mut greeting))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&greeting, b"hello");

    stream.write_all(b"ping").await.unwrap();
    let mut buf = [0u8; 4];
    tokio::time::timeout(Duration::from_secs(5), stream.read_exact(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf, b"ping");
}
