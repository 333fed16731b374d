//! Container backends
//!
//! Every orchestrator is reached through [`BackendDriver`]. The concrete
//! driver is chosen once at startup from `[backend]` in the configuration.

pub mod docker;
pub mod kubernetes;
pub mod swarm;

use crate::config::{BackendConfig, BackendType};
use crate::registry::Instance;
use crate::spec::ResolvedSpec;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::info;

pub use kubernetes::api::KubeError;

/// Label/annotation carrying the owning instance id
pub const LABEL_INSTANCE_ID: &str = "gantry.instance-id";
/// Label/annotation carrying the owning user id
pub const LABEL_USER_ID: &str = "gantry.user-id";
/// Label/annotation carrying the spec id
pub const LABEL_SPEC_ID: &str = "gantry.spec-id";
/// Label carrying the container id used in resource names
pub const LABEL_CONTAINER_ID: &str = "gantry.container-id";
/// Label/annotation listing exposed ports as `name=port,...`
pub const LABEL_PORTS: &str = "gantry.ports";

/// Timeout for a single readiness probe
const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// Errors raised by a backend driver
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("docker: {0}")]
    Docker(#[from] bollard::errors::Error),

    #[error("kubernetes: {0}")]
    Kube(#[from] KubeError),

    /// The workload uses something this backend cannot express
    #[error("not supported by the {backend} backend: {message}")]
    Unsupported {
        backend: &'static str,
        message: String,
    },

    #[error("invalid workload: {0}")]
    Invalid(String),

    /// The workload terminated or was lost while starting
    #[error("workload failed: {0}")]
    Failed(String),
}

/// One unit of compute belonging to an instance
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ContainerRecord {
    /// Id used in the deterministic resource names
    pub id: String,
    /// Port per mapping name
    pub ports: BTreeMap<String, u16>,
    /// Reachable URL per mapping name, filled once ready
    pub targets: BTreeMap<String, String>,
    pub ready: bool,
    /// Backend specific values (namespace, teardown list, ...)
    pub parameters: BTreeMap<String, serde_json::Value>,
}

impl ContainerRecord {
    pub fn new(id: impl Into<String>, ports: BTreeMap<String, u16>) -> Self {
        Self {
            id: id.into(),
            ports,
            ..Default::default()
        }
    }

    pub fn parameter_str(&self, key: &str) -> Option<&str> {
        self.parameters.get(key).and_then(|v| v.as_str())
    }
}

/// A workload found in the backend at startup
#[derive(Debug, Clone)]
pub struct RecoveredInstance {
    pub instance_id: String,
    pub user_id: String,
    pub spec_id: String,
    pub containers: Vec<ContainerRecord>,
    pub created_at: Option<DateTime<Utc>>,
}

/// Capability interface implemented once per orchestrator
#[async_trait]
pub trait BackendDriver: Send + Sync {
    /// Short name used in logs
    fn kind(&self) -> &'static str;

    /// Create the workload for `spec`. On failure nothing created by this
    /// call is left behind.
    async fn provision(&self, spec: &ResolvedSpec) -> Result<Vec<ContainerRecord>, BackendError>;

    /// Tear down everything belonging to `instance`. Resources that are
    /// already gone count as success, so calling this twice is harmless.
    async fn deprovision(&self, instance: &Instance) -> Result<(), BackendError>;

    /// Check readiness; when ready the record's targets are filled in
    async fn is_ready(&self, container: &mut ContainerRecord) -> Result<bool, BackendError>;

    /// List workloads left by a previous run
    async fn recover(&self) -> Result<Vec<RecoveredInstance>, BackendError> {
        Ok(Vec::new())
    }
}

/// Create the driver selected in the configuration
pub async fn create_driver(config: &BackendConfig) -> anyhow::Result<Arc<dyn BackendDriver>> {
    let driver: Arc<dyn BackendDriver> = match config.backend_type {
        BackendType::Docker => Arc::new(docker::DockerDriver::new(config.docker.clone()).await?),
        BackendType::Swarm => Arc::new(swarm::SwarmDriver::new(config.swarm.clone()).await?),
        BackendType::Kubernetes => {
            let api = kubernetes::api::HttpKubeApi::new(&config.kubernetes)?;
            Arc::new(kubernetes::KubernetesDriver::new(
                Arc::new(api),
                config.kubernetes.clone(),
            ))
        }
    };
    info!(backend = driver.kind(), "Container backend initialized");
    Ok(driver)
}

/// Encode ports as `name=port,...` for labels
pub(crate) fn encode_ports(ports: &BTreeMap<String, u16>) -> String {
    ports
        .iter()
        .map(|(name, port)| format!("{}={}", name, port))
        .collect::<Vec<_>>()
        .join(",")
}

/// Inverse of [`encode_ports`]; malformed entries are skipped
pub(crate) fn decode_ports(encoded: &str) -> BTreeMap<String, u16> {
    encoded
        .split(',')
        .filter_map(|entry| {
            let (name, port) = entry.split_once('=')?;
            Some((name.to_string(), port.parse().ok()?))
        })
        .collect()
}

/// Probe an HTTP target (`http://host:port`). Any response below 500 counts
/// as ready; connection failures and timeouts do not.
pub async fn probe_http(target: &str) -> bool {
    let host_port = target
        .strip_prefix("http://")
        .unwrap_or(target)
        .trim_end_matches('/');

    let mut stream =
        match tokio::time::timeout(PROBE_TIMEOUT, tokio::net::TcpStream::connect(host_port)).await
        {
            Ok(Ok(s)) => s,
            Ok(Err(_)) | Err(_) => return false,
        };

    let request = format!(
        "GET / HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n",
        host_port
    );
    if stream.write_all(request.as_bytes()).await.is_err() {
        return false;
    }

    let status_line = tokio::time::timeout(PROBE_TIMEOUT, async {
        let mut reader = BufReader::new(stream);
        let mut line = String::new();
        reader.read_line(&mut line).await?;
        Ok::<_, std::io::Error>(line)
    })
    .await;

    match status_line {
        // Format: "HTTP/1.1 200 OK\r\n"
        Ok(Ok(line)) => line
            .split_whitespace()
            .nth(1)
            .and_then(|code| code.parse::<u16>().ok())
            .map(|code| code < 500)
            .unwrap_or(false),
        _ => false,
    }
}

/// Parse a memory quantity ("512m", "1g", "1Gi", "256Mi") to bytes
pub(crate) fn parse_memory_limit(limit: &str) -> Result<i64, BackendError> {
    let lower = limit.trim().to_lowercase();
    let unit_start = lower
        .find(|c: char| c.is_ascii_alphabetic())
        .unwrap_or(lower.len());
    let (num_str, unit) = lower.split_at(unit_start);
    let multiplier: i64 = match unit {
        "" | "b" => 1,
        "k" | "kb" | "ki" => 1024,
        "m" | "mb" | "mi" => 1024 * 1024,
        "g" | "gb" | "gi" => 1024 * 1024 * 1024,
        _ => return Err(BackendError::Invalid(format!("invalid memory limit: {}", limit))),
    };

    let num: f64 = num_str
        .parse()
        .map_err(|_| BackendError::Invalid(format!("invalid memory limit: {}", limit)))?;

    Ok((num * multiplier as f64) as i64)
}

/// Parse a CPU quantity ("0.5", "2", "500m") to nano CPUs
pub(crate) fn parse_nano_cpus(cpus: &str) -> Result<i64, BackendError> {
    let cpus = cpus.trim();
    let cores: f64 = match cpus.strip_suffix('m') {
        Some(millis) => millis.parse::<f64>().map(|m| m / 1000.0),
        None => cpus.parse::<f64>(),
    }
    .map_err(|_| BackendError::Invalid(format!("invalid CPU limit: {}", cpus)))?;

    Ok((cores * 1_000_000_000.0) as i64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_memory_limit() {
        assert_eq!(parse_memory_limit("512m").unwrap(), 512 * 1024 * 1024);
        assert_eq!(parse_memory_limit("1g").unwrap(), 1024 * 1024 * 1024);
        assert_eq!(parse_memory_limit("1G").unwrap(), 1024 * 1024 * 1024);
        assert_eq!(parse_memory_limit("1Gi").unwrap(), 1024 * 1024 * 1024);
        assert_eq!(parse_memory_limit("256Mi").unwrap(), 256 * 1024 * 1024);
        assert_eq!(parse_memory_limit("1024k").unwrap(), 1024 * 1024);
        assert_eq!(parse_memory_limit("1048576").unwrap(), 1048576);
        assert!(parse_memory_limit("invalid").is_err());
        assert!(parse_memory_limit("12x").is_err());
    }

    #[test]
    fn test_parse_nano_cpus() {
        assert_eq!(parse_nano_cpus("2").unwrap(), 2_000_000_000);
        assert_eq!(parse_nano_cpus("0.5").unwrap(), 500_000_000);
        assert_eq!(parse_nano_cpus("250m").unwrap(), 250_000_000);
        assert!(parse_nano_cpus("lots").is_err());
    }

    #[test]
    fn test_port_labels() {
        let mut ports = BTreeMap::new();
        ports.insert("default".to_string(), 8080);
        ports.insert("shiny".to_string(), 3838);
        let encoded = encode_ports(&ports);
        assert_eq!(encoded, "default=8080,shiny=3838");
        assert_eq!(decode_ports(&encoded), ports);
        assert_eq!(decode_ports("bad,default=x,ok=1").len(), 1);
    }

    #[tokio::test]
    async fn test_probe_http() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            if let Ok((mut socket, _)) = listener.accept().await {
                let mut buf = [0u8; 1024];
                let _ = tokio::io::AsyncReadExt::read(&mut socket, &mut buf).await;
                let _ = socket
                    .write_all(b"HTTP/1.1 302 Found\r\nContent-Length: 0\r\n\r\n")
                    .await;
            }
        });

        assert!(probe_http(&format!("http://{}", addr)).await);

        let closed = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let closed_addr = closed.local_addr().unwrap();
        drop(closed);
        assert!(!probe_http(&format!("http://{}", closed_addr)).await);
    }
}
