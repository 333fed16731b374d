use crate::spec::ApplicationSpec;
use serde::Deserialize;
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

/// Global configuration for the control plane
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Front server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Instance lifecycle settings
    #[serde(default)]
    pub lifecycle: LifecycleConfig,

    /// Lifecycle event delivery
    #[serde(default)]
    pub events: EventsConfig,

    /// Container backend, selected once at startup
    #[serde(default)]
    pub backend: BackendConfig,

    /// Application templates users can launch
    #[serde(default)]
    pub specs: Vec<ApplicationSpec>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Listen port (default: 8080)
    #[serde(default = "default_listen_port")]
    pub port: u16,

    /// Bind address (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Bearer token protecting the control API.
    /// If not set, a random token is generated at startup and logged
    pub api_token: Option<String>,

    /// Maximum idle connections per instance target (default: 10)
    #[serde(default = "default_pool_max_idle_per_host")]
    pub pool_max_idle_per_host: usize,

    /// Idle connection timeout in seconds (default: 90)
    #[serde(default = "default_pool_idle_timeout")]
    pub pool_idle_timeout_secs: u64,

    /// Maximum time to wait for an instance to answer a proxied request
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Enable TLS (default: false). If true without cert/key, generates self-signed.
    #[serde(default)]
    pub tls: bool,

    /// Path to TLS certificate file (PEM format)
    pub tls_cert: Option<String>,

    /// Path to TLS private key file (PEM format)
    pub tls_key: Option<String>,
}

impl ServerConfig {
    pub fn tls_enabled(&self) -> bool {
        self.tls || self.has_tls_files()
    }

    pub fn has_tls_files(&self) -> bool {
        self.tls_cert.is_some() && self.tls_key.is_some()
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_listen_port(),
            bind: default_bind_address(),
            api_token: None,
            pool_max_idle_per_host: default_pool_max_idle_per_host(),
            pool_idle_timeout_secs: default_pool_idle_timeout(),
            request_timeout_secs: default_request_timeout(),
            tls: false,
            tls_cert: None,
            tls_key: None,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct LifecycleConfig {
    /// Maximum time an instance may take to become ready
    #[serde(default = "default_startup_timeout")]
    pub startup_timeout_secs: u64,

    /// Interval between readiness checks in milliseconds
    #[serde(default = "default_ready_poll_interval")]
    pub ready_poll_interval_ms: u64,

    /// Maximum time a stop waits for an in-flight start to settle
    #[serde(default = "default_stop_wait_timeout")]
    pub stop_wait_timeout_secs: u64,

    /// Path prefix under which instances are routed
    #[serde(default = "default_endpoint_prefix")]
    pub endpoint_prefix: String,

    /// Rebuild the registry from workloads already running in the backend
    #[serde(default = "default_true")]
    pub recover_running: bool,

    /// Stop every running instance on shutdown
    #[serde(default = "default_true")]
    pub stop_on_shutdown: bool,
}

impl LifecycleConfig {
    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.startup_timeout_secs)
    }

    pub fn ready_poll_interval(&self) -> Duration {
        Duration::from_millis(self.ready_poll_interval_ms)
    }

    pub fn stop_wait_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_wait_timeout_secs)
    }
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            startup_timeout_secs: default_startup_timeout(),
            ready_poll_interval_ms: default_ready_poll_interval(),
            stop_wait_timeout_secs: default_stop_wait_timeout(),
            endpoint_prefix: default_endpoint_prefix(),
            recover_running: true,
            stop_on_shutdown: true,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct EventsConfig {
    /// Capacity of the event queue; events are dropped when it is full
    #[serde(default = "default_event_queue_size")]
    pub queue_size: usize,

    /// Log every event through tracing
    #[serde(default = "default_true")]
    pub log: bool,

    /// POST every event as JSON to this URL
    pub webhook_url: Option<String>,

    /// Timeout for webhook delivery in seconds
    #[serde(default = "default_webhook_timeout")]
    pub webhook_timeout_secs: u64,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            queue_size: default_event_queue_size(),
            log: true,
            webhook_url: None,
            webhook_timeout_secs: default_webhook_timeout(),
        }
    }
}

/// Which orchestrator runs the instances
#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BackendType {
    /// Local Docker daemon (default)
    #[default]
    Docker,
    /// Docker Swarm services
    Swarm,
    /// Kubernetes pods
    Kubernetes,
}

/// Image pull policy for Docker backends
#[derive(Debug, Deserialize, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PullPolicy {
    /// Pull if image doesn't exist locally (default)
    #[default]
    #[serde(alias = "if-not-present")]
    IfNotPresent,
    /// Always pull before starting
    Always,
    /// Never pull, fail if image doesn't exist
    Never,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct BackendConfig {
    #[serde(default, rename = "type")]
    pub backend_type: BackendType,

    #[serde(default)]
    pub docker: DockerConfig,

    #[serde(default)]
    pub swarm: SwarmConfig,

    #[serde(default)]
    pub kubernetes: KubernetesConfig,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct DockerConfig {
    /// Docker host (e.g. "unix:///var/run/docker.sock"); auto-detected if unset
    pub host: Option<String>,

    /// Network containers are attached to
    pub network: Option<String>,

    /// Reach containers on their network address instead of a published port
    #[serde(default)]
    pub internal_networking: bool,

    #[serde(default)]
    pub pull_policy: PullPolicy,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SwarmConfig {
    /// Docker host of a swarm manager; auto-detected if unset
    pub host: Option<String>,

    /// Address on which published service ports are reachable
    #[serde(default = "default_published_host")]
    pub published_host: String,

    /// Overlay network services are attached to
    pub network: Option<String>,

    /// Reach services by DNS name on the overlay network
    #[serde(default)]
    pub internal_networking: bool,
}

impl Default for SwarmConfig {
    fn default() -> Self {
        Self {
            host: None,
            published_host: default_published_host(),
            network: None,
            internal_networking: false,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct KubernetesConfig {
    /// API server URL (default: in-cluster service address)
    #[serde(default = "default_kube_api_url")]
    pub api_url: String,

    /// Bearer token
    pub token: Option<String>,

    /// File holding the bearer token (default: service account token)
    pub token_file: Option<String>,

    /// CA bundle used to verify the API server
    pub ca_cert_file: Option<String>,

    #[serde(default)]
    pub insecure_skip_tls_verify: bool,

    /// Namespace for pods unless a patch overrides it
    #[serde(default = "default_namespace")]
    pub namespace: String,

    /// Route to pod IPs instead of node ports
    #[serde(default)]
    pub internal_networking: bool,

    /// Timeout for a single API call in seconds
    #[serde(default = "default_kube_api_timeout")]
    pub api_timeout_secs: u64,

    /// Attempts for transient API errors
    #[serde(default = "default_kube_retries")]
    pub retries: u32,
}

impl Default for KubernetesConfig {
    fn default() -> Self {
        Self {
            api_url: default_kube_api_url(),
            token: None,
            token_file: None,
            ca_cert_file: None,
            insecure_skip_tls_verify: false,
            namespace: default_namespace(),
            internal_networking: false,
            api_timeout_secs: default_kube_api_timeout(),
            retries: default_kube_retries(),
        }
    }
}

// Default value functions
fn default_listen_port() -> u16 {
    8080
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_pool_max_idle_per_host() -> usize {
    10
}

fn default_pool_idle_timeout() -> u64 {
    90
}

fn default_request_timeout() -> u64 {
    30
}

fn default_startup_timeout() -> u64 {
    60
}

fn default_ready_poll_interval() -> u64 {
    500
}

fn default_stop_wait_timeout() -> u64 {
    30
}

fn default_endpoint_prefix() -> String {
    "/endpoint".to_string()
}

fn default_event_queue_size() -> usize {
    1024
}

fn default_webhook_timeout() -> u64 {
    5
}

fn default_true() -> bool {
    true
}

fn default_published_host() -> String {
    "127.0.0.1".to_string()
}

fn default_kube_api_url() -> String {
    "https://kubernetes.default.svc".to_string()
}

fn default_namespace() -> String {
    "default".to_string()
}

fn default_kube_api_timeout() -> u64 {
    10
}

fn default_kube_retries() -> u32 {
    3
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        let mut ids = HashSet::new();
        for spec in &self.specs {
            if let Err(e) = spec.validate() {
                errors.push(e);
            }
            if !ids.insert(spec.id.as_str()) {
                errors.push(format!("Duplicate spec id '{}'", spec.id));
            }
        }

        let prefix = &self.lifecycle.endpoint_prefix;
        if !prefix.starts_with('/') || prefix.trim_end_matches('/').is_empty() {
            errors.push(format!(
                "lifecycle.endpoint_prefix '{}' must start with '/' and not be the root",
                prefix
            ));
        }
        if prefix.starts_with("/api") || prefix == "/health" || prefix == "/version" {
            errors.push(format!(
                "lifecycle.endpoint_prefix '{}' collides with the control API",
                prefix
            ));
        }

        if self.lifecycle.ready_poll_interval_ms == 0 {
            errors.push("lifecycle.ready_poll_interval_ms must be greater than 0".to_string());
        }

        if self.events.queue_size == 0 {
            errors.push("events.queue_size must be greater than 0".to_string());
        }

        if self.server.tls_cert.is_some() != self.server.tls_key.is_some() {
            errors.push("server.tls_cert and server.tls_key must be set together".to_string());
        }

        if self.backend.backend_type == BackendType::Kubernetes
            && self.backend.kubernetes.namespace.is_empty()
        {
            errors.push("backend.kubernetes.namespace must not be empty".to_string());
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}
