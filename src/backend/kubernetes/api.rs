//! Minimal Kubernetes REST client over generic JSON trees

use crate::config::KubernetesConfig;
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

const SERVICE_ACCOUNT_DIR: &str = "/var/run/secrets/kubernetes.io/serviceaccount";

/// Kinds that live outside any namespace
const CLUSTER_SCOPED_KINDS: &[&str] = &[
    "Namespace",
    "Node",
    "PersistentVolume",
    "ClusterRole",
    "ClusterRoleBinding",
    "StorageClass",
    "CustomResourceDefinition",
    "PriorityClass",
    "IngressClass",
];

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum KubeError {
    #[error("{0} not found")]
    NotFound(String),

    #[error("{0} already exists")]
    Conflict(String),

    /// Worth retrying: timeouts, throttling, server errors
    #[error("transient API failure: {0}")]
    Transient(String),

    #[error("API server returned {status}: {message}")]
    Api { status: u16, message: String },

    #[error("invalid resource: {0}")]
    Invalid(String),
}

impl KubeError {
    pub fn is_transient(&self) -> bool {
        matches!(self, KubeError::Transient(_))
    }
}

/// Identifies a single object on the API server
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceRef {
    pub api_version: String,
    pub kind: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

impl ResourceRef {
    pub fn new(api_version: &str, kind: &str, name: &str, namespace: Option<&str>) -> Self {
        Self {
            api_version: api_version.to_string(),
            kind: kind.to_string(),
            name: name.to_string(),
            namespace: namespace.map(str::to_string),
        }
    }

    pub fn pod(name: &str, namespace: &str) -> Self {
        Self::new("v1", "Pod", name, Some(namespace))
    }

    pub fn service(name: &str, namespace: &str) -> Self {
        Self::new("v1", "Service", name, Some(namespace))
    }

    /// Read apiVersion, kind, name and namespace from a manifest
    pub fn from_manifest(manifest: &Value) -> Result<Self, KubeError> {
        let field = |pointer: &str| {
            manifest
                .pointer(pointer)
                .and_then(Value::as_str)
                .filter(|s| !s.is_empty())
        };
        let api_version = field("/apiVersion")
            .ok_or_else(|| KubeError::Invalid("manifest without apiVersion".to_string()))?;
        let kind =
            field("/kind").ok_or_else(|| KubeError::Invalid("manifest without kind".to_string()))?;
        let name = field("/metadata/name")
            .ok_or_else(|| KubeError::Invalid(format!("{} without metadata.name", kind)))?;
        Ok(Self::new(
            api_version,
            kind,
            name,
            field("/metadata/namespace"),
        ))
    }

    pub fn is_cluster_scoped(&self) -> bool {
        is_cluster_scoped(&self.kind)
    }

    /// Collection URL path, e.g. `/api/v1/namespaces/ns/pods`
    pub fn collection_path(&self) -> String {
        let prefix = if self.api_version.contains('/') {
            format!("/apis/{}", self.api_version)
        } else {
            format!("/api/{}", self.api_version)
        };
        match self.namespace {
            Some(ref ns) if !self.is_cluster_scoped() => {
                format!("{}/namespaces/{}/{}", prefix, ns, plural(&self.kind))
            }
            _ => format!("{}/{}", prefix, plural(&self.kind)),
        }
    }

    pub fn path(&self) -> String {
        format!("{}/{}", self.collection_path(), self.name)
    }
}

impl std::fmt::Display for ResourceRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.namespace {
            Some(ref ns) => write!(f, "{} {}/{}", self.kind, ns, self.name),
            None => write!(f, "{} {}", self.kind, self.name),
        }
    }
}

pub fn is_cluster_scoped(kind: &str) -> bool {
    CLUSTER_SCOPED_KINDS.contains(&kind)
}

/// Resource name in URLs (`Pod` → `pods`, `NetworkPolicy` → `networkpolicies`)
fn plural(kind: &str) -> String {
    let lower = kind.to_lowercase();
    if lower == "endpoints" {
        lower
    } else if lower.ends_with('s') || lower.ends_with('x') || lower.ends_with("ch") {
        format!("{}es", lower)
    } else if let Some(stem) = lower.strip_suffix('y') {
        if stem.ends_with(['a', 'e', 'i', 'o', 'u']) {
            format!("{}s", lower)
        } else {
            format!("{}ies", stem)
        }
    } else {
        format!("{}s", lower)
    }
}

/// Operations the Kubernetes driver needs from the API server
#[async_trait]
pub trait KubeApi: Send + Sync {
    /// Create an object, returning the server's view of it
    async fn create(&self, resource: &ResourceRef, manifest: &Value) -> Result<Value, KubeError>;

    /// Fetch an object; `None` when it does not exist
    async fn get(&self, resource: &ResourceRef) -> Result<Option<Value>, KubeError>;

    /// Delete an object; `false` when it was already gone
    async fn delete(&self, resource: &ResourceRef) -> Result<bool, KubeError>;

    /// Pods in all namespaces matching a label selector
    async fn list_pods(&self, label_selector: &str) -> Result<Vec<Value>, KubeError>;
}

enum Token {
    None,
    Static(String),
    /// Re-read on every request so rotated tokens are picked up
    File(PathBuf),
}

/// [`KubeApi`] over HTTPS with `reqwest`
pub struct HttpKubeApi {
    client: reqwest::Client,
    base_url: String,
    token: Token,
}

impl HttpKubeApi {
    pub fn new(config: &KubernetesConfig) -> anyhow::Result<Self> {
        let service_account = PathBuf::from(SERVICE_ACCOUNT_DIR);

        let token = if let Some(ref token) = config.token {
            Token::Static(token.clone())
        } else if let Some(ref file) = config.token_file {
            Token::File(PathBuf::from(file))
        } else if service_account.join("token").exists() {
            Token::File(service_account.join("token"))
        } else {
            Token::None
        };

        let mut builder = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.api_timeout_secs))
            .danger_accept_invalid_certs(config.insecure_skip_tls_verify);

        let ca_file = config
            .ca_cert_file
            .as_ref()
            .map(PathBuf::from)
            .or_else(|| Some(service_account.join("ca.crt")).filter(|p| p.exists()));
        if let Some(ca_file) = ca_file {
            let pem = std::fs::read(&ca_file).map_err(|e| {
                anyhow::anyhow!("Failed to read CA certificate '{}': {}", ca_file.display(), e)
            })?;
            builder = builder.add_root_certificate(reqwest::Certificate::from_pem(&pem)?);
        }

        Ok(Self {
            client: builder.build()?,
            base_url: config.api_url.trim_end_matches('/').to_string(),
            token,
        })
    }

    fn request(
        &self,
        method: reqwest::Method,
        path: &str,
    ) -> Result<reqwest::RequestBuilder, KubeError> {
        let builder = self
            .client
            .request(method, format!("{}{}", self.base_url, path))
            .header("Accept", "application/json");
        Ok(match self.token {
            Token::None => builder,
            Token::Static(ref token) => builder.bearer_auth(token),
            Token::File(ref path) => {
                let token = std::fs::read_to_string(path).map_err(|e| {
                    KubeError::Invalid(format!("cannot read token '{}': {}", path.display(), e))
                })?;
                builder.bearer_auth(token.trim())
            }
        })
    }

    async fn send(
        &self,
        builder: reqwest::RequestBuilder,
        resource: &str,
    ) -> Result<Value, KubeError> {
        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() || e.is_connect() {
                KubeError::Transient(e.to_string())
            } else {
                KubeError::Api {
                    status: 0,
                    message: e.to_string(),
                }
            }
        })?;

        let status = response.status();
        let body: Value = response.json().await.unwrap_or(Value::Null);
        if status.is_success() {
            return Ok(body);
        }

        let message = body
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or_else(|| status.canonical_reason().unwrap_or("unknown error"))
            .to_string();
        Err(match status {
            StatusCode::NOT_FOUND => KubeError::NotFound(resource.to_string()),
            StatusCode::CONFLICT => KubeError::Conflict(resource.to_string()),
            StatusCode::TOO_MANY_REQUESTS => KubeError::Transient(message),
            s if s.is_server_error() => KubeError::Transient(message),
            s => KubeError::Api {
                status: s.as_u16(),
                message,
            },
        })
    }
}

#[async_trait]
impl KubeApi for HttpKubeApi {
    async fn create(&self, resource: &ResourceRef, manifest: &Value) -> Result<Value, KubeError> {
        debug!(resource = %resource, "Creating Kubernetes object");
        let builder = self
            .request(reqwest::Method::POST, &resource.collection_path())?
            .json(manifest);
        self.send(builder, &resource.to_string()).await
    }

    async fn get(&self, resource: &ResourceRef) -> Result<Option<Value>, KubeError> {
        let builder = self.request(reqwest::Method::GET, &resource.path())?;
        match self.send(builder, &resource.to_string()).await {
            Ok(value) => Ok(Some(value)),
            Err(KubeError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn delete(&self, resource: &ResourceRef) -> Result<bool, KubeError> {
        debug!(resource = %resource, "Deleting Kubernetes object");
        let builder = self
            .request(reqwest::Method::DELETE, &resource.path())?
            .json(&serde_json::json!({"propagationPolicy": "Background"}));
        match self.send(builder, &resource.to_string()).await {
            Ok(_) => Ok(true),
            Err(KubeError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn list_pods(&self, label_selector: &str) -> Result<Vec<Value>, KubeError> {
        let builder = self
            .request(reqwest::Method::GET, "/api/v1/pods")?
            .query(&[("labelSelector", label_selector)]);
        let list = self.send(builder, "pods").await?;
        Ok(match list.get("items") {
            Some(Value::Array(items)) => items.clone(),
            _ => Vec::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_paths() {
        let pod = ResourceRef::pod("gantry-pod-1", "users");
        assert_eq!(pod.path(), "/api/v1/namespaces/users/pods/gantry-pod-1");

        let policy = ResourceRef::new(
            "networking.k8s.io/v1",
            "NetworkPolicy",
            "deny",
            Some("users"),
        );
        assert_eq!(
            policy.collection_path(),
            "/apis/networking.k8s.io/v1/namespaces/users/networkpolicies"
        );

        let role = ResourceRef::new(
            "rbac.authorization.k8s.io/v1",
            "ClusterRole",
            "reader",
            Some("ignored"),
        );
        assert_eq!(
            role.path(),
            "/apis/rbac.authorization.k8s.io/v1/clusterroles/reader"
        );

        let ingress = ResourceRef::new("networking.k8s.io/v1", "Ingress", "web", Some("a"));
        assert!(ingress.collection_path().ends_with("/ingresses"));
        let endpoints = ResourceRef::new("v1", "Endpoints", "svc", Some("a"));
        assert!(endpoints.collection_path().ends_with("/endpoints"));
        let gateway = ResourceRef::new("x.io/v1", "Gateway", "g", Some("a"));
        assert!(gateway.collection_path().ends_with("/gateways"));
    }

    #[test]
    fn test_from_manifest() {
        let manifest = json!({
            "apiVersion": "v1",
            "kind": "Secret",
            "metadata": { "name": "creds", "namespace": "users" }
        });
        let resource = ResourceRef::from_manifest(&manifest).unwrap();
        assert_eq!(resource.namespace.as_deref(), Some("users"));
        assert_eq!(resource.to_string(), "Secret users/creds");

        let missing = json!({ "apiVersion": "v1", "kind": "Secret", "metadata": {} });
        assert!(matches!(
            ResourceRef::from_manifest(&missing),
            Err(KubeError::Invalid(_))
        ));
    }

    #[test]
    fn test_resource_ref_serialization() {
        let resource = ResourceRef::pod("p", "ns");
        let json = serde_json::to_value(&resource).unwrap();
        assert_eq!(json["apiVersion"], "v1");
        let back: ResourceRef = serde_json::from_value(json).unwrap();
        assert_eq!(back, resource);
    }
}
