//! Application templates and their per-launch resolved form
//!
//! An [`ApplicationSpec`] is loaded from configuration and never mutated; every
//! launch produces its own [`ResolvedSpec`] through [`crate::resolver`].

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Mapping name used for the primary port of a spec
pub const DEFAULT_MAPPING: &str = "default";

/// Identity of the user a launch is performed for
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct UserContext {
    pub id: String,
    pub groups: Vec<String>,
}

impl UserContext {
    pub fn new(id: impl Into<String>, groups: Vec<String>) -> Self {
        Self {
            id: id.into(),
            groups,
        }
    }
}

/// Template describing how to launch one kind of application
#[derive(Debug, Clone, Deserialize)]
pub struct ApplicationSpec {
    /// Unique id, also used in the launch URL
    pub id: String,

    /// Human readable name
    pub display_name: Option<String>,

    /// Container image reference
    pub image: String,

    /// Entrypoint override, either a shell-style string or a list
    pub command: Option<CommandLine>,

    /// Arguments passed to the command
    #[serde(default)]
    pub args: Vec<String>,

    /// Environment variables (literal, secret/config reference, or unset)
    #[serde(default)]
    pub env: BTreeMap<String, EnvValue>,

    /// Volumes, mounted in declaration order
    #[serde(default)]
    pub volumes: Vec<Volume>,

    /// Resource requests and limits
    #[serde(default)]
    pub resources: ResourceSpec,

    /// Run the container privileged
    #[serde(default)]
    pub privileged: bool,

    /// Port the application listens on
    pub port: u16,

    /// Additional named ports, each exposed under its own route
    #[serde(default)]
    pub port_mappings: Vec<PortMapping>,

    /// Docker/Swarm network to attach to
    pub network: Option<String>,

    /// Extra labels put on the workload
    #[serde(default)]
    pub labels: BTreeMap<String, String>,

    /// Launch parameters a caller may supply
    #[serde(default)]
    pub parameters: Vec<ParameterSpec>,

    /// Kubernetes-only settings
    #[serde(default)]
    pub kubernetes: KubernetesSpec,

    /// Who may launch this spec (empty lists allow everyone)
    #[serde(default)]
    pub access: AccessSpec,
}

impl ApplicationSpec {
    /// Minimal spec, mostly useful for tests and programmatic setups
    pub fn new(id: &str, image: &str, port: u16) -> Self {
        Self {
            id: id.to_string(),
            display_name: None,
            image: image.to_string(),
            command: None,
            args: Vec::new(),
            env: BTreeMap::new(),
            volumes: Vec::new(),
            resources: ResourceSpec::default(),
            privileged: false,
            port,
            port_mappings: Vec::new(),
            network: None,
            labels: BTreeMap::new(),
            parameters: Vec::new(),
            kubernetes: KubernetesSpec::default(),
            access: AccessSpec::default(),
        }
    }

    /// All exposed ports, the primary one first under [`DEFAULT_MAPPING`]
    pub fn all_ports(&self) -> Vec<PortMapping> {
        let mut ports = vec![PortMapping {
            name: DEFAULT_MAPPING.to_string(),
            port: self.port,
        }];
        ports.extend(self.port_mappings.iter().cloned());
        ports
    }

    /// Validate the template
    pub fn validate(&self) -> Result<(), String> {
        if self.id.is_empty() {
            return Err("spec 'id' must not be empty".to_string());
        }
        if !self
            .id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(format!(
                "Spec '{}': id may only contain alphanumerics, '-' and '_'",
                self.id
            ));
        }
        if self.image.is_empty() {
            return Err(format!("Spec '{}': 'image' must not be empty", self.id));
        }
        if self.port == 0 {
            return Err(format!("Spec '{}': 'port' must be greater than 0", self.id));
        }
        let mut names = std::collections::HashSet::new();
        for mapping in self.all_ports() {
            if mapping.port == 0 {
                return Err(format!(
                    "Spec '{}': port mapping '{}' must be greater than 0",
                    self.id, mapping.name
                ));
            }
            if mapping.name.is_empty() || mapping.name.contains('/') {
                return Err(format!(
                    "Spec '{}': invalid port mapping name '{}'",
                    self.id, mapping.name
                ));
            }
            if !names.insert(mapping.name.clone()) {
                return Err(format!(
                    "Spec '{}': duplicate port mapping '{}'",
                    self.id, mapping.name
                ));
            }
        }
        if let Some(ref command) = self.command {
            command
                .to_argv()
                .map_err(|e| format!("Spec '{}': {}", self.id, e))?;
        }
        for parameter in &self.parameters {
            if let Some(ref default) = parameter.default {
                if !parameter.accepts(default) {
                    return Err(format!(
                        "Spec '{}': default '{}' of parameter '{}' is not an allowed value",
                        self.id, default, parameter.name
                    ));
                }
            }
        }
        Ok(())
    }
}

/// Command line as written in configuration
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum CommandLine {
    /// Split like a shell would (`"python -m http.server"`)
    Shell(String),
    /// Already split
    Argv(Vec<String>),
}

impl CommandLine {
    pub fn to_argv(&self) -> Result<Vec<String>, String> {
        match self {
            CommandLine::Shell(line) => shell_words::split(line)
                .map_err(|e| format!("invalid command '{}': {}", line, e)),
            CommandLine::Argv(argv) => Ok(argv.clone()),
        }
    }
}

/// Value of an environment variable
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawEnvValue")]
pub enum EnvValue {
    Literal(String),
    /// Key of a secret (`name/key`)
    SecretKey { name: String, key: String },
    /// Key of a config map (`name/key`)
    ConfigMapKey { name: String, key: String },
    /// Declared without a value
    Unset,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawEnvValue {
    Literal(String),
    Source {
        secret_ref: Option<String>,
        config_map_ref: Option<String>,
    },
}

impl TryFrom<RawEnvValue> for EnvValue {
    type Error = String;

    fn try_from(raw: RawEnvValue) -> Result<Self, Self::Error> {
        match raw {
            RawEnvValue::Literal(value) => Ok(EnvValue::Literal(value)),
            RawEnvValue::Source {
                secret_ref: Some(_),
                config_map_ref: Some(_),
            } => Err("env value cannot reference both a secret and a config map".to_string()),
            RawEnvValue::Source {
                secret_ref: Some(reference),
                config_map_ref: None,
            } => {
                let (name, key) = split_key_ref(&reference)?;
                Ok(EnvValue::SecretKey { name, key })
            }
            RawEnvValue::Source {
                secret_ref: None,
                config_map_ref: Some(reference),
            } => {
                let (name, key) = split_key_ref(&reference)?;
                Ok(EnvValue::ConfigMapKey { name, key })
            }
            RawEnvValue::Source {
                secret_ref: None,
                config_map_ref: None,
            } => Ok(EnvValue::Unset),
        }
    }
}

fn split_key_ref(reference: &str) -> Result<(String, String), String> {
    match reference.split_once('/') {
        Some((name, key)) if !name.is_empty() && !key.is_empty() => {
            Ok((name.to_string(), key.to_string()))
        }
        _ => Err(format!(
            "invalid key reference '{}', expected 'name/key'",
            reference
        )),
    }
}

/// Where a volume's data comes from
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum VolumeSource {
    /// Directory on the node/host
    HostPath(String),
    /// Persistent volume claim (Kubernetes) or named volume (Docker)
    Claim(String),
}

/// A volume mounted into the primary container
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawVolume")]
pub struct Volume {
    pub source: VolumeSource,
    pub mount_path: String,
    pub read_only: bool,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawVolume {
    /// `"src:dst"` or `"src:dst:ro"`
    Short(String),
    Full {
        host_path: Option<String>,
        claim: Option<String>,
        mount_path: String,
        #[serde(default)]
        read_only: bool,
    },
}

impl TryFrom<RawVolume> for Volume {
    type Error = String;

    fn try_from(raw: RawVolume) -> Result<Self, Self::Error> {
        match raw {
            RawVolume::Short(short) => Volume::parse_short(&short),
            RawVolume::Full {
                host_path,
                claim,
                mount_path,
                read_only,
            } => {
                let source = match (host_path, claim) {
                    (Some(path), None) => VolumeSource::HostPath(path),
                    (None, Some(claim)) => VolumeSource::Claim(claim),
                    _ => {
                        return Err(format!(
                            "volume for '{}' needs exactly one of 'host_path' or 'claim'",
                            mount_path
                        ))
                    }
                };
                Ok(Volume {
                    source,
                    mount_path,
                    read_only,
                })
            }
        }
    }
}

impl Volume {
    pub fn host_path(path: &str, mount_path: &str) -> Self {
        Self {
            source: VolumeSource::HostPath(path.to_string()),
            mount_path: mount_path.to_string(),
            read_only: false,
        }
    }

    /// Parse the docker-like shorthand. Sources starting with `/` are host
    /// paths, anything else names a claim.
    pub fn parse_short(short: &str) -> Result<Self, String> {
        let parts: Vec<&str> = short.split(':').collect();
        let (source, mount_path, read_only) = match parts.as_slice() {
            [source, target] => (*source, *target, false),
            [source, target, "ro"] => (*source, *target, true),
            [source, target, "rw"] => (*source, *target, false),
            _ => return Err(format!("invalid volume '{}', expected 'src:dst[:ro]'", short)),
        };
        if source.is_empty() || mount_path.is_empty() {
            return Err(format!("invalid volume '{}'", short));
        }
        let source = if source.starts_with('/') {
            VolumeSource::HostPath(source.to_string())
        } else {
            VolumeSource::Claim(source.to_string())
        };
        Ok(Volume {
            source,
            mount_path: mount_path.to_string(),
            read_only,
        })
    }
}

/// CPU/memory requests and limits, in orchestrator notation (`"500m"`, `"1Gi"`)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceSpec {
    pub cpu_request: Option<String>,
    pub cpu_limit: Option<String>,
    pub memory_request: Option<String>,
    pub memory_limit: Option<String>,
}

/// A named port exposed by the application
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortMapping {
    pub name: String,
    pub port: u16,
}

/// A launch parameter the caller may supply
#[derive(Debug, Clone, Deserialize)]
pub struct ParameterSpec {
    pub name: String,
    pub default: Option<String>,
    /// Accepted values; empty means anything goes
    #[serde(default)]
    pub allowed: Vec<String>,
}

impl ParameterSpec {
    pub fn accepts(&self, value: &str) -> bool {
        self.allowed.is_empty() || self.allowed.iter().any(|v| v == value)
    }
}

/// Kubernetes-specific additions, parsed from YAML at load time
#[derive(Debug, Clone, Default, Deserialize)]
pub struct KubernetesSpec {
    /// Partial Pod merged over the generated one
    pub pod_patches: Option<YamlDocument>,
    /// Extra resources created next to the pod
    #[serde(default)]
    pub additional_manifests: Vec<YamlDocuments>,
}

impl KubernetesSpec {
    /// All additional manifests, flattened across multi-document strings
    pub fn manifests(&self) -> impl Iterator<Item = &Value> {
        self.additional_manifests.iter().flat_map(|docs| docs.0.iter())
    }
}

/// A single YAML document held as a generic tree
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(try_from = "String")]
pub struct YamlDocument(pub Value);

impl TryFrom<String> for YamlDocument {
    type Error = String;

    fn try_from(source: String) -> Result<Self, Self::Error> {
        let value: Value =
            serde_yaml::from_str(&source).map_err(|e| format!("invalid YAML: {}", e))?;
        if !value.is_object() {
            return Err("YAML fragment must be a mapping".to_string());
        }
        Ok(YamlDocument(value))
    }
}

/// One or more YAML documents separated by `---`
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(try_from = "String")]
pub struct YamlDocuments(pub Vec<Value>);

impl TryFrom<String> for YamlDocuments {
    type Error = String;

    fn try_from(source: String) -> Result<Self, Self::Error> {
        let mut documents = Vec::new();
        for document in serde_yaml::Deserializer::from_str(&source) {
            let value = Value::deserialize(document).map_err(|e| format!("invalid YAML: {}", e))?;
            match value {
                Value::Null => continue,
                Value::Object(_) => {
                    let name = value.pointer("/metadata/name").and_then(Value::as_str);
                    if value.get("kind").and_then(Value::as_str).is_none()
                        || value.get("apiVersion").and_then(Value::as_str).is_none()
                        || name.is_none()
                    {
                        return Err(
                            "manifest needs 'apiVersion', 'kind' and 'metadata.name'".to_string()
                        );
                    }
                    documents.push(value);
                }
                _ => return Err("manifest must be a mapping".to_string()),
            }
        }
        Ok(YamlDocuments(documents))
    }
}

/// Users and groups allowed to launch a spec
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AccessSpec {
    #[serde(default)]
    pub users: Vec<String>,
    #[serde(default)]
    pub groups: Vec<String>,
}

impl AccessSpec {
    pub fn allows(&self, user: &UserContext) -> bool {
        if self.users.is_empty() && self.groups.is_empty() {
            return true;
        }
        if self.users.iter().any(|u| u == &user.id) {
            return true;
        }
        self.groups
            .iter()
            .any(|g| user.groups.iter().any(|ug| ug.eq_ignore_ascii_case(g)))
    }
}

/// A template with every placeholder substituted, for a single launch
#[derive(Debug, Clone)]
pub struct ResolvedSpec {
    pub spec_id: String,
    pub instance_id: String,
    pub user_id: String,
    pub user_groups: Vec<String>,
    pub image: String,
    pub command: Vec<String>,
    pub args: Vec<String>,
    /// Ordered by name, injected variables included
    pub env: Vec<(String, EnvValue)>,
    pub volumes: Vec<Volume>,
    pub resources: ResourceSpec,
    pub privileged: bool,
    pub ports: Vec<PortMapping>,
    pub network: Option<String>,
    pub labels: BTreeMap<String, String>,
    pub pod_patch: Option<Value>,
    pub manifests: Vec<Value>,
    pub parameters: BTreeMap<String, String>,
}
