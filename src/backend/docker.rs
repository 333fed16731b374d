//! Instances as containers on a single Docker daemon

use super::{
    decode_ports, encode_ports, parse_memory_limit, parse_nano_cpus, probe_http, BackendDriver,
    BackendError, ContainerRecord, RecoveredInstance, LABEL_CONTAINER_ID, LABEL_INSTANCE_ID,
    LABEL_PORTS, LABEL_SPEC_ID, LABEL_USER_ID,
};
use crate::config::{DockerConfig, PullPolicy};
use crate::registry::Instance;
use crate::spec::{EnvValue, ResolvedSpec, VolumeSource};
use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, ListContainersOptions,
    RemoveContainerOptions, StartContainerOptions, StopContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::models::{ContainerStateStatusEnum, HostConfig, PortBinding};
use bollard::Docker;
use chrono::{TimeZone, Utc};
use futures::StreamExt;
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, info, warn};

/// Seconds docker waits after SIGTERM before killing
const STOP_GRACE_SECS: i64 = 10;

pub fn container_name(container_id: &str) -> String {
    format!("gantry-{}", container_id)
}

/// Connect to a Docker daemon
///
/// Connection priority:
/// 1. Explicit host parameter
/// 2. DOCKER_HOST environment variable
/// 3. Common socket paths (platform-specific)
pub async fn connect(docker_host: Option<&str>) -> anyhow::Result<Docker> {
    let client = if let Some(host) = docker_host {
        connect_to_host(host).map_err(|e| {
            anyhow::anyhow!(
                "Failed to connect to Docker at '{}': {}. \
                 Ensure Docker is running and the socket path is correct.",
                host,
                e
            )
        })?
    } else if let Ok(host) = std::env::var("DOCKER_HOST") {
        connect_to_host(&host).map_err(|e| {
            anyhow::anyhow!(
                "Failed to connect to Docker via DOCKER_HOST='{}': {}",
                host,
                e
            )
        })?
    } else {
        connect_with_defaults().await?
    };

    client.ping().await.map_err(|e| {
        anyhow::anyhow!(
            "Docker daemon is not responding: {}. Ensure dockerd is running.",
            e
        )
    })?;

    debug!("Connected to Docker daemon");
    Ok(client)
}

fn connect_to_host(host: &str) -> anyhow::Result<Docker> {
    if let Some(socket_path) = host.strip_prefix("unix://") {
        Docker::connect_with_socket(socket_path, 120, bollard::API_DEFAULT_VERSION)
            .map_err(|e| anyhow::anyhow!("Cannot connect to Unix socket '{}': {}", socket_path, e))
    } else if host.starts_with("tcp://") || host.starts_with("http://") {
        Docker::connect_with_http(host, 120, bollard::API_DEFAULT_VERSION)
            .map_err(|e| anyhow::anyhow!("Cannot connect to TCP endpoint '{}': {}", host, e))
    } else {
        anyhow::bail!(
            "Invalid docker host format: '{}'. Expected 'unix:///path/to/socket' or 'tcp://host:port'",
            host
        )
    }
}

async fn connect_with_defaults() -> anyhow::Result<Docker> {
    let home = std::env::var("HOME").unwrap_or_default();
    let xdg_runtime = std::env::var("XDG_RUNTIME_DIR").unwrap_or_default();

    let socket_paths: Vec<(&str, String)> = vec![
        ("Linux default", "/var/run/docker.sock".to_string()),
        ("Docker Desktop", format!("{}/.docker/run/docker.sock", home)),
        ("Colima", format!("{}/.colima/default/docker.sock", home)),
        ("Podman", format!("{}/podman/podman.sock", xdg_runtime)),
    ];

    let mut tried = Vec::new();
    for (name, path) in &socket_paths {
        // Empty env vars produce paths like "/podman/podman.sock" or "//..."
        if path.contains("//") || !std::path::Path::new(path).exists() {
            continue;
        }
        debug!(path, name, "Found Docker socket");
        match Docker::connect_with_socket(path, 120, bollard::API_DEFAULT_VERSION) {
            Ok(client) if client.ping().await.is_ok() => return Ok(client),
            Ok(_) => tried.push(format!("{} ({}): daemon not responding", path, name)),
            Err(e) => tried.push(format!("{} ({}): {}", path, name, e)),
        }
    }

    Docker::connect_with_socket_defaults().map_err(|e| {
        let tried = if tried.is_empty() {
            "No Docker socket found at common locations".to_string()
        } else {
            format!("Tried:\n  - {}", tried.join("\n  - "))
        };
        anyhow::anyhow!(
            "Cannot connect to Docker daemon. {}\n\
             Set DOCKER_HOST or backend.docker.host.\n\
             Underlying error: {}",
            tried,
            e
        )
    })
}

/// Pull an image if the policy asks for it
pub async fn pull_image_if_needed(
    client: &Docker,
    image: &str,
    policy: &PullPolicy,
) -> Result<(), BackendError> {
    let should_pull = match policy {
        PullPolicy::Always => true,
        PullPolicy::Never => {
            if client.inspect_image(image).await.is_err() {
                return Err(BackendError::Invalid(format!(
                    "image '{}' not found locally and pull_policy is 'never'",
                    image
                )));
            }
            false
        }
        PullPolicy::IfNotPresent => match client.inspect_image(image).await {
            Ok(_) => {
                debug!(image, "Image exists locally, skipping pull");
                false
            }
            Err(_) => true,
        },
    };

    if should_pull {
        info!(image, "Pulling Docker image");
        let options = CreateImageOptions {
            from_image: image,
            ..Default::default()
        };

        let mut stream = client.create_image(Some(options), None, None);
        while let Some(result) = stream.next().await {
            let progress = result?;
            if let Some(status) = progress.status {
                debug!(image, status, "Pull progress");
            }
            if let Some(error) = progress.error {
                return Err(BackendError::Failed(format!(
                    "failed to pull image '{}': {}",
                    image, error
                )));
            }
        }
        info!(image, "Image pulled successfully");
    }

    Ok(())
}

/// Map resolved env entries to `KEY=value`, rejecting indirect references
pub(crate) fn literal_env(
    spec: &ResolvedSpec,
    backend: &'static str,
) -> Result<Vec<String>, BackendError> {
    let mut env = Vec::with_capacity(spec.env.len());
    for (name, value) in &spec.env {
        match value {
            EnvValue::Literal(v) => env.push(format!("{}={}", name, v)),
            EnvValue::Unset => {}
            EnvValue::SecretKey { .. } | EnvValue::ConfigMapKey { .. } => {
                return Err(BackendError::Unsupported {
                    backend,
                    message: format!(
                        "environment variable '{}' references a secret or config map",
                        name
                    ),
                })
            }
        }
    }
    Ok(env)
}

/// Labels identifying a workload as ours
pub(crate) fn ownership_labels(
    spec: &ResolvedSpec,
    container_id: &str,
    ports: &BTreeMap<String, u16>,
) -> HashMap<String, String> {
    let mut labels: HashMap<String, String> = spec
        .labels
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    labels.insert(LABEL_INSTANCE_ID.to_string(), spec.instance_id.clone());
    labels.insert(LABEL_USER_ID.to_string(), spec.user_id.clone());
    labels.insert(LABEL_SPEC_ID.to_string(), spec.spec_id.clone());
    labels.insert(LABEL_CONTAINER_ID.to_string(), container_id.to_string());
    labels.insert(LABEL_PORTS.to_string(), encode_ports(ports));
    labels
}

/// Runs each instance as one container on a Docker daemon
pub struct DockerDriver {
    client: Docker,
    config: DockerConfig,
}

impl DockerDriver {
    pub async fn new(config: DockerConfig) -> anyhow::Result<Self> {
        let client = connect(config.host.as_deref()).await?;
        Ok(Self { client, config })
    }

    fn network(&self, spec: &ResolvedSpec) -> Option<String> {
        spec.network.clone().or_else(|| self.config.network.clone())
    }

    fn container_config(
        &self,
        spec: &ResolvedSpec,
        container_id: &str,
        ports: &BTreeMap<String, u16>,
    ) -> Result<Config<String>, BackendError> {
        let env = literal_env(spec, "docker")?;

        let binds: Vec<String> = spec
            .volumes
            .iter()
            .map(|volume| {
                let source = match volume.source {
                    VolumeSource::HostPath(ref path) => path,
                    VolumeSource::Claim(ref name) => name,
                };
                if volume.read_only {
                    format!("{}:{}:ro", source, volume.mount_path)
                } else {
                    format!("{}:{}", source, volume.mount_path)
                }
            })
            .collect();

        let mut exposed_ports: HashMap<String, HashMap<(), ()>> = HashMap::new();
        let mut port_bindings: HashMap<String, Option<Vec<PortBinding>>> = HashMap::new();
        for port in ports.values() {
            let key = format!("{}/tcp", port);
            exposed_ports.insert(key.clone(), HashMap::new());
            if !self.config.internal_networking {
                // Empty host port lets docker pick a free one
                port_bindings.insert(
                    key,
                    Some(vec![PortBinding {
                        host_ip: Some("127.0.0.1".to_string()),
                        host_port: Some(String::new()),
                    }]),
                );
            }
        }

        let mut host_config = HostConfig {
            binds: (!binds.is_empty()).then_some(binds),
            port_bindings: (!port_bindings.is_empty()).then_some(port_bindings),
            network_mode: self.network(spec),
            privileged: Some(spec.privileged),
            ..Default::default()
        };
        if let Some(ref memory) = spec.resources.memory_limit {
            host_config.memory = Some(parse_memory_limit(memory)?);
        }
        if let Some(ref memory) = spec.resources.memory_request {
            host_config.memory_reservation = Some(parse_memory_limit(memory)?);
        }
        if let Some(ref cpus) = spec.resources.cpu_limit {
            host_config.nano_cpus = Some(parse_nano_cpus(cpus)?);
        }
        if let Some(ref cpus) = spec.resources.cpu_request {
            // Relative weight, 1024 per requested core
            host_config.cpu_shares = Some(parse_nano_cpus(cpus)? * 1024 / 1_000_000_000);
        }

        Ok(Config {
            image: Some(spec.image.clone()),
            entrypoint: (!spec.command.is_empty()).then(|| spec.command.clone()),
            cmd: (!spec.args.is_empty()).then(|| spec.args.clone()),
            env: Some(env),
            labels: Some(ownership_labels(spec, container_id, ports)),
            exposed_ports: Some(exposed_ports),
            host_config: Some(host_config),
            ..Default::default()
        })
    }

    async fn remove_container(&self, name: &str) -> Result<(), BackendError> {
        let options = StopContainerOptions { t: STOP_GRACE_SECS };
        match self.client.stop_container(name, Some(options)).await {
            Ok(_) => debug!(container = name, "Stopped Docker container"),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 304, ..
            }) => debug!(container = name, "Container was already stopped"),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => {
                debug!(container = name, "Container not found");
                return Ok(());
            }
            Err(e) => warn!(container = name, error = %e, "Failed to stop container, removing anyway"),
        }

        let options = RemoveContainerOptions {
            force: true,
            v: true,
            ..Default::default()
        };
        match self.client.remove_container(name, Some(options)).await {
            Ok(_) => {
                info!(container = name, "Removed Docker container");
                Ok(())
            }
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(()),
            // Removal already in progress
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 409, ..
            }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl BackendDriver for DockerDriver {
    fn kind(&self) -> &'static str {
        "docker"
    }

    async fn provision(&self, spec: &ResolvedSpec) -> Result<Vec<ContainerRecord>, BackendError> {
        let container_id = uuid::Uuid::new_v4().to_string();
        let name = container_name(&container_id);
        let ports: BTreeMap<String, u16> =
            spec.ports.iter().map(|p| (p.name.clone(), p.port)).collect();

        let config = self.container_config(spec, &container_id, &ports)?;
        pull_image_if_needed(&self.client, &spec.image, &self.config.pull_policy).await?;

        let options = CreateContainerOptions {
            name: name.clone(),
            platform: None,
        };
        match self.client.create_container(Some(options), config).await {
            Ok(response) => {
                info!(
                    instance_id = %spec.instance_id,
                    container = %name,
                    docker_id = %response.id,
                    image = %spec.image,
                    "Created Docker container"
                );
            }
            // Our own deterministic name: a retried create already succeeded
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 409, ..
            }) => debug!(container = %name, "Container already exists"),
            Err(e) => return Err(e.into()),
        }

        if let Err(e) = self
            .client
            .start_container(&name, None::<StartContainerOptions<String>>)
            .await
        {
            warn!(container = %name, error = %e, "Failed to start container, removing it");
            if let Err(cleanup) = self.remove_container(&name).await {
                warn!(container = %name, error = %cleanup, "Cleanup after failed start failed");
            }
            return Err(e.into());
        }

        info!(instance_id = %spec.instance_id, container = %name, "Started Docker container");
        Ok(vec![ContainerRecord::new(container_id, ports)])
    }

    async fn deprovision(&self, instance: &Instance) -> Result<(), BackendError> {
        let mut first_error = None;
        for container in &instance.containers {
            if let Err(e) = self.remove_container(&container_name(&container.id)).await {
                warn!(
                    instance_id = %instance.id,
                    container_id = %container.id,
                    error = %e,
                    "Failed to remove container"
                );
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn is_ready(&self, container: &mut ContainerRecord) -> Result<bool, BackendError> {
        let name = container_name(&container.id);
        let info = match self
            .client
            .inspect_container(&name, None::<InspectContainerOptions>)
            .await
        {
            Ok(info) => info,
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => return Err(BackendError::Failed(format!("container '{}' disappeared", name))),
            Err(e) => return Err(e.into()),
        };

        let state = info.state.unwrap_or_default();
        if matches!(
            state.status,
            Some(ContainerStateStatusEnum::EXITED) | Some(ContainerStateStatusEnum::DEAD)
        ) {
            return Err(BackendError::Failed(format!(
                "container '{}' exited with code {}",
                name,
                state.exit_code.unwrap_or_default()
            )));
        }
        if state.running != Some(true) {
            return Ok(false);
        }

        let network_settings = info.network_settings.unwrap_or_default();
        let mut targets = BTreeMap::new();
        for (mapping, port) in &container.ports {
            let target = if self.config.internal_networking {
                let address = network_settings
                    .networks
                    .as_ref()
                    .and_then(|networks| networks.values().find_map(|n| n.ip_address.clone()))
                    .filter(|ip| !ip.is_empty());
                match address {
                    Some(ip) => format!("http://{}:{}", ip, port),
                    None => return Ok(false),
                }
            } else {
                let host_port = network_settings
                    .ports
                    .as_ref()
                    .and_then(|ports| ports.get(&format!("{}/tcp", port)).cloned())
                    .flatten()
                    .and_then(|bindings| bindings.into_iter().find_map(|b| b.host_port))
                    .filter(|p| !p.is_empty());
                match host_port {
                    Some(host_port) => format!("http://127.0.0.1:{}", host_port),
                    None => return Ok(false),
                }
            };
            targets.insert(mapping.clone(), target);
        }

        for target in targets.values() {
            if !probe_http(target).await {
                return Ok(false);
            }
        }

        container.targets = targets;
        container.ready = true;
        Ok(true)
    }

    async fn recover(&self) -> Result<Vec<RecoveredInstance>, BackendError> {
        let mut filters = HashMap::new();
        filters.insert("label".to_string(), vec![LABEL_INSTANCE_ID.to_string()]);
        let options = ListContainersOptions {
            all: true,
            filters,
            ..Default::default()
        };

        let mut recovered: BTreeMap<String, RecoveredInstance> = BTreeMap::new();
        for summary in self.client.list_containers(Some(options)).await? {
            let labels = summary.labels.unwrap_or_default();
            let (Some(instance_id), Some(container_id)) =
                (labels.get(LABEL_INSTANCE_ID), labels.get(LABEL_CONTAINER_ID))
            else {
                continue;
            };
            let ports = labels
                .get(LABEL_PORTS)
                .map(|p| decode_ports(p))
                .unwrap_or_default();

            let entry = recovered
                .entry(instance_id.clone())
                .or_insert_with(|| RecoveredInstance {
                    instance_id: instance_id.clone(),
                    user_id: labels.get(LABEL_USER_ID).cloned().unwrap_or_default(),
                    spec_id: labels.get(LABEL_SPEC_ID).cloned().unwrap_or_default(),
                    containers: Vec::new(),
                    created_at: summary
                        .created
                        .and_then(|ts| Utc.timestamp_opt(ts, 0).single()),
                });
            entry
                .containers
                .push(ContainerRecord::new(container_id.clone(), ports));
        }

        Ok(recovered.into_values().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::{resolve, SpecAccess};
    use crate::spec::{ApplicationSpec, UserContext};

    fn resolved(template: &ApplicationSpec) -> ResolvedSpec {
        let user = UserContext::new("jack", vec!["scientists".to_string()]);
        resolve(template, &user, &HashMap::new(), "inst-1", &SpecAccess).unwrap()
    }

    #[test]
    fn test_literal_env_skips_unset_and_rejects_refs() {
        let mut template = ApplicationSpec::new("app", "nginx", 80);
        template.env.insert(
            "GREETING".to_string(),
            EnvValue::Literal("hi ${user.id}".to_string()),
        );
        template.env.insert("EMPTY".to_string(), EnvValue::Unset);

        let env = literal_env(&resolved(&template), "docker").unwrap();
        assert!(env.contains(&"GREETING=hi jack".to_string()));
        assert!(env.contains(&"GANTRY_USERNAME=jack".to_string()));
        assert!(!env.iter().any(|e| e.starts_with("EMPTY")));

        template.env.insert(
            "PASSWORD".to_string(),
            EnvValue::SecretKey {
                name: "db".to_string(),
                key: "password".to_string(),
            },
        );
        let err = literal_env(&resolved(&template), "docker").unwrap_err();
        assert!(matches!(err, BackendError::Unsupported { backend: "docker", .. }));
    }

    #[test]
    fn test_ownership_labels() {
        let template = ApplicationSpec::new("app", "nginx", 80);
        let spec = resolved(&template);
        let ports: BTreeMap<String, u16> =
            spec.ports.iter().map(|p| (p.name.clone(), p.port)).collect();

        let labels = ownership_labels(&spec, "c-1", &ports);
        assert_eq!(labels[LABEL_INSTANCE_ID], "inst-1");
        assert_eq!(labels[LABEL_USER_ID], "jack");
        assert_eq!(labels[LABEL_SPEC_ID], "app");
        assert_eq!(labels[LABEL_CONTAINER_ID], "c-1");
        assert_eq!(decode_ports(&labels[LABEL_PORTS]), ports);
        assert_eq!(container_name("c-1"), "gantry-c-1");
    }
}
