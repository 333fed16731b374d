//! Instances as Docker Swarm services

use super::docker::{connect, literal_env, ownership_labels};
use super::{
    decode_ports, parse_memory_limit, parse_nano_cpus, probe_http, BackendDriver, BackendError,
    ContainerRecord, RecoveredInstance, LABEL_CONTAINER_ID, LABEL_INSTANCE_ID, LABEL_PORTS,
    LABEL_SPEC_ID, LABEL_USER_ID,
};
use crate::config::SwarmConfig;
use crate::registry::Instance;
use crate::spec::{ResolvedSpec, VolumeSource};
use async_trait::async_trait;
use bollard::models::{
    EndpointPortConfig, EndpointPortConfigProtocolEnum, EndpointSpec, Limit, Mount,
    MountTypeEnum, NetworkAttachmentConfig, ResourceObject, ServiceSpec, TaskSpec,
    TaskSpecContainerSpec, TaskSpecResources, TaskSpecRestartPolicy,
    TaskSpecRestartPolicyConditionEnum,
};
use bollard::service::{InspectServiceOptions, ListServicesOptions};
use bollard::Docker;
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, info, warn};

pub fn service_name(container_id: &str) -> String {
    format!("gantry-svc-{}", container_id)
}

/// Service definition for one instance
pub(crate) fn service_spec(
    spec: &ResolvedSpec,
    container_id: &str,
    ports: &BTreeMap<String, u16>,
    config: &SwarmConfig,
) -> Result<ServiceSpec, BackendError> {
    if spec.privileged {
        return Err(BackendError::Unsupported {
            backend: "swarm",
            message: "privileged services".to_string(),
        });
    }

    let mounts = spec
        .volumes
        .iter()
        .map(|volume| {
            let (typ, source) = match volume.source {
                VolumeSource::HostPath(ref path) => (MountTypeEnum::BIND, path.clone()),
                VolumeSource::Claim(ref name) => (MountTypeEnum::VOLUME, name.clone()),
            };
            Mount {
                target: Some(volume.mount_path.clone()),
                source: Some(source),
                typ: Some(typ),
                read_only: Some(volume.read_only),
                ..Default::default()
            }
        })
        .collect();

    let mut limits = Limit::default();
    let mut reservations = ResourceObject::default();
    if let Some(ref memory) = spec.resources.memory_limit {
        limits.memory_bytes = Some(parse_memory_limit(memory)?);
    }
    if let Some(ref cpus) = spec.resources.cpu_limit {
        limits.nano_cpus = Some(parse_nano_cpus(cpus)?);
    }
    if let Some(ref memory) = spec.resources.memory_request {
        reservations.memory_bytes = Some(parse_memory_limit(memory)?);
    }
    if let Some(ref cpus) = spec.resources.cpu_request {
        reservations.nano_cpus = Some(parse_nano_cpus(cpus)?);
    }

    let network = spec.network.clone().or_else(|| config.network.clone());
    let labels = ownership_labels(spec, container_id, ports);

    let endpoint_spec = (!config.internal_networking).then(|| EndpointSpec {
        ports: Some(
            ports
                .values()
                .map(|port| EndpointPortConfig {
                    protocol: Some(EndpointPortConfigProtocolEnum::TCP),
                    target_port: Some(i64::from(*port)),
                    ..Default::default()
                })
                .collect(),
        ),
        ..Default::default()
    });

    Ok(ServiceSpec {
        name: Some(service_name(container_id)),
        labels: Some(labels.clone()),
        task_template: Some(TaskSpec {
            container_spec: Some(TaskSpecContainerSpec {
                image: Some(spec.image.clone()),
                command: (!spec.command.is_empty()).then(|| spec.command.clone()),
                args: (!spec.args.is_empty()).then(|| spec.args.clone()),
                env: Some(literal_env(spec, "swarm")?),
                labels: Some(labels),
                mounts: Some(mounts),
                ..Default::default()
            }),
            resources: Some(TaskSpecResources {
                limits: Some(limits),
                reservations: Some(reservations),
                ..Default::default()
            }),
            restart_policy: Some(TaskSpecRestartPolicy {
                condition: Some(TaskSpecRestartPolicyConditionEnum::NONE),
                ..Default::default()
            }),
            networks: network.map(|target| {
                vec![NetworkAttachmentConfig {
                    target: Some(target),
                    ..Default::default()
                }]
            }),
            ..Default::default()
        }),
        endpoint_spec,
        ..Default::default()
    })
}

/// Runs each instance as a single-replica swarm service
pub struct SwarmDriver {
    client: Docker,
    config: SwarmConfig,
}

impl SwarmDriver {
    pub async fn new(config: SwarmConfig) -> anyhow::Result<Self> {
        let client = connect(config.host.as_deref()).await?;
        Ok(Self { client, config })
    }

    async fn remove_service(&self, name: &str) -> Result<(), BackendError> {
        match self.client.delete_service(name).await {
            Ok(_) => {
                info!(service = name, "Removed swarm service");
                Ok(())
            }
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => {
                debug!(service = name, "Service not found");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Running task count of a service; `None` once the service is gone
    async fn running_tasks(&self, name: &str) -> Result<Option<u64>, BackendError> {
        let mut filters = HashMap::new();
        filters.insert("name", vec![name]);
        let services = self
            .client
            .list_services(Some(ListServicesOptions {
                filters,
                status: true,
            }))
            .await?;
        // The name filter matches prefixes
        Ok(services
            .into_iter()
            .find(|service| {
                service.spec.as_ref().and_then(|s| s.name.as_deref()) == Some(name)
            })
            .map(|service| {
                service
                    .service_status
                    .and_then(|status| status.running_tasks)
                    .unwrap_or(0)
            }))
    }
}

#[async_trait]
impl BackendDriver for SwarmDriver {
    fn kind(&self) -> &'static str {
        "swarm"
    }

    async fn provision(&self, spec: &ResolvedSpec) -> Result<Vec<ContainerRecord>, BackendError> {
        let container_id = uuid::Uuid::new_v4().to_string();
        let name = service_name(&container_id);
        let ports: BTreeMap<String, u16> =
            spec.ports.iter().map(|p| (p.name.clone(), p.port)).collect();

        let service = service_spec(spec, &container_id, &ports, &self.config)?;
        match self.client.create_service(service, None).await {
            Ok(response) => info!(
                instance_id = %spec.instance_id,
                service = %name,
                service_id = ?response.id,
                "Created swarm service"
            ),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 409, ..
            }) => debug!(service = %name, "Service already exists"),
            Err(e) => return Err(e.into()),
        }

        Ok(vec![ContainerRecord::new(container_id, ports)])
    }

    async fn deprovision(&self, instance: &Instance) -> Result<(), BackendError> {
        let mut first_error = None;
        for container in &instance.containers {
            if let Err(e) = self.remove_service(&service_name(&container.id)).await {
                warn!(instance_id = %instance.id, error = %e, "Failed to remove service");
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn is_ready(&self, container: &mut ContainerRecord) -> Result<bool, BackendError> {
        let name = service_name(&container.id);
        match self.running_tasks(&name).await? {
            Some(0) => return Ok(false),
            Some(_) => {}
            None => {
                return Err(BackendError::Failed(format!(
                    "service '{}' disappeared",
                    name
                )))
            }
        }

        let mut targets = BTreeMap::new();
        if self.config.internal_networking {
            for (mapping, port) in &container.ports {
                targets.insert(mapping.clone(), format!("http://{}:{}", name, port));
            }
        } else {
            let service = self
                .client
                .inspect_service(&name, None::<InspectServiceOptions>)
                .await?;
            let published: Vec<EndpointPortConfig> = service
                .endpoint
                .and_then(|e| e.ports)
                .unwrap_or_default();
            for (mapping, port) in &container.ports {
                let published_port = published
                    .iter()
                    .find(|p| p.target_port == Some(i64::from(*port)))
                    .and_then(|p| p.published_port);
                match published_port {
                    Some(published_port) => {
                        targets.insert(
                            mapping.clone(),
                            format!("http://{}:{}", self.config.published_host, published_port),
                        );
                    }
                    None => return Ok(false),
                }
            }
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
        filters.insert("label", vec![LABEL_INSTANCE_ID]);
        let services = self
            .client
            .list_services(Some(ListServicesOptions {
                filters,
                ..Default::default()
            }))
            .await?;

        let mut recovered: BTreeMap<String, RecoveredInstance> = BTreeMap::new();
        for service in services {
            let labels = service.spec.and_then(|s| s.labels).unwrap_or_default();
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
                    created_at: None,
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
    use crate::spec::{ApplicationSpec, PortMapping, UserContext, Volume};

    fn template() -> ApplicationSpec {
        let mut template = ApplicationSpec::new("rstudio", "rocker/rstudio", 8787);
        template.port_mappings.push(PortMapping {
            name: "shiny".to_string(),
            port: 3838,
        });
        template.volumes = vec![
            Volume {
                source: VolumeSource::HostPath("/srv/${user.id}".to_string()),
                mount_path: "/home/rstudio".to_string(),
                read_only: false,
            },
            Volume {
                source: VolumeSource::Claim("shared".to_string()),
                mount_path: "/shared".to_string(),
                read_only: true,
            },
        ];
        template.resources.memory_limit = Some("1g".to_string());
        template.resources.cpu_limit = Some("2".to_string());
        template.resources.memory_request = Some("512m".to_string());
        template
    }

    fn build(
        template: &ApplicationSpec,
        config: &SwarmConfig,
    ) -> Result<ServiceSpec, BackendError> {
        let user = UserContext::new("jack", Vec::new());
        let spec = resolve(template, &user, &HashMap::new(), "inst-1", &SpecAccess).unwrap();
        let ports: BTreeMap<String, u16> =
            spec.ports.iter().map(|p| (p.name.clone(), p.port)).collect();
        service_spec(&spec, "c-1", &ports, config)
    }

    #[test]
    fn test_service_spec() {
        let service = build(&template(), &SwarmConfig::default()).unwrap();
        assert_eq!(service.name.as_deref(), Some("gantry-svc-c-1"));

        let labels = service.labels.unwrap();
        assert_eq!(labels[LABEL_INSTANCE_ID], "inst-1");
        assert_eq!(labels[LABEL_USER_ID], "jack");
        assert_eq!(labels[LABEL_CONTAINER_ID], "c-1");

        let task = service.task_template.unwrap();
        let container = task.container_spec.unwrap();
        assert_eq!(container.image.as_deref(), Some("rocker/rstudio"));
        assert!(container.command.is_none());

        let mounts = container.mounts.unwrap();
        assert_eq!(mounts.len(), 2);
        assert_eq!(mounts[0].typ, Some(MountTypeEnum::BIND));
        assert_eq!(mounts[0].source.as_deref(), Some("/srv/jack"));
        assert_eq!(mounts[0].target.as_deref(), Some("/home/rstudio"));
        assert_eq!(mounts[1].typ, Some(MountTypeEnum::VOLUME));
        assert_eq!(mounts[1].read_only, Some(true));

        let resources = task.resources.unwrap();
        let limits = resources.limits.unwrap();
        assert_eq!(limits.memory_bytes, Some(1024 * 1024 * 1024));
        assert_eq!(limits.nano_cpus, Some(2_000_000_000));
        let reservations = resources.reservations.unwrap();
        assert_eq!(reservations.memory_bytes, Some(512 * 1024 * 1024));
        assert_eq!(reservations.nano_cpus, None);

        assert_eq!(
            task.restart_policy.unwrap().condition,
            Some(TaskSpecRestartPolicyConditionEnum::NONE)
        );
        assert!(task.networks.is_none());

        let published: Vec<i64> = service
            .endpoint_spec
            .unwrap()
            .ports
            .unwrap()
            .iter()
            .filter_map(|p| p.target_port)
            .collect();
        assert_eq!(published.len(), 2);
        assert!(published.contains(&8787));
        assert!(published.contains(&3838));
    }

    #[test]
    fn test_internal_networking_uses_overlay() {
        let config = SwarmConfig {
            network: Some("gantry-net".to_string()),
            internal_networking: true,
            ..SwarmConfig::default()
        };
        let service = build(&template(), &config).unwrap();
        assert!(service.endpoint_spec.is_none());

        let networks = service.task_template.unwrap().networks.unwrap();
        assert_eq!(networks[0].target.as_deref(), Some("gantry-net"));
    }

    #[test]
    fn test_privileged_is_rejected() {
        let mut template = template();
        template.privileged = true;
        let err = build(&template, &SwarmConfig::default()).unwrap_err();
        assert!(matches!(err, BackendError::Unsupported { backend: "swarm", .. }));
    }

    #[test]
    fn test_bad_memory_limit_is_rejected() {
        let mut template = template();
        template.resources.memory_limit = Some("lots".to_string());
        assert!(build(&template, &SwarmConfig::default()).is_err());
    }
}
