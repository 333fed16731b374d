//! Instances as Kubernetes pods
//!
//! Each instance gets a pod `gantry-pod-<cid>` and a service
//! `gantry-service-<cid>`. User patches are merged over the generated pod and
//! additional manifests are created next to it. Objects that already existed
//! before the launch are never deleted by teardown.

pub mod api;
pub mod manifest;
pub mod patch;

use self::api::{is_cluster_scoped, KubeApi, KubeError, ResourceRef};
use super::{
    decode_ports, BackendDriver, BackendError, ContainerRecord, RecoveredInstance,
    LABEL_CONTAINER_ID, LABEL_INSTANCE_ID, LABEL_PORTS, LABEL_SPEC_ID, LABEL_USER_ID,
};
use crate::config::KubernetesConfig;
use crate::registry::Instance;
use crate::spec::ResolvedSpec;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Record parameter holding the pod namespace
pub const PARAM_NAMESPACE: &str = "namespace";
/// Record parameter holding the additional objects to delete
pub const PARAM_MANIFESTS: &str = "manifests";

/// Base delay between retries of transient API failures
const RETRY_DELAY: Duration = Duration::from_millis(200);

pub struct KubernetesDriver {
    api: Arc<dyn KubeApi>,
    config: KubernetesConfig,
}

impl KubernetesDriver {
    pub fn new(api: Arc<dyn KubeApi>, config: KubernetesConfig) -> Self {
        Self { api, config }
    }

    /// Create an object, retrying transient failures. A conflict means the
    /// deterministic name is already taken by an earlier attempt.
    async fn create(&self, resource: &ResourceRef, manifest: &Value) -> Result<(), KubeError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.api.create(resource, manifest).await {
                Ok(_) => {
                    debug!(resource = %resource, "Created");
                    return Ok(());
                }
                Err(KubeError::Conflict(_)) => {
                    debug!(resource = %resource, "Already exists, treating as created");
                    return Ok(());
                }
                Err(e) if e.is_transient() && attempt < self.config.retries.max(1) => {
                    warn!(resource = %resource, attempt, error = %e, "Transient error, retrying");
                    tokio::time::sleep(RETRY_DELAY * attempt).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Delete objects in order, continuing past failures
    async fn delete_all(&self, resources: &[ResourceRef]) -> Result<(), KubeError> {
        let mut first_error = None;
        for resource in resources {
            match self.api.delete(resource).await {
                Ok(true) => info!(resource = %resource, "Deleted"),
                Ok(false) => debug!(resource = %resource, "Already gone"),
                Err(e) => {
                    warn!(resource = %resource, error = %e, "Failed to delete");
                    first_error.get_or_insert(e);
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Split additional manifests into those to create and those that
    /// already exist. Namespaced objects without a namespace inherit the pod's.
    async fn plan_manifests(
        &self,
        spec: &ResolvedSpec,
        namespace: &str,
    ) -> Result<Vec<(ResourceRef, Value)>, BackendError> {
        let mut to_create = Vec::new();
        for manifest in &spec.manifests {
            let mut manifest = manifest.clone();
            let kind = manifest.get("kind").and_then(Value::as_str).unwrap_or_default();
            if !is_cluster_scoped(kind)
                && manifest.pointer("/metadata/namespace").and_then(Value::as_str).is_none()
            {
                manifest["metadata"]["namespace"] = json!(namespace);
            }
            let resource = ResourceRef::from_manifest(&manifest)?;
            if self.api.get(&resource).await?.is_some() {
                info!(
                    instance_id = %spec.instance_id,
                    resource = %resource,
                    "Manifest already exists, leaving it untouched"
                );
                continue;
            }
            to_create.push((resource, manifest));
        }
        Ok(to_create)
    }

    fn namespace_of(&self, container: &ContainerRecord) -> String {
        container
            .parameter_str(PARAM_NAMESPACE)
            .unwrap_or(&self.config.namespace)
            .to_string()
    }
}

#[async_trait]
impl BackendDriver for KubernetesDriver {
    fn kind(&self) -> &'static str {
        "kubernetes"
    }

    async fn provision(&self, spec: &ResolvedSpec) -> Result<Vec<ContainerRecord>, BackendError> {
        let container_id = uuid::Uuid::new_v4().to_string();
        let ports: BTreeMap<String, u16> =
            spec.ports.iter().map(|p| (p.name.clone(), p.port)).collect();

        let mut pod = manifest::build_pod(spec, &container_id, &self.config.namespace, &ports);
        if let Some(ref pod_patch) = spec.pod_patch {
            patch::merge(&mut pod, pod_patch);
            manifest::enforce_identity(&mut pod, spec, &container_id);
        }
        let namespace = pod
            .pointer("/metadata/namespace")
            .and_then(Value::as_str)
            .unwrap_or(&self.config.namespace)
            .to_string();

        let manifests = self.plan_manifests(spec, &namespace).await?;
        let teardown: Vec<ResourceRef> = manifests.iter().map(|(r, _)| r.clone()).collect();
        manifest::set_teardown_annotation(&mut pod, &teardown);

        let pod_ref = ResourceRef::pod(&manifest::pod_name(&container_id), &namespace);
        let service_ref = ResourceRef::service(&manifest::service_name(&container_id), &namespace);

        self.create(&pod_ref, &pod).await?;
        info!(instance_id = %spec.instance_id, pod = %pod_ref, "Created pod");

        let service = manifest::build_service(
            spec,
            &container_id,
            &namespace,
            &ports,
            self.config.internal_networking,
        );
        if let Err(e) = self.create(&service_ref, &service).await {
            warn!(instance_id = %spec.instance_id, error = %e, "Service creation failed, removing pod");
            if let Err(cleanup) = self.delete_all(&[pod_ref]).await {
                warn!(instance_id = %spec.instance_id, error = %cleanup, "Cleanup failed");
            }
            return Err(e.into());
        }

        let mut created: Vec<ResourceRef> = Vec::new();
        for (resource, manifest) in &manifests {
            if let Err(e) = self.create(resource, manifest).await {
                warn!(
                    instance_id = %spec.instance_id,
                    resource = %resource,
                    error = %e,
                    "Manifest creation failed, rolling back"
                );
                let mut rollback: Vec<ResourceRef> = vec![pod_ref.clone(), service_ref.clone()];
                rollback.extend(created.iter().rev().cloned());
                if let Err(cleanup) = self.delete_all(&rollback).await {
                    warn!(instance_id = %spec.instance_id, error = %cleanup, "Cleanup failed");
                }
                return Err(e.into());
            }
            created.push(resource.clone());
        }

        let mut record = ContainerRecord::new(container_id, ports);
        record
            .parameters
            .insert(PARAM_NAMESPACE.to_string(), json!(namespace));
        record.parameters.insert(
            PARAM_MANIFESTS.to_string(),
            serde_json::to_value(&teardown).unwrap_or_else(|_| json!([])),
        );
        Ok(vec![record])
    }

    async fn deprovision(&self, instance: &Instance) -> Result<(), BackendError> {
        let mut first_error: Option<KubeError> = None;

        for container in &instance.containers {
            let namespace = self.namespace_of(container);
            let pod_ref = ResourceRef::pod(&manifest::pod_name(&container.id), &namespace);
            let service_ref =
                ResourceRef::service(&manifest::service_name(&container.id), &namespace);

            let manifests: Vec<ResourceRef> = match container.parameters.get(PARAM_MANIFESTS) {
                Some(list) => serde_json::from_value(list.clone()).unwrap_or_default(),
                // Recovered instances only have the pod annotation
                None => match self.api.get(&pod_ref).await {
                    Ok(Some(pod)) => manifest::teardown_annotation(&pod),
                    Ok(None) => Vec::new(),
                    Err(e) => {
                        first_error.get_or_insert(e);
                        Vec::new()
                    }
                },
            };

            let mut order = vec![pod_ref, service_ref];
            order.extend(manifests.into_iter().rev());
            if let Err(e) = self.delete_all(&order).await {
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }

    async fn is_ready(&self, container: &mut ContainerRecord) -> Result<bool, BackendError> {
        let namespace = self.namespace_of(container);
        let pod_ref = ResourceRef::pod(&manifest::pod_name(&container.id), &namespace);
        let pod = self
            .api
            .get(&pod_ref)
            .await?
            .ok_or_else(|| BackendError::Failed(format!("{} disappeared", pod_ref)))?;

        let status = pod.get("status").cloned().unwrap_or(Value::Null);
        match status.get("phase").and_then(Value::as_str) {
            Some(phase @ ("Failed" | "Succeeded")) => {
                return Err(BackendError::Failed(format!(
                    "{} terminated with phase {}",
                    pod_ref, phase
                )))
            }
            Some("Running") => {}
            _ => return Ok(false),
        }
        let ready = status
            .get("conditions")
            .and_then(Value::as_array)
            .map(|conditions| {
                conditions
                    .iter()
                    .any(|c| c["type"] == "Ready" && c["status"] == "True")
            })
            .unwrap_or(false);
        if !ready {
            return Ok(false);
        }

        let mut targets = BTreeMap::new();
        if self.config.internal_networking {
            let Some(pod_ip) = status.get("podIP").and_then(Value::as_str) else {
                return Ok(false);
            };
            for (mapping, port) in &container.ports {
                targets.insert(mapping.clone(), format!("http://{}:{}", pod_ip, port));
            }
        } else {
            let Some(host_ip) = status.get("hostIP").and_then(Value::as_str) else {
                return Ok(false);
            };
            let service_ref =
                ResourceRef::service(&manifest::service_name(&container.id), &namespace);
            let Some(service) = self.api.get(&service_ref).await? else {
                return Err(BackendError::Failed(format!("{} disappeared", service_ref)));
            };
            let service_ports = service
                .pointer("/spec/ports")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default();
            for (mapping, port) in &container.ports {
                let node_port = service_ports
                    .iter()
                    .find(|p| p["targetPort"] == json!(port) || p["port"] == json!(port))
                    .and_then(|p| p.get("nodePort"))
                    .and_then(Value::as_u64);
                match node_port {
                    Some(node_port) => {
                        targets.insert(
                            mapping.clone(),
                            format!("http://{}:{}", host_ip, node_port),
                        );
                    }
                    None => return Ok(false),
                }
            }
        }

        container.targets = targets;
        container.ready = true;
        Ok(true)
    }

    async fn recover(&self) -> Result<Vec<RecoveredInstance>, BackendError> {
        let pods = self.api.list_pods(LABEL_INSTANCE_ID).await?;

        let mut recovered: BTreeMap<String, RecoveredInstance> = BTreeMap::new();
        for pod in pods {
            let label = |key: &str| {
                pod.pointer("/metadata/labels")
                    .and_then(|l| l.get(key))
                    .and_then(Value::as_str)
                    .map(str::to_string)
            };
            let annotation = |key: &str| {
                pod.pointer("/metadata/annotations")
                    .and_then(|a| a.get(key))
                    .and_then(Value::as_str)
                    .map(str::to_string)
            };
            let (Some(instance_id), Some(container_id)) =
                (label(LABEL_INSTANCE_ID), label(LABEL_CONTAINER_ID))
            else {
                continue;
            };
            let namespace = pod
                .pointer("/metadata/namespace")
                .and_then(Value::as_str)
                .unwrap_or(&self.config.namespace)
                .to_string();
            let created_at = pod
                .pointer("/metadata/creationTimestamp")
                .and_then(Value::as_str)
                .and_then(|ts| DateTime::parse_from_rfc3339(ts).ok())
                .map(|ts| ts.with_timezone(&Utc));

            let mut record = ContainerRecord::new(
                container_id,
                annotation(LABEL_PORTS)
                    .map(|p| decode_ports(&p))
                    .unwrap_or_default(),
            );
            record
                .parameters
                .insert(PARAM_NAMESPACE.to_string(), json!(namespace));
            record.parameters.insert(
                PARAM_MANIFESTS.to_string(),
                serde_json::to_value(manifest::teardown_annotation(&pod))
                    .unwrap_or_else(|_| json!([])),
            );

            recovered
                .entry(instance_id.clone())
                .or_insert_with(|| RecoveredInstance {
                    instance_id,
                    user_id: annotation(LABEL_USER_ID).unwrap_or_default(),
                    spec_id: annotation(LABEL_SPEC_ID).unwrap_or_default(),
                    containers: Vec::new(),
                    created_at,
                })
                .containers
                .push(record);
        }
        Ok(recovered.into_values().collect())
    }
}
