//! Pod and Service manifests generated from a resolved spec

use super::api::ResourceRef;
use crate::backend::{
    encode_ports, LABEL_CONTAINER_ID, LABEL_INSTANCE_ID, LABEL_PORTS, LABEL_SPEC_ID,
    LABEL_USER_ID,
};
use crate::spec::{EnvValue, ResolvedSpec, VolumeSource};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;

/// Pod annotation listing the extra objects to delete on teardown
pub const ANNOTATION_MANIFESTS: &str = "gantry.manifests";

/// Name of the single application container inside the pod
pub const CONTAINER_NAME: &str = "app";

pub fn pod_name(container_id: &str) -> String {
    format!("gantry-pod-{}", container_id)
}

pub fn service_name(container_id: &str) -> String {
    format!("gantry-service-{}", container_id)
}

pub fn volume_name(index: usize) -> String {
    format!("gantry-volume-{}", index)
}

/// Build the Pod for `spec` before any user patch is applied
pub fn build_pod(
    spec: &ResolvedSpec,
    container_id: &str,
    namespace: &str,
    ports: &BTreeMap<String, u16>,
) -> Value {
    let mut volumes = Vec::with_capacity(spec.volumes.len());
    let mut mounts = Vec::with_capacity(spec.volumes.len());
    for (index, volume) in spec.volumes.iter().enumerate() {
        let name = volume_name(index);
        volumes.push(match volume.source {
            VolumeSource::HostPath(ref path) => json!({
                "name": name,
                "hostPath": { "path": path, "type": "" }
            }),
            VolumeSource::Claim(ref claim) => json!({
                "name": name,
                "persistentVolumeClaim": { "claimName": claim, "readOnly": volume.read_only }
            }),
        });
        mounts.push(json!({
            "name": name,
            "mountPath": volume.mount_path,
            "readOnly": volume.read_only
        }));
    }

    let env: Vec<Value> = spec
        .env
        .iter()
        .map(|(name, value)| match value {
            EnvValue::Literal(v) => json!({ "name": name, "value": v }),
            EnvValue::SecretKey { name: secret, key } => json!({
                "name": name,
                "valueFrom": { "secretKeyRef": { "name": secret, "key": key } }
            }),
            EnvValue::ConfigMapKey { name: config_map, key } => json!({
                "name": name,
                "valueFrom": { "configMapKeyRef": { "name": config_map, "key": key } }
            }),
            EnvValue::Unset => json!({ "name": name, "value": null }),
        })
        .collect();

    let container_ports: Vec<Value> = ports
        .values()
        .map(|port| json!({ "containerPort": port, "protocol": "TCP" }))
        .collect();

    let mut container = json!({
        "name": CONTAINER_NAME,
        "image": spec.image,
        "env": env,
        "ports": container_ports,
        "volumeMounts": mounts,
        "securityContext": { "privileged": spec.privileged },
        "resources": resources(spec),
    });
    if !spec.command.is_empty() {
        container["command"] = json!(spec.command);
    }
    if !spec.args.is_empty() {
        container["args"] = json!(spec.args);
    }

    json!({
        "apiVersion": "v1",
        "kind": "Pod",
        "metadata": {
            "name": pod_name(container_id),
            "namespace": namespace,
            "labels": labels(spec, container_id),
            "annotations": {
                LABEL_USER_ID: spec.user_id,
                LABEL_SPEC_ID: spec.spec_id,
                LABEL_PORTS: encode_ports(ports),
            }
        },
        "spec": {
            "containers": [container],
            "volumes": volumes,
            "restartPolicy": "Never",
        }
    })
}

/// Build the Service selecting the pod
pub fn build_service(
    spec: &ResolvedSpec,
    container_id: &str,
    namespace: &str,
    ports: &BTreeMap<String, u16>,
    internal_networking: bool,
) -> Value {
    let service_ports: Vec<Value> = ports
        .values()
        .enumerate()
        .map(|(index, port)| {
            json!({
                "name": format!("port-{}", index),
                "port": port,
                "targetPort": port,
                "protocol": "TCP"
            })
        })
        .collect();
    let service_type = if internal_networking {
        "ClusterIP"
    } else {
        "NodePort"
    };

    json!({
        "apiVersion": "v1",
        "kind": "Service",
        "metadata": {
            "name": service_name(container_id),
            "namespace": namespace,
            "labels": labels(spec, container_id),
        },
        "spec": {
            "type": service_type,
            "selector": { "app": container_id },
            "ports": service_ports,
        }
    })
}

/// Re-apply the identity fields a patch must not change
pub fn enforce_identity(pod: &mut Value, spec: &ResolvedSpec, container_id: &str) {
    pod["metadata"]["name"] = json!(pod_name(container_id));
    if !pod["metadata"]["labels"].is_object() {
        pod["metadata"]["labels"] = json!({});
    }
    for (key, value) in labels(spec, container_id) {
        pod["metadata"]["labels"][key] = value;
    }
}

/// Record the teardown list on the pod
pub fn set_teardown_annotation(pod: &mut Value, resources: &[ResourceRef]) {
    if !pod["metadata"]["annotations"].is_object() {
        pod["metadata"]["annotations"] = json!({});
    }
    pod["metadata"]["annotations"][ANNOTATION_MANIFESTS] =
        json!(serde_json::to_string(resources).unwrap_or_else(|_| "[]".to_string()));
}

/// Read the teardown list back from a pod
pub fn teardown_annotation(pod: &Value) -> Vec<ResourceRef> {
    pod.pointer("/metadata/annotations")
        .and_then(|a| a.get(ANNOTATION_MANIFESTS))
        .and_then(Value::as_str)
        .and_then(|s| serde_json::from_str(s).ok())
        .unwrap_or_default()
}

fn labels(spec: &ResolvedSpec, container_id: &str) -> Map<String, Value> {
    let mut labels: Map<String, Value> = spec
        .labels
        .iter()
        .map(|(k, v)| (k.clone(), json!(v)))
        .collect();
    labels.insert("app".to_string(), json!(container_id));
    labels.insert(LABEL_INSTANCE_ID.to_string(), json!(spec.instance_id));
    labels.insert(LABEL_CONTAINER_ID.to_string(), json!(container_id));
    labels
}

fn resources(spec: &ResolvedSpec) -> Value {
    let mut requests = Map::new();
    let mut limits = Map::new();
    let r = &spec.resources;
    if let Some(ref cpu) = r.cpu_request {
        requests.insert("cpu".to_string(), json!(cpu));
    }
    if let Some(ref memory) = r.memory_request {
        requests.insert("memory".to_string(), json!(memory));
    }
    if let Some(ref cpu) = r.cpu_limit {
        limits.insert("cpu".to_string(), json!(cpu));
    }
    if let Some(ref memory) = r.memory_limit {
        limits.insert("memory".to_string(), json!(memory));
    }
    json!({ "requests": requests, "limits": limits })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::{resolve, SpecAccess};
    use crate::spec::{ApplicationSpec, UserContext, Volume};
    use std::collections::HashMap;

    fn resolved(template: &ApplicationSpec) -> ResolvedSpec {
        resolve(
            template,
            &UserContext::new("jack", vec![]),
            &HashMap::new(),
            "inst-1",
            &SpecAccess,
        )
        .unwrap()
    }

    fn ports(spec: &ResolvedSpec) -> BTreeMap<String, u16> {
        spec.ports.iter().map(|p| (p.name.clone(), p.port)).collect()
    }

    #[test]
    fn test_pod_volumes_in_order() {
        let mut template = ApplicationSpec::new("app", "img", 3838);
        template.volumes.push(Volume::host_path("/srv/v1", "/mnt/a"));
        template.volumes.push(Volume::host_path("/srv/v2", "/mnt/b"));
        let spec = resolved(&template);

        let pod = build_pod(&spec, "c1", "users", &ports(&spec));
        assert_eq!(pod["metadata"]["name"], "gantry-pod-c1");
        assert_eq!(pod["metadata"]["namespace"], "users");
        assert_eq!(pod["metadata"]["labels"]["app"], "c1");
        assert_eq!(pod["metadata"]["labels"][LABEL_INSTANCE_ID], "inst-1");

        let volumes = pod["spec"]["volumes"].as_array().unwrap();
        assert_eq!(volumes[0]["name"], "gantry-volume-0");
        assert_eq!(volumes[0]["hostPath"]["path"], "/srv/v1");
        assert_eq!(volumes[1]["name"], "gantry-volume-1");
        assert_eq!(volumes[1]["hostPath"]["path"], "/srv/v2");

        let mounts = pod["spec"]["containers"][0]["volumeMounts"].as_array().unwrap();
        assert_eq!(mounts[0]["mountPath"], "/mnt/a");
        assert_eq!(mounts[1]["mountPath"], "/mnt/b");
    }

    #[test]
    fn test_env_references() {
        let mut template = ApplicationSpec::new("app", "img", 80);
        template.env.insert(
            "MY_SECRET".to_string(),
            EnvValue::SecretKey {
                name: "mysecret".to_string(),
                key: "username".to_string(),
            },
        );
        template.env.insert("EMPTY".to_string(), EnvValue::Unset);
        let spec = resolved(&template);
        let pod = build_pod(&spec, "c1", "default", &ports(&spec));

        let env = pod["spec"]["containers"][0]["env"].as_array().unwrap();
        let secret = env.iter().find(|e| e["name"] == "MY_SECRET").unwrap();
        assert!(secret.get("value").is_none());
        assert_eq!(secret["valueFrom"]["secretKeyRef"]["name"], "mysecret");
        assert_eq!(secret["valueFrom"]["secretKeyRef"]["key"], "username");
        let empty = env.iter().find(|e| e["name"] == "EMPTY").unwrap();
        assert!(empty["value"].is_null());
        let user = env.iter().find(|e| e["name"] == "GANTRY_USERNAME").unwrap();
        assert_eq!(user["value"], "jack");
    }

    #[test]
    fn test_service_type() {
        let spec = resolved(&ApplicationSpec::new("app", "img", 3838));
        let service = build_service(&spec, "c1", "ns", &ports(&spec), false);
        assert_eq!(service["metadata"]["name"], "gantry-service-c1");
        assert_eq!(service["spec"]["type"], "NodePort");
        assert_eq!(service["spec"]["selector"]["app"], "c1");
        assert_eq!(service["spec"]["ports"][0]["targetPort"], 3838);

        let service = build_service(&spec, "c1", "ns", &ports(&spec), true);
        assert_eq!(service["spec"]["type"], "ClusterIP");
    }

    #[test]
    fn test_identity_survives_patch() {
        let spec = resolved(&ApplicationSpec::new("app", "img", 80));
        let mut pod = build_pod(&spec, "c1", "ns", &ports(&spec));
        pod["metadata"]["name"] = json!("renamed");
        pod["metadata"]["labels"]["app"] = json!("other");
        enforce_identity(&mut pod, &spec, "c1");
        assert_eq!(pod["metadata"]["name"], "gantry-pod-c1");
        assert_eq!(pod["metadata"]["labels"]["app"], "c1");
    }

    #[test]
    fn test_teardown_annotation() {
        let spec = resolved(&ApplicationSpec::new("app", "img", 80));
        let mut pod = build_pod(&spec, "c1", "ns", &ports(&spec));
        assert!(teardown_annotation(&pod).is_empty());

        let refs = vec![ResourceRef::new("v1", "Secret", "s", Some("ns"))];
        set_teardown_annotation(&mut pod, &refs);
        assert_eq!(teardown_annotation(&pod), refs);
    }
}
