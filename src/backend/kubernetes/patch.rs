//! Structural merge of user patches over generated manifests
//!
//! Mappings merge key by key, `null` removes a key, scalars from the patch
//! win. Lists of mappings merge element-wise on a merge key (`name`,
//! `mountPath` or `containerPort`); unmatched elements are appended and exact
//! duplicates are skipped. A patched env entry carries either `value` or
//! `valueFrom`, never both.

use serde_json::Value;

const MERGE_KEYS: &[&str] = &["name", "mountPath", "containerPort"];

/// Keys of an env var entry that exclude each other
const EXCLUSIVE_KEYS: &[(&str, &str)] = &[("value", "valueFrom"), ("valueFrom", "value")];

/// Merge `patch` into `base` in place
pub fn merge(base: &mut Value, patch: &Value) {
    match (base, patch) {
        (Value::Object(base_map), Value::Object(patch_map)) => {
            for (key, patch_value) in patch_map {
                if patch_value.is_null() {
                    base_map.remove(key);
                    continue;
                }
                match base_map.get_mut(key) {
                    Some(existing) => merge(existing, patch_value),
                    None => {
                        base_map.insert(key.clone(), patch_value.clone());
                    }
                }
            }
        }
        (Value::Array(base_items), Value::Array(patch_items)) => {
            for patch_item in patch_items {
                merge_list_item(base_items, patch_item);
            }
        }
        (base, patch) => *base = patch.clone(),
    }
}

fn merge_list_item(items: &mut Vec<Value>, patch_item: &Value) {
    if let Some((key, value)) = merge_key(patch_item) {
        if let Some(existing) = items
            .iter_mut()
            .find(|item| item.get(key) == Some(value))
        {
            if let (Some(existing_map), Some(patch_map)) =
                (existing.as_object_mut(), patch_item.as_object())
            {
                for (set, cleared) in EXCLUSIVE_KEYS {
                    if patch_map.contains_key(*set) {
                        existing_map.remove(*cleared);
                    }
                }
            }
            merge(existing, patch_item);
            return;
        }
    }
    if !items.contains(patch_item) {
        items.push(patch_item.clone());
    }
}

fn merge_key(item: &Value) -> Option<(&'static str, &Value)> {
    let map = item.as_object()?;
    MERGE_KEYS
        .iter()
        .find_map(|key| map.get(*key).map(|value| (*key, value)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_adds_volume_without_duplicates() {
        let mut pod = json!({
            "spec": {
                "volumes": [{ "name": "gantry-volume-0", "hostPath": { "path": "/srv/a" } }],
                "containers": [{
                    "name": "app",
                    "image": "img",
                    "volumeMounts": [{ "name": "gantry-volume-0", "mountPath": "/a" }]
                }]
            }
        });
        let patch = json!({
            "spec": {
                "volumes": [{ "name": "cache-volume", "emptyDir": {} }],
                "containers": [{
                    "name": "app",
                    "volumeMounts": [{ "name": "cache-volume", "mountPath": "/cache" }]
                }]
            }
        });

        merge(&mut pod, &patch);
        merge(&mut pod, &patch);

        let volumes = pod["spec"]["volumes"].as_array().unwrap();
        assert_eq!(volumes.len(), 2);
        assert_eq!(volumes[0]["name"], "gantry-volume-0");
        assert_eq!(volumes[1]["name"], "cache-volume");

        let containers = pod["spec"]["containers"].as_array().unwrap();
        assert_eq!(containers.len(), 1);
        assert_eq!(containers[0]["image"], "img");
        assert_eq!(containers[0]["volumeMounts"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn test_scalars_and_nested_maps() {
        let mut pod = json!({
            "metadata": { "name": "p", "labels": { "app": "x" } },
            "spec": { "restartPolicy": "Never" }
        });
        merge(
            &mut pod,
            &json!({
                "metadata": { "namespace": "other", "labels": { "team": "data" } },
                "spec": { "restartPolicy": "Always", "serviceAccountName": "runner" }
            }),
        );
        assert_eq!(pod["metadata"]["name"], "p");
        assert_eq!(pod["metadata"]["namespace"], "other");
        assert_eq!(pod["metadata"]["labels"]["app"], "x");
        assert_eq!(pod["metadata"]["labels"]["team"], "data");
        assert_eq!(pod["spec"]["restartPolicy"], "Always");
        assert_eq!(pod["spec"]["serviceAccountName"], "runner");
    }

    #[test]
    fn test_null_removes_key() {
        let mut pod = json!({ "spec": { "nodeSelector": { "disk": "ssd" }, "hostNetwork": false } });
        merge(&mut pod, &json!({ "spec": { "nodeSelector": null } }));
        assert!(pod["spec"].get("nodeSelector").is_none());
        assert_eq!(pod["spec"]["hostNetwork"], false);
    }

    #[test]
    fn test_env_merges_by_name() {
        let mut container = json!({ "env": [{ "name": "A", "value": "1" }, { "name": "B", "value": "2" }] });
        merge(
            &mut container,
            &json!({ "env": [{ "name": "B", "value": "patched" }, { "name": "C", "value": "3" }] }),
        );
        let env = container["env"].as_array().unwrap();
        assert_eq!(env.len(), 3);
        assert_eq!(env[1]["value"], "patched");
        assert_eq!(env[2]["name"], "C");
    }

    #[test]
    fn test_env_source_replaces_literal_value() {
        let mut container = json!({
            "env": [
                { "name": "TOKEN", "value": "generated" },
                { "name": "MODE", "valueFrom": { "configMapKeyRef": { "name": "m", "key": "mode" } } }
            ]
        });
        merge(
            &mut container,
            &json!({
                "env": [
                    { "name": "TOKEN", "valueFrom": { "secretKeyRef": { "name": "s", "key": "token" } } },
                    { "name": "MODE", "value": "batch" }
                ]
            }),
        );
        let env = container["env"].as_array().unwrap();
        assert_eq!(env.len(), 2);
        assert!(env[0].get("value").is_none());
        assert_eq!(env[0]["valueFrom"]["secretKeyRef"]["key"], "token");
        assert!(env[1].get("valueFrom").is_none());
        assert_eq!(env[1]["value"], "batch");
    }

    #[test]
    fn test_plain_lists_append_unique() {
        let mut value = json!({ "args": ["--a"] });
        merge(&mut value, &json!({ "args": ["--a", "--b"] }));
        assert_eq!(value["args"], json!(["--a", "--b"]));
    }
}
