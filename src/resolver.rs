//! Turns an application template into a concrete per-launch spec
//!
//! Placeholders use `${name}`; `$$` produces a literal `$`. Known names are
//! `user.id`, `user.groups`, `instance.id`, `spec.id` and `param.<name>`.

use crate::spec::{
    ApplicationSpec, EnvValue, ResolvedSpec, UserContext, Volume, VolumeSource,
};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use thiserror::Error;

/// Environment variable carrying the launching user's id
pub const ENV_USERNAME: &str = "GANTRY_USERNAME";
/// Environment variable carrying the launching user's groups
pub const ENV_USERGROUPS: &str = "GANTRY_USERGROUPS";
/// Environment variable carrying the instance id
pub const ENV_INSTANCE_ID: &str = "GANTRY_INSTANCE_ID";

/// Reasons a template cannot be resolved for a launch
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SpecError {
    #[error("user '{user_id}' may not launch spec '{spec_id}'")]
    AccessDenied { spec_id: String, user_id: String },

    #[error("undefined placeholder '${{{0}}}'")]
    UndefinedPlaceholder(String),

    #[error("unterminated placeholder in '{0}'")]
    UnterminatedPlaceholder(String),

    #[error("unknown parameter '{0}'")]
    UnknownParameter(String),

    #[error("value '{value}' is not allowed for parameter '{name}'")]
    DisallowedParameter { name: String, value: String },

    #[error("parameter '{0}' has no default and was not supplied")]
    MissingParameter(String),

    #[error("{0}")]
    Invalid(String),
}

/// Decides whether a user may launch a template
pub trait AccessControl: Send + Sync {
    fn is_allowed(&self, spec: &ApplicationSpec, user: &UserContext) -> bool;
}

/// Checks the template's own `access` lists
#[derive(Debug, Default, Clone, Copy)]
pub struct SpecAccess;

impl AccessControl for SpecAccess {
    fn is_allowed(&self, spec: &ApplicationSpec, user: &UserContext) -> bool {
        spec.access.allows(user)
    }
}

/// Resolve `template` for one launch by `user`.
pub fn resolve(
    template: &ApplicationSpec,
    user: &UserContext,
    parameters: &HashMap<String, String>,
    instance_id: &str,
    access: &dyn AccessControl,
) -> Result<ResolvedSpec, SpecError> {
    if !access.is_allowed(template, user) {
        return Err(SpecError::AccessDenied {
            spec_id: template.id.clone(),
            user_id: user.id.clone(),
        });
    }

    let effective = effective_parameters(template, parameters)?;

    let mut vars = BTreeMap::new();
    vars.insert("user.id".to_string(), user.id.clone());
    vars.insert("user.groups".to_string(), user.groups.join(","));
    vars.insert("instance.id".to_string(), instance_id.to_string());
    vars.insert("spec.id".to_string(), template.id.clone());
    for (name, value) in &effective {
        vars.insert(format!("param.{}", name), value.clone());
    }

    let command = match template.command {
        Some(ref command) => command.to_argv().map_err(SpecError::Invalid)?,
        None => Vec::new(),
    };
    let command = substitute_all(&command, &vars)?;
    let args = substitute_all(&template.args, &vars)?;

    let mut env = BTreeMap::new();
    for (name, value) in &template.env {
        let value = match value {
            EnvValue::Literal(v) => EnvValue::Literal(substitute(v, &vars)?),
            EnvValue::SecretKey { name, key } => EnvValue::SecretKey {
                name: substitute(name, &vars)?,
                key: substitute(key, &vars)?,
            },
            EnvValue::ConfigMapKey { name, key } => EnvValue::ConfigMapKey {
                name: substitute(name, &vars)?,
                key: substitute(key, &vars)?,
            },
            EnvValue::Unset => EnvValue::Unset,
        };
        env.insert(name.clone(), value);
    }
    for (name, value) in [
        (ENV_USERNAME, user.id.clone()),
        (ENV_USERGROUPS, user.groups.join(",")),
        (ENV_INSTANCE_ID, instance_id.to_string()),
    ] {
        env.entry(name.to_string())
            .or_insert(EnvValue::Literal(value));
    }

    let mut volumes = Vec::with_capacity(template.volumes.len());
    for volume in &template.volumes {
        let source = match volume.source {
            VolumeSource::HostPath(ref path) => VolumeSource::HostPath(substitute(path, &vars)?),
            VolumeSource::Claim(ref claim) => VolumeSource::Claim(substitute(claim, &vars)?),
        };
        volumes.push(Volume {
            source,
            mount_path: substitute(&volume.mount_path, &vars)?,
            read_only: volume.read_only,
        });
    }

    let mut labels = BTreeMap::new();
    for (key, value) in &template.labels {
        labels.insert(substitute(key, &vars)?, substitute(value, &vars)?);
    }

    let pod_patch = match template.kubernetes.pod_patches {
        Some(ref patch) => Some(substitute_value(&patch.0, &vars)?),
        None => None,
    };
    let manifests = template
        .kubernetes
        .manifests()
        .map(|m| substitute_value(m, &vars))
        .collect::<Result<Vec<_>, _>>()?;

    let network = match template.network {
        Some(ref network) => Some(substitute(network, &vars)?),
        None => None,
    };

    Ok(ResolvedSpec {
        spec_id: template.id.clone(),
        instance_id: instance_id.to_string(),
        user_id: user.id.clone(),
        user_groups: user.groups.clone(),
        image: substitute(&template.image, &vars)?,
        command,
        args,
        env: env.into_iter().collect(),
        volumes,
        resources: template.resources.clone(),
        privileged: template.privileged,
        ports: template.all_ports(),
        network,
        labels,
        pod_patch,
        manifests,
        parameters: effective,
    })
}

/// Declared parameters with defaults applied and caller values validated
fn effective_parameters(
    template: &ApplicationSpec,
    supplied: &HashMap<String, String>,
) -> Result<BTreeMap<String, String>, SpecError> {
    for name in supplied.keys() {
        if !template.parameters.iter().any(|p| &p.name == name) {
            return Err(SpecError::UnknownParameter(name.clone()));
        }
    }

    let mut effective = BTreeMap::new();
    for parameter in &template.parameters {
        let value = match supplied.get(&parameter.name).or(parameter.default.as_ref()) {
            Some(value) => value.clone(),
            None => return Err(SpecError::MissingParameter(parameter.name.clone())),
        };
        if !parameter.accepts(&value) {
            return Err(SpecError::DisallowedParameter {
                name: parameter.name.clone(),
                value,
            });
        }
        effective.insert(parameter.name.clone(), value);
    }
    Ok(effective)
}

fn substitute_all(
    inputs: &[String],
    vars: &BTreeMap<String, String>,
) -> Result<Vec<String>, SpecError> {
    inputs.iter().map(|s| substitute(s, vars)).collect()
}

/// Replace every placeholder in `input`
pub fn substitute(input: &str, vars: &BTreeMap<String, String>) -> Result<String, SpecError> {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(pos) = rest.find('$') {
        out.push_str(&rest[..pos]);
        let tail = &rest[pos + 1..];
        if let Some(after) = tail.strip_prefix('$') {
            out.push('$');
            rest = after;
        } else if let Some(body) = tail.strip_prefix('{') {
            let end = body
                .find('}')
                .ok_or_else(|| SpecError::UnterminatedPlaceholder(input.to_string()))?;
            let name = body[..end].trim();
            let value = vars
                .get(name)
                .ok_or_else(|| SpecError::UndefinedPlaceholder(name.to_string()))?;
            out.push_str(value);
            rest = &body[end + 1..];
        } else {
            out.push('$');
            rest = tail;
        }
    }
    out.push_str(rest);
    Ok(out)
}

/// Substitute every string leaf (and mapping key) of a YAML/JSON tree
fn substitute_value(value: &Value, vars: &BTreeMap<String, String>) -> Result<Value, SpecError> {
    Ok(match value {
        Value::String(s) => Value::String(substitute(s, vars)?),
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|v| substitute_value(v, vars))
                .collect::<Result<_, _>>()?,
        ),
        Value::Object(map) => {
            let mut out = serde_json::Map::with_capacity(map.len());
            for (key, v) in map {
                out.insert(substitute(key, vars)?, substitute_value(v, vars)?);
            }
            Value::Object(out)
        }
        other => other.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spec::{CommandLine, ParameterSpec, YamlDocument, YamlDocuments};

    fn vars() -> BTreeMap<String, String> {
        let mut vars = BTreeMap::new();
        vars.insert("user.id".to_string(), "jack".to_string());
        vars.insert("instance.id".to_string(), "abc".to_string());
        vars
    }

    fn user() -> UserContext {
        UserContext::new("jack", vec!["scientists".to_string(), "ops".to_string()])
    }

    #[test]
    fn test_substitute() {
        let vars = vars();
        assert_eq!(substitute("/home/${user.id}", &vars).unwrap(), "/home/jack");
        assert_eq!(substitute("${ user.id }-${instance.id}", &vars).unwrap(), "jack-abc");
        assert_eq!(substitute("cost: $$5", &vars).unwrap(), "cost: $5");
        assert_eq!(substitute("plain $HOME", &vars).unwrap(), "plain $HOME");
        assert_eq!(substitute("trailing $", &vars).unwrap(), "trailing $");
        assert_eq!(
            substitute("${user.name}", &vars),
            Err(SpecError::UndefinedPlaceholder("user.name".to_string()))
        );
        assert!(matches!(
            substitute("${user.id", &vars),
            Err(SpecError::UnterminatedPlaceholder(_))
        ));
    }

    #[test]
    fn test_resolve_substitutes_everywhere() {
        let mut template = ApplicationSpec::new("notebook", "jupyter/base", 8888);
        template.command = Some(CommandLine::Shell(
            "start.sh --user ${user.id}".to_string(),
        ));
        template.args = vec!["--groups=${user.groups}".to_string()];
        template
            .env
            .insert("HOME_DIR".to_string(), EnvValue::Literal("/home/${user.id}".to_string()));
        template.env.insert(
            "TOKEN".to_string(),
            EnvValue::SecretKey {
                name: "token-${user.id}".to_string(),
                key: "value".to_string(),
            },
        );
        template
            .volumes
            .push(Volume::host_path("/srv/${user.id}", "/home/${user.id}"));
        template
            .labels
            .insert("owner".to_string(), "${user.id}".to_string());
        template.kubernetes.pod_patches = Some(
            YamlDocument::try_from(
                "metadata:\n  labels:\n    instance: ${instance.id}\n".to_string(),
            )
            .unwrap(),
        );
        template.kubernetes.additional_manifests.push(
            YamlDocuments::try_from(
                "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: cfg-${user.id}\n".to_string(),
            )
            .unwrap(),
        );

        let resolved =
            resolve(&template, &user(), &HashMap::new(), "inst-1", &SpecAccess).unwrap();

        assert_eq!(resolved.command, vec!["start.sh", "--user", "jack"]);
        assert_eq!(resolved.args, vec!["--groups=scientists,ops"]);
        let env: BTreeMap<_, _> = resolved.env.iter().cloned().collect();
        assert_eq!(env["HOME_DIR"], EnvValue::Literal("/home/jack".to_string()));
        assert_eq!(
            env["TOKEN"],
            EnvValue::SecretKey {
                name: "token-jack".to_string(),
                key: "value".to_string()
            }
        );
        assert_eq!(env[ENV_USERNAME], EnvValue::Literal("jack".to_string()));
        assert_eq!(env[ENV_INSTANCE_ID], EnvValue::Literal("inst-1".to_string()));
        assert_eq!(resolved.volumes[0], Volume::host_path("/srv/jack", "/home/jack"));
        assert_eq!(resolved.labels["owner"], "jack");
        assert_eq!(
            resolved.pod_patch.unwrap().pointer("/metadata/labels/instance").unwrap(),
            "inst-1"
        );
        assert_eq!(resolved.manifests[0]["metadata"]["name"], "cfg-jack");
        assert_eq!(resolved.ports[0].port, 8888);
    }

    #[test]
    fn test_template_declared_env_wins_over_injected() {
        let mut template = ApplicationSpec::new("app", "img", 80);
        template.env.insert(
            ENV_USERNAME.to_string(),
            EnvValue::Literal("fixed".to_string()),
        );
        let resolved = resolve(&template, &user(), &HashMap::new(), "i", &SpecAccess).unwrap();
        let env: BTreeMap<_, _> = resolved.env.into_iter().collect();
        assert_eq!(env[ENV_USERNAME], EnvValue::Literal("fixed".to_string()));
    }

    #[test]
    fn test_parameters() {
        let mut template = ApplicationSpec::new("app", "img:${param.version}", 80);
        template.parameters.push(ParameterSpec {
            name: "version".to_string(),
            default: Some("1".to_string()),
            allowed: vec!["1".to_string(), "2".to_string()],
        });

        let resolved = resolve(&template, &user(), &HashMap::new(), "i", &SpecAccess).unwrap();
        assert_eq!(resolved.image, "img:1");

        let mut params = HashMap::new();
        params.insert("version".to_string(), "2".to_string());
        let resolved = resolve(&template, &user(), &params, "i", &SpecAccess).unwrap();
        assert_eq!(resolved.image, "img:2");

        params.insert("version".to_string(), "3".to_string());
        assert!(matches!(
            resolve(&template, &user(), &params, "i", &SpecAccess),
            Err(SpecError::DisallowedParameter { .. })
        ));

        let mut params = HashMap::new();
        params.insert("color".to_string(), "red".to_string());
        assert_eq!(
            resolve(&template, &user(), &params, "i", &SpecAccess).unwrap_err(),
            SpecError::UnknownParameter("color".to_string())
        );
    }

    #[test]
    fn test_access_denied() {
        let mut template = ApplicationSpec::new("app", "img", 80);
        template.access.groups = vec!["admins".to_string()];
        assert!(matches!(
            resolve(&template, &user(), &HashMap::new(), "i", &SpecAccess),
            Err(SpecError::AccessDenied { .. })
        ));
    }

    #[test]
    fn test_undefined_placeholder_in_manifest_fails() {
        let mut template = ApplicationSpec::new("app", "img", 80);
        template.kubernetes.additional_manifests.push(
            YamlDocuments::try_from(
                "apiVersion: v1\nkind: Secret\nmetadata:\n  name: s-${user.nickname}\n".to_string(),
            )
            .unwrap(),
        );
        assert_eq!(
            resolve(&template, &user(), &HashMap::new(), "i", &SpecAccess).unwrap_err(),
            SpecError::UndefinedPlaceholder("user.nickname".to_string())
        );
    }
}
