//! Control API
//!
//! JSON endpoints for starting, stopping and listing instances. Requests
//! arrive here from the proxy server when no route matches. The caller is
//! identified by the `X-Gantry-User` / `X-Gantry-Groups` headers, which are
//! trusted because the whole API sits behind the bearer token.

use crate::catalog::SpecCatalog;
use crate::error::{json_error_response, LifecycleError, ProxyErrorCode};
use crate::lifecycle::LifecycleOrchestrator;
use crate::registry::Instance;
use crate::spec::UserContext;
use http_body_util::{combinators::BoxBody, BodyExt, Full, Limited};
use hyper::body::{Bytes, Incoming};
use hyper::header::{AUTHORIZATION, CONTENT_TYPE};
use hyper::{Method, Request, Response, StatusCode};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");

pub const USER_HEADER: &str = "x-gantry-user";
pub const GROUPS_HEADER: &str = "x-gantry-groups";

const MAX_BODY_BYTES: usize = 64 * 1024;

type ApiResponse = Response<BoxBody<Bytes, hyper::Error>>;

/// Shared state behind the control API
pub struct ApiState {
    pub catalog: Arc<SpecCatalog>,
    pub lifecycle: Arc<LifecycleOrchestrator>,
    auth_token: String,
}

impl ApiState {
    pub fn new(
        catalog: Arc<SpecCatalog>,
        lifecycle: Arc<LifecycleOrchestrator>,
        auth_token: String,
    ) -> Self {
        Self {
            catalog,
            lifecycle,
            auth_token,
        }
    }

    pub fn auth_token(&self) -> &str {
        &self.auth_token
    }
}

#[derive(Debug, Default, Deserialize)]
struct StartRequest {
    #[serde(default)]
    parameters: HashMap<String, String>,
}

fn json_response(status: StatusCode, body: serde_json::Value) -> ApiResponse {
    let mut response = Response::new(
        Full::new(Bytes::from(body.to_string()))
            .map_err(|never| match never {})
            .boxed(),
    );
    *response.status_mut() = status;
    response.headers_mut().insert(
        CONTENT_TYPE,
        hyper::header::HeaderValue::from_static("application/json"),
    );
    response
}

fn text_response(status: StatusCode, body: &'static str) -> ApiResponse {
    let mut response = Response::new(
        Full::new(Bytes::from_static(body.as_bytes()))
            .map_err(|never| match never {})
            .boxed(),
    );
    *response.status_mut() = status;
    response
}

fn check_auth(req: &Request<Incoming>, expected_token: &str) -> bool {
    req.headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(|auth| auth.strip_prefix("Bearer ").unwrap_or(auth).eq(expected_token))
        .unwrap_or(false)
}

/// Identity from the trusted user headers. Groups are comma separated.
fn user_context(req: &Request<Incoming>) -> Option<UserContext> {
    let id = req
        .headers()
        .get(USER_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|s| !s.is_empty())?;
    let groups = req
        .headers()
        .get(GROUPS_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(|groups| {
            groups
                .split(',')
                .map(str::trim)
                .filter(|g| !g.is_empty())
                .map(String::from)
                .collect()
        })
        .unwrap_or_default();
    Some(UserContext::new(id, groups))
}

fn query_flag(req: &Request<Incoming>, name: &str) -> bool {
    req.uri()
        .query()
        .map(|query| {
            query.split('&').any(|pair| match pair.split_once('=') {
                Some((key, value)) => key == name && (value == "true" || value == "1"),
                None => pair == name,
            })
        })
        .unwrap_or(false)
}

fn instance_json(instance: &Instance) -> serde_json::Value {
    serde_json::json!({
        "id": instance.id,
        "user_id": instance.user_id,
        "spec_id": instance.spec_id,
        "state": instance.state,
        "routes": instance.routes,
        "containers": instance.containers.iter().map(|c| serde_json::json!({
            "id": c.id,
            "ready": c.ready,
            "targets": c.targets,
        })).collect::<Vec<_>>(),
        "created_at": instance.created_at,
    })
}

/// Handle a request that did not match any instance route
pub async fn handle_api_request(req: Request<Incoming>, state: Arc<ApiState>) -> ApiResponse {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    debug!(%method, path, "API request");

    match (&method, path.as_str()) {
        (&Method::GET, "/health") => return text_response(StatusCode::OK, "ok"),
        (&Method::GET, "/version") => {
            return json_response(
                StatusCode::OK,
                serde_json::json!({ "name": PKG_NAME, "version": VERSION }),
            )
        }
        _ => {}
    }

    if !path.starts_with("/api/") {
        return json_error_response(ProxyErrorCode::NoRoute, "no route for path");
    }

    if !check_auth(&req, state.auth_token()) {
        warn!(path, "Unauthorized API request");
        return json_error_response(ProxyErrorCode::Unauthorized, "unauthorized");
    }

    let Some(user) = user_context(&req) else {
        return json_error_response(ProxyErrorCode::BadRequest, "missing X-Gantry-User header");
    };

    let segments: Vec<&str> = path
        .trim_start_matches("/api/")
        .split('/')
        .filter(|s| !s.is_empty())
        .collect();

    match (&method, segments.as_slice()) {
        (&Method::GET, ["specs"]) => list_specs(&state, &user),
        (&Method::GET, ["proxy"]) => {
            let all = query_flag(&req, "all");
            list_instances(&state, &user, all)
        }
        (&Method::GET, ["proxy", id]) => get_instance(&state, &user, id),
        (&Method::POST, ["proxy", spec_id]) => {
            let spec_id = spec_id.to_string();
            start_instance(req, &state, &user, &spec_id).await
        }
        (&Method::DELETE, ["proxy", id]) => {
            let force = query_flag(&req, "force");
            stop_instance(&state, &user, id, force).await
        }
        _ => json_error_response(ProxyErrorCode::NoRoute, "unknown API endpoint"),
    }
}

fn list_specs(state: &ApiState, user: &UserContext) -> ApiResponse {
    let specs: Vec<serde_json::Value> = state
        .catalog
        .list()
        .iter()
        .filter(|spec| spec.access.allows(user))
        .map(|spec| {
            serde_json::json!({
                "id": spec.id,
                "display_name": spec.display_name.as_deref().unwrap_or(&spec.id),
                "image": spec.image,
                "parameters": spec.parameters.iter().map(|p| serde_json::json!({
                    "name": p.name,
                    "default": p.default,
                    "allowed": p.allowed,
                })).collect::<Vec<_>>(),
            })
        })
        .collect();
    json_response(
        StatusCode::OK,
        serde_json::json!({ "count": specs.len(), "specs": specs }),
    )
}

fn list_instances(state: &ApiState, user: &UserContext, all: bool) -> ApiResponse {
    let registry = state.lifecycle.registry();
    let instances: Vec<serde_json::Value> = if all {
        registry.list(|_| true).map(|i| instance_json(&i)).collect()
    } else {
        registry
            .list_for_user(&user.id)
            .iter()
            .map(instance_json)
            .collect()
    };
    json_response(
        StatusCode::OK,
        serde_json::json!({ "count": instances.len(), "instances": instances }),
    )
}

fn get_instance(state: &ApiState, user: &UserContext, id: &str) -> ApiResponse {
    match state.lifecycle.registry().get(id) {
        Some(instance) if instance.user_id == user.id => {
            json_response(StatusCode::OK, instance_json(&instance))
        }
        _ => LifecycleError::NotFound(id.to_string()).to_response(),
    }
}

async fn start_instance(
    req: Request<Incoming>,
    state: &ApiState,
    user: &UserContext,
    spec_id: &str,
) -> ApiResponse {
    let Some(template) = state.catalog.get(spec_id) else {
        return LifecycleError::UnknownSpec(spec_id.to_string()).to_response();
    };

    let body = match Limited::new(req.into_body(), MAX_BODY_BYTES).collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            return json_error_response(
                ProxyErrorCode::BadRequest,
                format!("failed to read request body: {}", e),
            )
        }
    };
    let request: StartRequest = if body.is_empty() {
        StartRequest::default()
    } else {
        match serde_json::from_slice(&body) {
            Ok(request) => request,
            Err(e) => {
                return json_error_response(
                    ProxyErrorCode::BadRequest,
                    format!("invalid JSON body: {}", e),
                )
            }
        }
    };

    info!(user_id = %user.id, spec_id, "Start requested");
    match state
        .lifecycle
        .start(&template, user, &request.parameters)
        .await
    {
        Ok(instance) => json_response(StatusCode::CREATED, instance_json(&instance)),
        Err(e) => e.to_response(),
    }
}

async fn stop_instance(
    state: &ApiState,
    user: &UserContext,
    id: &str,
    force: bool,
) -> ApiResponse {
    match state.lifecycle.registry().get(id) {
        Some(instance) if instance.user_id == user.id => {}
        _ => return LifecycleError::NotFound(id.to_string()).to_response(),
    }

    info!(user_id = %user.id, instance_id = id, force, "Stop requested");
    match state.lifecycle.stop(id, force).await {
        Ok(()) => json_response(
            StatusCode::OK,
            serde_json::json!({ "id": id, "state": "stopped" }),
        ),
        Err(e) => e.to_response(),
    }
}
