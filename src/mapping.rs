//! Routing table from URL path prefixes to instance targets

use parking_lot::RwLock;
use serde::Serialize;
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RouteError {
    #[error("invalid route prefix '{0}'")]
    InvalidPrefix(String),
}

/// A single prefix → target entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Route {
    pub prefix: String,
    /// Base URL requests are forwarded to (`http://host:port`)
    pub target: String,
    pub instance_id: String,
}

/// Result of matching a request path
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedRoute {
    pub route: Route,
    /// Request path with the prefix stripped, always starting with `/`
    pub remaining_path: String,
}

/// Concurrent prefix table consulted on every proxied request.
///
/// Prefixes are normalized without a trailing slash and matched on whole
/// path segments, so `/endpoint/abc` never matches `/endpoint/abcdef`.
#[derive(Debug, Default)]
pub struct MappingTable {
    routes: RwLock<BTreeMap<String, Route>>,
}

impl MappingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace the route for `prefix`
    pub fn add_route(
        &self,
        instance_id: &str,
        prefix: &str,
        target: &str,
    ) -> Result<(), RouteError> {
        let prefix = normalize_prefix(prefix)?;
        debug!(instance_id, prefix = %prefix, target, "Adding route");
        self.routes.write().insert(
            prefix.clone(),
            Route {
                prefix,
                target: target.trim_end_matches('/').to_string(),
                instance_id: instance_id.to_string(),
            },
        );
        Ok(())
    }

    /// Remove a route; a missing prefix is a no-op
    pub fn remove_route(&self, prefix: &str) -> Option<Route> {
        let prefix = normalize_prefix(prefix).ok()?;
        let removed = self.routes.write().remove(&prefix);
        if removed.is_some() {
            debug!(prefix = %prefix, "Removed route");
        }
        removed
    }

    /// Remove every route owned by `instance_id`, returning them
    pub fn remove_owned_by(&self, instance_id: &str) -> Vec<Route> {
        let mut routes = self.routes.write();
        let prefixes: Vec<String> = routes
            .values()
            .filter(|r| r.instance_id == instance_id)
            .map(|r| r.prefix.clone())
            .collect();
        prefixes
            .into_iter()
            .filter_map(|p| routes.remove(&p))
            .collect()
    }

    /// Longest registered prefix matching `path` on a segment boundary
    pub fn resolve(&self, path: &str) -> Option<ResolvedRoute> {
        let routes = self.routes.read();
        let path = if path.is_empty() { "/" } else { path };

        let mut candidate = path.trim_end_matches('/');
        loop {
            if candidate.is_empty() {
                return None;
            }
            if let Some(route) = routes.get(candidate) {
                let rest = &path[candidate.len()..];
                let remaining_path = if rest.is_empty() {
                    "/".to_string()
                } else {
                    rest.to_string()
                };
                return Some(ResolvedRoute {
                    route: route.clone(),
                    remaining_path,
                });
            }
            match candidate.rfind('/') {
                Some(idx) => candidate = &candidate[..idx],
                None => return None,
            }
        }
    }

    /// Snapshot of all routes, ordered by prefix
    pub fn routes(&self) -> Vec<Route> {
        self.routes.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.routes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.read().is_empty()
    }
}

fn normalize_prefix(prefix: &str) -> Result<String, RouteError> {
    let trimmed = prefix.trim_end_matches('/');
    if trimmed.is_empty() {
        return Err(RouteError::InvalidPrefix(prefix.to_string()));
    }
    if trimmed.starts_with('/') {
        Ok(trimmed.to_string())
    } else {
        Ok(format!("/{}", trimmed))
    }
}
