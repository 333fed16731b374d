//! Start/stop coordination
//!
//! The orchestrator is the only component that mutates the registry and the
//! mapping table. A start goes resolve → provision → readiness → routes → `Up`;
//! a stop removes routes first, then tears the backend down. Every failure
//! path leaves the instance terminal and removed.

use crate::backend::{BackendDriver, BackendError, ContainerRecord};
use crate::config::LifecycleConfig;
use crate::error::{LifecycleError, Phase};
use crate::events::{Event, EventSink, EventType};
use crate::mapping::MappingTable;
use crate::registry::{Instance, InstanceState, ProxyRegistry};
use crate::resolver::{self, AccessControl, SpecAccess};
use crate::spec::{ApplicationSpec, ResolvedSpec, UserContext, DEFAULT_MAPPING};
use chrono::Utc;
use futures::future::join_all;
use serde_json::json;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Timing and routing settings for the orchestrator
#[derive(Debug, Clone)]
pub struct LifecycleSettings {
    pub startup_timeout: Duration,
    pub ready_poll_interval: Duration,
    pub stop_wait_timeout: Duration,
    pub endpoint_prefix: String,
}

impl Default for LifecycleSettings {
    fn default() -> Self {
        Self::from(&LifecycleConfig::default())
    }
}

impl From<&LifecycleConfig> for LifecycleSettings {
    fn from(config: &LifecycleConfig) -> Self {
        Self {
            startup_timeout: config.startup_timeout(),
            ready_poll_interval: config.ready_poll_interval(),
            stop_wait_timeout: config.stop_wait_timeout(),
            endpoint_prefix: config.endpoint_prefix.trim_end_matches('/').to_string(),
        }
    }
}

pub struct LifecycleOrchestrator {
    driver: Arc<dyn BackendDriver>,
    registry: Arc<ProxyRegistry>,
    mappings: Arc<MappingTable>,
    events: Arc<dyn EventSink>,
    access: Arc<dyn AccessControl>,
    settings: LifecycleSettings,
}

impl LifecycleOrchestrator {
    pub fn new(
        driver: Arc<dyn BackendDriver>,
        registry: Arc<ProxyRegistry>,
        mappings: Arc<MappingTable>,
        events: Arc<dyn EventSink>,
        settings: LifecycleSettings,
    ) -> Self {
        Self {
            driver,
            registry,
            mappings,
            events,
            access: Arc::new(SpecAccess),
            settings,
        }
    }

    /// Replace the default access check
    pub fn with_access(mut self, access: Arc<dyn AccessControl>) -> Self {
        self.access = access;
        self
    }

    pub fn registry(&self) -> &Arc<ProxyRegistry> {
        &self.registry
    }

    pub fn mappings(&self) -> &Arc<MappingTable> {
        &self.mappings
    }

    pub fn settings(&self) -> &LifecycleSettings {
        &self.settings
    }

    /// Path prefix of an instance's route for `mapping`
    pub fn route_prefix(&self, instance_id: &str, mapping: &str) -> String {
        if mapping == DEFAULT_MAPPING {
            format!("{}/{}", self.settings.endpoint_prefix, instance_id)
        } else {
            format!("{}/{}/{}", self.settings.endpoint_prefix, instance_id, mapping)
        }
    }

    /// Launch a new instance of `template` for `user`
    pub async fn start(
        &self,
        template: &ApplicationSpec,
        user: &UserContext,
        parameters: &HashMap<String, String>,
    ) -> Result<Instance, LifecycleError> {
        if !self.access.is_allowed(template, user) {
            return Err(resolver::SpecError::AccessDenied {
                spec_id: template.id.clone(),
                user_id: user.id.clone(),
            }
            .into());
        }
        let instance = self.registry.reserve(&user.id, &template.id);
        self.start_reserved(&instance.id, template, user, parameters)
            .await
    }

    /// Launch an instance previously created with [`ProxyRegistry::reserve`].
    /// Only one caller can move it out of `New`; others get a conflict.
    pub async fn start_reserved(
        &self,
        instance_id: &str,
        template: &ApplicationSpec,
        user: &UserContext,
        parameters: &HashMap<String, String>,
    ) -> Result<Instance, LifecycleError> {
        if self.registry.state(instance_id).is_none() {
            return Err(LifecycleError::NotFound(instance_id.to_string()));
        }

        let resolved = match resolver::resolve(
            template,
            user,
            parameters,
            instance_id,
            self.access.as_ref(),
        ) {
            Ok(resolved) => Arc::new(resolved),
            Err(e) => {
                warn!(instance_id, spec_id = %template.id, error = %e, "Spec resolution failed");
                if self
                    .registry
                    .transition(instance_id, InstanceState::New, InstanceState::Failed)
                {
                    self.registry.remove(instance_id);
                }
                return Err(e.into());
            }
        };

        if !self
            .registry
            .transition(instance_id, InstanceState::New, InstanceState::Starting)
        {
            return Err(self.conflict(instance_id));
        }
        self.registry.update(instance_id, |i| i.spec = Some(resolved.clone()));

        if self.registry.is_cancel_requested(instance_id) {
            let error = LifecycleError::Cancelled(instance_id.to_string());
            return Err(self.abort_start(instance_id, &resolved, &[], error).await);
        }

        info!(
            instance_id,
            user_id = %user.id,
            spec_id = %template.id,
            backend = self.driver.kind(),
            "Starting instance"
        );

        let containers = match self.driver.provision(&resolved).await {
            Ok(containers) => containers,
            Err(e) => {
                let error = LifecycleError::Provision {
                    instance_id: instance_id.to_string(),
                    phase: Phase::Provision,
                    source: e,
                };
                return Err(self.abort_start(instance_id, &resolved, &[], error).await);
            }
        };
        self.registry
            .update(instance_id, |i| i.containers = containers.clone());

        let containers = match self.wait_ready(instance_id, containers.clone()).await {
            Ok(containers) => containers,
            Err(e) => {
                return Err(self
                    .abort_start(instance_id, &resolved, &containers, e)
                    .await)
            }
        };
        self.registry
            .update(instance_id, |i| i.containers = containers.clone());

        if self.registry.is_cancel_requested(instance_id) {
            let error = LifecycleError::Cancelled(instance_id.to_string());
            return Err(self
                .abort_start(instance_id, &resolved, &containers, error)
                .await);
        }

        let prefixes = match self.add_routes(instance_id, &containers) {
            Ok(prefixes) => prefixes,
            Err(e) => {
                return Err(self
                    .abort_start(instance_id, &resolved, &containers, e)
                    .await)
            }
        };
        self.registry
            .update(instance_id, |i| i.routes = prefixes.clone());

        if self.registry.is_cancel_requested(instance_id)
            || !self
                .registry
                .transition(instance_id, InstanceState::Starting, InstanceState::Up)
        {
            let error = LifecycleError::Cancelled(instance_id.to_string());
            return Err(self
                .abort_start(instance_id, &resolved, &containers, error)
                .await);
        }

        info!(instance_id, routes = ?prefixes, "Instance is up");
        self.events.post(
            Event::new(EventType::ProxyStart, &user.id, instance_id, &template.id)
                .with_data(json!({ "routes": prefixes })),
        );

        self.registry
            .get(instance_id)
            .ok_or_else(|| LifecycleError::NotFound(instance_id.to_string()))
    }

    /// Poll readiness until every container is ready, the start is
    /// cancelled, or the startup timeout expires
    async fn wait_ready(
        &self,
        instance_id: &str,
        mut containers: Vec<ContainerRecord>,
    ) -> Result<Vec<ContainerRecord>, LifecycleError> {
        let deadline = Instant::now() + self.settings.startup_timeout;
        let timeout_error = || LifecycleError::ReadinessTimeout {
            instance_id: instance_id.to_string(),
            timeout_secs: self.settings.startup_timeout.as_secs(),
        };

        loop {
            if self.registry.is_cancel_requested(instance_id) {
                return Err(LifecycleError::Cancelled(instance_id.to_string()));
            }

            let mut all_ready = true;
            for container in containers.iter_mut().filter(|c| !c.ready) {
                match tokio::time::timeout_at(deadline, self.driver.is_ready(container)).await {
                    Ok(Ok(true)) => {
                        debug!(instance_id, container_id = %container.id, "Container ready");
                    }
                    Ok(Ok(false)) => all_ready = false,
                    Ok(Err(e)) => {
                        return Err(LifecycleError::Provision {
                            instance_id: instance_id.to_string(),
                            phase: Phase::Readiness,
                            source: e,
                        })
                    }
                    Err(_) => return Err(timeout_error()),
                }
            }
            if all_ready {
                return Ok(containers);
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(timeout_error());
            }
            tokio::time::sleep(self.settings.ready_poll_interval.min(deadline - now)).await;
        }
    }

    /// Register one route per named target. On error no route is left behind.
    fn add_routes(
        &self,
        instance_id: &str,
        containers: &[ContainerRecord],
    ) -> Result<Vec<String>, LifecycleError> {
        let mut targets: BTreeMap<&str, &str> = BTreeMap::new();
        for container in containers {
            for (mapping, target) in &container.targets {
                targets.entry(mapping.as_str()).or_insert(target.as_str());
            }
        }
        if targets.is_empty() {
            return Err(LifecycleError::Provision {
                instance_id: instance_id.to_string(),
                phase: Phase::Routing,
                source: BackendError::Invalid("backend reported no network targets".to_string()),
            });
        }

        let mut prefixes = Vec::with_capacity(targets.len());
        for (mapping, target) in targets {
            let prefix = self.route_prefix(instance_id, mapping);
            if let Err(e) = self.mappings.add_route(instance_id, &prefix, target) {
                self.mappings.remove_owned_by(instance_id);
                return Err(LifecycleError::Routing {
                    instance_id: instance_id.to_string(),
                    source: e,
                });
            }
            prefixes.push(prefix);
        }
        Ok(prefixes)
    }

    /// Undo a failed start: drop routes, tear down whatever was created,
    /// move to `Failed` and remove the instance. `containers` are the records
    /// the start holds itself; they are torn down even if the registry entry
    /// is already gone.
    async fn abort_start(
        &self,
        instance_id: &str,
        resolved: &ResolvedSpec,
        containers: &[ContainerRecord],
        error: LifecycleError,
    ) -> LifecycleError {
        warn!(instance_id, error = %error, "Start failed, cleaning up");
        self.mappings.remove_owned_by(instance_id);

        let mut instance = self.registry.get(instance_id).unwrap_or_else(|| Instance {
            id: instance_id.to_string(),
            user_id: resolved.user_id.clone(),
            spec_id: resolved.spec_id.clone(),
            spec: None,
            state: InstanceState::Failed,
            containers: Vec::new(),
            routes: Vec::new(),
            created_at: Utc::now(),
        });
        if !containers.is_empty() {
            instance.containers = containers.to_vec();
        }

        if !instance.containers.is_empty() {
            if let Err(e) = self.driver.deprovision(&instance).await {
                error!(instance_id, error = %e, "Cleanup after failed start failed");
            }
        }
        if self
            .registry
            .transition(instance_id, InstanceState::Starting, InstanceState::Failed)
        {
            self.registry.remove(instance_id);
        }
        self.events.post(
            Event::new(
                EventType::ProxyStartFailed,
                &instance.user_id,
                instance_id,
                &instance.spec_id,
            )
            .with_data(json!({ "error": error.to_string(), "code": error.code() })),
        );
        error
    }

    /// Stop an instance. With `force`, an instance already `Stopping` (or a
    /// start that does not settle in time) is torn down anyway.
    pub async fn stop(&self, instance_id: &str, force: bool) -> Result<(), LifecycleError> {
        let mut waited = false;
        loop {
            let Some(state) = self.registry.state(instance_id) else {
                return if waited {
                    Ok(())
                } else {
                    Err(LifecycleError::NotFound(instance_id.to_string()))
                };
            };
            match state {
                InstanceState::New => {
                    if self.registry.transition(
                        instance_id,
                        InstanceState::New,
                        InstanceState::Failed,
                    ) {
                        self.registry.remove(instance_id);
                        debug!(instance_id, "Stopped instance that never started");
                        return Ok(());
                    }
                }
                InstanceState::Starting => {
                    self.registry.request_cancel(instance_id);
                    waited = true;
                    if !self.wait_for_start(instance_id).await {
                        if !force {
                            return Err(self.conflict(instance_id));
                        }
                        warn!(instance_id, "Start did not settle, forcing teardown");
                        return self.force_cancel_start(instance_id).await;
                    }
                }
                InstanceState::Up => {
                    if self
                        .registry
                        .transition(instance_id, InstanceState::Up, InstanceState::Stopping)
                    {
                        break;
                    }
                }
                InstanceState::Stopping => {
                    if force {
                        break;
                    }
                    return Err(self.conflict(instance_id));
                }
                InstanceState::Stopped | InstanceState::Failed => return Ok(()),
            }
        }

        self.teardown(instance_id).await
    }

    /// Wait until a start leaves `New`/`Starting`. False on timeout.
    async fn wait_for_start(&self, instance_id: &str) -> bool {
        let Some(mut rx) = self.registry.subscribe(instance_id) else {
            return true;
        };
        let settled = async {
            loop {
                let state = *rx.borrow_and_update();
                if !matches!(state, InstanceState::New | InstanceState::Starting) {
                    return;
                }
                if rx.changed().await.is_err() {
                    return;
                }
            }
        };
        tokio::time::timeout(self.settings.stop_wait_timeout, settled)
            .await
            .is_ok()
    }

    /// Tear down what a stuck start has created so far. The slot stays in
    /// `Starting` with its cancel flag set; the start removes it once its
    /// in-flight backend call returns, deprovisioning anything that call made.
    async fn force_cancel_start(&self, instance_id: &str) -> Result<(), LifecycleError> {
        self.mappings.remove_owned_by(instance_id);
        let Some(instance) = self.registry.get(instance_id) else {
            return Ok(());
        };
        if instance.containers.is_empty() {
            return Ok(());
        }
        self.driver
            .deprovision(&instance)
            .await
            .map_err(|e| LifecycleError::Deprovision {
                instance_id: instance_id.to_string(),
                source: e,
            })
    }

    /// Routes first, then the backend, then the registry entry
    async fn teardown(&self, instance_id: &str) -> Result<(), LifecycleError> {
        let removed = self.mappings.remove_owned_by(instance_id);
        debug!(instance_id, routes = removed.len(), "Removed routes");

        let Some(instance) = self.registry.get(instance_id) else {
            return Ok(());
        };

        let result = if instance.containers.is_empty() {
            Ok(())
        } else {
            self.driver.deprovision(&instance).await
        };

        let final_state = if result.is_ok() {
            InstanceState::Stopped
        } else {
            InstanceState::Failed
        };
        if self.registry.state(instance_id) == Some(InstanceState::Stopping) {
            self.registry
                .transition(instance_id, InstanceState::Stopping, final_state);
        }
        self.registry.remove(instance_id);

        match result {
            Ok(()) => {
                info!(instance_id, "Instance stopped");
                self.events.post(Event::new(
                    EventType::ProxyStop,
                    &instance.user_id,
                    instance_id,
                    &instance.spec_id,
                ));
                Ok(())
            }
            Err(e) => {
                error!(instance_id, error = %e, "Backend teardown failed");
                self.events.post(
                    Event::new(
                        EventType::ProxyStopFailed,
                        &instance.user_id,
                        instance_id,
                        &instance.spec_id,
                    )
                    .with_data(json!({ "error": e.to_string() })),
                );
                Err(LifecycleError::Deprovision {
                    instance_id: instance_id.to_string(),
                    source: e,
                })
            }
        }
    }

    /// Stop every `Up` instance, in parallel. Returns the number of
    /// instances that were stopped cleanly.
    pub async fn stop_all(&self) -> usize {
        let ids: Vec<String> = self
            .registry
            .list(|i| i.state == InstanceState::Up)
            .map(|i| i.id)
            .collect();
        if ids.is_empty() {
            return 0;
        }
        info!(count = ids.len(), "Stopping all instances");

        let results = join_all(ids.iter().map(|id| self.stop(id, false))).await;
        let mut stopped = 0;
        for (id, result) in ids.iter().zip(results) {
            match result {
                Ok(()) => stopped += 1,
                Err(e) => warn!(instance_id = %id, error = %e, "Failed to stop instance"),
            }
        }
        stopped
    }

    /// Rebuild registry and routes from workloads the backend still runs.
    /// Workloads that are not ready are torn down.
    pub async fn recover(&self) -> anyhow::Result<usize> {
        let found = self.driver.recover().await?;
        let mut recovered = 0;

        for found in found {
            if self.registry.state(&found.instance_id).is_some() {
                continue;
            }
            let mut instance = Instance {
                id: found.instance_id.clone(),
                user_id: found.user_id.clone(),
                spec_id: found.spec_id.clone(),
                spec: None,
                state: InstanceState::Up,
                containers: found.containers,
                routes: Vec::new(),
                created_at: found.created_at.unwrap_or_else(Utc::now),
            };

            let mut ready = true;
            for container in instance.containers.iter_mut() {
                match self.driver.is_ready(container).await {
                    Ok(true) => {}
                    Ok(false) => ready = false,
                    Err(e) => {
                        warn!(instance_id = %instance.id, error = %e, "Recovered workload is broken");
                        ready = false;
                    }
                }
            }

            if !ready {
                warn!(instance_id = %instance.id, "Removing recovered workload that is not ready");
                if let Err(e) = self.driver.deprovision(&instance).await {
                    error!(instance_id = %instance.id, error = %e, "Failed to remove workload");
                }
                continue;
            }

            if !self.registry.insert_recovered(instance.clone()) {
                continue;
            }
            match self.add_routes(&instance.id, &instance.containers) {
                Ok(prefixes) => {
                    self.registry
                        .update(&instance.id, |i| i.routes = prefixes.clone());
                    info!(
                        instance_id = %instance.id,
                        user_id = %instance.user_id,
                        routes = ?prefixes,
                        "Recovered instance"
                    );
                    self.events.post(Event::new(
                        EventType::ProxyRecovered,
                        &instance.user_id,
                        &instance.id,
                        &instance.spec_id,
                    ));
                    recovered += 1;
                }
                Err(e) => {
                    warn!(instance_id = %instance.id, error = %e, "Could not route recovered instance");
                    if self.registry.transition(
                        &instance.id,
                        InstanceState::Up,
                        InstanceState::Stopping,
                    ) {
                        let _ = self.teardown(&instance.id).await;
                    }
                }
            }
        }

        Ok(recovered)
    }

    fn conflict(&self, instance_id: &str) -> LifecycleError {
        LifecycleError::ConcurrencyConflict {
            instance_id: instance_id.to_string(),
            state: self
                .registry
                .state(instance_id)
                .map(|s| s.to_string())
                .unwrap_or_else(|| "gone".to_string()),
        }
    }
}
