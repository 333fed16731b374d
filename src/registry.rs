//! Authoritative set of live instances
//!
//! Every instance sits in its own slot behind a `parking_lot::Mutex`, so
//! transitions on one instance never block another. State changes are also
//! published on a `watch` channel per instance for callers that need to wait
//! for a start to settle.

use crate::backend::ContainerRecord;
use crate::spec::ResolvedSpec;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, warn};

/// Lifecycle state of an instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceState {
    /// Reserved, nothing created yet
    New,
    /// Backend resources are being created
    Starting,
    /// Ready and routed
    Up,
    /// Routes removed, backend teardown in progress
    Stopping,
    /// Fully torn down
    Stopped,
    /// Start or stop failed; cleanup was attempted
    Failed,
}

impl InstanceState {
    pub fn is_terminal(self) -> bool {
        matches!(self, InstanceState::Stopped | InstanceState::Failed)
    }

    /// Whether `self → to` is an edge of the state machine
    pub fn can_transition_to(self, to: InstanceState) -> bool {
        use InstanceState::*;
        matches!(
            (self, to),
            (New, Starting)
                | (Starting, Up)
                | (Up, Stopping)
                | (Stopping, Stopped)
                | (New, Failed)
                | (Starting, Failed)
                | (Stopping, Failed)
        )
    }
}

impl std::fmt::Display for InstanceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            InstanceState::New => "new",
            InstanceState::Starting => "starting",
            InstanceState::Up => "up",
            InstanceState::Stopping => "stopping",
            InstanceState::Stopped => "stopped",
            InstanceState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// One running or transitioning application instance
#[derive(Debug, Clone, Serialize)]
pub struct Instance {
    pub id: String,
    pub user_id: String,
    pub spec_id: String,
    /// Absent for instances recovered from the backend at startup
    #[serde(skip)]
    pub spec: Option<Arc<ResolvedSpec>>,
    pub state: InstanceState,
    pub containers: Vec<ContainerRecord>,
    /// Route prefixes owned by this instance
    pub routes: Vec<String>,
    pub created_at: DateTime<Utc>,
}

struct InstanceSlot {
    instance: Mutex<Instance>,
    state_tx: watch::Sender<InstanceState>,
    cancel_requested: AtomicBool,
}

/// Registry of instances keyed by id, with a per-user index
#[derive(Default)]
pub struct ProxyRegistry {
    instances: DashMap<String, Arc<InstanceSlot>>,
    by_user: DashMap<String, HashSet<String>>,
}

impl ProxyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve a fresh instance in state `New`
    pub fn reserve(&self, user_id: &str, spec_id: &str) -> Instance {
        let instance = Instance {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            spec_id: spec_id.to_string(),
            spec: None,
            state: InstanceState::New,
            containers: Vec::new(),
            routes: Vec::new(),
            created_at: Utc::now(),
        };
        self.insert(instance.clone());
        debug!(instance_id = %instance.id, user_id, spec_id, "Reserved instance");
        instance
    }

    /// Register an instance rediscovered in the backend. Returns false if the
    /// id is already known.
    pub fn insert_recovered(&self, instance: Instance) -> bool {
        if self.instances.contains_key(&instance.id) {
            return false;
        }
        self.insert(instance);
        true
    }

    fn insert(&self, instance: Instance) {
        let (state_tx, _) = watch::channel(instance.state);
        self.by_user
            .entry(instance.user_id.clone())
            .or_default()
            .insert(instance.id.clone());
        self.instances.insert(
            instance.id.clone(),
            Arc::new(InstanceSlot {
                instance: Mutex::new(instance),
                state_tx,
                cancel_requested: AtomicBool::new(false),
            }),
        );
    }

    fn slot(&self, id: &str) -> Option<Arc<InstanceSlot>> {
        self.instances.get(id).map(|entry| entry.value().clone())
    }

    /// Compare-and-swap the state of `id` from `from` to `to`.
    ///
    /// Returns false if the instance is unknown, its state is not `from`, or
    /// the edge is not part of the state machine.
    pub fn transition(&self, id: &str, from: InstanceState, to: InstanceState) -> bool {
        if !from.can_transition_to(to) {
            warn!(instance_id = id, %from, %to, "Rejected illegal transition");
            return false;
        }
        let Some(slot) = self.slot(id) else {
            return false;
        };
        {
            let mut instance = slot.instance.lock();
            if instance.state != from {
                return false;
            }
            instance.state = to;
        }
        slot.state_tx.send_replace(to);
        debug!(instance_id = id, %from, %to, "Instance transition");
        true
    }

    /// Remove an instance. Only instances in a terminal state can be removed.
    pub fn remove(&self, id: &str) -> Option<Instance> {
        let slot = self.slot(id)?;
        if !slot.instance.lock().state.is_terminal() {
            return None;
        }
        let (_, slot) = self.instances.remove(id)?;
        let instance = slot.instance.lock().clone();
        if let Some(mut ids) = self.by_user.get_mut(&instance.user_id) {
            ids.remove(id);
        }
        self.by_user
            .remove_if(&instance.user_id, |_, ids| ids.is_empty());
        Some(instance)
    }

    /// Snapshot of one instance
    pub fn get(&self, id: &str) -> Option<Instance> {
        self.slot(id).map(|slot| slot.instance.lock().clone())
    }

    pub fn state(&self, id: &str) -> Option<InstanceState> {
        self.slot(id).map(|slot| slot.instance.lock().state)
    }

    /// Point-in-time snapshot of instances matching `filter`
    pub fn list<F>(&self, filter: F) -> impl Iterator<Item = Instance>
    where
        F: Fn(&Instance) -> bool,
    {
        let slots: Vec<Arc<InstanceSlot>> =
            self.instances.iter().map(|e| e.value().clone()).collect();
        let mut snapshot: Vec<Instance> = slots
            .iter()
            .map(|slot| slot.instance.lock().clone())
            .filter(|instance| filter(instance))
            .collect();
        snapshot.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        snapshot.into_iter()
    }

    /// Snapshot of instances owned by `user_id`
    pub fn list_for_user(&self, user_id: &str) -> Vec<Instance> {
        let ids: Vec<String> = self
            .by_user
            .get(user_id)
            .map(|ids| ids.iter().cloned().collect())
            .unwrap_or_default();
        let mut instances: Vec<Instance> = ids.iter().filter_map(|id| self.get(id)).collect();
        instances.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        instances
    }

    /// Apply `f` to the stored instance. State changes must go through
    /// [`transition`](Self::transition); `f` cannot alter the state.
    pub fn update<F>(&self, id: &str, f: F) -> bool
    where
        F: FnOnce(&mut Instance),
    {
        let Some(slot) = self.slot(id) else {
            return false;
        };
        let mut instance = slot.instance.lock();
        let state = instance.state;
        f(&mut instance);
        instance.state = state;
        true
    }

    /// Receive every state change of `id`
    pub fn subscribe(&self, id: &str) -> Option<watch::Receiver<InstanceState>> {
        self.slot(id).map(|slot| slot.state_tx.subscribe())
    }

    /// Ask an in-flight start to abandon. Returns false for unknown ids.
    pub fn request_cancel(&self, id: &str) -> bool {
        match self.slot(id) {
            Some(slot) => {
                slot.cancel_requested.store(true, Ordering::SeqCst);
                true
            }
            None => false,
        }
    }

    /// True once a cancel was requested. An instance that is no longer
    /// registered counts as cancelled.
    pub fn is_cancel_requested(&self, id: &str) -> bool {
        self.slot(id)
            .map(|slot| slot.cancel_requested.load(Ordering::SeqCst))
            .unwrap_or(true)
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use InstanceState::*;

    #[test]
    fn test_state_machine_edges() {
        assert!(New.can_transition_to(Starting));
        assert!(Starting.can_transition_to(Up));
        assert!(Up.can_transition_to(Stopping));
        assert!(Stopping.can_transition_to(Stopped));
        assert!(Starting.can_transition_to(Failed));
        assert!(Stopping.can_transition_to(Failed));

        assert!(!New.can_transition_to(Up));
        assert!(!Up.can_transition_to(Stopped));
        assert!(!Up.can_transition_to(Failed));
        assert!(!Stopped.can_transition_to(New));
        assert!(!Failed.can_transition_to(Starting));
    }

    #[test]
    fn test_reserve_and_transition() {
        let registry = ProxyRegistry::new();
        let instance = registry.reserve("jack", "notebook");
        assert_eq!(instance.state, New);
        assert_eq!(registry.len(), 1);

        assert!(registry.transition(&instance.id, New, Starting));
        assert!(!registry.transition(&instance.id, New, Starting));
        assert!(!registry.transition(&instance.id, Starting, Stopped));
        assert_eq!(registry.state(&instance.id), Some(Starting));

        assert!(!registry.transition("missing", New, Starting));
    }

    #[test]
    fn test_ids_unique() {
        let registry = ProxyRegistry::new();
        let ids: HashSet<String> = (0..100)
            .map(|_| registry.reserve("u", "s").id)
            .collect();
        assert_eq!(ids.len(), 100);
    }

    #[test]
    fn test_remove_only_terminal() {
        let registry = ProxyRegistry::new();
        let id = registry.reserve("jack", "app").id;

        assert!(registry.remove(&id).is_none());
        assert!(registry.transition(&id, New, Failed));
        let removed = registry.remove(&id).unwrap();
        assert_eq!(removed.state, Failed);
        assert!(registry.get(&id).is_none());
        assert!(registry.list_for_user("jack").is_empty());
        assert!(registry.remove(&id).is_none());
    }

    #[test]
    fn test_list_is_snapshot() {
        let registry = ProxyRegistry::new();
        let a = registry.reserve("jack", "app").id;
        registry.reserve("jill", "app");

        let snapshot = registry.list(|i| i.user_id == "jack");
        registry.transition(&a, New, Starting);

        let listed: Vec<Instance> = snapshot.collect();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].state, New);
        assert_eq!(registry.list(|_| true).count(), 2);
        assert_eq!(registry.list_for_user("jill").len(), 1);
    }

    #[test]
    fn test_update_cannot_change_state() {
        let registry = ProxyRegistry::new();
        let id = registry.reserve("jack", "app").id;
        assert!(registry.update(&id, |i| {
            i.routes.push("/endpoint/x".to_string());
            i.state = Up;
        }));
        let instance = registry.get(&id).unwrap();
        assert_eq!(instance.state, New);
        assert_eq!(instance.routes, vec!["/endpoint/x".to_string()]);
    }

    #[tokio::test]
    async fn test_subscribe_sees_transitions() {
        let registry = ProxyRegistry::new();
        let id = registry.reserve("jack", "app").id;
        let mut rx = registry.subscribe(&id).unwrap();

        registry.transition(&id, New, Starting);
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), Starting);

        assert!(!registry.is_cancel_requested(&id));
        assert!(registry.request_cancel(&id));
        assert!(registry.is_cancel_requested(&id));

        assert!(!registry.request_cancel("missing"));
        assert!(registry.is_cancel_requested("missing"));
    }

    #[test]
    fn test_concurrent_transition_exactly_once() {
        let registry = Arc::new(ProxyRegistry::new());
        let id = registry.reserve("jack", "app").id;

        let winners: usize = (0..16)
            .map(|_| {
                let registry = registry.clone();
                let id = id.clone();
                std::thread::spawn(move || registry.transition(&id, New, Starting))
            })
            .collect::<Vec<_>>()
            .into_iter()
            .map(|h| h.join().unwrap() as usize)
            .sum();
        assert_eq!(winners, 1);
    }
}
