//! Hot-reloadable set of application templates

use crate::spec::ApplicationSpec;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tracing::info;

/// Result of replacing the catalog
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ReloadResult {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub updated: Vec<String>,
}

/// Templates keyed by id. Specs are shared as `Arc` so a reload never
/// changes a template under an in-flight launch.
#[derive(Debug, Default)]
pub struct SpecCatalog {
    specs: RwLock<BTreeMap<String, Arc<ApplicationSpec>>>,
}

impl SpecCatalog {
    pub fn new(specs: Vec<ApplicationSpec>) -> Self {
        let catalog = Self::default();
        catalog.replace(specs);
        catalog
    }

    pub fn get(&self, id: &str) -> Option<Arc<ApplicationSpec>> {
        self.specs.read().get(id).cloned()
    }

    /// All templates, ordered by id
    pub fn list(&self) -> Vec<Arc<ApplicationSpec>> {
        self.specs.read().values().cloned().collect()
    }

    /// Swap in a new set of templates. Running instances keep the resolved
    /// copy they were started from.
    pub fn replace(&self, specs: Vec<ApplicationSpec>) -> ReloadResult {
        let mut result = ReloadResult::default();
        let new_ids: HashSet<String> = specs.iter().map(|s| s.id.clone()).collect();

        let mut current = self.specs.write();
        for id in current.keys() {
            if !new_ids.contains(id) {
                result.removed.push(id.clone());
            }
        }

        let mut next = BTreeMap::new();
        for spec in specs {
            if current.contains_key(&spec.id) {
                result.updated.push(spec.id.clone());
            } else {
                result.added.push(spec.id.clone());
            }
            next.insert(spec.id.clone(), Arc::new(spec));
        }
        *current = next;
        drop(current);

        if !result.added.is_empty() || !result.removed.is_empty() {
            info!(
                added = ?result.added,
                removed = ?result.removed,
                updated = result.updated.len(),
                "Spec catalog reloaded"
            );
        }
        result
    }

    pub fn len(&self) -> usize {
        self.specs.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.specs.read().is_empty()
    }
}
