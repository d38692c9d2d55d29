//! Per-resource-type convergence state
//!
//! One [`PendingItemTracker`] lives for a single teardown run and is shared by
//! every reconciler in it. Each resource type gets its own [`ResourceSet`];
//! entries are guarded per key by `DashMap`, so two tasks can never mutate the
//! same type at once even if they were ever pointed at the same name.

use dashmap::DashMap;

use crate::resource::{ResourceDescriptor, ResourceSet};

/// Resources known or assumed to still exist, grouped by type
#[derive(Debug, Default)]
pub struct PendingItemTracker {
    pending: DashMap<String, ResourceSet>,
}

impl PendingItemTracker {
    /// Create an empty tracker
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge newly discovered items and return the full tracked set for the type
    ///
    /// Items already tracked are overwritten with the fresher descriptor, items
    /// no longer listed stay tracked until [`remove`](Self::remove) confirms them gone.
    pub fn insert(
        &self,
        type_name: &str,
        items: impl IntoIterator<Item = ResourceDescriptor>,
    ) -> Vec<ResourceDescriptor> {
        let mut entry = self.pending.entry(type_name.to_string()).or_default();
        entry.extend(items);
        entry.list()
    }

    /// Forget items confirmed deleted
    pub fn remove<'a>(&self, type_name: &str, keys: impl IntoIterator<Item = &'a str>) {
        if let Some(mut entry) = self.pending.get_mut(type_name) {
            for key in keys {
                entry.remove(key);
            }
        }
    }

    /// Snapshot of the pending items for a type, sorted by key
    pub fn get(&self, type_name: &str) -> Vec<ResourceDescriptor> {
        self.pending
            .get(type_name)
            .map(|entry| entry.list())
            .unwrap_or_default()
    }

    /// Number of pending items for a type
    pub fn count(&self, type_name: &str) -> usize {
        self.pending.get(type_name).map(|entry| entry.len()).unwrap_or(0)
    }

    /// Number of pending items across every type
    pub fn total(&self) -> usize {
        self.pending.iter().map(|entry| entry.value().len()).sum()
    }

    /// Types that still have pending items, sorted
    pub fn pending_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self
            .pending
            .iter()
            .filter(|entry| !entry.value().is_empty())
            .map(|entry| entry.key().clone())
            .collect();
        types.sort();
        types
    }
}
