//! Resource identity and membership primitives
//!
//! A [`ResourceDescriptor`] names one cloud or cluster object. Its `key` must be
//! stable across repeated listings of the same object: convergence is decided
//! by comparing keys between the tracked pending set and the latest listing.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// One object slated for deletion
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceDescriptor {
    /// Stable identity used for set membership
    pub key: String,
    /// Human-readable name for logs
    pub display_name: String,
    /// Provider-reported status (e.g. "Deleting", "available")
    pub status: String,
    /// Resource type this object belongs to (e.g. "floating-ip")
    pub type_name: String,
    /// Provider identifier passed back to the delete call
    pub id: String,
}

impl ResourceDescriptor {
    /// Create a descriptor whose key, name, and id are all `id`
    pub fn new(type_name: impl Into<String>, id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            key: id.clone(),
            display_name: id.clone(),
            status: String::new(),
            type_name: type_name.into(),
            id,
        }
    }

    /// Override the key
    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = key.into();
        self
    }

    /// Override the display name
    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = name.into();
        self
    }

    /// Set the provider status
    pub fn with_status(mut self, status: impl Into<String>) -> Self {
        self.status = status.into();
        self
    }
}

/// Set of descriptors keyed by [`ResourceDescriptor::key`]
///
/// Backed by a `BTreeMap` so [`ResourceSet::list`] is always sorted by key.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ResourceSet {
    items: BTreeMap<String, ResourceDescriptor>,
}

impl ResourceSet {
    /// Create an empty set
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or overwrite by key
    pub fn insert(&mut self, item: ResourceDescriptor) {
        self.items.insert(item.key.clone(), item);
    }

    /// Merge every item, overwriting existing keys
    pub fn extend(&mut self, items: impl IntoIterator<Item = ResourceDescriptor>) {
        for item in items {
            self.insert(item);
        }
    }

    /// Remove by key, returning the removed descriptor
    pub fn remove(&mut self, key: &str) -> Option<ResourceDescriptor> {
        self.items.remove(key)
    }

    /// Whether a key is present
    pub fn contains(&self, key: &str) -> bool {
        self.items.contains_key(key)
    }

    /// Look up a descriptor by key
    pub fn get(&self, key: &str) -> Option<&ResourceDescriptor> {
        self.items.get(key)
    }

    /// Number of items
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether the set is empty
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Descriptors sorted by key
    pub fn list(&self) -> Vec<ResourceDescriptor> {
        self.items.values().cloned().collect()
    }

    /// Keys in sorted order
    pub fn keys(&self) -> Vec<String> {
        self.items.keys().cloned().collect()
    }
}

impl FromIterator<ResourceDescriptor> for ResourceSet {
    fn from_iter<I: IntoIterator<Item = ResourceDescriptor>>(iter: I) -> Self {
        let mut set = ResourceSet::new();
        set.extend(iter);
        set
    }
}

/// A set of tag key/value pairs that must all be present on a resource
pub type TagFilter = BTreeMap<String, String>;

/// Any-of collection of [`TagFilter`]s
///
/// A resource matches the set if it matches at least one filter, and a filter
/// matches if every key/value pair in it is present in the resource's tags.
/// An empty set matches nothing, so a missing filter can never select every
/// resource in an account.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterSet(pub Vec<TagFilter>);

impl FilterSet {
    /// Filter set matching resources owned by a cluster infra ID
    ///
    /// Matches either the Kubernetes cloud-provider ownership tag or the
    /// CAPI cluster-name label.
    pub fn owned_by(infra_id: &str) -> Self {
        FilterSet(vec![
            TagFilter::from([(format!("kubernetes.io/cluster/{infra_id}"), "owned".to_string())]),
            TagFilter::from([("cluster.x-k8s.io/cluster-name".to_string(), infra_id.to_string())]),
        ])
    }

    /// Whether the given tags satisfy at least one filter
    pub fn matches(&self, tags: &BTreeMap<String, String>) -> bool {
        self.0
            .iter()
            .any(|filter| filter.iter().all(|(k, v)| tags.get(k) == Some(v)))
    }
}

/// Criteria handed to every lister
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ListFilter {
    /// Cluster infrastructure ID; names usually contain it
    pub infra_id: String,
    /// Tag filters for providers that list by tag
    pub tags: FilterSet,
}

impl ListFilter {
    /// Filter for everything owned by `infra_id`
    pub fn for_infra_id(infra_id: impl Into<String>) -> Self {
        let infra_id = infra_id.into();
        Self {
            tags: FilterSet::owned_by(&infra_id),
            infra_id,
        }
    }

    /// Whether a resource name belongs to the cluster
    pub fn matches_name(&self, name: &str) -> bool {
        !self.infra_id.is_empty() && name.contains(&self.infra_id)
    }
}
