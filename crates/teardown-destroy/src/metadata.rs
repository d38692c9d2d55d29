//! Cluster metadata written at install time and read back for teardown
//!
//! ```json
//! {
//!   "clusterName": "dev",
//!   "clusterID": "4a6c2b1e-...",
//!   "infraID": "dev-x7k2p",
//!   "capi": { "namespace": "capi-dev" }
//! }
//! ```
//!
//! Exactly one platform-keyed object must be present; its key selects the
//! destroyer.

use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use teardown_common::{Error, ListFilter, Result};

/// Identity of an installed cluster plus its platform section
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterMetadata {
    /// Human-facing cluster name
    pub cluster_name: String,
    /// Unique cluster ID
    #[serde(rename = "clusterID", default)]
    pub cluster_id: String,
    /// Infrastructure ID that tags and names every cloud object
    #[serde(rename = "infraID")]
    pub infra_id: String,
    /// Platform sections keyed by platform name
    #[serde(flatten)]
    pub platforms: BTreeMap<String, serde_json::Value>,
}

impl ClusterMetadata {
    /// The single platform name this cluster was installed on
    pub fn platform(&self) -> Result<&str> {
        let mut keys = self.platforms.keys();
        match (keys.next(), keys.next()) {
            (Some(name), None) => Ok(name),
            (None, _) => Err(Error::validation("metadata has no platform section")),
            (Some(_), Some(_)) => Err(Error::validation(format!(
                "metadata has multiple platform sections: {}",
                self.platforms.keys().cloned().collect::<Vec<_>>().join(", ")
            ))),
        }
    }

    /// Deserialize the section for `platform`
    pub fn platform_config<T: DeserializeOwned>(&self, platform: &str) -> Result<T> {
        let value = self.platforms.get(platform).ok_or_else(|| {
            Error::validation(format!("metadata has no {platform:?} platform section"))
        })?;
        serde_json::from_value(value.clone()).map_err(|e| {
            Error::serialization(format!("invalid {platform} platform section: {e}"))
        })
    }

    /// Check the fields every destroyer relies on
    pub fn validate(&self) -> Result<()> {
        if self.cluster_name.is_empty() {
            return Err(Error::validation("clusterName is required"));
        }
        if self.infra_id.is_empty() {
            return Err(Error::validation("infraID is required"));
        }
        self.platform()?;
        Ok(())
    }

    /// List filter selecting everything owned by this cluster
    pub fn list_filter(&self) -> ListFilter {
        ListFilter::for_infra_id(&self.infra_id)
    }
}
