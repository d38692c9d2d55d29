//! Platform name to destroyer factory mapping
//!
//! The registry is built once at startup and passed to whoever needs it.
//! Nothing registers itself as a side effect of linking.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use teardown_common::{Error, Result};

use crate::destroyer::{DestroyOptions, Destroyer};
use crate::metadata::ClusterMetadata;

/// Builds a destroyer for a cluster's metadata
pub type DestroyerFactory =
    Arc<dyn Fn(&ClusterMetadata, &DestroyOptions) -> Result<Box<dyn Destroyer>> + Send + Sync>;

/// Known platforms and their factories
#[derive(Clone, Default)]
pub struct Registry {
    factories: BTreeMap<String, DestroyerFactory>,
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("platforms", &self.platforms())
            .finish()
    }
}

impl Registry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every built-in platform
    pub fn builtin() -> Self {
        Self::new().register(crate::capi::PLATFORM, crate::capi::factory)
    }

    /// Add or replace the factory for `platform`
    pub fn register<F>(mut self, platform: impl Into<String>, factory: F) -> Self
    where
        F: Fn(&ClusterMetadata, &DestroyOptions) -> Result<Box<dyn Destroyer>>
            + Send
            + Sync
            + 'static,
    {
        self.factories.insert(platform.into(), Arc::new(factory));
        self
    }

    /// Registered platform names, sorted
    pub fn platforms(&self) -> Vec<String> {
        self.factories.keys().cloned().collect()
    }

    /// Build the destroyer for the platform named in `metadata`
    pub fn new_destroyer(
        &self,
        metadata: &ClusterMetadata,
        options: &DestroyOptions,
    ) -> Result<Box<dyn Destroyer>> {
        metadata.validate()?;
        let platform = metadata.platform()?;

        let factory = self
            .factories
            .get(platform)
            .ok_or_else(|| Error::UnsupportedPlatform {
                platform: platform.to_string(),
                known: self.platforms(),
            })?;

        factory(metadata, options)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::destroyer::ClusterQuota;
    use async_trait::async_trait;
    use serde_json::json;
    use tokio_util::sync::CancellationToken;

    struct Noop;

    #[async_trait]
    impl Destroyer for Noop {
        async fn run(&self, _cancel: &CancellationToken) -> Result<Option<ClusterQuota>> {
            Ok(Some(ClusterQuota::default()))
        }
    }

    fn noop_factory(_: &ClusterMetadata, _: &DestroyOptions) -> Result<Box<dyn Destroyer>> {
        Ok(Box::new(Noop))
    }

    fn metadata(platform: &str) -> ClusterMetadata {
        let mut value = json!({"clusterName": "dev", "infraID": "dev-1"});
        value[platform] = json!({});
        serde_json::from_value(value).unwrap()
    }

    #[tokio::test]
    async fn resolves_registered_platform() {
        let registry = Registry::new().register("fake", noop_factory);
        let destroyer = registry
            .new_destroyer(&metadata("fake"), &DestroyOptions::default())
            .unwrap();
        let quota = destroyer.run(&CancellationToken::new()).await.unwrap();
        assert!(quota.is_some());
    }

    #[test]
    fn unknown_platform_lists_known_names() {
        let registry = Registry::new()
            .register("zeta", noop_factory)
            .register("alpha", noop_factory);

        let err = registry
            .new_destroyer(&metadata("openstack"), &DestroyOptions::default())
            .err()
            .unwrap();

        match err {
            Error::UnsupportedPlatform { platform, known } => {
                assert_eq!(platform, "openstack");
                assert_eq!(known, vec!["alpha", "zeta"]);
            }
            other => panic!("expected UnsupportedPlatform, got {other:?}"),
        }
    }

    #[test]
    fn invalid_metadata_never_reaches_a_factory() {
        let registry = Registry::new().register(
            "fake",
            |_: &ClusterMetadata, _: &DestroyOptions| -> Result<Box<dyn Destroyer>> {
                panic!("factory must not be called")
            },
        );
        let mut md = metadata("fake");
        md.infra_id.clear();
        assert!(registry
            .new_destroyer(&md, &DestroyOptions::default())
            .is_err());
    }

    #[test]
    fn builtin_registers_capi() {
        assert_eq!(Registry::builtin().platforms(), vec!["capi"]);
    }

    #[test]
    fn later_registration_replaces_earlier() {
        let registry = Registry::new()
            .register("fake", noop_factory)
            .register("fake", noop_factory);
        assert_eq!(registry.platforms().len(), 1);
    }
}
