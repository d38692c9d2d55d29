//! Destroyer trait and the staged destroyer every platform builds on

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use teardown_common::{Result, DEFAULT_POLL_INTERVAL, DEFAULT_VOLUME_TIMEOUT};

use crate::stage::Pipeline;

/// Quota consumed by one kind of resource
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaUsage {
    /// Service the quota belongs to
    pub service: String,
    /// Quota name within the service
    pub name: String,
    /// Amount released by the teardown
    pub amount: i64,
}

/// Quota released by destroying a cluster
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterQuota {
    /// Per-quota usage
    pub quota: Vec<QuotaUsage>,
}

/// Tears down everything a cluster owns
#[async_trait]
pub trait Destroyer: Send + Sync {
    /// Run the teardown to completion
    ///
    /// Returns released quota when the platform reports it.
    async fn run(&self, cancel: &CancellationToken) -> Result<Option<ClusterQuota>>;
}

/// Settings shared by every destroyer factory
#[derive(Clone, Debug, PartialEq)]
pub struct DestroyOptions {
    /// Interval between polls of a stage func
    pub poll_interval: Duration,
    /// Budget for draining and deleting cluster volumes
    pub volume_timeout: Duration,
    /// Whether an expired volume budget aborts the run
    pub fail_on_volume_timeout: bool,
    /// Management cluster kubeconfig override
    pub kubeconfig: Option<PathBuf>,
}

impl Default for DestroyOptions {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            volume_timeout: DEFAULT_VOLUME_TIMEOUT,
            fail_on_volume_timeout: false,
            kubeconfig: None,
        }
    }
}

/// Destroyer that runs a fixed [`Pipeline`] of stages
pub struct StagedDestroyer {
    cluster_name: String,
    infra_id: String,
    pipeline: Pipeline,
}

impl StagedDestroyer {
    /// Create a destroyer for the named cluster
    pub fn new(
        cluster_name: impl Into<String>,
        infra_id: impl Into<String>,
        pipeline: Pipeline,
    ) -> Self {
        Self {
            cluster_name: cluster_name.into(),
            infra_id: infra_id.into(),
            pipeline,
        }
    }

    /// The pipeline this destroyer runs
    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }
}

#[async_trait]
impl Destroyer for StagedDestroyer {
    async fn run(&self, cancel: &CancellationToken) -> Result<Option<ClusterQuota>> {
        info!(
            cluster = %self.cluster_name,
            infra_id = %self.infra_id,
            stages = self.pipeline.stages().len(),
            "Destroying cluster"
        );

        if let Err(e) = self.pipeline.run(cancel).await {
            error!(cluster = %self.cluster_name, error = %e, "Cluster teardown failed");
            return Err(e);
        }

        info!(cluster = %self.cluster_name, "Cluster destroyed");
        Ok(None)
    }
}
