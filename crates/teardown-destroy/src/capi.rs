//! Cluster API platform
//!
//! Tears down a cluster managed by Cluster API: the workload cluster's storage
//! is drained first (when its kubeconfig is known), then the Cluster is
//! unpaused and the CAPI objects are deleted from the management cluster from
//! the leaves up so the providers release the cloud infrastructure behind them.
//!
//! Control-plane Machines are left to their KubeadmControlPlane, which
//! replaces any Machine deleted out from under it. They go when the Cluster
//! deletion cascades.
//!
//! ```json
//! "capi": {
//!   "namespace": "capi-dev",
//!   "managementKubeconfig": "/path/to/mgmt.kubeconfig",
//!   "workloadKubeconfig": "/path/to/dev.kubeconfig"
//! }
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use kube::api::{Api, DeleteParams, DynamicObject, ListParams, Patch, PatchParams};
use kube::ResourceExt;
#[cfg(test)]
use mockall::automock;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use teardown_common::{
    Error, ListFilter, ResourceDescriptor, ResourceSet, Result, STATUS_DELETING,
};

use crate::destroyer::{ClusterQuota, DestroyOptions, Destroyer, StagedDestroyer};
use crate::kube_client::{create_client, delete_outcome, discover_api_resource};
use crate::metadata::ClusterMetadata;
use crate::reconcile::{ResourceDeleter, ResourceLister, ResourceReconciler, RunState};
use crate::stage::{Pipeline, Stage, StageFunc};
use crate::volumes::{KubeVolumeCluster, VolumeCluster, VolumeReconciler, VolumeStageFunc};

/// Platform key in cluster metadata
pub const PLATFORM: &str = "capi";

/// API group of every CAPI core kind
pub const CAPI_GROUP: &str = "cluster.x-k8s.io";

/// Label CAPI puts on every object belonging to a cluster
pub const CLUSTER_NAME_LABEL: &str = "cluster.x-k8s.io/cluster-name";

/// Label CAPI puts on Machines owned by a control plane
pub const CONTROL_PLANE_LABEL: &str = "cluster.x-k8s.io/control-plane";

/// Name of the stage that drains workload storage
pub const STORAGE_STAGE: &str = "cluster storage";

/// Name of the stage that unpauses the Cluster
pub const UNPAUSE_STAGE: &str = "unpause cluster";

/// How a CAPI kind's objects are selected
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Selection {
    /// By the cluster-name label
    Label,
    /// By the cluster-name label, skipping control-plane objects
    WorkerLabel,
    /// By object name equal to the infra ID
    Name,
}

/// One CAPI kind deleted in its own stage
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CapiKind {
    /// Stage name
    pub stage: &'static str,
    /// Kubernetes kind
    pub kind: &'static str,
    /// Resource type name used in logs and trackers
    pub type_name: &'static str,
    /// How objects are selected
    pub selection: Selection,
}

/// CAPI kinds in deletion order
pub const CAPI_KINDS: [CapiKind; 3] = [
    CapiKind {
        stage: "machine deployments",
        kind: "MachineDeployment",
        type_name: "machine-deployment",
        selection: Selection::Label,
    },
    CapiKind {
        stage: "machines",
        kind: "Machine",
        type_name: "machine",
        selection: Selection::WorkerLabel,
    },
    CapiKind {
        stage: "cluster",
        kind: "Cluster",
        type_name: "cluster",
        selection: Selection::Name,
    },
];

/// The `capi` section of cluster metadata
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CapiMetadata {
    /// Namespace holding the cluster's CAPI objects
    pub namespace: String,
    /// Kubeconfig of the management cluster
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub management_kubeconfig: Option<PathBuf>,
    /// Kubeconfig of the workload cluster itself
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workload_kubeconfig: Option<PathBuf>,
}

/// Registry factory for the `capi` platform
pub fn factory(metadata: &ClusterMetadata, options: &DestroyOptions) -> Result<Box<dyn Destroyer>> {
    let platform: CapiMetadata = metadata.platform_config(PLATFORM)?;
    if platform.namespace.is_empty() {
        return Err(Error::validation("capi.namespace is required"));
    }

    Ok(Box::new(CapiDestroyer {
        metadata: metadata.clone(),
        platform,
        options: options.clone(),
    }))
}

/// Lists and deletes the objects of one CAPI kind
pub struct CapiObjects {
    api: Api<DynamicObject>,
    type_name: String,
    selection: Selection,
}

impl CapiObjects {
    /// Objects reachable through `api`
    pub fn new(api: Api<DynamicObject>, type_name: impl Into<String>, selection: Selection) -> Self {
        Self {
            api,
            type_name: type_name.into(),
            selection,
        }
    }
}

fn list_params(selection: Selection, filter: &ListFilter) -> ListParams {
    match selection {
        Selection::Label => {
            ListParams::default().labels(&format!("{}={}", CLUSTER_NAME_LABEL, filter.infra_id))
        }
        Selection::WorkerLabel => ListParams::default().labels(&format!(
            "{}={},!{}",
            CLUSTER_NAME_LABEL, filter.infra_id, CONTROL_PLANE_LABEL
        )),
        Selection::Name => ListParams::default().fields(&format!("metadata.name={}", filter.infra_id)),
    }
}

fn object_descriptor(type_name: &str, obj: &DynamicObject) -> ResourceDescriptor {
    let status = if obj.metadata.deletion_timestamp.is_some() {
        STATUS_DELETING.to_string()
    } else {
        obj.data
            .get("status")
            .and_then(|s| s.get("phase"))
            .and_then(|p| p.as_str())
            .unwrap_or_default()
            .to_string()
    };
    ResourceDescriptor::new(type_name, obj.name_any()).with_status(status)
}

#[async_trait]
impl ResourceLister for CapiObjects {
    async fn list(&self, filter: &ListFilter) -> Result<ResourceSet> {
        if filter.infra_id.is_empty() {
            return Err(Error::list(&self.type_name, "refusing to list without an infra ID"));
        }
        let objects = self
            .api
            .list(&list_params(self.selection, filter))
            .await
            .map_err(|e| Error::list(&self.type_name, e.to_string()))?;
        Ok(objects
            .items
            .iter()
            .map(|obj| object_descriptor(&self.type_name, obj))
            .collect())
    }
}

#[async_trait]
impl ResourceDeleter for CapiObjects {
    async fn delete(&self, item: &ResourceDescriptor) -> Result<()> {
        let result = self.api.delete(&item.id, &DeleteParams::background()).await;
        delete_outcome(result, &self.type_name, &item.key)
    }
}

/// Clears `spec.paused` on a Cluster
///
/// CAPI controllers skip paused clusters, so nothing below a paused Cluster
/// is ever deleted.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterUnpauser: Send + Sync {
    /// Unpause the named Cluster
    async fn unpause(&self, name: &str) -> Result<()>;
}

#[async_trait]
impl ClusterUnpauser for CapiObjects {
    async fn unpause(&self, name: &str) -> Result<()> {
        let patch = json!({"spec": {"paused": false}});
        self.api
            .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }
}

/// Stage func that unpauses one Cluster, retrying until it sticks
pub struct UnpauseCluster {
    cluster: String,
    unpauser: Arc<dyn ClusterUnpauser>,
}

impl UnpauseCluster {
    /// Stage func name
    pub const NAME: &'static str = "unpause";

    /// Unpause `cluster` through `unpauser`
    pub fn new(cluster: impl Into<String>, unpauser: Arc<dyn ClusterUnpauser>) -> Self {
        Self {
            cluster: cluster.into(),
            unpauser,
        }
    }
}

#[async_trait]
impl StageFunc for UnpauseCluster {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn run(&self, _cancel: &CancellationToken) -> Result<bool> {
        match self.unpauser.unpause(&self.cluster).await {
            Ok(()) => {
                info!(cluster = %self.cluster, "CAPI cluster unpaused");
                Ok(true)
            }
            Err(e) if e.is_not_found() => {
                debug!(cluster = %self.cluster, "CAPI cluster already gone");
                Ok(true)
            }
            Err(e) => {
                warn!(cluster = %self.cluster, error = %e, "Unpause failed, retrying");
                Ok(false)
            }
        }
    }
}

/// A CAPI kind with the collaborators that list and delete it
pub struct KindObjects {
    /// Kind being deleted
    pub kind: CapiKind,
    /// Lists the kind's objects
    pub lister: Arc<dyn ResourceLister>,
    /// Deletes the kind's objects
    pub deleter: Arc<dyn ResourceDeleter>,
}

/// Assemble the CAPI pipeline
///
/// `storage` adds the storage stage in front. The Cluster named by the infra
/// ID is unpaused next, then each entry of `kinds` becomes its own stage in
/// the given order.
pub fn capi_pipeline(
    metadata: &ClusterMetadata,
    options: &DestroyOptions,
    storage: Option<Arc<dyn VolumeCluster>>,
    unpauser: Arc<dyn ClusterUnpauser>,
    kinds: Vec<KindObjects>,
) -> Pipeline {
    let state = RunState::new();
    let filter = metadata.list_filter();
    let mut pipeline = Pipeline::new(options.poll_interval);

    if let Some(cluster) = storage {
        let func = VolumeStageFunc::new(VolumeReconciler::new(cluster), options.volume_timeout)
            .fail_on_timeout(options.fail_on_volume_timeout);
        pipeline = pipeline.stage(Stage::new(STORAGE_STAGE).with_func(func));
    }

    pipeline = pipeline.stage(
        Stage::new(UNPAUSE_STAGE).with_func(UnpauseCluster::new(&metadata.infra_id, unpauser)),
    );

    for KindObjects {
        kind,
        lister,
        deleter,
    } in kinds
    {
        let reconciler =
            ResourceReconciler::new(kind.type_name, filter.clone(), lister, deleter, state.clone());
        pipeline = pipeline.stage(Stage::new(kind.stage).with_func(reconciler));
    }

    pipeline
}

/// Destroyer for clusters provisioned through Cluster API
pub struct CapiDestroyer {
    metadata: ClusterMetadata,
    platform: CapiMetadata,
    options: DestroyOptions,
}

impl CapiDestroyer {
    /// Kubeconfig for the management cluster; the command-line override wins
    pub fn management_kubeconfig(&self) -> Option<&Path> {
        self.options
            .kubeconfig
            .as_deref()
            .or(self.platform.management_kubeconfig.as_deref())
    }
}

#[async_trait]
impl Destroyer for CapiDestroyer {
    async fn run(&self, cancel: &CancellationToken) -> Result<Option<ClusterQuota>> {
        let management = create_client(self.management_kubeconfig()).await?;

        let storage: Option<Arc<dyn VolumeCluster>> = match &self.platform.workload_kubeconfig {
            Some(path) => {
                let workload = create_client(Some(path.as_path())).await?;
                Some(Arc::new(KubeVolumeCluster::new(workload)) as Arc<dyn VolumeCluster>)
            }
            None => {
                info!(cluster = %self.metadata.cluster_name, "No workload kubeconfig, skipping storage drain");
                None
            }
        };

        let mut kinds = Vec::with_capacity(CAPI_KINDS.len());
        let mut unpauser: Option<Arc<dyn ClusterUnpauser>> = None;
        for kind in CAPI_KINDS {
            let ar = discover_api_resource(&management, CAPI_GROUP, kind.kind).await?;
            let api = Api::namespaced_with(management.clone(), &self.platform.namespace, &ar);
            let objects = Arc::new(CapiObjects::new(api, kind.type_name, kind.selection));
            if kind.kind == "Cluster" {
                unpauser = Some(objects.clone());
            }
            kinds.push(KindObjects {
                kind,
                lister: objects.clone(),
                deleter: objects,
            });
        }

        let unpauser = unpauser
            .ok_or_else(|| Error::internal_with_context("capi", "no Cluster kind to unpause"))?;
        let pipeline = capi_pipeline(&self.metadata, &self.options, storage, unpauser, kinds);

        StagedDestroyer::new(&self.metadata.cluster_name, &self.metadata.infra_id, pipeline)
            .run(cancel)
            .await
    }
}
