//! Drain and delete cluster-resident storage before its cloud disks go away
//!
//! Deleting cloud disks out from under a live cluster leaves volumes stuck
//! attached. The [`VolumeReconciler`] evacuates the cluster first:
//!
//! 1. Snapshot every PersistentVolumeClaim and PersistentVolume.
//! 2. Watch both kinds and drop deleted keys from the snapshot.
//! 3. Cordon every worker, then drain every worker. All cordons finish before
//!    the first drain so evicted pods cannot land on a node about to drain.
//! 4. Delete the snapshotted claims once, then back off until the volume
//!    snapshot is empty or the deadline passes.
//! 5. On the deadline, re-list once. A watch that had to re-list (after a
//!    410 Gone, say) never reports objects deleted while it was away.
//!
//! The snapshot is the only state shared with the watch tasks and sits
//! behind a single mutex.

mod kube_cluster;

pub use kube_cluster::KubeVolumeCluster;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use teardown_common::retry::{backoff_until, Backoff};
use teardown_common::{Error, ResourceDescriptor, ResourceSet, Result};

use crate::stage::StageFunc;

/// Storage operations against one cluster
#[async_trait]
pub trait VolumeCluster: Send + Sync {
    /// Every PersistentVolumeClaim, keyed `namespace/name`
    async fn list_claims(&self) -> Result<ResourceSet>;

    /// Every PersistentVolume, keyed by name
    async fn list_volumes(&self) -> Result<ResourceSet>;

    /// Names of the nodes that run workloads
    async fn list_worker_nodes(&self) -> Result<Vec<String>>;

    /// Mark a node unschedulable
    async fn cordon_node(&self, node: &str) -> Result<()>;

    /// Evict the evictable pods on a node
    async fn drain_node(&self, node: &str) -> Result<()>;

    /// Delete one claim; already gone is success
    async fn delete_claim(&self, claim: &ResourceDescriptor) -> Result<()>;

    /// Keys of claims as they are deleted
    fn watch_claim_deletions(&self) -> BoxStream<'static, String>;

    /// Keys of volumes as they are deleted
    fn watch_volume_deletions(&self) -> BoxStream<'static, String>;
}

/// Where a [`VolumeReconciler`] is in its run
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum VolumePhase {
    /// Not started
    #[default]
    Idle,
    /// Marking workers unschedulable
    Cordoning,
    /// Evicting pods from workers
    Draining,
    /// Claims deleted, waiting for volumes to disappear
    AwaitingDeletion,
    /// Every snapshotted volume is gone
    Converged,
    /// The deadline passed with volumes remaining
    TimedOut,
}

impl fmt::Display for VolumePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            VolumePhase::Idle => "Idle",
            VolumePhase::Cordoning => "Cordoning",
            VolumePhase::Draining => "Draining",
            VolumePhase::AwaitingDeletion => "AwaitingDeletion",
            VolumePhase::Converged => "Converged",
            VolumePhase::TimedOut => "TimedOut",
        };
        f.write_str(s)
    }
}

/// How a volume reconciliation ended
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum VolumeOutcome {
    /// Every snapshotted volume was deleted
    Converged,
    /// The deadline passed; these keys were never seen deleted
    TimedOut {
        /// Claims still present
        claims: Vec<String>,
        /// Volumes still present
        volumes: Vec<String>,
    },
}

#[derive(Debug, Default)]
struct StorageSnapshot {
    claims: ResourceSet,
    volumes: ResourceSet,
}

#[derive(Clone, Copy, Debug)]
enum StorageKind {
    Claim,
    Volume,
}

impl StorageSnapshot {
    fn forget(&mut self, kind: StorageKind, key: &str) -> bool {
        let set = match kind {
            StorageKind::Claim => &mut self.claims,
            StorageKind::Volume => &mut self.volumes,
        };
        set.remove(key).is_some()
    }

    /// Forget every key a fresh listing no longer returns
    fn retain_listed(&mut self, claims: &ResourceSet, volumes: &ResourceSet) {
        for key in self.claims.keys() {
            if !claims.contains(&key) {
                self.claims.remove(&key);
            }
        }
        for key in self.volumes.keys() {
            if !volumes.contains(&key) {
                self.volumes.remove(&key);
            }
        }
    }
}

async fn track_deletions(
    mut deleted: BoxStream<'static, String>,
    snapshot: Arc<Mutex<StorageSnapshot>>,
    kind: StorageKind,
) {
    while let Some(key) = deleted.next().await {
        if snapshot.lock().forget(kind, &key) {
            debug!(kind = ?kind, key = %key, "Storage object deleted");
        }
    }
}

/// Watch-driven drain and delete of one cluster's storage
pub struct VolumeReconciler {
    cluster: Arc<dyn VolumeCluster>,
    backoff: Backoff,
    phase: Mutex<VolumePhase>,
}

impl VolumeReconciler {
    /// Create a reconciler using the default capped backoff
    pub fn new(cluster: Arc<dyn VolumeCluster>) -> Self {
        Self {
            cluster,
            backoff: Backoff::default(),
            phase: Mutex::new(VolumePhase::Idle),
        }
    }

    /// Override the backoff between deletion checks
    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Current phase
    pub fn phase(&self) -> VolumePhase {
        *self.phase.lock()
    }

    fn enter(&self, phase: VolumePhase) {
        debug!(phase = %phase, "Volume reconciler phase");
        *self.phase.lock() = phase;
    }

    async fn resync(&self, snapshot: &Mutex<StorageSnapshot>) {
        let listed = tokio::try_join!(self.cluster.list_claims(), self.cluster.list_volumes());
        match listed {
            Ok((claims, volumes)) => snapshot.lock().retain_listed(&claims, &volumes),
            Err(e) => warn!(error = %e, "Failed to re-list storage, keeping watched state"),
        }
    }

    /// Drain the cluster and wait for its volumes to be deleted
    ///
    /// Listing, cordon and drain failures are errors. Running out of time is
    /// not: it is reported as [`VolumeOutcome::TimedOut`] so the caller can
    /// decide whether to continue.
    pub async fn run(&self, deadline: Instant) -> Result<VolumeOutcome> {
        let snapshot = Arc::new(Mutex::new(StorageSnapshot {
            claims: self.cluster.list_claims().await?,
            volumes: self.cluster.list_volumes().await?,
        }));
        {
            let snap = snapshot.lock();
            info!(
                claims = snap.claims.len(),
                volumes = snap.volumes.len(),
                "Captured cluster storage"
            );
        }

        // dropping the set aborts the watches on every return path
        let mut watches = JoinSet::new();
        watches.spawn(track_deletions(
            self.cluster.watch_claim_deletions(),
            Arc::clone(&snapshot),
            StorageKind::Claim,
        ));
        watches.spawn(track_deletions(
            self.cluster.watch_volume_deletions(),
            Arc::clone(&snapshot),
            StorageKind::Volume,
        ));

        let workers = self.cluster.list_worker_nodes().await?;

        self.enter(VolumePhase::Cordoning);
        for node in &workers {
            self.cluster.cordon_node(node).await?;
            debug!(node = %node, "Cordoned");
        }

        self.enter(VolumePhase::Draining);
        for node in &workers {
            self.cluster.drain_node(node).await?;
            info!(node = %node, "Drained");
        }

        self.enter(VolumePhase::AwaitingDeletion);
        let mut delete_claims = true;
        let waited = backoff_until(&self.backoff, deadline, "persistent volume deletion", || {
            let first = std::mem::take(&mut delete_claims);
            let cluster = Arc::clone(&self.cluster);
            let snapshot = Arc::clone(&snapshot);
            async move {
                if first {
                    let claims = snapshot.lock().claims.list();
                    for claim in &claims {
                        match cluster.delete_claim(claim).await {
                            Ok(()) => debug!(claim = %claim.key, "Claim deletion requested"),
                            Err(e) => warn!(claim = %claim.key, error = %e, "Failed to delete claim"),
                        }
                    }
                }
                let remaining = snapshot.lock().volumes.len();
                debug!(remaining = remaining, "Waiting for volumes");
                Ok(remaining == 0)
            }
        })
        .await;

        watches.abort_all();

        let converged = match waited {
            Ok(()) => true,
            Err(Error::Timeout { .. }) => {
                self.resync(&snapshot).await;
                snapshot.lock().volumes.is_empty()
            }
            Err(e) => return Err(e),
        };

        if converged {
            self.enter(VolumePhase::Converged);
            info!("Cluster storage deleted");
            return Ok(VolumeOutcome::Converged);
        }

        self.enter(VolumePhase::TimedOut);
        let snap = snapshot.lock();
        for claim in snap.claims.list() {
            warn!(claim = %claim.display_name, "Claim was not deleted before the deadline");
        }
        for volume in snap.volumes.list() {
            warn!(volume = %volume.display_name, "Volume was not deleted before the deadline");
        }
        Ok(VolumeOutcome::TimedOut {
            claims: snap.claims.keys(),
            volumes: snap.volumes.keys(),
        })
    }
}

/// Stage func running a [`VolumeReconciler`] with its own deadline
pub struct VolumeStageFunc {
    reconciler: VolumeReconciler,
    timeout: Duration,
    fail_on_timeout: bool,
}

impl VolumeStageFunc {
    /// Stage func name
    pub const NAME: &'static str = "persistent-volumes";

    /// Wrap `reconciler`, allowing it `timeout` per run
    pub fn new(reconciler: VolumeReconciler, timeout: Duration) -> Self {
        Self {
            reconciler,
            timeout,
            fail_on_timeout: false,
        }
    }

    /// Treat an expired deadline as fatal
    pub fn fail_on_timeout(mut self, fail: bool) -> Self {
        self.fail_on_timeout = fail;
        self
    }
}

#[async_trait]
impl StageFunc for VolumeStageFunc {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn run(&self, _cancel: &CancellationToken) -> Result<bool> {
        let deadline = Instant::now() + self.timeout;
        match self.reconciler.run(deadline).await? {
            VolumeOutcome::Converged => Ok(true),
            VolumeOutcome::TimedOut { claims, volumes } if self.fail_on_timeout => {
                Err(Error::timeout_with(
                    "persistent volume deletion",
                    claims.into_iter().chain(volumes).collect(),
                ))
            }
            VolumeOutcome::TimedOut { volumes, .. } => {
                warn!(
                    remaining = volumes.len(),
                    "Continuing teardown with volumes still present"
                );
                Ok(true)
            }
        }
    }
}
