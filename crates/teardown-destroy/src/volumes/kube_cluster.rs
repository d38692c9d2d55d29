//! [`VolumeCluster`] backed by a Kubernetes API server

use std::fmt::Debug;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use k8s_openapi::api::core::v1::{Node, PersistentVolume, PersistentVolumeClaim, Pod};
use kube::api::{Api, DeleteParams, EvictParams, ListParams, Patch, PatchParams};
use kube::runtime::watcher::{self, Event};
use kube::runtime::WatchStreamExt;
use kube::{Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde_json::json;
use tracing::{debug, warn};

use teardown_common::retry::{retry_with_backoff, RetryConfig};
use teardown_common::{Error, ResourceDescriptor, ResourceSet, Result, STATUS_DELETING};

use super::VolumeCluster;
use crate::kube_client::delete_outcome;

const CLAIM_TYPE: &str = "persistent-volume-claim";
const VOLUME_TYPE: &str = "persistent-volume";

const CONTROL_PLANE_ROLE: &str = "node-role.kubernetes.io/control-plane";
const MASTER_ROLE: &str = "node-role.kubernetes.io/master";
const MIRROR_POD_ANNOTATION: &str = "kubernetes.io/config.mirror";

const CORDON_ATTEMPTS: u32 = 5;
const CORDON_INTERVAL: Duration = Duration::from_secs(1);

/// Storage operations through kube-rs
#[derive(Clone)]
pub struct KubeVolumeCluster {
    client: Client,
}

impl KubeVolumeCluster {
    /// Operate on the cluster behind `client`
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

fn status_or_deleting<K: Resource>(obj: &K, phase: Option<&str>) -> String {
    if obj.meta().deletion_timestamp.is_some() {
        STATUS_DELETING.to_string()
    } else {
        phase.unwrap_or_default().to_string()
    }
}

fn claim_key(claim: &PersistentVolumeClaim) -> String {
    format!("{}/{}", claim.namespace().unwrap_or_default(), claim.name_any())
}

fn claim_descriptor(claim: &PersistentVolumeClaim) -> ResourceDescriptor {
    let key = claim_key(claim);
    let phase = claim.status.as_ref().and_then(|s| s.phase.as_deref());
    ResourceDescriptor::new(CLAIM_TYPE, claim.name_any())
        .with_key(key.clone())
        .with_display_name(key)
        .with_status(status_or_deleting(claim, phase))
}

fn volume_descriptor(volume: &PersistentVolume) -> ResourceDescriptor {
    let phase = volume.status.as_ref().and_then(|s| s.phase.as_deref());
    ResourceDescriptor::new(VOLUME_TYPE, volume.name_any())
        .with_status(status_or_deleting(volume, phase))
}

fn is_worker(node: &Node) -> bool {
    let labels = node.labels();
    !labels.contains_key(CONTROL_PLANE_ROLE) && !labels.contains_key(MASTER_ROLE)
}

/// DaemonSet pods are recreated on the node and mirror pods cannot be
/// evicted; finished pods hold nothing.
fn is_evictable(pod: &Pod) -> bool {
    let owned_by_daemonset = pod
        .owner_references()
        .iter()
        .any(|owner| owner.kind == "DaemonSet");
    let mirror = pod.annotations().contains_key(MIRROR_POD_ANNOTATION);
    let finished = matches!(
        pod.status.as_ref().and_then(|s| s.phase.as_deref()),
        Some("Succeeded") | Some("Failed")
    );
    !owned_by_daemonset && !mirror && !finished
}

fn deletions<K>(api: Api<K>, key: fn(&K) -> String) -> BoxStream<'static, String>
where
    K: Resource + Clone + DeserializeOwned + Debug + Send + 'static,
{
    watcher::watcher(api, watcher::Config::default())
        .default_backoff()
        .filter_map(move |event| async move {
            match event {
                Ok(Event::Delete(obj)) => Some(key(&obj)),
                Ok(_) => None,
                Err(e) => {
                    debug!(error = %e, "Storage watch error, retrying");
                    None
                }
            }
        })
        .boxed()
}

#[async_trait]
impl VolumeCluster for KubeVolumeCluster {
    async fn list_claims(&self) -> Result<ResourceSet> {
        let api: Api<PersistentVolumeClaim> = Api::all(self.client.clone());
        let claims = api
            .list(&ListParams::default())
            .await
            .map_err(|e| Error::list(CLAIM_TYPE, e.to_string()))?;
        Ok(claims.items.iter().map(claim_descriptor).collect())
    }

    async fn list_volumes(&self) -> Result<ResourceSet> {
        let api: Api<PersistentVolume> = Api::all(self.client.clone());
        let volumes = api
            .list(&ListParams::default())
            .await
            .map_err(|e| Error::list(VOLUME_TYPE, e.to_string()))?;
        Ok(volumes.items.iter().map(volume_descriptor).collect())
    }

    async fn list_worker_nodes(&self) -> Result<Vec<String>> {
        let api: Api<Node> = Api::all(self.client.clone());
        let nodes = api
            .list(&ListParams::default())
            .await
            .map_err(|e| Error::list("node", e.to_string()))?;
        let mut workers: Vec<String> = nodes
            .items
            .iter()
            .filter(|n| is_worker(n))
            .map(|n| n.name_any())
            .collect();
        workers.sort();
        Ok(workers)
    }

    async fn cordon_node(&self, node: &str) -> Result<()> {
        let api: Api<Node> = Api::all(self.client.clone());
        let patch = json!({"spec": {"unschedulable": true}});
        let name = node.to_string();

        retry_with_backoff(
            &RetryConfig::fixed(CORDON_ATTEMPTS, CORDON_INTERVAL),
            "cordon_node",
            || {
                let api = api.clone();
                let patch = patch.clone();
                let name = name.clone();
                async move {
                    api.patch(&name, &PatchParams::default(), &Patch::Merge(&patch))
                        .await
                }
            },
        )
        .await?;
        Ok(())
    }

    async fn drain_node(&self, node: &str) -> Result<()> {
        let api: Api<Pod> = Api::all(self.client.clone());
        let pods = api
            .list(&ListParams::default().fields(&format!("spec.nodeName={}", node)))
            .await
            .map_err(|e| Error::list("pod", e.to_string()))?;

        for pod in pods.items.iter().filter(|p| is_evictable(p)) {
            let namespace = pod.namespace().unwrap_or_default();
            let name = pod.name_any();
            let namespaced: Api<Pod> = Api::namespaced(self.client.clone(), &namespace);

            match namespaced
                .evict(&name, &EvictParams::default())
                .await
                .map_err(Error::from)
            {
                Ok(_) => debug!(node = %node, pod = %name, namespace = %namespace, "Evicted"),
                Err(e) if e.is_not_found() => {}
                Err(e) => {
                    warn!(node = %node, pod = %name, namespace = %namespace, error = %e, "Eviction failed")
                }
            }
        }
        Ok(())
    }

    async fn delete_claim(&self, claim: &ResourceDescriptor) -> Result<()> {
        let (namespace, name) = claim
            .key
            .split_once('/')
            .ok_or_else(|| Error::validation(format!("claim key {:?} has no namespace", claim.key)))?;
        let api: Api<PersistentVolumeClaim> = Api::namespaced(self.client.clone(), namespace);

        let result = api.delete(name, &DeleteParams::default()).await;
        delete_outcome(result, CLAIM_TYPE, &claim.key)
    }

    fn watch_claim_deletions(&self) -> BoxStream<'static, String> {
        deletions(Api::<PersistentVolumeClaim>::all(self.client.clone()), claim_key)
    }

    fn watch_volume_deletions(&self) -> BoxStream<'static, String> {
        deletions(Api::<PersistentVolume>::all(self.client.clone()), |pv| pv.name_any())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{PersistentVolumeClaimStatus, PersistentVolumeStatus, PodStatus};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference, Time};
    use std::collections::BTreeMap;

    fn meta(name: &str, namespace: Option<&str>) -> ObjectMeta {
        ObjectMeta {
            name: Some(name.to_string()),
            namespace: namespace.map(str::to_string),
            ..Default::default()
        }
    }

    fn node(name: &str, labels: &[&str]) -> Node {
        let mut node = Node {
            metadata: meta(name, None),
            ..Default::default()
        };
        node.metadata.labels = Some(
            labels
                .iter()
                .map(|l| (l.to_string(), String::new()))
                .collect::<BTreeMap<_, _>>(),
        );
        node
    }

    fn pod(name: &str) -> Pod {
        Pod {
            metadata: meta(name, Some("default")),
            ..Default::default()
        }
    }

    #[test]
    fn claim_key_includes_namespace() {
        let claim = PersistentVolumeClaim {
            metadata: meta("data-0", Some("db")),
            status: Some(PersistentVolumeClaimStatus {
                phase: Some("Bound".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        };

        let d = claim_descriptor(&claim);
        assert_eq!(d.key, "db/data-0");
        assert_eq!(d.id, "data-0");
        assert_eq!(d.status, "Bound");
    }

    #[test]
    fn terminating_volume_reports_deleting() {
        let mut volume = PersistentVolume {
            metadata: meta("pv-a", None),
            status: Some(PersistentVolumeStatus {
                phase: Some("Released".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert_eq!(volume_descriptor(&volume).status, "Released");

        volume.metadata.deletion_timestamp = Some(Time(Default::default()));
        let d = volume_descriptor(&volume);
        assert_eq!(d.key, "pv-a");
        assert_eq!(d.status, STATUS_DELETING);
    }

    #[test]
    fn control_plane_nodes_are_not_workers() {
        assert!(is_worker(&node("worker-1", &[])));
        assert!(is_worker(&node("worker-2", &["node-role.kubernetes.io/worker"])));
        assert!(!is_worker(&node("cp-1", &[CONTROL_PLANE_ROLE])));
        assert!(!is_worker(&node("old-cp", &[MASTER_ROLE])));
    }

    #[test]
    fn daemonset_mirror_and_finished_pods_are_not_evicted() {
        assert!(is_evictable(&pod("app")));

        let mut ds = pod("fluentd");
        ds.metadata.owner_references = Some(vec![OwnerReference {
            kind: "DaemonSet".to_string(),
            name: "fluentd".to_string(),
            ..Default::default()
        }]);
        assert!(!is_evictable(&ds));

        let mut mirror = pod("etcd");
        mirror.metadata.annotations = Some(BTreeMap::from([(
            MIRROR_POD_ANNOTATION.to_string(),
            "abc".to_string(),
        )]));
        assert!(!is_evictable(&mirror));

        let mut done = pod("job-1");
        done.status = Some(PodStatus {
            phase: Some("Succeeded".to_string()),
            ..Default::default()
        });
        assert!(!is_evictable(&done));
    }
}
