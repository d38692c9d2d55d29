//! Staged cluster teardown
//!
//! This crate provides:
//! - The stage pipeline and its executor (barrier-separated groups of
//!   concurrently polled funcs)
//! - The per-resource-type reconciliation loop (list, diff, delete, pending)
//! - The watch-driven volume drain and delete reconciler
//! - The `Destroyer` trait, cluster metadata, and the platform registry
//! - The built-in Cluster API platform

#![deny(missing_docs)]

pub mod capi;
pub mod destroyer;
pub mod kube_client;
pub mod metadata;
pub mod reconcile;
pub mod registry;
pub mod stage;
pub mod volumes;

pub use destroyer::{ClusterQuota, DestroyOptions, Destroyer, QuotaUsage, StagedDestroyer};
pub use metadata::ClusterMetadata;
pub use reconcile::{ResourceDeleter, ResourceLister, ResourceReconciler, RunState};
pub use registry::{DestroyerFactory, Registry};
pub use stage::{stage_fn, Pipeline, Stage, StageFunc};
pub use volumes::{
    KubeVolumeCluster, VolumeCluster, VolumeOutcome, VolumePhase, VolumeReconciler,
    VolumeStageFunc,
};

#[cfg(test)]
pub use reconcile::{MockResourceDeleter, MockResourceLister};
