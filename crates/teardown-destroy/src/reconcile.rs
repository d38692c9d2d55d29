//! Per-resource-type reconciliation loop
//!
//! One pass of a [`ResourceReconciler`]:
//!
//! 1. List what still exists. A listing failure is fatal: the state of the
//!    type is unobservable and cannot be converted into "pending".
//! 2. Merge the listing into the run's [`PendingItemTracker`].
//! 3. Anything tracked but no longer listed has converged and is forgotten.
//!    Anything still listed is deleted, unless its status shows it is already
//!    terminating. Delete failures go to the [`ErrorTracker`] and never abort
//!    the pass.
//! 4. A non-empty pending set is reported as [`Error::Pending`], which the
//!    stage executor treats as "poll again".

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

#[cfg(test)]
use mockall::automock;

use teardown_common::retry::poll_until_done;
use teardown_common::{
    Error, ErrorTracker, ListFilter, PendingItemTracker, ResourceDescriptor, ResourceSet, Result,
    STATUS_DELETING,
};

use crate::stage::StageFunc;

/// Lists the objects of one resource type that belong to a cluster
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ResourceLister: Send + Sync {
    /// Return every matching object currently visible to the API
    async fn list(&self, filter: &ListFilter) -> Result<ResourceSet>;
}

/// Deletes one object of a resource type
///
/// Implementations must be idempotent: an object that is already gone is a
/// successful delete.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ResourceDeleter: Send + Sync {
    /// Issue the delete for one object
    async fn delete(&self, item: &ResourceDescriptor) -> Result<()>;
}

/// Trackers shared by every reconciler in one teardown run
#[derive(Clone, Debug, Default)]
pub struct RunState {
    /// Items not yet confirmed deleted, per type
    pub pending: Arc<PendingItemTracker>,
    /// Last delete failure per item
    pub errors: Arc<ErrorTracker>,
}

impl RunState {
    /// Fresh trackers for a new run
    pub fn new() -> Self {
        Self::default()
    }
}

/// Convergence loop for a single resource type
pub struct ResourceReconciler {
    type_name: String,
    filter: ListFilter,
    lister: Arc<dyn ResourceLister>,
    deleter: Arc<dyn ResourceDeleter>,
    state: RunState,
    terminating_states: Vec<String>,
}

impl ResourceReconciler {
    /// Create a reconciler for `type_name` using the run's trackers
    pub fn new(
        type_name: impl Into<String>,
        filter: ListFilter,
        lister: Arc<dyn ResourceLister>,
        deleter: Arc<dyn ResourceDeleter>,
        state: RunState,
    ) -> Self {
        Self {
            type_name: type_name.into(),
            filter,
            lister,
            deleter,
            state,
            terminating_states: vec![STATUS_DELETING.to_string()],
        }
    }

    /// Replace the statuses that mean "deletion already in progress"
    pub fn with_terminating_states<I, S>(mut self, states: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.terminating_states = states.into_iter().map(Into::into).collect();
        self
    }

    /// Resource type this reconciler owns
    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    fn is_terminating(&self, item: &ResourceDescriptor) -> bool {
        self.terminating_states
            .iter()
            .any(|s| s.eq_ignore_ascii_case(&item.status))
    }

    fn error_key(&self, item: &ResourceDescriptor) -> String {
        format!("{}/{}", self.type_name, item.key)
    }

    /// Run one list/diff/delete pass
    ///
    /// Returns `Ok(())` once nothing is pending, [`Error::Pending`] while items
    /// remain, and any other error when the type could not be listed.
    pub async fn reconcile_once(&self) -> Result<()> {
        let found = self.lister.list(&self.filter).await.map_err(|e| match e {
            Error::List { .. } => e,
            other => Error::list(&self.type_name, other.to_string()),
        })?;

        let items = self.state.pending.insert(&self.type_name, found.list());

        for item in &items {
            if !found.contains(&item.key) {
                info!(resource_type = %self.type_name, name = %item.display_name, "Deleted");
                self.state.pending.remove(&self.type_name, [item.key.as_str()]);
                self.state.errors.forget(&self.error_key(item));
                continue;
            }

            if self.is_terminating(item) {
                debug!(
                    resource_type = %self.type_name,
                    name = %item.display_name,
                    status = %item.status,
                    "Deletion already in progress"
                );
                continue;
            }

            debug!(resource_type = %self.type_name, name = %item.display_name, "Deleting");
            if let Err(e) = self.deleter.delete(item).await {
                self.state.errors.suppress_warning(&self.error_key(item), &e);
            }
        }

        match self.state.pending.count(&self.type_name) {
            0 => Ok(()),
            count => Err(Error::pending(&self.type_name, count)),
        }
    }

    /// Repeat passes every `interval` until the type converges
    pub async fn converge(&self, interval: Duration, cancel: &CancellationToken) -> Result<()> {
        poll_until_done(interval, cancel, || self.run(cancel)).await
    }
}

#[async_trait]
impl StageFunc for ResourceReconciler {
    fn name(&self) -> &str {
        &self.type_name
    }

    async fn run(&self, _cancel: &CancellationToken) -> Result<bool> {
        match self.reconcile_once().await {
            Ok(()) => Ok(true),
            Err(e) if e.is_pending() => {
                debug!(resource_type = %self.type_name, "{}", e);
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn fip(key: &str) -> ResourceDescriptor {
        ResourceDescriptor::new("floating-ip", key)
    }

    fn set(items: &[ResourceDescriptor]) -> ResourceSet {
        items.iter().cloned().collect()
    }

    /// Lister that returns the next scripted listing on every call
    fn scripted_lister(passes: Vec<ResourceSet>) -> MockResourceLister {
        let calls = AtomicUsize::new(0);
        let mut lister = MockResourceLister::new();
        lister.expect_list().returning(move |_| {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            Ok(passes.get(n).cloned().unwrap_or_default())
        });
        lister
    }

    fn reconciler(
        lister: MockResourceLister,
        deleter: MockResourceDeleter,
        state: RunState,
    ) -> ResourceReconciler {
        ResourceReconciler::new(
            "floating-ip",
            ListFilter::for_infra_id("demo"),
            Arc::new(lister),
            Arc::new(deleter),
            state,
        )
    }

    #[tokio::test]
    async fn converges_in_two_passes_when_listing_empties() {
        let lister = scripted_lister(vec![set(&[fip("a"), fip("b")]), ResourceSet::new()]);
        let mut deleter = MockResourceDeleter::new();
        deleter.expect_delete().times(2).returning(|_| Ok(()));

        let state = RunState::new();
        let r = reconciler(lister, deleter, state.clone());

        let first = r.reconcile_once().await;
        assert!(matches!(first, Err(Error::Pending { count: 2, .. })));

        assert!(r.reconcile_once().await.is_ok());
        assert_eq!(state.pending.count("floating-ip"), 0);
    }

    /// Story: one delete keeps failing for a pass while its sibling succeeds
    #[tokio::test]
    async fn scenario_pending_counts_down_across_three_passes() {
        let lister = scripted_lister(vec![
            set(&[fip("a"), fip("b")]),
            set(&[fip("b")]),
            ResourceSet::new(),
        ]);

        let b_attempts = AtomicUsize::new(0);
        let mut deleter = MockResourceDeleter::new();
        deleter.expect_delete().returning(move |item| {
            if item.key == "b" && b_attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(Error::delete("floating-ip", "b", "DependencyViolation"))
            } else {
                Ok(())
            }
        });

        let state = RunState::new();
        let r = reconciler(lister, deleter, state.clone());

        let mut counts = Vec::new();
        for _ in 0..3 {
            match r.reconcile_once().await {
                Err(Error::Pending { count, .. }) => counts.push(count),
                Ok(()) => counts.push(0),
                Err(e) => panic!("unexpected error: {e}"),
            }
        }

        assert_eq!(counts, vec![2, 1, 0]);
        assert_eq!(
            state.errors.last_error("floating-ip/b"),
            None,
            "converged items drop their error record"
        );
    }

    #[tokio::test]
    async fn pending_includes_previous_items_not_yet_confirmed_gone() {
        let lister = scripted_lister(vec![set(&[fip("a"), fip("b")]), set(&[fip("a")])]);
        let mut deleter = MockResourceDeleter::new();
        deleter.expect_delete().returning(|_| Ok(()));

        let state = RunState::new();
        let r = reconciler(lister, deleter, state.clone());

        let _ = r.reconcile_once().await;
        let second = r.reconcile_once().await;

        // b was tracked and is no longer listed, so it converged
        assert!(matches!(second, Err(Error::Pending { count: 1, .. })));
        let keys: Vec<_> = state.pending.get("floating-ip").into_iter().map(|d| d.key).collect();
        assert_eq!(keys, vec!["a"]);
    }

    #[tokio::test]
    async fn listing_failure_is_fatal() {
        let mut lister = MockResourceLister::new();
        lister
            .expect_list()
            .returning(|_| Err(Error::internal("connection refused")));
        let mut deleter = MockResourceDeleter::new();
        deleter.expect_delete().never();

        let r = reconciler(lister, deleter, RunState::new());
        let err = r.reconcile_once().await.unwrap_err();

        assert!(!err.is_pending());
        assert!(matches!(err, Error::List { ref resource_type, .. } if resource_type == "floating-ip"));
        assert!(r.run(&CancellationToken::new()).await.is_err());
    }

    #[tokio::test]
    async fn terminating_items_are_not_deleted_again() {
        let lister = scripted_lister(vec![set(&[
            fip("a").with_status("Deleting"),
            fip("b").with_status("available"),
        ])]);
        let mut deleter = MockResourceDeleter::new();
        deleter
            .expect_delete()
            .withf(|item| item.key == "b")
            .times(1)
            .returning(|_| Ok(()));

        let r = reconciler(lister, deleter, RunState::new());
        assert!(matches!(
            r.reconcile_once().await,
            Err(Error::Pending { count: 2, .. })
        ));
    }

    #[tokio::test]
    async fn custom_terminating_states_are_case_insensitive() {
        let lister = scripted_lister(vec![set(&[fip("a").with_status("shutting-down")])]);
        let mut deleter = MockResourceDeleter::new();
        deleter.expect_delete().never();

        let r = reconciler(lister, deleter, RunState::new())
            .with_terminating_states(["Shutting-Down", "Terminated"]);
        assert!(r.reconcile_once().await.is_err());
    }

    #[tokio::test]
    async fn failing_delete_does_not_abort_pass() {
        let lister = scripted_lister(vec![set(&[fip("a"), fip("b"), fip("c")])]);
        let deleted = Arc::new(AtomicUsize::new(0));
        let d = deleted.clone();
        let mut deleter = MockResourceDeleter::new();
        deleter.expect_delete().returning(move |item| {
            d.fetch_add(1, Ordering::SeqCst);
            if item.key == "a" {
                Err(Error::delete("floating-ip", "a", "throttled"))
            } else {
                Ok(())
            }
        });

        let state = RunState::new();
        let r = reconciler(lister, deleter, state.clone());
        let _ = r.reconcile_once().await;

        assert_eq!(deleted.load(Ordering::SeqCst), 3);
        assert!(state.errors.last_error("floating-ip/a").is_some());
    }

    #[tokio::test]
    async fn stage_run_maps_pending_to_not_done() {
        let lister = scripted_lister(vec![set(&[fip("a")]), ResourceSet::new()]);
        let mut deleter = MockResourceDeleter::new();
        deleter.expect_delete().returning(|_| Ok(()));

        let r = reconciler(lister, deleter, RunState::new());
        let cancel = CancellationToken::new();

        assert!(!r.run(&cancel).await.unwrap());
        assert!(r.run(&cancel).await.unwrap());
        assert_eq!(r.name(), "floating-ip");
    }

    #[tokio::test]
    async fn converge_polls_until_empty() {
        let lister = scripted_lister(vec![
            set(&[fip("a")]),
            set(&[fip("a")]),
            ResourceSet::new(),
        ]);
        let mut deleter = MockResourceDeleter::new();
        deleter.expect_delete().times(2).returning(|_| Ok(()));

        let r = reconciler(lister, deleter, RunState::new());
        let result = r
            .converge(Duration::from_millis(1), &CancellationToken::new())
            .await;
        assert!(result.is_ok());
    }
}
