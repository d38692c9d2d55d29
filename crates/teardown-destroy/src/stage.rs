//! Stage pipeline and executor
//!
//! A [`Pipeline`] is an ordered list of [`Stage`]s. Every [`StageFunc`] in a
//! stage is independent of its siblings and runs as its own tokio task,
//! polled at the pipeline's interval until it reports done. A stage is a
//! barrier: the next one starts only after every func in the current stage
//! has finished.
//!
//! The first fatal error in a stage cancels the stage's token and aborts the
//! sibling tasks before the error is returned, so no background polling or
//! log noise outlives a failed run. A failed run leaves the cluster partially
//! torn down; running it again is safe because deletes are idempotent and
//! every loop converges from whatever state it finds.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use teardown_common::retry::poll_until_done;
use teardown_common::{Error, Result};

/// One independently retried unit of teardown work
///
/// `run` returns `Ok(true)` when done, `Ok(false)` to be polled again later,
/// and `Err` for a fatal error that aborts the pipeline.
#[async_trait]
pub trait StageFunc: Send + Sync {
    /// Name used in logs and errors
    fn name(&self) -> &str;

    /// Make one attempt
    async fn run(&self, cancel: &CancellationToken) -> Result<bool>;
}

/// [`StageFunc`] backed by a closure
pub struct FnStage<F> {
    name: String,
    f: F,
}

/// Wrap a closure as a [`StageFunc`]
pub fn stage_fn<F, Fut>(name: impl Into<String>, f: F) -> FnStage<F>
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = Result<bool>> + Send,
{
    FnStage {
        name: name.into(),
        f,
    }
}

#[async_trait]
impl<F, Fut> StageFunc for FnStage<F>
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = Result<bool>> + Send,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, _cancel: &CancellationToken) -> Result<bool> {
        (self.f)().await
    }
}

/// A named group of funcs with no dependencies between them
#[derive(Clone)]
pub struct Stage {
    name: String,
    funcs: Vec<Arc<dyn StageFunc>>,
}

impl Stage {
    /// Create an empty stage
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            funcs: Vec::new(),
        }
    }

    /// Add a func to the stage
    pub fn with_func(mut self, func: impl StageFunc + 'static) -> Self {
        self.funcs.push(Arc::new(func));
        self
    }

    /// Add an already shared func to the stage
    pub fn with_shared(mut self, func: Arc<dyn StageFunc>) -> Self {
        self.funcs.push(func);
        self
    }

    /// Stage name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Names of the funcs in this stage
    pub fn func_names(&self) -> Vec<&str> {
        self.funcs.iter().map(|f| f.name()).collect()
    }

    /// Number of funcs in this stage
    pub fn len(&self) -> usize {
        self.funcs.len()
    }

    /// Whether the stage has no funcs
    pub fn is_empty(&self) -> bool {
        self.funcs.is_empty()
    }

    async fn execute(&self, interval: Duration, parent: &CancellationToken) -> Result<()> {
        let cancel = parent.child_token();
        let mut tasks = JoinSet::new();

        for func in &self.funcs {
            let func = Arc::clone(func);
            let cancel = cancel.clone();
            tasks.spawn(async move {
                let result = poll_until_done(interval, &cancel, || func.run(&cancel)).await;
                (func.name().to_string(), result)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((task, Ok(()))) => {
                    debug!(stage = %self.name, task = %task, remaining = tasks.len(), "Task complete");
                }
                Ok((task, Err(e))) => {
                    cancel.cancel();
                    tasks.abort_all();
                    if parent.is_cancelled() {
                        return Err(Error::cancelled(format!("stage {}", self.name)));
                    }
                    return Err(Error::stage_failed(&self.name, task, e));
                }
                Err(join_err) => {
                    cancel.cancel();
                    tasks.abort_all();
                    return Err(Error::internal_with_context(
                        "executor",
                        format!("task in stage {} did not complete: {}", self.name, join_err),
                    ));
                }
            }
        }

        Ok(())
    }
}

/// Ordered sequence of stages
#[derive(Clone)]
pub struct Pipeline {
    stages: Vec<Stage>,
    poll_interval: Duration,
}

impl Pipeline {
    /// Create an empty pipeline polling every `poll_interval`
    pub fn new(poll_interval: Duration) -> Self {
        Self {
            stages: Vec::new(),
            poll_interval,
        }
    }

    /// Append a stage
    pub fn stage(mut self, stage: Stage) -> Self {
        self.stages.push(stage);
        self
    }

    /// Stages in execution order
    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    /// Run every stage in order
    ///
    /// Returns `Ok(())` only if every func of every stage reported done.
    /// Otherwise returns the first fatal error; later stages never start.
    pub async fn run(&self, cancel: &CancellationToken) -> Result<()> {
        let total = self.stages.len();

        for (index, stage) in self.stages.iter().enumerate() {
            if cancel.is_cancelled() {
                return Err(Error::cancelled(format!("before stage {}", stage.name)));
            }

            info!(
                stage = %stage.name,
                step = index + 1,
                total = total,
                tasks = stage.len(),
                "Starting stage"
            );

            if let Err(e) = stage.execute(self.poll_interval, cancel).await {
                warn!(stage = %stage.name, error = %e, "Stage failed");
                return Err(e);
            }

            info!(stage = %stage.name, "Stage complete");
        }

        Ok(())
    }
}
