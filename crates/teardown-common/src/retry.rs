//! Retry policies used by the teardown orchestrator
//!
//! Three shapes of waiting show up during teardown:
//!
//! - [`retry_with_backoff`] with [`RetryConfig::fixed`]: a bounded number of
//!   attempts at a fixed interval, for single steps that usually succeed
//!   quickly (e.g. a conflicting node patch).
//! - [`poll_until_done`]: polls forever at a fixed interval. Stage tasks use it
//!   because cloud convergence time has no useful upper bound.
//! - [`backoff_until`]: exponential growth capped at a maximum interval, bounded
//!   by a caller-supplied deadline.
//!
//! # Example
//!
//! ```ignore
//! use teardown_common::retry::{retry_with_backoff, RetryConfig};
//!
//! let node = retry_with_backoff(
//!     &RetryConfig::fixed(5, Duration::from_secs(1)),
//!     "cordon_node",
//!     || async { nodes.patch(name, &params, &patch).await },
//! ).await?;
//! ```

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

use crate::Error;

/// Configuration for operations that may fail transiently.
#[derive(Clone, Debug)]
pub struct RetryConfig {
    /// Maximum number of attempts (0 = infinite)
    pub max_attempts: u32,
    /// Initial delay between retries
    pub initial_delay: Duration,
    /// Maximum delay between retries
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    pub backoff_multiplier: f64,
    /// Randomize each delay between 0.5x and 1.5x
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 0, // infinite
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// Create a config with a maximum number of attempts
    pub fn with_max_attempts(attempts: u32) -> Self {
        Self {
            max_attempts: attempts,
            ..Default::default()
        }
    }

    /// Bounded retries at a fixed interval, no growth and no jitter
    pub fn fixed(max_attempts: u32, interval: Duration) -> Self {
        Self {
            max_attempts,
            initial_delay: interval,
            max_delay: interval,
            backoff_multiplier: 1.0,
            jitter: false,
        }
    }
}

/// Execute an async operation until it succeeds or attempts run out.
///
/// Returns the first `Ok`, or the last error once `max_attempts` is reached.
pub async fn retry_with_backoff<F, Fut, T, E>(
    config: &RetryConfig,
    operation_name: &str,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempt = 0u32;
    let mut delay = config.initial_delay;

    loop {
        attempt += 1;

        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) => {
                if config.max_attempts > 0 && attempt >= config.max_attempts {
                    error!(
                        operation = %operation_name,
                        attempt = attempt,
                        error = %e,
                        "Operation failed after max retries"
                    );
                    return Err(e);
                }

                let sleep_for = if config.jitter {
                    let jitter = rand::thread_rng().gen_range(0.5..1.5);
                    Duration::from_secs_f64(delay.as_secs_f64() * jitter)
                } else {
                    delay
                };

                warn!(
                    operation = %operation_name,
                    attempt = attempt,
                    error = %e,
                    delay_ms = sleep_for.as_millis(),
                    "Operation failed, retrying"
                );

                tokio::time::sleep(sleep_for).await;

                delay = Duration::from_secs_f64(
                    (delay.as_secs_f64() * config.backoff_multiplier)
                        .min(config.max_delay.as_secs_f64()),
                );
            }
        }
    }
}

/// Poll `check` at a fixed interval until it reports done.
///
/// `check` runs immediately, then once per `interval`:
/// - `Ok(true)` stops polling with success
/// - `Ok(false)` sleeps and polls again, with no attempt cap
/// - `Err(e)` stops polling and returns `e`
///
/// Returns [`Error::Cancelled`] if `cancel` fires while waiting.
pub async fn poll_until_done<F, Fut>(
    interval: Duration,
    cancel: &CancellationToken,
    mut check: F,
) -> Result<(), Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool, Error>>,
{
    loop {
        if cancel.is_cancelled() {
            return Err(Error::cancelled("poll"));
        }

        match check().await {
            Ok(true) => return Ok(()),
            Ok(false) => trace!("Poll condition not yet met"),
            Err(e) => return Err(e),
        }

        tokio::select! {
            _ = cancel.cancelled() => return Err(Error::cancelled("poll")),
            _ = tokio::time::sleep(interval) => {}
        }
    }
}

/// Capped exponential backoff parameters
#[derive(Clone, Debug, PartialEq)]
pub struct Backoff {
    /// Delay after the first attempt
    pub initial: Duration,
    /// Growth factor per attempt
    pub factor: f64,
    /// Maximum number of attempts
    pub steps: u32,
    /// Upper bound for any single delay
    pub cap: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(2),
            factor: 1.5,
            steps: 64,
            cap: Duration::from_secs(30),
        }
    }
}

impl Backoff {
    /// Delay to sleep after attempt number `attempt` (zero-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let grown = self.initial.as_secs_f64() * self.factor.powi(attempt as i32);
        Duration::from_secs_f64(grown.min(self.cap.as_secs_f64()))
    }
}

/// Retry `check` with capped exponential backoff until `deadline`.
///
/// The remaining budget is computed once, before the first attempt, and the
/// whole loop runs under a single timeout so the deadline never drifts with
/// per-iteration clock reads.
///
/// Stops on `Ok(true)` or `Err`. Exhausted steps or an expired deadline return
/// [`Error::Timeout`] with no enumerated resources; callers that know what is
/// outstanding replace it with their own list.
pub async fn backoff_until<F, Fut>(
    backoff: &Backoff,
    deadline: Instant,
    operation_name: &str,
    mut check: F,
) -> Result<(), Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool, Error>>,
{
    let budget = deadline.saturating_duration_since(Instant::now());

    let attempts = async {
        for attempt in 0..backoff.steps {
            if check().await? {
                return Ok(true);
            }
            let delay = backoff.delay_for(attempt);
            debug!(
                operation = %operation_name,
                attempt = attempt + 1,
                delay_ms = delay.as_millis(),
                "Not converged, backing off"
            );
            tokio::time::sleep(delay).await;
        }
        Ok::<_, Error>(false)
    };

    match tokio::time::timeout(budget, attempts).await {
        Ok(Ok(true)) => Ok(()),
        Ok(Ok(false)) => {
            warn!(operation = %operation_name, steps = backoff.steps, "Backoff steps exhausted");
            Err(Error::timeout(operation_name))
        }
        Ok(Err(e)) => Err(e),
        Err(_) => {
            warn!(operation = %operation_name, budget_ms = budget.as_millis(), "Deadline exceeded");
            Err(Error::timeout(operation_name))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast_backoff(steps: u32) -> Backoff {
        Backoff {
            initial: Duration::from_millis(1),
            factor: 2.0,
            steps,
            cap: Duration::from_millis(5),
        }
    }

    #[tokio::test]
    async fn test_succeeds_immediately() {
        let config = RetryConfig::with_max_attempts(3);
        let result: Result<i32, &str> =
            retry_with_backoff(&config, "op", || async { Ok(42) }).await;
        assert_eq!(result, Ok(42));
    }

    #[tokio::test]
    async fn test_succeeds_after_failures() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();

        let config = RetryConfig {
            max_attempts: 5,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
            backoff_multiplier: 2.0,
            jitter: true,
        };

        let result: Result<i32, &str> = retry_with_backoff(&config, "op", || {
            let c = c.clone();
            async move {
                if c.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err("fail")
                } else {
                    Ok(42)
                }
            }
        })
        .await;

        assert_eq!(result, Ok(42));
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_fixed_returns_last_error_after_max_attempts() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();

        let config = RetryConfig::fixed(3, Duration::from_millis(1));
        let result: Result<i32, String> = retry_with_backoff(&config, "op", || {
            let c = c.clone();
            async move {
                let n = c.fetch_add(1, Ordering::SeqCst);
                Err(format!("attempt {n}"))
            }
        })
        .await;

        assert_eq!(result, Err("attempt 2".to_string()));
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_fixed_config_never_grows() {
        let config = RetryConfig::fixed(4, Duration::from_secs(2));
        assert_eq!(config.initial_delay, config.max_delay);
        assert_eq!(config.backoff_multiplier, 1.0);
        assert!(!config.jitter);
    }

    #[tokio::test]
    async fn test_poll_until_done_polls_until_true() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();
        let cancel = CancellationToken::new();

        let result = poll_until_done(Duration::from_millis(1), &cancel, || {
            let c = c.clone();
            async move { Ok(c.fetch_add(1, Ordering::SeqCst) >= 4) }
        })
        .await;

        assert!(result.is_ok());
        assert_eq!(count.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn test_poll_until_done_stops_on_error() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();
        let cancel = CancellationToken::new();

        let result = poll_until_done(Duration::from_millis(1), &cancel, || {
            let c = c.clone();
            async move {
                if c.fetch_add(1, Ordering::SeqCst) == 1 {
                    Err(Error::list("vpc", "denied"))
                } else {
                    Ok(false)
                }
            }
        })
        .await;

        assert!(matches!(result, Err(Error::List { .. })));
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_poll_until_done_observes_cancellation() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();

        let handle = tokio::spawn(async move {
            poll_until_done(Duration::from_millis(5), &cancel, || async { Ok(false) }).await
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        trigger.cancel();

        let result = handle.await.unwrap();
        assert!(matches!(result, Err(Error::Cancelled { .. })));
    }

    #[test]
    fn test_backoff_delay_is_capped() {
        let backoff = Backoff {
            initial: Duration::from_secs(1),
            factor: 2.0,
            steps: 10,
            cap: Duration::from_secs(5),
        };
        assert_eq!(backoff.delay_for(0), Duration::from_secs(1));
        assert_eq!(backoff.delay_for(1), Duration::from_secs(2));
        assert_eq!(backoff.delay_for(2), Duration::from_secs(4));
        assert_eq!(backoff.delay_for(3), Duration::from_secs(5));
        assert_eq!(backoff.delay_for(9), Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_backoff_until_succeeds_before_deadline() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();
        let deadline = Instant::now() + Duration::from_secs(5);

        let result = backoff_until(&fast_backoff(10), deadline, "op", || {
            let c = c.clone();
            async move { Ok(c.fetch_add(1, Ordering::SeqCst) == 2) }
        })
        .await;

        assert!(result.is_ok());
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_backoff_until_times_out_at_deadline() {
        let deadline = Instant::now() + Duration::from_millis(20);

        let result = backoff_until(&fast_backoff(u32::MAX), deadline, "volumes", || async {
            Ok(false)
        })
        .await;

        match result {
            Err(Error::Timeout { operation, .. }) => assert_eq!(operation, "volumes"),
            other => panic!("expected timeout, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_backoff_until_times_out_when_steps_exhausted() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();
        let deadline = Instant::now() + Duration::from_secs(5);

        let result = backoff_until(&fast_backoff(3), deadline, "op", || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Ok(false)
            }
        })
        .await;

        assert!(matches!(result, Err(Error::Timeout { .. })));
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_backoff_until_propagates_errors() {
        let deadline = Instant::now() + Duration::from_secs(5);
        let result = backoff_until(&fast_backoff(5), deadline, "op", || async {
            Err(Error::internal("boom"))
        })
        .await;
        assert!(matches!(result, Err(Error::Internal { .. })));
    }
}
