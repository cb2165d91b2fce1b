//! Bounded fixed-delay retry loops with an injectable sleeper.
//!
//! Two loops in the reconciler wait on the eventually-consistent read path:
//! ingress endpoint resolution and the status convergence check. Both take a
//! [`RetryPolicy`] value and a [`Sleeper`] so that tests can run them with zero
//! retries or zero real delay.
//!
//! # Example
//!
//! ```ignore
//! use tribefire_operator::retry::{poll_until, RetryPolicy, TokioSleeper};
//!
//! let converged = poll_until(&RetryPolicy::new(10, Duration::from_secs(1)), &TokioSleeper, "status", || async {
//!     Ok::<_, Error>(store.get_runtime(ns, name).await?.is_some())
//! })
//! .await?;
//! ```

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, trace};

/// Retry count and fixed delay for a bounded loop
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Number of retries after the initial attempt
    pub retries: u32,
    /// Delay before each retry
    pub delay: Duration,
}

impl RetryPolicy {
    /// Create a policy with the given retry count and delay
    pub const fn new(retries: u32, delay: Duration) -> Self {
        Self { retries, delay }
    }

    /// A policy that never retries and never sleeps
    pub const fn none() -> Self {
        Self::new(0, Duration::ZERO)
    }
}

/// Abstraction over waiting, so retry loops can run without wall-clock delay
#[async_trait]
pub trait Sleeper: Send + Sync {
    /// Wait for the given duration
    async fn sleep(&self, duration: Duration);
}

/// Production sleeper backed by the tokio timer
#[derive(Clone, Copy, Debug, Default)]
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Sleeper that returns immediately
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopSleeper;

#[async_trait]
impl Sleeper for NoopSleeper {
    async fn sleep(&self, _duration: Duration) {}
}

/// Run `operation` until it yields `Some`, at most `1 + policy.retries` times.
///
/// Returns `None` once the budget is exhausted; the caller picks the fallback.
pub async fn retry_fixed<F, Fut, T>(
    policy: &RetryPolicy,
    sleeper: &dyn Sleeper,
    operation_name: &str,
    mut operation: F,
) -> Option<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Option<T>>,
{
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        if let Some(value) = operation().await {
            return Some(value);
        }
        if attempt > policy.retries {
            debug!(
                operation = %operation_name,
                attempts = attempt,
                "giving up after retry budget"
            );
            return None;
        }
        trace!(operation = %operation_name, attempt, "not ready yet, retrying");
        sleeper.sleep(policy.delay).await;
    }
}

/// Poll `check_fn` exactly `policy.retries` times, sleeping `policy.delay`
/// before each check, until it returns `Ok(true)`.
///
/// Returns `Ok(true)` if the condition was observed, `Ok(false)` if the budget
/// ran out (including a budget of zero), or the first error from `check_fn`.
pub async fn poll_until<F, Fut, E>(
    policy: &RetryPolicy,
    sleeper: &dyn Sleeper,
    operation_name: &str,
    mut check_fn: F,
) -> Result<bool, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool, E>>,
{
    for attempt in 1..=policy.retries {
        sleeper.sleep(policy.delay).await;
        if check_fn().await? {
            trace!(operation = %operation_name, attempt, "condition met");
            return Ok(true);
        }
        trace!(operation = %operation_name, attempt, "condition not met yet");
    }
    Ok(false)
}
