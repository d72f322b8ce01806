//! Retry policies for broker requests.
//!
//! | Policy | Min Delay | Max Delay | Retries | Use Case |
//! |--------|-----------|-----------|---------|----------|
//! | `delivery_policy` | 50ms | 2s | configured | batch sends |
//! | `fast_policy` | 5ms | 100ms | 3 | group operations racing a rebalance |
//!
//! Only errors for which [`Error::is_retriable`] holds are retried; a lost
//! connection surfaces immediately.

use std::future::Future;
use std::time::Duration;

use backon::{ExponentialBuilder, Retryable};

use crate::constants::{RETRY_MAX_DELAY, RETRY_MIN_DELAY};
use crate::error::{Error, Result};

/// Policy for sending produced batches, with `retries` extra attempts.
pub fn delivery_policy(retries: usize) -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(RETRY_MIN_DELAY)
        .with_max_delay(RETRY_MAX_DELAY)
        .with_max_times(retries)
        .with_jitter()
}

/// Policy for short-lived conflicts such as a coordinator still loading.
pub fn fast_policy() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(5))
        .with_max_delay(Duration::from_millis(100))
        .with_max_times(3)
        .with_jitter()
}

/// Run `operation`, retrying transient broker errors under `policy`.
///
/// `label` identifies the operation in logs.
pub async fn with_policy<F, Fut, T>(
    policy: ExponentialBuilder,
    label: &str,
    operation: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    operation
        .retry(policy)
        .when(Error::is_retriable)
        .notify(|err: &Error, delay: Duration| {
            tracing::debug!(op = label, error = %err, ?delay, "Retrying after transient error");
        })
        .await
}
