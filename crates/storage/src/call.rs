//! Per-call policy: deadline and transient-failure retry
//!
//! Retry only ever repeats a single backend call that failed with
//! `Unavailable`. Application-level outcomes (`NotFound`,
//! `FailedPrecondition`, a lost race) are returned as they are.

use membersys_core::config::{Consistency, RetryConfig};
use membersys_core::{Result, StoreError};
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Options fixed when a store is opened
#[derive(Debug, Clone, Copy)]
pub struct StoreOptions {
    /// Deadline for one logical operation
    pub timeout: Duration,
    pub retry: RetryConfig,
    /// Consistency of plain listings (wide-column only)
    pub listing_consistency: Consistency,
}

impl Default for StoreOptions {
    fn default() -> Self {
        let timeout = Duration::from_secs(5);
        Self {
            timeout,
            retry: RetryConfig::for_timeout(timeout),
            listing_consistency: Consistency::One,
        }
    }
}

/// Run `fut`, failing with `DeadlineExceeded` once `timeout` elapses
///
/// The future is dropped on expiry, which cancels the backend call.
pub async fn with_deadline<T, F>(timeout: Duration, op: &str, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(StoreError::DeadlineExceeded(format!(
            "{op} did not complete within {timeout:?}"
        ))),
    }
}

/// Run `call` until it succeeds, fails permanently, or attempts run out
pub async fn with_retry<T, F, Fut>(policy: &RetryConfig, op: &str, mut call: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match call().await {
            Err(err) if err.is_transient() && attempt < max_attempts => {
                let delay = policy.backoff(attempt);
                warn!(op, attempt, ?delay, error = %err, "transient backend failure, retrying");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            result => return result,
        }
    }
}
