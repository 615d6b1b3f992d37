//! Retry logic providers.
//!
//! A provider decides whether a failed execution is retried and how long to
//! wait first. The pipeline hands it a retryable closure that builds the
//! whole write-and-read unit from scratch on every call, so a retry never
//! observes half-applied state from the failed attempt.
//!
//! ```rust,ignore
//! use sqlclient::retry::{ExponentialRetryProvider, execute_async};
//! use sqlclient::RetryPolicy;
//!
//! let provider = ExponentialRetryProvider::new(RetryPolicy::new().max_retries(5));
//! let rows = execute_async(&provider, || async { run_once().await }).await?;
//! ```

use std::collections::HashSet;
use std::future::Future;
use std::time::Duration;

use once_cell::sync::Lazy;

use crate::config::RetryPolicy;
use crate::error::{Error, Result};

/// Server error numbers treated as transient.
///
/// Deadlock victims, lock timeouts, Azure SQL throttling and failover
/// codes, and transport-level failures reported as server errors.
pub const TRANSIENT_ERROR_NUMBERS: &[i32] = &[
    1204, 1205, 1222, 49918, 49919, 49920, 4060, 4221, 40143, 40613, 40501, 40540, 40197, 10929,
    10928, 10060, 10054, 10053, 997, 233, 64, 20, 0,
];

static TRANSIENT_SET: Lazy<HashSet<i32>> =
    Lazy::new(|| TRANSIENT_ERROR_NUMBERS.iter().copied().collect());

/// Whether a server error number is in the default transient list.
#[must_use]
pub fn is_transient_number(number: i32) -> bool {
    TRANSIENT_SET.contains(&number)
}

/// Strategy deciding whether, and when, a failed execution is retried.
pub trait RetryLogicProvider: Send + Sync {
    /// Delay before retry number `attempt` (1-based) after `error`, or
    /// `None` to give up and surface the error.
    fn next_delay(&self, attempt: u32, error: &Error) -> Option<Duration>;
}

/// Run `f` on the calling thread, sleeping between attempts.
pub fn execute<T, F>(provider: &dyn RetryLogicProvider, mut f: F) -> Result<T>
where
    F: FnMut() -> Result<T>,
{
    let mut attempt = 0;
    loop {
        match f() {
            Ok(value) => return Ok(value),
            Err(error) => {
                attempt += 1;
                let Some(delay) = provider.next_delay(attempt, &error) else {
                    return Err(error);
                };
                tracing::debug!(attempt, delay_ms = delay.as_millis() as u64, error = %error, "retrying execution");
                std::thread::sleep(delay);
            }
        }
    }
}

/// Await `f`, sleeping on the runtime timer between attempts.
pub async fn execute_async<T, F, Fut>(provider: &dyn RetryLogicProvider, mut f: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0;
    loop {
        match f().await {
            Ok(value) => return Ok(value),
            Err(error) => {
                attempt += 1;
                let Some(delay) = provider.next_delay(attempt, &error) else {
                    return Err(error);
                };
                tracing::debug!(attempt, delay_ms = delay.as_millis() as u64, error = %error, "retrying execution");
                tokio::time::sleep(delay).await;
            }
        }
    }
}

/// Never retries.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoneRetryProvider;

impl RetryLogicProvider for NoneRetryProvider {
    fn next_delay(&self, _attempt: u32, _error: &Error) -> Option<Duration> {
        None
    }
}

/// Retries transient errors with exponentially growing delays.
#[derive(Debug, Clone)]
pub struct ExponentialRetryProvider {
    policy: RetryPolicy,
    transient_numbers: HashSet<i32>,
}

impl ExponentialRetryProvider {
    /// Create a provider using the default transient error numbers.
    #[must_use]
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            transient_numbers: TRANSIENT_SET.clone(),
        }
    }

    /// Replace the server error numbers treated as transient.
    #[must_use]
    pub fn with_transient_numbers(mut self, numbers: impl IntoIterator<Item = i32>) -> Self {
        self.transient_numbers = numbers.into_iter().collect();
        self
    }

    /// The policy this provider applies.
    #[must_use]
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    fn is_retryable(&self, error: &Error) -> bool {
        match error {
            Error::Server { number, .. } => self.transient_numbers.contains(number),
            // The caller asked for this; retrying would defeat the cancel.
            Error::Cancelled => false,
            other => other.is_transient(),
        }
    }
}

impl RetryLogicProvider for ExponentialRetryProvider {
    fn next_delay(&self, attempt: u32, error: &Error) -> Option<Duration> {
        if attempt == 0 || !self.policy.should_retry(attempt - 1) || !self.is_retryable(error) {
            return None;
        }
        let delay = self.policy.backoff_for_attempt(attempt);
        if !self.policy.jitter {
            return Some(delay);
        }
        // Equal jitter: keep half, randomize the other half.
        let half = delay / 2;
        Some(half + half.mul_f64(unit_random()))
    }
}

fn unit_random() -> f64 {
    let bits = uuid::Uuid::new_v4().as_u128() as u64;
    bits as f64 / u64::MAX as f64
}
