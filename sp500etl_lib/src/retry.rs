//! Bounded exponential-backoff retries for transient I/O.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::PipelineError;

/// Errors that can tell whether another attempt might succeed.
pub trait Transient {
    fn is_transient(&self) -> bool;
}

impl Transient for marketdata_api::Error {
    fn is_transient(&self) -> bool {
        marketdata_api::Error::is_transient(self)
    }
}

/// Retry budget and backoff curve.
///
/// Attempt `n` (1-based) waits `base_delay_ms * 2^(n-1)`, capped at
/// `max_delay_ms`, scaled by a random 0.8..1.2 jitter factor.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_retries: usize,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 2000,
            max_delay_ms: 30000,
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            base_delay_ms: 0,
            max_delay_ms: 0,
        }
    }

    /// Total attempts including the first one.
    pub fn max_attempts(&self) -> usize {
        self.max_retries + 1
    }

    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        let shift = (attempt.saturating_sub(1)).min(30) as u32;
        let exp = 1u64 << shift;
        let base = self
            .base_delay_ms
            .saturating_mul(exp)
            .min(self.max_delay_ms);
        let jitter = rand::thread_rng().gen_range(0.8..1.2);
        Duration::from_millis((base as f64 * jitter) as u64)
    }
}

/// Runs `op` until it succeeds, fails with a non-transient error, or the
/// policy's retry budget is spent. The last error is returned unchanged.
pub async fn with_retry<T, E, F, Fut>(policy: &RetryPolicy, label: &str, mut op: F) -> Result<T, E>
where
    E: Transient + Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut attempt = 0usize;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                attempt += 1;
                if attempt > policy.max_retries || !err.is_transient() {
                    return Err(err);
                }
                let delay = policy.delay_for_attempt(attempt);
                tracing::warn!(
                    "{} failed (attempt {}/{}): {}; retrying in {:.1}s",
                    label,
                    attempt,
                    policy.max_attempts(),
                    err,
                    delay.as_secs_f64()
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

/// [`with_retry`] for stage I/O. A transient error that outlives the
/// budget becomes [`PipelineError::TransientIo`]; anything else converts
/// through its `From` impl.
pub async fn retry_io<T, E, F, Fut>(
    policy: &RetryPolicy,
    operation: &str,
    op: F,
) -> Result<T, PipelineError>
where
    E: Transient + std::error::Error + Send + Sync + 'static,
    PipelineError: From<E>,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    match with_retry(policy, operation, op).await {
        Ok(value) => Ok(value),
        Err(err) if err.is_transient() => Err(PipelineError::TransientIo {
            operation: operation.to_string(),
            attempts: policy.max_attempts(),
            source: Box::new(err),
        }),
        Err(err) => Err(PipelineError::from(err)),
    }
}
