// =============================================================================
// utils/retry.rs
// =============================================================================
// Bounded retry for store calls: per-attempt timeout + exponential backoff +
// full jitter. Every index and bulk call in the tiering engine goes through
// here with a `RetryPolicy` taken from configuration.
// =============================================================================

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio::time::{sleep, timeout};

use crate::tiering::StoreError;

/// Explicit retry policy for one store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Max attempts including the first
    pub max_attempts: u32,
    /// Base backoff (ms)
    pub base_delay_ms: u64,
    /// Maximum backoff cap (ms)
    pub max_delay_ms: u64,
    /// Timeout applied to each attempt (ms)
    pub call_timeout_ms: u64,
    /// Randomize each delay in [0, capped backoff]
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 50,
            max_delay_ms: 5000,
            call_timeout_ms: 1500,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Defaults for the low-latency index store
    pub fn index_default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 50,
            max_delay_ms: 2000,
            call_timeout_ms: 1500,
            jitter: true,
        }
    }

    /// Defaults for the bulk object store (larger transfers, slower tier)
    pub fn bulk_default() -> Self {
        Self {
            max_attempts: 4,
            base_delay_ms: 100,
            max_delay_ms: 5000,
            call_timeout_ms: 10_000,
            jitter: true,
        }
    }

    /// Single attempt, no backoff
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            base_delay_ms: 0,
            max_delay_ms: 0,
            call_timeout_ms: 1500,
            jitter: false,
        }
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    /// Backoff before the retry that follows `attempt` (1-indexed).
    ///
    /// Formula: min(max_delay, base * 2^(attempt-1)), with full jitter
    /// random(0, capped) when enabled.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let exp_backoff = self
            .base_delay_ms
            .saturating_mul(2_u64.saturating_pow(attempt.saturating_sub(1)));
        let capped_backoff = exp_backoff.min(self.max_delay_ms);

        let delay_ms = if self.jitter && capped_backoff > 0 {
            rand::thread_rng().gen_range(0..=capped_backoff)
        } else {
            capped_backoff
        };

        Duration::from_millis(delay_ms)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.max_attempts == 0 {
            return Err("max_attempts must be at least 1".to_string());
        }
        if self.call_timeout_ms == 0 {
            return Err("call_timeout_ms must be positive".to_string());
        }
        if self.base_delay_ms > self.max_delay_ms {
            return Err(format!(
                "base_delay_ms ({}) exceeds max_delay_ms ({})",
                self.base_delay_ms, self.max_delay_ms
            ));
        }
        Ok(())
    }
}

/// Call `op` under `policy`, retrying transient store errors.
pub async fn call_with_retry<F, Fut, T>(policy: &RetryPolicy, op_name: &str, op: F) -> Result<T, StoreError>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, StoreError>>,
{
    call_with_retry_if(policy, op_name, op, StoreError::is_transient).await
}

/// Call `op` under `policy`, retrying every error `should_retry` accepts.
///
/// A timed-out attempt counts as `StoreError::Timeout`, which callers
/// normally treat as retryable. The last error is returned once attempts
/// are exhausted.
pub async fn call_with_retry_if<F, Fut, T, P>(
    policy: &RetryPolicy,
    op_name: &str,
    op: F,
    should_retry: P,
) -> Result<T, StoreError>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, StoreError>>,
    P: Fn(&StoreError) -> bool,
{
    let max_attempts = policy.max_attempts.max(1);
    let call_timeout = policy.call_timeout();
    let mut attempt = 0;

    loop {
        attempt += 1;

        let result = match timeout(call_timeout, op()).await {
            Ok(res) => res,
            Err(_) => Err(StoreError::Timeout(call_timeout)),
        };

        match result {
            Ok(value) => return Ok(value),
            Err(e) if attempt < max_attempts && should_retry(&e) => {
                let backoff = policy.backoff_for(attempt);
                tracing::debug!(
                    op = op_name,
                    attempt,
                    max_attempts,
                    error = %e,
                    backoff_ms = backoff.as_millis() as u64,
                    "Store call failed, retrying"
                );
                sleep(backoff).await;
            }
            Err(e) => {
                if attempt > 1 {
                    tracing::debug!(op = op_name, attempt, error = %e, "Store call gave up");
                }
                return Err(e);
            }
        }
    }
}
