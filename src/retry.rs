//! Retry with exponential backoff for model calls
//!
//! A plain wrapper around an async operation: the caller hands over a call
//! budget (max attempts) and a base delay. Each attempt gets its own
//! timeout; a timeout counts as a transient failure.

use crate::config::RetryConfig;
use crate::error::{PipelineError, Result};
use rand::Rng;
use std::future::Future;
use std::time::Duration;

#[derive(Debug, Clone, Default)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Single attempt, no waiting
    pub fn no_retry() -> Self {
        Self {
            config: RetryConfig {
                max_attempts: 1,
                ..RetryConfig::default()
            },
        }
    }

    /// Delay before the retry following `attempt` (0-indexed)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = i32::try_from(attempt).unwrap_or(i32::MAX);
        let base = self.config.base_delay_ms as f64 * self.config.multiplier.powi(exp);
        let capped = base.min(self.config.max_delay_ms as f64);

        let delay = if self.config.jitter {
            capped * rand::thread_rng().gen_range(0.5..=1.0)
        } else {
            capped
        };

        Duration::from_millis(delay as u64)
    }

    /// Run `operation` until it succeeds, fails permanently, or the budget
    /// is spent. Every attempt is bounded by `timeout`.
    pub async fn run<T, F, Fut>(&self, label: &str, timeout: Duration, mut operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let attempts = self.config.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            let outcome = match tokio::time::timeout(timeout, operation()).await {
                Ok(result) => result,
                Err(_) => Err(PipelineError::TransientCallFailure(format!(
                    "timed out after {:?}",
                    timeout
                ))),
            };

            match outcome {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && attempt + 1 < attempts => {
                    let delay = self.delay_for(attempt);
                    tracing::warn!(
                        call = label,
                        attempt = attempt + 1,
                        max_attempts = attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "model call failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
