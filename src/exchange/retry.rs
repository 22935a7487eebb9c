use std::future::Future;
use anyhow::Result;
use tokio::time::{sleep, Duration};
use rand::Rng;

use crate::logging::log_retry;
use crate::state::Config;

/// Retry configuration
#[derive(Clone, Debug)]
pub struct RetryConfig {
    /// Guarded attempts before the final unguarded one.
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay_ms: 1200,
            max_delay_ms: 60_000,
            jitter_factor: 0.0,
        }
    }
}

impl RetryConfig {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            max_retries: cfg.retry_tries,
            base_delay_ms: cfg.retry_base_ms,
            jitter_factor: cfg.retry_jitter.clamp(0.0, 1.0),
            ..Default::default()
        }
    }

    /// Calculate delay with exponential backoff and optional jitter
    fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.base_delay_ms as f64 * 2.0_f64.powi(attempt as i32);
        let clamped = base.min(self.max_delay_ms as f64);

        let jitter = if self.jitter_factor > 0.0 {
            let range = clamped * self.jitter_factor;
            rand::thread_rng().gen_range(-range..=range)
        } else {
            0.0
        };
        let final_delay = (clamped + jitter).max(0.0);

        Duration::from_millis(final_delay as u64)
    }
}

/// Retry a fallible async operation with exponential backoff.
///
/// Failures during the first `max_retries` attempts are logged and slept on;
/// then one last attempt runs and its error, if any, goes to the caller.
pub async fn retry_async<F, Fut, T>(
    config: &RetryConfig,
    operation_name: &str,
    mut operation: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    for attempt in 0..config.max_retries {
        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) => {
                let delay = config.delay_for_attempt(attempt);
                log_retry(operation_name, attempt + 1, config.max_retries, &e, delay);
                sleep(delay).await;
            }
        }
    }

    operation().await
}

/// Categorize errors for retry decisions
pub fn is_retryable_http_error(status: u16) -> bool {
    matches!(status,
        408 |   // Request Timeout
        429 |   // Too Many Requests
        500 |   // Internal Server Error
        502 |   // Bad Gateway
        503 |   // Service Unavailable
        504     // Gateway Timeout
    )
}
