//! Bounded retry with exponential backoff.

use std::future::Future;
use std::time::Duration;

use tracing::{debug, warn};

use crate::errors::Result;

/// How often and how patiently to retry
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Total attempts, including the first
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    /// Spread delays by ±10%
    pub use_jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            use_jitter: true,
        }
    }
}

impl RetryConfig {
    /// No jitter, so tests with a paused clock are deterministic
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            initial_delay: delay,
            max_delay: delay,
            backoff_multiplier: 1.0,
            use_jitter: false,
        }
    }
}

/// Run `operation` until it succeeds, fails unrecoverably or runs out of
/// attempts
pub async fn retry_with_backoff<T, F, Fut>(operation_name: &str, config: &RetryConfig, mut operation: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0;
    let mut delay = config.initial_delay;

    loop {
        attempt += 1;
        match operation().await {
            Ok(value) => {
                if attempt > 1 {
                    debug!(operation = operation_name, attempt, "succeeded after retries");
                }
                return Ok(value);
            }
            Err(e) if e.is_recoverable() && attempt < config.max_attempts => {
                warn!(
                    operation = operation_name,
                    attempt,
                    error = %e,
                    category = %e.category(),
                    next_delay_ms = delay.as_millis() as u64,
                    "recoverable error, retrying"
                );
                let actual = if config.use_jitter {
                    let jitter = (rand::random::<f64>() - 0.5) * 0.2;
                    Duration::from_millis((delay.as_millis() as f64 * (1.0 + jitter)) as u64)
                } else {
                    delay
                };
                tokio::time::sleep(actual).await;
                delay = Duration::from_millis(
                    ((delay.as_millis() as f64) * config.backoff_multiplier) as u64,
                )
                .min(config.max_delay);
            }
            Err(e) => {
                if attempt > 1 {
                    warn!(operation = operation_name, attempt, error = %e, "giving up");
                }
                return Err(e);
            }
        }
    }
}
