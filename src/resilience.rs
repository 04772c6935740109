//! Retry with exponential backoff
//!
//! Used for notification delivery only. Backup, verification and restore runs are
//! never retried inside the process; the scheduler owns that decision.

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, error, info, instrument, warn};

/// Retry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Maximum number of attempts, including the first one
    pub max_attempts: usize,
    /// Initial delay between attempts
    #[serde(with = "millis")]
    pub initial_delay: Duration,
    /// Upper bound for the delay
    #[serde(with = "millis")]
    pub max_delay: Duration,
    /// Backoff multiplier
    pub backoff_multiplier: f64,
    /// Add up to 10% random jitter to every delay
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(10),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// Single attempt, no waiting
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_multiplier: 1.0,
            jitter: false,
        }
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

/// Retry executor
#[derive(Debug, Clone)]
pub struct RetryExecutor {
    config: RetryConfig,
}

impl RetryExecutor {
    /// Create an executor
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Run `operation` until it succeeds, the error is not retryable, or attempts run
    /// out. The last error is returned as-is.
    #[instrument(skip(self, operation, retryable))]
    pub async fn execute<F, Fut, T, E, P>(&self, operation: F, retryable: P) -> Result<T, E>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
        P: Fn(&E) -> bool,
    {
        let max_attempts = self.config.max_attempts.max(1);
        let mut attempt = 0;
        let mut delay = self.config.initial_delay;

        loop {
            attempt += 1;

            match operation().await {
                Ok(result) => {
                    if attempt > 1 {
                        info!("Operation succeeded after {} attempts", attempt);
                    }
                    return Ok(result);
                }
                Err(error) => {
                    if !retryable(&error) {
                        debug!("Not retrying permanent failure: {}", error);
                        return Err(error);
                    }
                    if attempt >= max_attempts {
                        error!("Max retry attempts exceeded: {}", error);
                        return Err(error);
                    }

                    warn!("Attempt {} failed: {}, retrying in {:?}", attempt, error, delay);

                    let actual_delay = if self.config.jitter {
                        let jitter_ms = (delay.as_millis() as f64 * rand::random::<f64>() * 0.1) as u64;
                        delay + Duration::from_millis(jitter_ms)
                    } else {
                        delay
                    };

                    tokio::time::sleep(actual_delay).await;

                    delay = Duration::from_millis((delay.as_millis() as f64 * self.config.backoff_multiplier) as u64)
                        .min(self.config.max_delay);
                }
            }
        }
    }
}
