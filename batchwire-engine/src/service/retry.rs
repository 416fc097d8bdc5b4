//! Retry with capped exponential backoff

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tracing::{info, warn};

use crate::config::EngineConfig;

/// How often and how patiently an external operation is retried
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, the first one included
    pub attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    pub fn new(attempts: u32, initial_backoff: Duration, max_backoff: Duration) -> Self {
        Self {
            attempts: attempts.max(1),
            initial_backoff,
            max_backoff,
        }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(
            config.submit_attempts,
            config.retry_initial_backoff,
            config.retry_max_backoff,
        )
    }

    /// Delay before retry number `retry` (1-based)
    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry.saturating_sub(1));
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }

    /// Runs `operation` until it succeeds, fails permanently, or the attempt
    /// budget is spent
    ///
    /// Returns the value together with the number of retries it took.
    pub async fn run<T, E, F, Fut>(
        &self,
        what: &str,
        is_retryable: impl Fn(&E) -> bool,
        mut operation: F,
    ) -> Result<(T, u32), E>
    where
        E: Display,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut attempt = 0;

        loop {
            attempt += 1;

            match operation().await {
                Ok(value) => {
                    if attempt > 1 {
                        info!("{} succeeded after {} attempt(s)", what, attempt);
                    }
                    return Ok((value, attempt - 1));
                }
                Err(e) if is_retryable(&e) && attempt < self.attempts => {
                    let delay = self.delay_for(attempt);
                    warn!(
                        "{} failed (attempt {}/{}): {}",
                        what, attempt, self.attempts, e
                    );
                    warn!("Retrying in {:?}...", delay);
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    if is_retryable(&e) {
                        warn!("{} failed after {} attempt(s): {}", what, attempt, e);
                    }
                    return Err(e);
                }
            }
        }
    }
}
