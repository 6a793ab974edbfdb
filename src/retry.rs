//! Bounded retry with exponential backoff
//!
//! Every attempt runs under its own timeout, so a hung call counts as a
//! failed attempt instead of stalling the caller.

use anyhow::{Result, anyhow};
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first one
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub attempt_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(10),
            attempt_timeout: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Delay before attempt `attempt + 1` (attempts are 1-based)
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }

    /// Run `op` until it succeeds or the attempts are used up
    pub async fn run<T, E, F, Fut>(&self, label: &str, mut op: F) -> Result<T>
    where
        E: Display,
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
    {
        let attempts = self.max_attempts.max(1);
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            match tokio::time::timeout(self.attempt_timeout, op()).await {
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(e)) => last_error = e.to_string(),
                Err(_) => last_error = format!("timed out after {:?}", self.attempt_timeout),
            }

            if attempt < attempts {
                let delay = self.backoff(attempt);
                warn!(
                    operation = label,
                    attempt,
                    max_attempts = attempts,
                    error = %last_error,
                    "Attempt failed, retrying in {:?}",
                    delay
                );
                tokio::time::sleep(delay).await;
            }
        }

        Err(anyhow!(
            "{} failed after {} attempts: {}",
            label,
            attempts,
            last_error
        ))
    }
}
