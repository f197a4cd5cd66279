//! Retry policy for transient chain-node failures.

use anyhow::Result;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;

/// Bounded retry with a fixed delay between attempts. Transport failures are
/// treated as transient and retried at a constant pace; the loop that owns
/// this policy decides when an exhausted retry becomes a skipped range.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries after the first attempt (0 = try once).
    pub max_retries: u32,
    /// Fixed pause between attempts.
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    /// A policy that fails on the first error, for tests.
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            delay: Duration::ZERO,
        }
    }

    /// Runs `operation`, retrying on error until the budget is exhausted.
    pub async fn execute<F, Fut, T>(&self, mut operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempts = 0;

        loop {
            match operation().await {
                Ok(result) => return Ok(result),
                Err(err) => {
                    attempts += 1;
                    if attempts > self.max_retries {
                        return Err(err);
                    }
                    tracing::warn!(
                        target: "hasira::indexer",
                        attempt = attempts,
                        max = self.max_retries,
                        error = %err,
                        "Retrying after {:?}",
                        self.delay
                    );
                    sleep(self.delay).await;
                }
            }
        }
    }
}
