//! Bounded exponential backoff with jitter.
//!
//! Used for metadata-store CAS conflicts, store outages and node-to-node RPCs.

use crate::config::RetryConfig;
use crate::error::{ClusterError, Result};
use std::future::Future;
use std::time::Duration;

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn from_config(cfg: &RetryConfig) -> Self {
        Self {
            attempts: cfg.attempts.max(1),
            base_delay: Duration::from_millis(cfg.base_delay_ms),
            max_delay: Duration::from_millis(cfg.max_delay_ms),
        }
    }

    /// No waiting between attempts. Handy for tests.
    pub fn immediate(attempts: usize) -> Self {
        Self {
            attempts: attempts.max(1),
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    /// Delay before retry number `attempt` (0-based).
    pub fn delay_for(&self, attempt: usize) -> Duration {
        if self.base_delay.is_zero() {
            return Duration::ZERO;
        }
        let factor = 1u32.checked_shl(attempt.min(16) as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor).min(self.max_delay);
        let jitter = rand::random::<u64>() % 50;
        delay + Duration::from_millis(jitter)
    }

    pub async fn backoff(&self, attempt: usize) {
        let delay = self.delay_for(attempt);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }

    /// Runs `op` until it succeeds, fails with a non-transient error, or the
    /// attempt budget is spent.
    pub async fn run<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut last = ClusterError::transient(format!("{}: no attempts made", what));
        for attempt in 0..self.attempts {
            match op().await {
                Ok(value) => return Ok(value),
                Err(ClusterError::Transient(msg)) => {
                    tracing::debug!(attempt, "{} failed transiently: {}", what, msg);
                    last = ClusterError::Transient(msg);
                    if attempt + 1 < self.attempts {
                        self.backoff(attempt).await;
                    }
                }
                Err(e) => return Err(e),
            }
        }
        Err(last)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}
