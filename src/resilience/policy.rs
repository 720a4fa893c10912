use crate::Error;
use serde::Deserialize;
use std::time::Duration;

/// Bounded retry with exponential backoff.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total upstream attempts per invocation, including the first.
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
        }
    }
}

/// What to do after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Retry { delay: Duration },
    Fail,
}

impl RetryPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_attempts(mut self, n: u32) -> Self {
        self.max_attempts = n;
        self
    }

    pub fn with_base_delay(mut self, d: Duration) -> Self {
        self.base_delay_ms = d.as_millis() as u64;
        self
    }

    pub fn with_max_delay(mut self, d: Duration) -> Self {
        self.max_delay_ms = d.as_millis() as u64;
        self
    }

    /// Delay after failed attempt `attempt` (0-based): `base * 2^attempt`,
    /// raised to any provider hint and capped at `max_delay_ms`.
    pub fn backoff(&self, attempt: u32, retry_after: Option<Duration>) -> Duration {
        let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
        let base = self.base_delay_ms.saturating_mul(factor);
        let hinted = retry_after.map(|d| d.as_millis() as u64).unwrap_or(0);
        Duration::from_millis(base.max(hinted).min(self.max_delay_ms))
    }

    /// Decide after attempt `attempt` (0-based) failed with `error`.
    pub fn decide(&self, attempt: u32, error: &Error) -> Decision {
        if attempt.saturating_add(1) >= self.max_attempts || !error.is_retryable() {
            return Decision::Fail;
        }
        Decision::Retry {
            delay: self.backoff(attempt, error.retry_after()),
        }
    }
}
