//! Time source used by quota windows, cache expiry and retry backoff.
//!
//! Production code uses [`SystemClock`]. Tests inject a [`ManualClock`] so that
//! window boundaries, expiry and backoff delays can be exercised without
//! waiting on the wall clock.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[async_trait]
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;

    /// Suspend the current task for `duration`.
    async fn sleep(&self, duration: Duration);
}

/// Wall clock backed by `chrono::Utc` and `tokio::time::sleep`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

#[async_trait]
impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

pub fn system_clock() -> Arc<dyn Clock> {
    Arc::new(SystemClock)
}

#[derive(Debug)]
struct ManualState {
    now: DateTime<Utc>,
    sleeps: Vec<Duration>,
}

/// Deterministic clock: `sleep` returns immediately after advancing time.
///
/// Every requested sleep is recorded so callers can assert on backoff schedules.
#[derive(Debug)]
pub struct ManualClock {
    state: Mutex<ManualState>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            state: Mutex::new(ManualState {
                now: start,
                sleeps: Vec::new(),
            }),
        }
    }

    pub fn starting_now() -> Self {
        Self::new(Utc::now())
    }

    pub fn advance(&self, by: Duration) {
        let mut st = self.state.lock().unwrap_or_else(|p| p.into_inner());
        st.now += to_chrono(by);
    }

    pub fn set(&self, now: DateTime<Utc>) {
        self.state.lock().unwrap_or_else(|p| p.into_inner()).now = now;
    }

    /// Sleeps requested so far, in call order.
    pub fn sleeps(&self) -> Vec<Duration> {
        self.state
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .sleeps
            .clone()
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::starting_now()
    }
}

#[async_trait]
impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        self.state.lock().unwrap_or_else(|p| p.into_inner()).now
    }

    async fn sleep(&self, duration: Duration) {
        let mut st = self.state.lock().unwrap_or_else(|p| p.into_inner());
        st.now += to_chrono(duration);
        st.sleeps.push(duration);
    }
}

/// std -> chrono conversion, capped at a century.
pub(crate) fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d)
        .ok()
        .filter(|c| *c <= chrono::Duration::days(36_500))
        .unwrap_or_else(|| chrono::Duration::days(36_500))
}

/// Non-negative chrono -> std conversion; negative spans clamp to zero.
pub(crate) fn to_std(d: chrono::Duration) -> Duration {
    d.to_std().unwrap_or(Duration::ZERO)
}
