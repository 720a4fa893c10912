use crate::clock::{to_chrono, to_std, Clock};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct QuotaConfig {
    /// Dispatches allowed per rolling minute.
    pub per_minute: u32,
    /// Dispatches allowed per rolling day.
    pub per_day: u32,
}

impl Default for QuotaConfig {
    /// 80% of a 15 RPM / 1500 RPD provider tier.
    fn default() -> Self {
        Self {
            per_minute: 12,
            per_day: 1200,
        }
    }
}

impl QuotaConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_per_minute(mut self, n: u32) -> Self {
        self.per_minute = n;
        self
    }

    pub fn with_per_day(mut self, n: u32) -> Self {
        self.per_day = n;
        self
    }

    /// Derive ceilings from provider hard limits, keeping `margin` (0..=1) of each.
    pub fn with_margin(per_minute_hard: u32, per_day_hard: u32, margin: f64) -> Self {
        let m = if margin.is_finite() { margin.clamp(0.0, 1.0) } else { 1.0 };
        Self {
            per_minute: ((per_minute_hard as f64) * m).floor().max(1.0) as u32,
            per_day: ((per_day_hard as f64) * m).floor().max(1.0) as u32,
        }
    }
}

/// Result of [`QuotaGate::admit`]. Denial is a normal signal, not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Allowed,
    Denied { retry_after: Duration },
}

impl Admission {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Admission::Allowed)
    }
}

/// Remaining budget, as reported to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaInfo {
    pub minute_remaining: u32,
    pub day_remaining: u32,
    /// Seconds until budget frees up: the minute window normally, the day
    /// window or a provider block when that is what is holding calls back.
    pub reset_in_seconds: u64,
}

#[derive(Debug)]
struct Window {
    count: u32,
    start: DateTime<Utc>,
    length: chrono::Duration,
}

impl Window {
    fn new(now: DateTime<Utc>, length: chrono::Duration) -> Self {
        Self {
            count: 0,
            start: now,
            length,
        }
    }

    /// Lazy reset: a window whose length has elapsed starts over at `now`.
    fn roll(&mut self, now: DateTime<Utc>) {
        if now - self.start >= self.length {
            self.count = 0;
            self.start = now;
        }
    }

    fn is_closed(&self, limit: u32) -> bool {
        self.count >= limit
    }

    fn remaining(&self, limit: u32) -> u32 {
        limit.saturating_sub(self.count)
    }

    fn reset_in(&self, now: DateTime<Utc>) -> Duration {
        to_std(self.start + self.length - now)
    }
}

#[derive(Debug)]
struct State {
    minute: Window,
    day: Window,
    /// Set when the provider itself reported exhaustion.
    blocked_until: Option<DateTime<Utc>>,
}

impl State {
    fn roll(&mut self, now: DateTime<Utc>) {
        self.minute.roll(now);
        self.day.roll(now);
        if matches!(self.blocked_until, Some(until) if until <= now) {
            self.blocked_until = None;
        }
    }
}

/// Rolling per-minute / per-day admission gate for upstream dispatches.
///
/// - `admit()` only checks; `record_dispatch()` charges. A caller that is
///   admitted but then decides not to dispatch is not charged.
/// - Counters live behind one mutex. Two tasks admitted concurrently may
///   overshoot a ceiling by one; counts are never lost.
/// - Process-local: nothing is persisted and quota resets on restart.
pub struct QuotaGate {
    cfg: QuotaConfig,
    clock: Arc<dyn Clock>,
    state: Mutex<State>,
}

impl QuotaGate {
    pub fn new(cfg: QuotaConfig, clock: Arc<dyn Clock>) -> Self {
        let now = clock.now();
        Self {
            cfg,
            state: Mutex::new(State {
                minute: Window::new(now, chrono::Duration::minutes(1)),
                day: Window::new(now, chrono::Duration::days(1)),
                blocked_until: None,
            }),
            clock,
        }
    }

    pub fn config(&self) -> &QuotaConfig {
        &self.cfg
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        // Counters stay meaningful even if a holder panicked.
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Check whether a dispatch may proceed right now.
    pub fn admit(&self) -> Admission {
        let now = self.clock.now();
        let mut st = self.lock();
        st.roll(now);
        Self::decide(&self.cfg, &st, now)
    }

    fn decide(cfg: &QuotaConfig, st: &State, now: DateTime<Utc>) -> Admission {
        let mut wait: Option<Duration> = None;
        if let Some(until) = st.blocked_until {
            wait = Some(to_std(until - now));
        }
        if st.minute.is_closed(cfg.per_minute) {
            wait = Some(wait.unwrap_or(Duration::ZERO).max(st.minute.reset_in(now)));
        }
        if st.day.is_closed(cfg.per_day) {
            wait = Some(wait.unwrap_or(Duration::ZERO).max(st.day.reset_in(now)));
        }
        match wait {
            Some(retry_after) => {
                debug!(retry_after_ms = retry_after.as_millis() as u64, "quota admission denied");
                Admission::Denied { retry_after }
            }
            None => Admission::Allowed,
        }
    }

    /// Charge one dispatch against both windows.
    pub fn record_dispatch(&self) {
        let now = self.clock.now();
        let mut st = self.lock();
        st.roll(now);
        st.minute.count = st.minute.count.saturating_add(1);
        st.day.count = st.day.count.saturating_add(1);
    }

    /// Admit and charge under a single lock acquisition.
    pub fn try_acquire(&self) -> Admission {
        let now = self.clock.now();
        let mut st = self.lock();
        st.roll(now);
        let admission = Self::decide(&self.cfg, &st, now);
        if admission.is_allowed() {
            st.minute.count = st.minute.count.saturating_add(1);
            st.day.count = st.day.count.saturating_add(1);
        }
        admission
    }

    /// Deny all admissions for `duration`, e.g. after the provider reported a
    /// rate limit with a retry-after hint. Never shortens an existing block.
    pub fn block_for(&self, duration: Duration) {
        let now = self.clock.now();
        let until = now + to_chrono(duration);
        let mut st = self.lock();
        st.blocked_until = Some(match st.blocked_until {
            Some(existing) if existing > until => existing,
            _ => until,
        });
    }

    pub fn quota_info(&self) -> QuotaInfo {
        let now = self.clock.now();
        let mut st = self.lock();
        st.roll(now);
        let reset = match Self::decide(&self.cfg, &st, now) {
            Admission::Denied { retry_after } => retry_after,
            Admission::Allowed => st.minute.reset_in(now),
        };
        QuotaInfo {
            minute_remaining: st.minute.remaining(self.cfg.per_minute),
            day_remaining: st.day.remaining(self.cfg.per_day),
            reset_in_seconds: reset.as_secs_f64().ceil() as u64,
        }
    }
}
