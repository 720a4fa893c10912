//! 弹性模块：上游调用的配额闸门与重试退避策略。
//!
//! # Resilience Primitives Module
//!
//! Admission control and retry policy for upstream generative calls.
//!
//! ## Key Components
//!
//! | Component | Description |
//! |-----------|-------------|
//! | [`quota`] | Rolling per-minute / per-day quota gate |
//! | [`policy`] | Bounded retry with exponential backoff |
//!
//! ## Quota Gate
//!
//! Each window is `OPEN` while its count is under the ceiling and `CLOSED`
//! once the ceiling is reached. A closed window re-opens lazily: the next
//! check after the window length has elapsed resets the counter.
//!
//! ```rust
//! use ai_gencache::clock::system_clock;
//! use ai_gencache::resilience::quota::{Admission, QuotaConfig, QuotaGate};
//!
//! let gate = QuotaGate::new(QuotaConfig::new().with_per_minute(2), system_clock());
//! if gate.admit().is_allowed() {
//!     gate.record_dispatch();
//!     // call the upstream service...
//! }
//! ```

pub mod policy;
pub mod quota;

pub use policy::{Decision, RetryPolicy};
pub use quota::{Admission, QuotaConfig, QuotaGate, QuotaInfo};
