//! # ai-gencache
//!
//! 生成式模型调用的缓存优先编排层：按输入指纹缓存生成结果，配额闸门限制上游调用，
//! 防御式解析模型输出，并带退避重试。
//!
//! Cache-first, quota-aware orchestration for generative model calls.
//!
//! ## Overview
//!
//! Producing an AI-generated artifact (a parsed document, a score, a summary,
//! a study note) is slow and billed per call. This library answers recurring
//! requests from a persistent cache keyed by a stable fingerprint of the
//! semantic input, and guards every real upstream call with a rolling
//! per-minute / per-day quota gate, defensive JSON extraction and bounded
//! retry.
//!
//! ## Control Flow
//!
//! ```text
//! caller -> CacheFirstOrchestrator -> GenerationCache.lookup
//!             hit  -> return (cached = true)
//!             miss -> RetryingInvoker -> QuotaGate.admit -> upstream
//!                       -> ResponseExtractor -> GenerationCache.store -> return
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use ai_gencache::cache::CacheType;
//! use ai_gencache::extract::ExpectedShape;
//! use ai_gencache::invoker::upstream_fn;
//! use ai_gencache::{CacheFirstOrchestrator, GenCacheConfig, GenerationRequest};
//! use futures::FutureExt;
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> ai_gencache::Result<()> {
//!     let upstream = upstream_fn("model", |prompt, _format| {
//!         async move { Ok(format!("{{\"score\": {}}}", prompt.len() % 10)) }.boxed()
//!     });
//!     let orchestrator = CacheFirstOrchestrator::builder()
//!         .with_config(GenCacheConfig::default().with_env_overrides())
//!         .build(upstream)?;
//!
//!     let request = GenerationRequest::new("score-R1", CacheType::Score, json!({"resume": "R1"}));
//!     let resolved = orchestrator
//!         .resolve(&request, &ExpectedShape::object("score"), |r| {
//!             format!("Score this resume: {}", r.semantic_input)
//!         })
//!         .await?;
//!     println!("{} (cached: {})", resolved.output, resolved.cached);
//!     Ok(())
//! }
//! ```
//!
//! ## Module Organization
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`cache`] | Fingerprints, cache entries, document stores, the generation cache |
//! | [`resilience`] | Quota gate and retry policy |
//! | [`extract`] | Defensive JSON extraction and expected shapes |
//! | [`invoker`] | Upstream trait and the retrying invoker |
//! | [`orchestrator`] | Cache-first entry point and stage chains |
//! | [`config`] | YAML / env configuration |
//! | [`clock`] | Injectable time source |
//! | [`telemetry`] | Generation events and counters |

pub mod cache;
pub mod clock;
pub mod config;
pub mod extract;
pub mod invoker;
pub mod orchestrator;
pub mod resilience;
pub mod telemetry;

// Re-export main types for convenience
pub use cache::{fingerprint, CacheType, GenerationCache, InputFingerprint};
pub use config::GenCacheConfig;
pub use extract::{ExpectedShape, ResponseExtractor};
pub use invoker::{RetryingInvoker, Upstream};
pub use orchestrator::{CacheFirstOrchestrator, GenerationRequest, Resolved, StageGraph};
pub use resilience::{QuotaGate, QuotaInfo};

/// Result type alias for the library
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for the library
pub mod error;
pub use error::{Error, ErrorContext, UpstreamErrorKind};
