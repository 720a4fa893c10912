//! 生成缓存模块：按输入指纹持久化生成结果，避免重复调用上游模型。
//!
//! # Generation Cache Module
//!
//! Persists generated artifacts keyed by a logical cache key plus a SHA-256
//! fingerprint of the semantic input, so a recurring request is answered
//! without paying for another upstream call.
//!
//! ## Key Components
//!
//! | Component | Description |
//! |-----------|-------------|
//! | [`GenerationCache`] | Lookup / store / invalidate / sweep / stats |
//! | [`CacheEntry`] | Stored artifact with hit count and timestamps |
//! | [`Fingerprinter`] | Canonical-JSON SHA-256 input fingerprints |
//! | [`DocumentStore`] | Trait for the persistence substrate |
//! | [`MemoryStore`] | Process-local store |
//! | [`JsonFileStore`] | One JSON file per collection |
//! | [`NullStore`] | No-op store for disabling persistence |
//!
//! ## Example
//!
//! ```rust
//! use ai_gencache::cache::{fingerprint, CacheConfig, CacheType, GenerationCache, MemoryStore};
//! use ai_gencache::clock::system_clock;
//! use std::sync::Arc;
//!
//! # async fn demo() {
//! let cache = GenerationCache::new(CacheConfig::default(), Arc::new(MemoryStore::new()), system_clock());
//! let fp = fingerprint(&serde_json::json!({"studentId": "S1"})).unwrap();
//!
//! cache.store("summary-S1", &CacheType::Summary, &fp, r#"{"text":"..."}"#, Some(7.0)).await;
//! assert!(cache.lookup("summary-S1", &fp).await.is_hit());
//! # }
//! ```
//!
//! ## Failure Semantics
//!
//! The cache is an optimization, not a dependency: persistence errors during
//! `lookup` and `store` are logged and behave as a miss / no-op.

mod entry;
mod file_store;
mod key;
mod manager;
mod store;
mod sweeper;

pub use entry::{document_id, expiry_from_days, CacheEntry, CacheType};
pub use file_store::JsonFileStore;
pub use key::{canonical_json, fingerprint, Fingerprinter, InputFingerprint};
pub use manager::{CacheConfig, CacheCounters, CacheStats, GenerationCache, Lookup, TypeStats};
pub use store::{DocumentPatch, DocumentStore, Filter, FilterOp, MemoryStore, NullStore};
pub use sweeper::{spawn_sweeper, SweeperHandle};
