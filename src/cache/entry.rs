//! Cached artifact records.

use super::key::InputFingerprint;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Classification of a cached artifact, used for reporting and scoped
/// invalidation. Never part of the lookup identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum CacheType {
    ParsedDocument,
    Score,
    Summary,
    Overview,
    Concepts,
    Notes,
    Custom(String),
}

impl CacheType {
    pub fn as_str(&self) -> &str {
        match self {
            CacheType::ParsedDocument => "parsed_document",
            CacheType::Score => "score",
            CacheType::Summary => "summary",
            CacheType::Overview => "overview",
            CacheType::Concepts => "concepts",
            CacheType::Notes => "notes",
            CacheType::Custom(s) => s,
        }
    }
}

impl From<String> for CacheType {
    fn from(s: String) -> Self {
        match s.as_str() {
            "parsed_document" => CacheType::ParsedDocument,
            "score" => CacheType::Score,
            "summary" => CacheType::Summary,
            "overview" => CacheType::Overview,
            "concepts" => CacheType::Concepts,
            "notes" => CacheType::Notes,
            _ => CacheType::Custom(s),
        }
    }
}

impl From<&str> for CacheType {
    fn from(s: &str) -> Self {
        Self::from(s.to_string())
    }
}

impl From<CacheType> for String {
    fn from(t: CacheType) -> Self {
        t.as_str().to_string()
    }
}

impl std::fmt::Display for CacheType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One cached artifact.
///
/// `(cache_key, input_hash)` is the storage identity. Apart from the
/// `hit_count` / `last_used_at` bump on lookup, an entry is never modified
/// in place; it is replaced by a later store or removed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub cache_key: String,
    pub input_hash: InputFingerprint,
    pub cache_type: CacheType,
    pub output: String,
    pub hit_count: u64,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub created_at: DateTime<Utc>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub last_used_at: DateTime<Utc>,
    #[serde(default, with = "chrono::serde::ts_milliseconds_option")]
    pub expires_at: Option<DateTime<Utc>>,
}

impl CacheEntry {
    pub fn new(
        cache_key: impl Into<String>,
        cache_type: CacheType,
        input_hash: InputFingerprint,
        output: impl Into<String>,
        now: DateTime<Utc>,
        expires_at: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            cache_key: cache_key.into(),
            input_hash,
            cache_type,
            output: output.into(),
            hit_count: 0,
            created_at: now,
            last_used_at: now,
            expires_at,
        }
    }

    /// Document id in the backing store.
    pub fn document_id(&self) -> String {
        document_id(&self.cache_key, &self.input_hash)
    }

    /// An entry is treated as absent once `now` is past `expires_at`.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        matches!(self.expires_at, Some(at) if now > at)
    }
}

/// The input hash is fixed-length hex, so the composed id is unambiguous even
/// when `cache_key` itself contains the separator.
pub fn document_id(cache_key: &str, input_hash: &InputFingerprint) -> String {
    format!("{}::{}", cache_key, input_hash)
}

/// Convert a fractional day count into an absolute expiry instant.
///
/// Returns `None` for negative or non-finite values.
pub fn expiry_from_days(now: DateTime<Utc>, days: f64) -> Option<DateTime<Utc>> {
    if !days.is_finite() || days < 0.0 {
        return None;
    }
    let micros = (days * 86_400_000_000.0).round();
    if micros > i64::MAX as f64 {
        return None;
    }
    now.checked_add_signed(chrono::Duration::microseconds(micros as i64))
}
