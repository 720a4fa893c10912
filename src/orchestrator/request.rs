//! Requests and results of the cache-first orchestrator.

use crate::cache::CacheType;
use crate::Result;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

/// One logical generation need.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    /// Logical identity of the kind of artifact, e.g. `"summary-S1"`.
    pub cache_key: String,
    /// Used for reporting and scoped invalidation, never for lookup.
    pub cache_type: CacheType,
    /// The input the artifact is derived from. Fingerprinted for the cache.
    pub semantic_input: Value,
    pub expires_in_days: Option<f64>,
}

impl GenerationRequest {
    pub fn new(cache_key: impl Into<String>, cache_type: CacheType, semantic_input: Value) -> Self {
        Self {
            cache_key: cache_key.into(),
            cache_type,
            semantic_input,
            expires_in_days: None,
        }
    }

    /// Build a request from any serializable input.
    pub fn from_serializable<T: Serialize + ?Sized>(
        cache_key: impl Into<String>,
        cache_type: CacheType,
        input: &T,
    ) -> Result<Self> {
        Ok(Self::new(cache_key, cache_type, serde_json::to_value(input)?))
    }

    pub fn with_expiry_days(mut self, days: f64) -> Self {
        self.expires_in_days = Some(days);
        self
    }
}

/// Result of `resolve()`.
#[derive(Debug, Clone, PartialEq)]
pub struct Resolved {
    pub output: Value,
    /// Served from the cache without an upstream call.
    pub cached: bool,
    /// A fallback template stood in for parsed content; never cached.
    pub degraded: bool,
    /// Upstream dispatches spent on this result (0 for a cache hit).
    pub attempts: u32,
}

impl Resolved {
    pub(crate) fn hit(output: Value) -> Self {
        Self {
            output,
            cached: true,
            degraded: false,
            attempts: 0,
        }
    }

    /// Deserialize the artifact into a typed value.
    pub fn parse<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(self.output.clone())?)
    }
}
