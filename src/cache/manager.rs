//! Generation cache.

use super::entry::{document_id, expiry_from_days, CacheEntry, CacheType};
use super::key::InputFingerprint;
use super::store::{DocumentPatch, DocumentStore, Filter};
use crate::clock::Clock;
use crate::Result;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Collection holding cache documents.
    pub collection: String,
    pub enabled: bool,
    /// Applied when a request carries no expiry of its own.
    pub default_expiry_days: Option<f64>,
    /// Outputs larger than this are returned but not stored.
    pub max_output_bytes: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            collection: "generation_cache".to_string(),
            enabled: true,
            default_expiry_days: None,
            max_output_bytes: 10 * 1024 * 1024,
        }
    }
}

impl CacheConfig {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn with_collection(mut self, collection: impl Into<String>) -> Self {
        self.collection = collection.into();
        self
    }
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }
    pub fn with_default_expiry_days(mut self, days: f64) -> Self {
        self.default_expiry_days = Some(days);
        self
    }
}

/// Outcome of [`GenerationCache::lookup`].
#[derive(Debug, Clone, PartialEq)]
pub enum Lookup {
    Hit(CacheEntry),
    Miss,
}

impl Lookup {
    pub fn is_hit(&self) -> bool {
        matches!(self, Lookup::Hit(_))
    }
}

/// Per-type aggregate in [`CacheStats`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TypeStats {
    pub entries: u64,
    pub hits: u64,
}

/// In-process counters since construction.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheCounters {
    pub hits: u64,
    pub misses: u64,
    pub stores: u64,
    pub errors: u64,
}

impl CacheCounters {
    pub fn hit_ratio(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CacheStats {
    pub total_entries: u64,
    /// Entries past their expiry that have not been swept yet.
    pub expired_entries: u64,
    pub total_hits: u64,
    pub by_type: BTreeMap<String, TypeStats>,
    pub counters: CacheCounters,
}

struct AtomicCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    stores: AtomicU64,
    errors: AtomicU64,
}

impl AtomicCounters {
    fn new() -> Self {
        Self {
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            stores: AtomicU64::new(0),
            errors: AtomicU64::new(0),
        }
    }
    fn snapshot(&self) -> CacheCounters {
        CacheCounters {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            stores: self.stores.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
}

/// Persistent map `(cache_key, input_hash) -> artifact`.
///
/// Persistence failures on the read/write path are logged and absorbed:
/// a failed lookup is a miss, a failed store is a no-op.
pub struct GenerationCache {
    config: CacheConfig,
    store: Arc<dyn DocumentStore>,
    clock: Arc<dyn Clock>,
    counters: AtomicCounters,
}

impl GenerationCache {
    pub fn new(config: CacheConfig, store: Arc<dyn DocumentStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            store,
            clock,
            counters: AtomicCounters::new(),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn backend_name(&self) -> &'static str {
        self.store.name()
    }

    /// Point lookup. A hit bumps `hit_count` and `last_used_at` (best effort).
    pub async fn lookup(&self, cache_key: &str, input_hash: &InputFingerprint) -> Lookup {
        if !self.config.enabled {
            return Lookup::Miss;
        }
        let id = document_id(cache_key, input_hash);
        let doc = match self.store.get(&self.config.collection, &id).await {
            Ok(Some(doc)) => doc,
            Ok(None) => return self.miss(cache_key, "absent"),
            Err(e) => {
                self.counters.errors.fetch_add(1, Ordering::Relaxed);
                warn!(cache_key, error = %e, "cache lookup failed; treating as miss");
                return self.miss(cache_key, "lookup_error");
            }
        };
        let mut entry: CacheEntry = match serde_json::from_value(doc) {
            Ok(entry) => entry,
            Err(e) => {
                self.counters.errors.fetch_add(1, Ordering::Relaxed);
                warn!(cache_key, error = %e, "unreadable cache document; treating as miss");
                return self.miss(cache_key, "corrupt");
            }
        };

        let now = self.clock.now();
        if entry.is_expired_at(now) {
            return self.miss(cache_key, "expired");
        }

        let patch = DocumentPatch::new()
            .increment("hit_count", 1)
            .set("last_used_at", now.timestamp_millis());
        if let Err(e) = self.store.update(&self.config.collection, &id, &patch).await {
            self.counters.errors.fetch_add(1, Ordering::Relaxed);
            warn!(cache_key, error = %e, "failed to record cache hit");
        }
        entry.hit_count += 1;
        entry.last_used_at = now;

        self.counters.hits.fetch_add(1, Ordering::Relaxed);
        debug!(cache_key, hit_count = entry.hit_count, "cache hit");
        Lookup::Hit(entry)
    }

    fn miss(&self, cache_key: &str, reason: &'static str) -> Lookup {
        self.counters.misses.fetch_add(1, Ordering::Relaxed);
        debug!(cache_key, reason, "cache miss");
        Lookup::Miss
    }

    /// Upsert keyed by `(cache_key, input_hash)`; last writer wins.
    ///
    /// Returns whether the entry was persisted.
    pub async fn store(
        &self,
        cache_key: &str,
        cache_type: &CacheType,
        input_hash: &InputFingerprint,
        output: &str,
        expires_in_days: Option<f64>,
    ) -> bool {
        if !self.config.enabled {
            return false;
        }
        if output.len() > self.config.max_output_bytes {
            debug!(cache_key, bytes = output.len(), "output too large to cache");
            return false;
        }

        let now = self.clock.now();
        let expires_at = match expires_in_days.or(self.config.default_expiry_days) {
            Some(days) => {
                let at = expiry_from_days(now, days);
                if at.is_none() {
                    warn!(cache_key, days, "ignoring invalid expiry");
                }
                at
            }
            None => None,
        };

        let entry = CacheEntry::new(
            cache_key,
            cache_type.clone(),
            input_hash.clone(),
            output,
            now,
            expires_at,
        );
        let doc = match serde_json::to_value(&entry) {
            Ok(doc) => doc,
            Err(e) => {
                self.counters.errors.fetch_add(1, Ordering::Relaxed);
                warn!(cache_key, error = %e, "failed to encode cache entry");
                return false;
            }
        };
        match self
            .store
            .put(&self.config.collection, &entry.document_id(), doc)
            .await
        {
            Ok(()) => {
                self.counters.stores.fetch_add(1, Ordering::Relaxed);
                info!(cache_key, input_hash = %input_hash, "cache entry stored");
                true
            }
            Err(e) => {
                self.counters.errors.fetch_add(1, Ordering::Relaxed);
                warn!(cache_key, error = %e, "cache store failed; result not cached");
                false
            }
        }
    }

    /// Delete every entry under `cache_key`, whatever its input hash.
    pub async fn invalidate(&self, cache_key: &str) -> Result<usize> {
        let removed = self
            .delete_matching(&Filter::eq("cache_key", cache_key))
            .await?;
        debug!(cache_key, removed, "cache key invalidated");
        Ok(removed)
    }

    /// Delete every entry of one [`CacheType`].
    pub async fn invalidate_type(&self, cache_type: &CacheType) -> Result<usize> {
        self.delete_matching(&Filter::eq("cache_type", cache_type.as_str()))
            .await
    }

    /// Delete every entry whose expiry has passed.
    pub async fn sweep_expired(&self) -> Result<usize> {
        let now_ms = self.clock.now().timestamp_millis();
        let removed = self
            .delete_matching(&Filter::lt("expires_at", now_ms))
            .await?;
        if removed > 0 {
            debug!(removed, "expired cache entries swept");
        }
        Ok(removed)
    }

    async fn delete_matching(&self, filter: &Filter) -> Result<usize> {
        let docs = self
            .store
            .query_where(&self.config.collection, filter)
            .await?;
        let mut removed = 0;
        for (id, _) in docs {
            if self.store.delete(&self.config.collection, &id).await? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    pub async fn stats(&self) -> Result<CacheStats> {
        let now = self.clock.now();
        let mut stats = CacheStats {
            counters: self.counters.snapshot(),
            ..Default::default()
        };
        for (id, doc) in self.store.scan(&self.config.collection).await? {
            let entry: CacheEntry = match serde_json::from_value(doc) {
                Ok(e) => e,
                Err(e) => {
                    warn!(id = %id, error = %e, "skipping unreadable cache document");
                    continue;
                }
            };
            stats.total_entries += 1;
            stats.total_hits += entry.hit_count;
            if entry.is_expired_at(now) {
                stats.expired_entries += 1;
            }
            let per_type = stats
                .by_type
                .entry(entry.cache_type.as_str().to_string())
                .or_default();
            per_type.entries += 1;
            per_type.hits += entry.hit_count;
        }
        Ok(stats)
    }

    pub fn counters(&self) -> CacheCounters {
        self.counters.snapshot()
    }
}
