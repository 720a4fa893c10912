//! 遥测模块：生成事件流与计数器，用于统计缓存命中、上游调用和降级解析。
//!
//! Telemetry Module.
//!
//! Application-controlled observation of the generation layer. Nothing is
//! collected unless a sink is installed; counters are always kept in-process.
//!
//! ## Key Components
//!
//! | Component | Description |
//! |-----------|-------------|
//! | [`GenerationEvent`] | Typed event enum (hits, misses, dispatches, stores, ...) |
//! | [`EventSink`] | Trait for event destinations |
//! | [`NoopEventSink`] | Default no-op sink |
//! | [`InMemoryEventSink`] | Bounded in-memory sink for tests |
//! | [`CompositeEventSink`] | Multi-destination composite sink |
//! | [`GenerationMetrics`] | Lock-free counters with a [`MetricsSnapshot`] |

use crate::Result;
use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

/// Something observable happened in the generation layer.
#[derive(Debug, Clone, PartialEq)]
pub enum GenerationEvent {
    CacheHit {
        cache_key: String,
        input_hash: String,
    },
    CacheMiss {
        cache_key: String,
        input_hash: String,
    },
    /// A concurrent miss joined an in-flight generation instead of dispatching.
    Coalesced {
        cache_key: String,
        input_hash: String,
    },
    UpstreamDispatched {
        shape: String,
        attempt: u32,
    },
    AttemptFailed {
        shape: String,
        attempt: u32,
        error: String,
    },
    QuotaDenied {
        retry_after_ms: u64,
    },
    /// The value returned is a fallback template, not parsed content.
    ParseDegraded {
        shape: String,
    },
    Stored {
        cache_key: String,
        input_hash: String,
    },
}

impl GenerationEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            GenerationEvent::CacheHit { .. } => "cache_hit",
            GenerationEvent::CacheMiss { .. } => "cache_miss",
            GenerationEvent::Coalesced { .. } => "coalesced",
            GenerationEvent::UpstreamDispatched { .. } => "upstream_dispatched",
            GenerationEvent::AttemptFailed { .. } => "attempt_failed",
            GenerationEvent::QuotaDenied { .. } => "quota_denied",
            GenerationEvent::ParseDegraded { .. } => "parse_degraded",
            GenerationEvent::Stored { .. } => "stored",
        }
    }

    /// Cache key the event refers to, when it has one.
    pub fn cache_key(&self) -> Option<&str> {
        match self {
            GenerationEvent::CacheHit { cache_key, .. }
            | GenerationEvent::CacheMiss { cache_key, .. }
            | GenerationEvent::Coalesced { cache_key, .. }
            | GenerationEvent::Stored { cache_key, .. } => Some(cache_key),
            _ => None,
        }
    }
}

/// Destination for generation events.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn report(&self, event: GenerationEvent) -> Result<()>;

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Drops every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopEventSink;

#[async_trait]
impl EventSink for NoopEventSink {
    async fn report(&self, _event: GenerationEvent) -> Result<()> {
        Ok(())
    }
}

pub fn noop_sink() -> Arc<dyn EventSink> {
    Arc::new(NoopEventSink)
}

/// In-memory sink for testing. Keeps the newest `max_events` events.
pub struct InMemoryEventSink {
    events: RwLock<Vec<GenerationEvent>>,
    max_events: usize,
}

impl InMemoryEventSink {
    pub fn new(max: usize) -> Self {
        Self {
            events: RwLock::new(Vec::new()),
            max_events: max,
        }
    }

    pub fn events(&self) -> Vec<GenerationEvent> {
        self.events
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    pub fn events_for_key(&self, cache_key: &str) -> Vec<GenerationEvent> {
        self.events()
            .into_iter()
            .filter(|e| e.cache_key() == Some(cache_key))
            .collect()
    }

    /// Event kinds in arrival order.
    pub fn kinds(&self) -> Vec<&'static str> {
        self.events().iter().map(GenerationEvent::kind).collect()
    }

    pub fn clear(&self) {
        self.events
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .clear();
    }

    pub fn len(&self) -> usize {
        self.events.read().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for InMemoryEventSink {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[async_trait]
impl EventSink for InMemoryEventSink {
    async fn report(&self, event: GenerationEvent) -> Result<()> {
        let mut events = self.events.write().unwrap_or_else(|p| p.into_inner());
        events.push(event);
        if events.len() > self.max_events {
            events.remove(0);
        }
        Ok(())
    }
}

/// Composite sink for multiple destinations. A failing sink does not stop the others.
#[derive(Default)]
pub struct CompositeEventSink {
    sinks: Vec<Arc<dyn EventSink>>,
}

impl CompositeEventSink {
    pub fn new() -> Self {
        Self { sinks: Vec::new() }
    }

    pub fn add_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sinks.push(sink);
        self
    }
}

#[async_trait]
impl EventSink for CompositeEventSink {
    async fn report(&self, event: GenerationEvent) -> Result<()> {
        for s in &self.sinks {
            let _ = s.report(event.clone()).await;
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        for s in &self.sinks {
            let _ = s.close().await;
        }
        Ok(())
    }
}

/// Report an event, logging instead of failing when the sink errors.
pub(crate) async fn emit(sink: &Arc<dyn EventSink>, event: GenerationEvent) {
    let kind = event.kind();
    if let Err(e) = sink.report(event).await {
        tracing::warn!(event = kind, error = %e, "event sink rejected event");
    }
}

/// Process-local generation counters.
#[derive(Debug, Default)]
pub struct GenerationMetrics {
    upstream_calls: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    stores: AtomicU64,
    degraded: AtomicU64,
    retries: AtomicU64,
    quota_denials: AtomicU64,
    coalesced: AtomicU64,
}

/// Point-in-time copy of [`GenerationMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub upstream_calls: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub stores: u64,
    pub degraded: u64,
    pub retries: u64,
    pub quota_denials: u64,
    pub coalesced: u64,
}

impl GenerationMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn upstream_call(&self) {
        self.upstream_calls.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn cache_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn cache_miss(&self) {
        self.cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn stored(&self) {
        self.stores.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn degraded(&self) {
        self.degraded.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn retry(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn quota_denied(&self) {
        self.quota_denials.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn coalesced(&self) {
        self.coalesced.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            upstream_calls: self.upstream_calls.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            stores: self.stores.load(Ordering::Relaxed),
            degraded: self.degraded.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            quota_denials: self.quota_denials.load(Ordering::Relaxed),
            coalesced: self.coalesced.load(Ordering::Relaxed),
        }
    }
}
