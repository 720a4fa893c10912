use super::{CacheFirstOrchestrator, Inner};
use crate::cache::{DocumentStore, Fingerprinter, GenerationCache, MemoryStore};
use crate::clock::{system_clock, Clock};
use crate::config::GenCacheConfig;
use crate::extract::ResponseExtractor;
use crate::invoker::{RetryingInvoker, Upstream};
use crate::resilience::QuotaGate;
use crate::telemetry::{self, EventSink, GenerationMetrics};
use crate::Result;
use std::sync::Arc;

/// Builder for [`CacheFirstOrchestrator`].
///
/// Defaults: [`GenCacheConfig::default`], an in-process [`MemoryStore`], the
/// system clock, a fresh quota gate and no event sink.
pub struct OrchestratorBuilder {
    config: GenCacheConfig,
    store: Option<Arc<dyn DocumentStore>>,
    clock: Option<Arc<dyn Clock>>,
    gate: Option<Arc<QuotaGate>>,
    sink: Arc<dyn EventSink>,
    extractor: ResponseExtractor,
    fingerprinter: Fingerprinter,
}

impl OrchestratorBuilder {
    pub fn new() -> Self {
        Self {
            config: GenCacheConfig::default(),
            store: None,
            clock: None,
            gate: None,
            sink: telemetry::noop_sink(),
            extractor: ResponseExtractor::new(),
            fingerprinter: Fingerprinter::new(),
        }
    }

    pub fn with_config(mut self, config: GenCacheConfig) -> Self {
        self.config = config;
        self
    }

    /// Persistence substrate for cache entries.
    pub fn with_store(mut self, store: Arc<dyn DocumentStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Share one quota gate between orchestrators using the same upstream
    /// credentials. Overrides `config.quota`.
    pub fn with_quota_gate(mut self, gate: Arc<QuotaGate>) -> Self {
        self.gate = Some(gate);
        self
    }

    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn with_extractor(mut self, extractor: ResponseExtractor) -> Self {
        self.extractor = extractor;
        self
    }

    /// Salt every input fingerprint, e.g. with a prompt-template revision.
    pub fn with_fingerprint_salt(mut self, salt: impl Into<String>) -> Self {
        self.fingerprinter = Fingerprinter::new().with_salt(salt);
        self
    }

    /// Validate the configuration and wire the orchestrator around `upstream`.
    pub fn build(self, upstream: Arc<dyn Upstream>) -> Result<CacheFirstOrchestrator> {
        self.config.validate()?;

        let clock = self.clock.unwrap_or_else(system_clock);
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(MemoryStore::new()) as Arc<dyn DocumentStore>);
        let gate = self
            .gate
            .unwrap_or_else(|| Arc::new(QuotaGate::new(self.config.quota.clone(), clock.clone())));

        let cache = Arc::new(GenerationCache::new(
            self.config.cache.clone(),
            store,
            clock.clone(),
        ));
        let invoker = RetryingInvoker::new(upstream, gate, clock)
            .with_policy(self.config.retry.clone())
            .with_timeout(self.config.upstream_timeout())
            .with_extractor(self.extractor)
            .with_event_sink(self.sink.clone())
            .with_metrics(Arc::new(GenerationMetrics::new()));

        Ok(CacheFirstOrchestrator::from_inner(Inner::new(
            cache,
            invoker,
            self.fingerprinter,
            self.sink,
            self.config.coalesce_misses,
            self.config.sweep_interval(),
        )))
    }
}

impl Default for OrchestratorBuilder {
    fn default() -> Self {
        Self::new()
    }
}
