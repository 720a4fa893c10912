//! 编排模块：缓存优先的生成入口，协调缓存、配额与重试调用。
//!
//! # Cache-First Orchestration Module
//!
//! The public entry point of the crate. A request is answered from the
//! [`GenerationCache`] when possible; on a miss the [`RetryingInvoker`]
//! generates it and the result is stored before it is returned.
//!
//! ## Key Components
//!
//! | Component | Description |
//! |-----------|-------------|
//! | [`CacheFirstOrchestrator`] | `resolve`, stage chains, maintenance operations |
//! | [`OrchestratorBuilder`] | Wires config, store, clock, gate and sinks |
//! | [`GenerationRequest`] / [`Resolved`] | Request and result types |
//! | [`StageGraph`] / [`Stage`] | Multi-stage dependency chains |
//!
//! ## Behaviour
//!
//! - Generation errors from the invoker are returned unchanged; cache
//!   failures are absorbed and behave like a miss or a skipped store.
//! - The generate-and-store step runs on its own task. Dropping a `resolve()`
//!   future does not cancel an upstream call that is already running, and its
//!   result is still cached.
//! - With miss coalescing enabled, concurrent misses on the same
//!   `(cache_key, input_hash)` wait on one shared generation.
//! - Degraded (fallback) results are returned but never cached.
//!
//! ```rust,no_run
//! use ai_gencache::cache::CacheType;
//! use ai_gencache::extract::ExpectedShape;
//! use ai_gencache::invoker::upstream_fn;
//! use ai_gencache::orchestrator::{CacheFirstOrchestrator, GenerationRequest};
//! use futures::FutureExt;
//! use serde_json::json;
//!
//! # async fn demo() -> ai_gencache::Result<()> {
//! let upstream = upstream_fn("model", |_prompt, _format| {
//!     async { Ok("{\"summary\": \"steady progress\"}".to_string()) }.boxed()
//! });
//! let orchestrator = CacheFirstOrchestrator::builder().build(upstream)?;
//!
//! let request = GenerationRequest::new("summary-S1", CacheType::Summary, json!({"studentId": "S1"}));
//! let shape = ExpectedShape::object("summary");
//! let first = orchestrator.resolve(&request, &shape, |r| format!("Summarise {}", r.semantic_input)).await?;
//! let second = orchestrator.resolve(&request, &shape, |_| unreachable!()).await?;
//! assert!(!first.cached && second.cached);
//! # Ok(())
//! # }
//! ```

pub mod builder;
pub mod chain;
mod inflight;
pub mod request;

pub use builder::OrchestratorBuilder;
pub use chain::{Stage, StageGraph, StageGraphBuilder, StageOutputs, StagePrompt};
pub use request::{GenerationRequest, Resolved};

use crate::cache::{
    spawn_sweeper, CacheStats, CacheType, Fingerprinter, GenerationCache, InputFingerprint, Lookup,
    SweeperHandle,
};
use crate::extract::ExpectedShape;
use crate::invoker::RetryingInvoker;
use crate::resilience::QuotaInfo;
use crate::telemetry::{self, EventSink, GenerationEvent, GenerationMetrics, MetricsSnapshot};
use crate::{Error, ErrorContext, Result};
use async_recursion::async_recursion;
use futures::FutureExt;
use inflight::{InFlight, Slot};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info_span, warn, Instrument};
use uuid::Uuid;

pub(crate) struct Inner {
    pub(crate) cache: Arc<GenerationCache>,
    pub(crate) invoker: RetryingInvoker,
    pub(crate) fingerprinter: Fingerprinter,
    pub(crate) sink: Arc<dyn EventSink>,
    pub(crate) metrics: Arc<GenerationMetrics>,
    pub(crate) coalesce: bool,
    pub(crate) sweep_interval: Duration,
    inflight: InFlight,
}

impl Inner {
    pub(crate) fn new(
        cache: Arc<GenerationCache>,
        invoker: RetryingInvoker,
        fingerprinter: Fingerprinter,
        sink: Arc<dyn EventSink>,
        coalesce: bool,
        sweep_interval: Duration,
    ) -> Self {
        let metrics = invoker.metrics().clone();
        Self {
            cache,
            invoker,
            fingerprinter,
            sink,
            metrics,
            coalesce,
            sweep_interval,
            inflight: InFlight::new(),
        }
    }
}

/// Cache-first front door for generations. Cheap to clone.
#[derive(Clone)]
pub struct CacheFirstOrchestrator {
    inner: Arc<Inner>,
}

impl CacheFirstOrchestrator {
    pub fn builder() -> OrchestratorBuilder {
        OrchestratorBuilder::new()
    }

    pub(crate) fn from_inner(inner: Inner) -> Self {
        Self {
            inner: Arc::new(inner),
        }
    }

    /// Return the artifact for `request`, generating it on a cache miss.
    ///
    /// `build_prompt` is only called when an upstream call is needed.
    pub async fn resolve<F>(
        &self,
        request: &GenerationRequest,
        shape: &ExpectedShape,
        build_prompt: F,
    ) -> Result<Resolved>
    where
        F: FnOnce(&GenerationRequest) -> String + Send,
    {
        let hash = self.inner.fingerprinter.fingerprint(&request.semantic_input)?;
        if let Some(hit) = self.cached(request, &hash).await {
            return Ok(hit);
        }
        self.generate(request, shape, hash, build_prompt).await
    }

    /// Resolve one stage of `graph`, resolving its dependencies first if the
    /// stage itself is not cached.
    pub async fn resolve_stage(&self, graph: &StageGraph, stage: &str) -> Result<Resolved> {
        let mut outputs = StageOutputs::default();
        self.resolve_node(graph, stage, &mut outputs).await
    }

    /// Resolve every stage of `graph`, dependencies first.
    pub async fn resolve_all(&self, graph: &StageGraph) -> Result<StageOutputs> {
        let mut outputs = StageOutputs::default();
        for name in graph.order() {
            if !outputs.contains(name) {
                self.resolve_node(graph, name, &mut outputs).await?;
            }
        }
        Ok(outputs)
    }

    #[async_recursion]
    async fn resolve_node(
        &self,
        graph: &StageGraph,
        name: &str,
        outputs: &mut StageOutputs,
    ) -> Result<Resolved> {
        if let Some(done) = outputs.get(name) {
            return Ok(done.clone());
        }
        let stage = graph.require(name)?;
        let hash = self
            .inner
            .fingerprinter
            .fingerprint(&stage.request.semantic_input)?;

        let resolved = match self.cached(&stage.request, &hash).await {
            Some(hit) => hit,
            None => {
                for dep in &stage.depends_on {
                    if !outputs.contains(dep) {
                        self.resolve_node(graph, dep, outputs).await?;
                    }
                }
                debug!(stage = name, "stage dependencies ready");
                let deps: &StageOutputs = outputs;
                let prompt = stage.prompt.clone();
                self.generate(&stage.request, &stage.shape, hash, move |r| prompt(r, deps))
                    .await?
            }
        };
        outputs.insert(name, resolved.clone());
        Ok(resolved)
    }

    /// Cache hit for `request`, if there is a usable one.
    async fn cached(&self, request: &GenerationRequest, hash: &InputFingerprint) -> Option<Resolved> {
        let inner = &self.inner;
        match inner.cache.lookup(&request.cache_key, hash).await {
            Lookup::Hit(entry) => match serde_json::from_str(&entry.output) {
                Ok(output) => {
                    inner.metrics.cache_hit();
                    telemetry::emit(
                        &inner.sink,
                        GenerationEvent::CacheHit {
                            cache_key: request.cache_key.clone(),
                            input_hash: hash.to_string(),
                        },
                    )
                    .await;
                    Some(Resolved::hit(output))
                }
                Err(e) => {
                    warn!(
                        cache_key = %request.cache_key,
                        error = %e,
                        "cached output is not valid JSON; regenerating"
                    );
                    self.note_miss(request, hash).await;
                    None
                }
            },
            Lookup::Miss => {
                self.note_miss(request, hash).await;
                None
            }
        }
    }

    async fn note_miss(&self, request: &GenerationRequest, hash: &InputFingerprint) {
        self.inner.metrics.cache_miss();
        telemetry::emit(
            &self.inner.sink,
            GenerationEvent::CacheMiss {
                cache_key: request.cache_key.clone(),
                input_hash: hash.to_string(),
            },
        )
        .await;
    }

    /// Miss path: generate on a detached task (joining an in-flight one when
    /// coalescing) and wait for it.
    async fn generate<F>(
        &self,
        request: &GenerationRequest,
        shape: &ExpectedShape,
        hash: InputFingerprint,
        build_prompt: F,
    ) -> Result<Resolved>
    where
        F: FnOnce(&GenerationRequest) -> String + Send,
    {
        if !self.inner.coalesce {
            let prompt = build_prompt(request);
            let task = spawn_generation(
                self.inner.clone(),
                request.clone(),
                shape.clone(),
                hash,
                prompt,
                None,
            );
            return task.await;
        }

        let inner = self.inner.clone();
        let slot = self
            .inner
            .inflight
            .join_or_start(&request.cache_key, hash.as_str(), |ticket| {
                let prompt = build_prompt(request);
                spawn_generation(
                    inner,
                    request.clone(),
                    shape.clone(),
                    hash.clone(),
                    prompt,
                    Some(ticket),
                )
            });
        match slot {
            Slot::Leader(generation) => generation.await,
            Slot::Follower(generation) => {
                self.inner.metrics.coalesced();
                debug!(cache_key = %request.cache_key, "joined in-flight generation");
                telemetry::emit(
                    &self.inner.sink,
                    GenerationEvent::Coalesced {
                        cache_key: request.cache_key.clone(),
                        input_hash: hash.to_string(),
                    },
                )
                .await;
                generation.await
            }
        }
    }

    /// Delete every cached entry under `cache_key`.
    pub async fn invalidate(&self, cache_key: &str) -> Result<usize> {
        self.inner.cache.invalidate(cache_key).await
    }

    /// Delete every cached entry of `cache_type`.
    pub async fn invalidate_type(&self, cache_type: &CacheType) -> Result<usize> {
        self.inner.cache.invalidate_type(cache_type).await
    }

    pub async fn sweep_expired(&self) -> Result<usize> {
        self.inner.cache.sweep_expired().await
    }

    pub async fn stats(&self) -> Result<CacheStats> {
        self.inner.cache.stats().await
    }

    pub fn quota_info(&self) -> QuotaInfo {
        self.inner.invoker.gate().quota_info()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.inner.metrics.snapshot()
    }

    pub fn cache(&self) -> &Arc<GenerationCache> {
        &self.inner.cache
    }

    /// Start the periodic expiry sweep at the configured interval. The sweep
    /// runs until the returned handle is shut down or dropped.
    #[must_use = "dropping the handle stops the sweeper"]
    pub fn spawn_sweeper(&self) -> SweeperHandle {
        spawn_sweeper(self.inner.cache.clone(), self.inner.sweep_interval)
    }
}

/// Run invoke-then-store on its own task so it outlives an abandoned caller.
fn spawn_generation(
    inner: Arc<Inner>,
    request: GenerationRequest,
    shape: ExpectedShape,
    hash: InputFingerprint,
    prompt: String,
    ticket: Option<u64>,
) -> futures::future::BoxFuture<'static, Result<Resolved>> {
    let span = info_span!(
        "generation",
        generation_id = %Uuid::new_v4(),
        cache_key = %request.cache_key,
        input_hash = %hash,
    );
    let handle = tokio::spawn(
        async move {
            let result = generate_and_store(&inner, &request, &shape, &hash, &prompt).await;
            if let Some(ticket) = ticket {
                inner
                    .inflight
                    .finish(&request.cache_key, hash.as_str(), ticket);
            }
            result
        }
        .instrument(span),
    );
    async move {
        handle.await.map_err(|e| {
            Error::runtime_with_context(
                format!("generation task failed: {}", e),
                ErrorContext::new().with_source("orchestrator"),
            )
        })?
    }
    .boxed()
}

async fn generate_and_store(
    inner: &Inner,
    request: &GenerationRequest,
    shape: &ExpectedShape,
    hash: &InputFingerprint,
    prompt: &str,
) -> Result<Resolved> {
    let invocation = inner.invoker.invoke(prompt, shape).await?;
    let degraded = invocation.is_degraded();

    if degraded {
        debug!(cache_key = %request.cache_key, "degraded result not cached");
    } else {
        let output = serde_json::to_string(&invocation.value)?;
        let stored = inner
            .cache
            .store(
                &request.cache_key,
                &request.cache_type,
                hash,
                &output,
                request.expires_in_days,
            )
            .await;
        if stored {
            inner.metrics.stored();
            telemetry::emit(
                &inner.sink,
                GenerationEvent::Stored {
                    cache_key: request.cache_key.clone(),
                    input_hash: hash.to_string(),
                },
            )
            .await;
        }
    }

    Ok(Resolved {
        output: invocation.value,
        cached: false,
        degraded,
        attempts: invocation.attempts,
    })
}
