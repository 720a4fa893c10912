//! 调用模块：带配额准入、响应提取与退避重试的上游调用器。
//!
//! # Retrying Invoker Module
//!
//! Wraps one logical upstream generation: quota admission, dispatch under a
//! bounded wait, response extraction against an expected shape, and bounded
//! retry with exponential backoff.
//!
//! ## Key Components
//!
//! | Component | Description |
//! |-----------|-------------|
//! | [`RetryingInvoker`] | Admission + dispatch + extraction + retry loop |
//! | [`Upstream`] | The injected generative service |
//! | [`Invocation`] | Extracted value plus attempt count and degraded flag |
//!
//! ## Failure handling
//!
//! | Failure | Behaviour |
//! |---------|-----------|
//! | Quota gate denies | `QuotaExceeded` immediately, no retry |
//! | Provider rate/quota error | gate blocked for the hint, `QuotaExceeded` |
//! | Authentication / configuration | `Configuration`, no retry |
//! | Malformed response, timeout, other provider errors | fresh upstream call after backoff |
//! | Attempts exhausted | `GenerationFailed` carrying the last cause |
//!
//! Every dispatch is charged to the quota gate, including attempts whose
//! response later fails extraction.

pub mod upstream;

pub use upstream::{upstream_fn, FnUpstream, Upstream};

use crate::clock::Clock;
use crate::extract::{ExpectedShape, ExtractionStage, Extracted, ResponseExtractor};
use crate::resilience::{Admission, Decision, QuotaGate, RetryPolicy};
use crate::telemetry::{self, EventSink, GenerationEvent, GenerationMetrics};
use crate::{Error, ErrorContext, Result, UpstreamErrorKind};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Default bounded wait for a single upstream call.
pub const DEFAULT_UPSTREAM_TIMEOUT: Duration = Duration::from_secs(60);

/// Gate block applied when the provider reports exhaustion without a hint.
const PROVIDER_QUOTA_BACKOFF: Duration = Duration::from_secs(60);

/// Outcome of a successful invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct Invocation {
    pub value: Value,
    /// Upstream dispatches made, including the successful one.
    pub attempts: u32,
    pub stage: ExtractionStage,
}

impl Invocation {
    pub fn is_degraded(&self) -> bool {
        self.stage == ExtractionStage::Fallback
    }
}

/// Upstream caller with admission control and bounded retry.
pub struct RetryingInvoker {
    upstream: Arc<dyn Upstream>,
    gate: Arc<QuotaGate>,
    clock: Arc<dyn Clock>,
    extractor: ResponseExtractor,
    policy: RetryPolicy,
    timeout: Duration,
    sink: Arc<dyn EventSink>,
    metrics: Arc<GenerationMetrics>,
}

impl RetryingInvoker {
    pub fn new(upstream: Arc<dyn Upstream>, gate: Arc<QuotaGate>, clock: Arc<dyn Clock>) -> Self {
        Self {
            upstream,
            gate,
            clock,
            extractor: ResponseExtractor::new(),
            policy: RetryPolicy::default(),
            timeout: DEFAULT_UPSTREAM_TIMEOUT,
            sink: telemetry::noop_sink(),
            metrics: Arc::new(GenerationMetrics::new()),
        }
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_extractor(mut self, extractor: ResponseExtractor) -> Self {
        self.extractor = extractor;
        self
    }

    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<GenerationMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn gate(&self) -> &Arc<QuotaGate> {
        &self.gate
    }

    pub fn metrics(&self) -> &Arc<GenerationMetrics> {
        &self.metrics
    }

    /// Generate and extract a value of `shape` from `prompt`.
    pub async fn invoke(&self, prompt: &str, shape: &ExpectedShape) -> Result<Invocation> {
        let mut degraded: Option<Extracted> = None;
        let mut attempt: u32 = 0;

        loop {
            self.admit().await?;

            self.metrics.upstream_call();
            telemetry::emit(
                &self.sink,
                GenerationEvent::UpstreamDispatched {
                    shape: shape.name().to_string(),
                    attempt: attempt + 1,
                },
            )
            .await;
            info!(
                upstream = self.upstream.name(),
                shape = shape.name(),
                attempt = attempt + 1,
                "dispatching upstream generation"
            );

            let err = match self.attempt_once(prompt, shape).await {
                Ok(extracted) if !extracted.is_degraded() => {
                    return Ok(Invocation {
                        value: extracted.value,
                        attempts: attempt + 1,
                        stage: extracted.stage,
                    });
                }
                Ok(extracted) => {
                    // Only the fallback template matched: keep it as a last
                    // resort and try for real content again.
                    degraded = Some(extracted);
                    Error::malformed("", "response matched only the fallback template")
                }
                Err(e) => e,
            };

            let err = self.classify(err);
            if err.is_fatal() || matches!(err, Error::QuotaExceeded { .. }) {
                return Err(err);
            }

            match self.policy.decide(attempt, &err) {
                Decision::Retry { delay } => {
                    self.metrics.retry();
                    warn!(
                        shape = shape.name(),
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "upstream attempt failed, retrying"
                    );
                    telemetry::emit(
                        &self.sink,
                        GenerationEvent::AttemptFailed {
                            shape: shape.name().to_string(),
                            attempt: attempt + 1,
                            error: err.to_string(),
                        },
                    )
                    .await;
                    self.clock.sleep(delay).await;
                    attempt += 1;
                }
                Decision::Fail => {
                    telemetry::emit(
                        &self.sink,
                        GenerationEvent::AttemptFailed {
                            shape: shape.name().to_string(),
                            attempt: attempt + 1,
                            error: err.to_string(),
                        },
                    )
                    .await;
                    if let Some(extracted) = degraded {
                        self.metrics.degraded();
                        warn!(shape = shape.name(), "returning degraded fallback result");
                        telemetry::emit(
                            &self.sink,
                            GenerationEvent::ParseDegraded {
                                shape: shape.name().to_string(),
                            },
                        )
                        .await;
                        return Ok(Invocation {
                            value: extracted.value,
                            attempts: attempt + 1,
                            stage: extracted.stage,
                        });
                    }
                    return Err(Error::GenerationFailed {
                        attempts: attempt + 1,
                        cause: Box::new(err),
                    });
                }
            }
        }
    }

    async fn admit(&self) -> Result<()> {
        match self.gate.admit() {
            Admission::Allowed => {
                self.gate.record_dispatch();
                Ok(())
            }
            Admission::Denied { retry_after } => {
                let retry_after_ms = retry_after.as_millis() as u64;
                self.metrics.quota_denied();
                warn!(retry_after_ms, "quota gate denied upstream dispatch");
                telemetry::emit(&self.sink, GenerationEvent::QuotaDenied { retry_after_ms }).await;
                Err(Error::QuotaExceeded { retry_after_ms })
            }
        }
    }

    async fn attempt_once(&self, prompt: &str, shape: &ExpectedShape) -> Result<Extracted> {
        let format = shape.response_format();
        let raw = match tokio::time::timeout(self.timeout, self.upstream.generate(prompt, &format))
            .await
        {
            Ok(result) => result?,
            Err(_) => {
                return Err(Error::upstream(
                    UpstreamErrorKind::Timeout,
                    format!("no response within {} ms", self.timeout.as_millis()),
                ))
            }
        };
        debug!(shape = shape.name(), bytes = raw.len(), "upstream responded");
        Ok(self.extractor.extract(&raw, shape)?)
    }

    /// Map provider failures onto the caller-facing taxonomy. Provider quota
    /// errors also block the local gate so other tasks stop dispatching.
    fn classify(&self, err: Error) -> Error {
        match err {
            Error::Upstream { kind, message, .. } if kind.is_fatal() => {
                Error::configuration_with_context(
                    message,
                    ErrorContext::new()
                        .with_details(kind.as_str())
                        .with_source(self.upstream.name()),
                )
            }
            e if e.is_quota() => {
                let wait = e.retry_after().unwrap_or(PROVIDER_QUOTA_BACKOFF);
                self.gate.block_for(wait);
                self.metrics.quota_denied();
                warn!(
                    upstream = self.upstream.name(),
                    retry_after_ms = wait.as_millis() as u64,
                    "provider reported quota exhaustion"
                );
                Error::QuotaExceeded {
                    retry_after_ms: wait.as_millis() as u64,
                }
            }
            other => other,
        }
    }
}
