use std::time::Duration;
use thiserror::Error;

/// Longest raw-response excerpt carried by [`Error::MalformedResponse`].
pub const EXCERPT_LIMIT: usize = 500;

/// Structured error context for better error handling and debugging.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorContext {
    /// Field path or configuration key that caused the error (e.g., "quota.per_minute")
    pub field_path: Option<String>,
    /// Additional context about the error (e.g., expected type, actual value)
    pub details: Option<String>,
    /// Source of the error (e.g., "generation_cache", "quota_gate")
    pub source: Option<String>,
}

impl ErrorContext {
    pub fn new() -> Self {
        Self {
            field_path: None,
            details: None,
            source: None,
        }
    }

    pub fn with_field_path(mut self, path: impl Into<String>) -> Self {
        self.field_path = Some(path.into());
        self
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }
}

impl Default for ErrorContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Classification of a failed upstream call.
///
/// Mirrors the standard error classes used by provider manifests
/// (`rate_limited`, `authentication`, `server_error`, ...).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UpstreamErrorKind {
    Authentication,
    PermissionDenied,
    Configuration,
    RateLimited,
    QuotaExhausted,
    Timeout,
    Overloaded,
    ServerError,
    InvalidRequest,
    Other,
}

impl UpstreamErrorKind {
    /// Map a standard error class string onto a kind.
    pub fn from_class(class: &str) -> Self {
        match class {
            "authentication" | "authorized_error" => Self::Authentication,
            "permission_denied" => Self::PermissionDenied,
            "configuration" | "missing_credentials" => Self::Configuration,
            "rate_limited" => Self::RateLimited,
            "quota_exhausted" => Self::QuotaExhausted,
            "timeout" => Self::Timeout,
            "overloaded" => Self::Overloaded,
            "server_error" => Self::ServerError,
            "invalid_request" | "request_too_large" | "not_found" => Self::InvalidRequest,
            _ => Self::Other,
        }
    }

    /// Map an HTTP status code onto a kind.
    pub fn from_http_status(status: u16) -> Self {
        match status {
            401 => Self::Authentication,
            403 => Self::PermissionDenied,
            408 => Self::Timeout,
            429 => Self::RateLimited,
            529 | 503 => Self::Overloaded,
            500..=599 => Self::ServerError,
            400 | 404 | 413 | 422 => Self::InvalidRequest,
            _ => Self::Other,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Authentication => "authentication",
            Self::PermissionDenied => "permission_denied",
            Self::Configuration => "configuration",
            Self::RateLimited => "rate_limited",
            Self::QuotaExhausted => "quota_exhausted",
            Self::Timeout => "timeout",
            Self::Overloaded => "overloaded",
            Self::ServerError => "server_error",
            Self::InvalidRequest => "invalid_request",
            Self::Other => "other",
        }
    }

    /// Credentials or setup problems: retrying cannot help.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Authentication | Self::PermissionDenied | Self::Configuration
        )
    }

    /// The provider is refusing calls for budget reasons.
    pub fn is_quota(&self) -> bool {
        matches!(self, Self::RateLimited | Self::QuotaExhausted)
    }
}

impl std::fmt::Display for UpstreamErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unified error type for generation, caching and admission.
///
/// Generation-layer variants are propagated verbatim to callers of
/// `resolve()`; `Persistence` is absorbed by the cache layer and only
/// surfaces from maintenance operations (`invalidate`, `sweep_expired`, `stats`).
#[derive(Debug, Clone, Error)]
pub enum Error {
    #[error("Quota exceeded: retry after {retry_after_ms} ms")]
    QuotaExceeded { retry_after_ms: u64 },

    #[error("Malformed upstream response: {reason} (excerpt: {excerpt:?})")]
    MalformedResponse { excerpt: String, reason: String },

    #[error("Generation failed after {attempts} attempt(s): {cause}")]
    GenerationFailed {
        attempts: u32,
        #[source]
        cause: Box<Error>,
    },

    #[error("Configuration error: {message}{}", format_context(.context))]
    Configuration {
        message: String,
        context: ErrorContext,
    },

    #[error("Upstream error ({kind}): {message}")]
    Upstream {
        kind: UpstreamErrorKind,
        message: String,
        retry_after_ms: Option<u64>,
    },

    #[error("Fingerprint error: {message}")]
    Fingerprint { message: String },

    #[error("Cache persistence error: {message}{}", format_context(.context))]
    Persistence {
        message: String,
        context: ErrorContext,
    },

    #[error("Serialization error: {message}")]
    Serialization { message: String },

    #[error("Runtime error: {message}{}", format_context(.context))]
    Runtime {
        message: String,
        context: ErrorContext,
    },
}

// Helper function to format error context for display
fn format_context(ctx: &ErrorContext) -> String {
    let mut parts = Vec::new();
    if let Some(ref field) = ctx.field_path {
        parts.push(format!("field: {}", field));
    }
    if let Some(ref details) = ctx.details {
        parts.push(format!("details: {}", details));
    }
    if let Some(ref source) = ctx.source {
        parts.push(format!("source: {}", source));
    }
    if parts.is_empty() {
        String::new()
    } else {
        format!(" ({})", parts.join(", "))
    }
}

/// Truncate `raw` to at most [`EXCERPT_LIMIT`] characters.
pub fn excerpt(raw: &str) -> String {
    match raw.char_indices().nth(EXCERPT_LIMIT) {
        Some((idx, _)) => format!("{}...", &raw[..idx]),
        None => raw.to_string(),
    }
}

impl Error {
    pub fn configuration_with_context(msg: impl Into<String>, context: ErrorContext) -> Self {
        Error::Configuration {
            message: msg.into(),
            context,
        }
    }

    pub fn persistence_with_context(msg: impl Into<String>, context: ErrorContext) -> Self {
        Error::Persistence {
            message: msg.into(),
            context,
        }
    }

    pub fn runtime_with_context(msg: impl Into<String>, context: ErrorContext) -> Self {
        Error::Runtime {
            message: msg.into(),
            context,
        }
    }

    pub fn malformed(raw: &str, reason: impl Into<String>) -> Self {
        Error::MalformedResponse {
            excerpt: excerpt(raw),
            reason: reason.into(),
        }
    }

    pub fn upstream(kind: UpstreamErrorKind, msg: impl Into<String>) -> Self {
        Error::Upstream {
            kind,
            message: msg.into(),
            retry_after_ms: None,
        }
    }

    /// Attach a provider retry-after hint to an upstream error.
    pub fn with_retry_after(self, after: Duration) -> Self {
        match self {
            Error::Upstream { kind, message, .. } => Error::Upstream {
                kind,
                message,
                retry_after_ms: Some(after.as_millis() as u64),
            },
            other => other,
        }
    }

    /// Extract error context if available
    pub fn context(&self) -> Option<&ErrorContext> {
        match self {
            Error::Configuration { context, .. }
            | Error::Persistence { context, .. }
            | Error::Runtime { context, .. } => Some(context),
            _ => None,
        }
    }

    /// "Try again shortly": the caller should wait before retrying.
    pub fn is_quota(&self) -> bool {
        match self {
            Error::QuotaExceeded { .. } => true,
            Error::Upstream { kind, .. } => kind.is_quota(),
            _ => false,
        }
    }

    /// "Try again never": configuration or credential problems.
    pub fn is_fatal(&self) -> bool {
        match self {
            Error::Configuration { .. } | Error::Fingerprint { .. } => true,
            Error::Upstream { kind, .. } => kind.is_fatal(),
            _ => false,
        }
    }

    /// Whether a fresh upstream attempt may succeed. Everything that is
    /// neither fatal nor a quota signal shares the retry budget.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::GenerationFailed { .. } => false,
            e => !e.is_fatal() && !e.is_quota(),
        }
    }

    /// Suggested wait before retrying, when known.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Error::QuotaExceeded { retry_after_ms } => Some(Duration::from_millis(*retry_after_ms)),
            Error::Upstream { retry_after_ms, .. } => retry_after_ms.map(Duration::from_millis),
            Error::GenerationFailed { cause, .. } => cause.retry_after(),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization {
            message: err.to_string(),
        }
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(err: serde_yaml::Error) -> Self {
        Error::configuration_with_context(
            err.to_string(),
            ErrorContext::new().with_source("yaml"),
        )
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::persistence_with_context(err.to_string(), ErrorContext::new().with_source("io"))
    }
}
