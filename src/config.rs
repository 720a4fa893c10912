//! Runtime configuration.
//!
//! Values come from code (`with_*` setters), YAML, or environment overrides:
//! - `GENCACHE_PER_MINUTE` / `GENCACHE_PER_DAY` (quota ceilings)
//! - `GENCACHE_MAX_ATTEMPTS` / `GENCACHE_BASE_DELAY_MS` (retry policy)
//! - `GENCACHE_DEFAULT_EXPIRY_DAYS` (cache entries without their own expiry)
//! - `GENCACHE_UPSTREAM_TIMEOUT_MS` (bounded wait per upstream call)

use crate::cache::CacheConfig;
use crate::resilience::{QuotaConfig, RetryPolicy};
use crate::{Error, ErrorContext, Result};
use serde::Deserialize;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct GenCacheConfig {
    pub quota: QuotaConfig,
    pub retry: RetryPolicy,
    pub cache: CacheConfig,
    pub upstream_timeout_ms: u64,
    /// Let concurrent misses on the same key share one generation.
    pub coalesce_misses: bool,
    pub sweep_interval_secs: u64,
}

impl Default for GenCacheConfig {
    fn default() -> Self {
        Self {
            quota: QuotaConfig::default(),
            retry: RetryPolicy::default(),
            cache: CacheConfig::default(),
            upstream_timeout_ms: 60_000,
            coalesce_misses: true,
            sweep_interval_secs: 3_600,
        }
    }
}

impl GenCacheConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let cfg: Self = serde_yaml::from_str(yaml)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub async fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = tokio::fs::read_to_string(path).await.map_err(|e| {
            Error::configuration_with_context(
                format!("cannot read config: {}", e),
                ErrorContext::new()
                    .with_details(path.display().to_string())
                    .with_source("config"),
            )
        })?;
        Self::from_yaml_str(&text)
    }

    /// Apply `GENCACHE_*` environment variables.
    pub fn with_env_overrides(self) -> Self {
        self.with_overrides_from(|key| std::env::var(key).ok())
    }

    /// Apply overrides from any key lookup. Unparseable values are logged and skipped.
    pub fn with_overrides_from<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(n) = parse_var::<u32, _>(&lookup, "GENCACHE_PER_MINUTE") {
            self.quota.per_minute = n;
        }
        if let Some(n) = parse_var::<u32, _>(&lookup, "GENCACHE_PER_DAY") {
            self.quota.per_day = n;
        }
        if let Some(n) = parse_var::<u32, _>(&lookup, "GENCACHE_MAX_ATTEMPTS") {
            self.retry.max_attempts = n;
        }
        if let Some(ms) = parse_var::<u64, _>(&lookup, "GENCACHE_BASE_DELAY_MS") {
            self.retry.base_delay_ms = ms;
        }
        if let Some(days) = parse_var::<f64, _>(&lookup, "GENCACHE_DEFAULT_EXPIRY_DAYS") {
            self.cache.default_expiry_days = Some(days);
        }
        if let Some(ms) = parse_var::<u64, _>(&lookup, "GENCACHE_UPSTREAM_TIMEOUT_MS") {
            self.upstream_timeout_ms = ms;
        }
        self
    }

    pub fn with_quota(mut self, quota: QuotaConfig) -> Self {
        self.quota = quota;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_cache(mut self, cache: CacheConfig) -> Self {
        self.cache = cache;
        self
    }

    pub fn with_upstream_timeout(mut self, timeout: Duration) -> Self {
        self.upstream_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_coalesce_misses(mut self, enabled: bool) -> Self {
        self.coalesce_misses = enabled;
        self
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval_secs = interval.as_secs();
        self
    }

    pub fn upstream_timeout(&self) -> Duration {
        Duration::from_millis(self.upstream_timeout_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |field: &str, msg: &str| {
            Err(Error::configuration_with_context(
                msg.to_string(),
                ErrorContext::new()
                    .with_field_path(field)
                    .with_source("config"),
            ))
        };
        if self.quota.per_minute == 0 {
            return invalid("quota.per_minute", "ceiling must be positive");
        }
        if self.quota.per_day == 0 {
            return invalid("quota.per_day", "ceiling must be positive");
        }
        if self.quota.per_minute > self.quota.per_day {
            return invalid("quota.per_minute", "minute ceiling exceeds day ceiling");
        }
        if self.retry.max_attempts == 0 {
            return invalid("retry.max_attempts", "at least one attempt is required");
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            return invalid("retry.base_delay_ms", "base delay exceeds max delay");
        }
        if let Some(days) = self.cache.default_expiry_days {
            if !days.is_finite() || days < 0.0 {
                return invalid("cache.default_expiry_days", "expiry must be a non-negative number");
            }
        }
        if self.cache.collection.trim().is_empty() {
            return invalid("cache.collection", "collection name must not be empty");
        }
        if self.upstream_timeout_ms == 0 {
            return invalid("upstream_timeout_ms", "timeout must be positive");
        }
        if self.sweep_interval_secs == 0 {
            return invalid("sweep_interval_secs", "interval must be positive");
        }
        Ok(())
    }
}

fn parse_var<T, F>(lookup: &F, key: &str) -> Option<T>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    let raw = lookup(key)?;
    match raw.trim().parse::<T>() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!(key, value = %raw, "ignoring unparseable environment override");
            None
        }
    }
}
