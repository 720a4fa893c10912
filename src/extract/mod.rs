//! 响应提取模块：从上游自由文本中恢复结构化 JSON。
//!
//! # Response Extraction Module
//!
//! Recovers a well-formed JSON value from upstream text that may be wrapped in
//! prose or markdown fences, or be slightly malformed.
//!
//! ## Key Components
//!
//! | Component | Description |
//! |-----------|-------------|
//! | [`ResponseExtractor`] | Runs the extraction pipeline against an [`ExpectedShape`] |
//! | [`ExpectedShape`] | Kind / JSON Schema check, long-text fields, optional fallback |
//! | [`repair`] | String-aware text repairs (fences, trailing commas, truncation) |
//!
//! ## Pipeline
//!
//! Stages run in order and each one is tried only when the previous failed:
//! direct parse, fenced block, embedded object, repaired text, and finally
//! the shape's fallback template. Every parsed value is checked against the
//! shape; a mismatch counts as a failed stage.
//!
//! ```rust
//! use ai_gencache::extract::{ExpectedShape, ExtractionStage, ResponseExtractor};
//!
//! let extractor = ResponseExtractor::new();
//! let shape = ExpectedShape::object("summary");
//! let out = extractor
//!     .extract("```json\n{\"summary\": \"ok\",}\n```", &shape)
//!     .unwrap();
//! assert_eq!(out.value["summary"], "ok");
//! assert_eq!(out.stage, ExtractionStage::Repaired);
//! ```

pub mod repair;
pub mod shape;

pub use shape::{ExpectedShape, ResponseFormat, ShapeKind};

use crate::Error;
use serde_json::Value;
use tracing::{debug, warn};

/// Which pipeline stage produced a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExtractionStage {
    Direct,
    Fenced,
    Embedded,
    Repaired,
    Fallback,
}

impl ExtractionStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExtractionStage::Direct => "direct",
            ExtractionStage::Fenced => "fenced",
            ExtractionStage::Embedded => "embedded",
            ExtractionStage::Repaired => "repaired",
            ExtractionStage::Fallback => "fallback",
        }
    }
}

impl std::fmt::Display for ExtractionStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A value recovered from a raw response.
#[derive(Debug, Clone, PartialEq)]
pub struct Extracted {
    pub value: Value,
    pub stage: ExtractionStage,
}

impl Extracted {
    /// True when the value is the shape's fallback template rather than parsed content.
    pub fn is_degraded(&self) -> bool {
        self.stage == ExtractionStage::Fallback
    }
}

/// Every stage failed and no fallback applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractionError {
    pub excerpt: String,
    /// One `stage: reason` line per failed stage, in pipeline order.
    pub failures: Vec<String>,
}

impl ExtractionError {
    pub fn reason(&self) -> String {
        if self.failures.is_empty() {
            "no JSON value found".to_string()
        } else {
            self.failures.join("; ")
        }
    }
}

impl std::fmt::Display for ExtractionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} (excerpt: {:?})", self.reason(), self.excerpt)
    }
}

impl std::error::Error for ExtractionError {}

impl From<ExtractionError> for Error {
    fn from(err: ExtractionError) -> Self {
        let reason = err.reason();
        Error::MalformedResponse {
            excerpt: err.excerpt,
            reason,
        }
    }
}

type StageResult = std::result::Result<Value, String>;
type StageFn = fn(&str, &ExpectedShape) -> StageResult;

const PIPELINE: [(ExtractionStage, StageFn); 4] = [
    (ExtractionStage::Direct, direct_stage),
    (ExtractionStage::Fenced, fenced_stage),
    (ExtractionStage::Embedded, embedded_stage),
    (ExtractionStage::Repaired, repaired_stage),
];

/// Defensive JSON extractor.
#[derive(Debug, Clone)]
pub struct ResponseExtractor {
    repair: bool,
}

impl ResponseExtractor {
    pub fn new() -> Self {
        Self { repair: true }
    }

    /// Disable the repair stage; only verbatim JSON (possibly fenced or embedded) is accepted.
    pub fn strict() -> Self {
        Self { repair: false }
    }

    pub fn with_repair(mut self, enabled: bool) -> Self {
        self.repair = enabled;
        self
    }

    /// Recover a value of the expected shape from `raw`.
    pub fn extract(
        &self,
        raw: &str,
        shape: &ExpectedShape,
    ) -> std::result::Result<Extracted, ExtractionError> {
        let text = repair::strip_bom(raw).trim();
        let mut failures = Vec::new();

        for (stage, run) in PIPELINE {
            if stage == ExtractionStage::Repaired && !self.repair {
                continue;
            }
            match run(text, shape) {
                Ok(value) => {
                    debug!(shape = shape.name(), stage = stage.as_str(), "extracted response");
                    return Ok(Extracted { value, stage });
                }
                Err(reason) => failures.push(format!("{}: {}", stage, reason)),
            }
        }

        if let Some(template) = shape.fallback() {
            match shape.check(template) {
                Ok(()) => {
                    warn!(
                        shape = shape.name(),
                        failures = failures.len(),
                        "extraction failed, returning degraded fallback"
                    );
                    return Ok(Extracted {
                        value: template.clone(),
                        stage: ExtractionStage::Fallback,
                    });
                }
                Err(reason) => failures.push(format!("fallback: {}", reason)),
            }
        }

        Err(ExtractionError {
            excerpt: crate::error::excerpt(raw),
            failures,
        })
    }
}

impl Default for ResponseExtractor {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_checked(text: &str, shape: &ExpectedShape) -> StageResult {
    let value: Value = serde_json::from_str(text).map_err(|e| e.to_string())?;
    shape.check(&value)?;
    Ok(value)
}

fn direct_stage(text: &str, shape: &ExpectedShape) -> StageResult {
    if text.is_empty() {
        return Err("empty response".to_string());
    }
    parse_checked(text, shape)
}

fn fenced_stage(text: &str, shape: &ExpectedShape) -> StageResult {
    let body = repair::strip_fence(text).ok_or_else(|| "no code fence".to_string())?;
    parse_checked(body, shape)
}

fn embedded_stage(text: &str, shape: &ExpectedShape) -> StageResult {
    if text.starts_with('{') || text.starts_with('[') {
        return Err("response is not wrapped in prose".to_string());
    }
    let mut last = "no embedded object or array".to_string();
    for candidate in repair::embedded_candidates(text) {
        match parse_checked(candidate, shape) {
            Ok(value) => return Ok(value),
            Err(reason) => last = reason,
        }
    }
    Err(last)
}

fn repaired_stage(text: &str, shape: &ExpectedShape) -> StageResult {
    let mut bases: Vec<&str> = Vec::new();
    if let Some(body) = repair::strip_fence(text) {
        bases.push(body);
    }
    match text.find(['{', '[']) {
        Some(start) => bases.push(&text[start..]),
        None => return Err("no JSON start found".to_string()),
    }

    let mut last = String::new();
    for base in bases {
        let escaped = repair::escape_long_text(base, shape.long_text_fields());
        let cleaned = repair::remove_trailing_commas(&escaped);
        match parse_checked(&cleaned, shape) {
            Ok(value) => return Ok(value),
            Err(reason) => last = reason,
        }
        // Cut-off responses: close what was left open, then drop any comma
        // that the closing exposed.
        let closed = repair::remove_trailing_commas(&repair::close_truncated(&cleaned));
        match parse_checked(&closed, shape) {
            Ok(value) => return Ok(value),
            Err(reason) => last = reason,
        }
        // Prose after the JSON: keep the first balanced block only.
        if let Some(block) = repair::first_balanced(&cleaned) {
            match parse_checked(block, shape) {
                Ok(value) => return Ok(value),
                Err(reason) => last = reason,
            }
        }
    }
    Err(last)
}
