//! Expected output shapes.
//!
//! Every extracted value is checked against an [`ExpectedShape`] before it is
//! handed back, so a well-formed but wrong-shaped response never passes as a
//! success.

use crate::{Error, ErrorContext, Result};
use jsonschema::{Draft, JSONSchema};
use serde_json::Value;
use std::sync::Arc;

/// Top-level JSON kind required by a shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShapeKind {
    Any,
    Object,
    Array,
}

impl ShapeKind {
    fn accepts(&self, value: &Value) -> bool {
        match self {
            ShapeKind::Any => true,
            ShapeKind::Object => value.is_object(),
            ShapeKind::Array => value.is_array(),
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            ShapeKind::Any => "any",
            ShapeKind::Object => "object",
            ShapeKind::Array => "array",
        }
    }
}

/// Hint passed to the upstream service about the wanted response format.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseFormat {
    /// Any JSON value.
    Json,
    /// JSON conforming to a schema.
    JsonSchema { name: String, schema: Value },
}

impl ResponseFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResponseFormat::Json => "json_object",
            ResponseFormat::JsonSchema { .. } => "json_schema",
        }
    }
}

/// The shape a generation is expected to produce.
///
/// Cheap to clone; the compiled schema is shared.
#[derive(Clone)]
pub struct ExpectedShape {
    name: String,
    kind: ShapeKind,
    schema: Option<(Arc<JSONSchema>, Arc<Value>)>,
    long_text_fields: Vec<String>,
    fallback: Option<Value>,
}

impl std::fmt::Debug for ExpectedShape {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExpectedShape")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("has_schema", &self.schema.is_some())
            .field("long_text_fields", &self.long_text_fields)
            .field("has_fallback", &self.fallback.is_some())
            .finish()
    }
}

impl ExpectedShape {
    fn with_kind(name: impl Into<String>, kind: ShapeKind) -> Self {
        Self {
            name: name.into(),
            kind,
            schema: None,
            long_text_fields: Vec::new(),
            fallback: None,
        }
    }

    /// Any JSON value is accepted.
    pub fn any(name: impl Into<String>) -> Self {
        Self::with_kind(name, ShapeKind::Any)
    }

    /// A JSON object is required.
    pub fn object(name: impl Into<String>) -> Self {
        Self::with_kind(name, ShapeKind::Object)
    }

    /// A JSON array is required.
    pub fn array(name: impl Into<String>) -> Self {
        Self::with_kind(name, ShapeKind::Array)
    }

    /// Compile a Draft 7 JSON Schema.
    pub fn from_schema(name: impl Into<String>, schema: Value) -> Result<Self> {
        let name = name.into();
        let compiled = JSONSchema::options()
            .with_draft(Draft::Draft7)
            .compile(&schema)
            .map_err(|e| {
                Error::configuration_with_context(
                    format!("invalid output schema: {}", e),
                    ErrorContext::new()
                        .with_field_path(name.clone())
                        .with_source("expected_shape"),
                )
            })?;
        let kind = match schema.get("type").and_then(Value::as_str) {
            Some("object") => ShapeKind::Object,
            Some("array") => ShapeKind::Array,
            _ => ShapeKind::Any,
        };
        Ok(Self {
            name,
            kind,
            schema: Some((Arc::new(compiled), Arc::new(schema))),
            long_text_fields: Vec::new(),
            fallback: None,
        })
    }

    /// Derive the shape from a Rust type's JSON Schema.
    pub fn of<T: schemars::JsonSchema>() -> Result<Self> {
        let schema = schemars::schema_for!(T);
        let value = serde_json::to_value(&schema)?;
        Self::from_schema(T::schema_name(), value)
    }

    /// Mark a string field that may hold long-form text. Raw newlines and tabs
    /// inside such fields are escaped during repair.
    pub fn with_long_text_field(mut self, field: impl Into<String>) -> Self {
        self.long_text_fields.push(field.into());
        self
    }

    /// Opt in to a last-resort placeholder returned when extraction fails.
    /// The result is flagged as degraded.
    pub fn with_fallback(mut self, template: Value) -> Self {
        self.fallback = Some(template);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> ShapeKind {
        self.kind
    }

    pub fn long_text_fields(&self) -> &[String] {
        &self.long_text_fields
    }

    pub fn fallback(&self) -> Option<&Value> {
        self.fallback.as_ref()
    }

    pub fn response_format(&self) -> ResponseFormat {
        match &self.schema {
            Some((_, source)) => ResponseFormat::JsonSchema {
                name: self.name.clone(),
                schema: source.as_ref().clone(),
            },
            None => ResponseFormat::Json,
        }
    }

    /// Check `value` against the shape. The error lists up to three violations.
    pub fn check(&self, value: &Value) -> std::result::Result<(), String> {
        if !self.kind.accepts(value) {
            return Err(format!(
                "expected {} for shape '{}'",
                self.kind.as_str(),
                self.name
            ));
        }
        if let Some((compiled, _)) = &self.schema {
            if let Err(errors) = compiled.validate(value) {
                let msgs: Vec<String> = errors.take(3).map(|e| e.to_string()).collect();
                return Err(format!("schema '{}': {}", self.name, msgs.join("; ")));
            }
        }
        Ok(())
    }
}
