//! Persistence substrate for cached artifacts.
//!
//! The cache only needs a document-style key/value store: point reads and
//! writes, an atomic partial update, deletes and single-field filters. Any
//! backend offering those primitives can implement [`DocumentStore`].

use crate::{Error, ErrorContext, Result};
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::RwLock;

/// Comparison operator for [`Filter`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

/// Single-field predicate, `field <op> value`.
///
/// Documents that lack the field (or hold `null`) never match.
#[derive(Debug, Clone, PartialEq)]
pub struct Filter {
    pub field: String,
    pub op: FilterOp,
    pub value: Value,
}

impl Filter {
    pub fn new(field: impl Into<String>, op: FilterOp, value: impl Into<Value>) -> Self {
        Self {
            field: field.into(),
            op,
            value: value.into(),
        }
    }

    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(field, FilterOp::Eq, value)
    }

    pub fn lt(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(field, FilterOp::Lt, value)
    }

    pub fn matches(&self, doc: &Value) -> bool {
        let actual = match doc.get(&self.field) {
            Some(v) if !v.is_null() => v,
            _ => return false,
        };
        let ord = compare_values(actual, &self.value);
        match self.op {
            FilterOp::Eq => ord == Some(Ordering::Equal),
            FilterOp::Ne => ord != Some(Ordering::Equal),
            FilterOp::Lt => ord == Some(Ordering::Less),
            FilterOp::Le => matches!(ord, Some(Ordering::Less | Ordering::Equal)),
            FilterOp::Gt => ord == Some(Ordering::Greater),
            FilterOp::Ge => matches!(ord, Some(Ordering::Greater | Ordering::Equal)),
        }
    }
}

fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        _ if a == b => Some(Ordering::Equal),
        _ => None,
    }
}

/// Partial update applied atomically by the store.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DocumentPatch {
    set: Map<String, Value>,
    increments: Vec<(String, i64)>,
}

impl DocumentPatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set.insert(field.into(), value.into());
        self
    }

    pub fn increment(mut self, field: impl Into<String>, by: i64) -> Self {
        self.increments.push((field.into(), by));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.set.is_empty() && self.increments.is_empty()
    }

    /// Apply to an in-memory document. Non-object documents are left untouched.
    pub fn apply(&self, doc: &mut Value) {
        let Some(obj) = doc.as_object_mut() else {
            return;
        };
        for (k, v) in &self.set {
            obj.insert(k.clone(), v.clone());
        }
        for (k, by) in &self.increments {
            let current = obj.get(k).and_then(Value::as_i64).unwrap_or(0);
            obj.insert(k.clone(), Value::from(current.saturating_add(*by)));
        }
    }
}

#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn get(&self, collection: &str, id: &str) -> Result<Option<Value>>;
    /// Insert or replace.
    async fn put(&self, collection: &str, id: &str, doc: Value) -> Result<()>;
    /// Returns `false` when the document does not exist.
    async fn update(&self, collection: &str, id: &str, patch: &DocumentPatch) -> Result<bool>;
    async fn delete(&self, collection: &str, id: &str) -> Result<bool>;
    async fn query_where(&self, collection: &str, filter: &Filter) -> Result<Vec<(String, Value)>>;
    async fn scan(&self, collection: &str) -> Result<Vec<(String, Value)>>;
    fn name(&self) -> &'static str;
}

pub(crate) fn poisoned(store: &'static str) -> Error {
    Error::persistence_with_context(
        "store lock poisoned",
        ErrorContext::new().with_source(store),
    )
}

type Collections = HashMap<String, HashMap<String, Value>>;

/// Process-local store. Contents are lost on restart.
#[derive(Default)]
pub struct MemoryStore {
    collections: RwLock<Collections>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn get(&self, collection: &str, id: &str) -> Result<Option<Value>> {
        let cols = self.collections.read().map_err(|_| poisoned("memory"))?;
        Ok(cols.get(collection).and_then(|c| c.get(id)).cloned())
    }

    async fn put(&self, collection: &str, id: &str, doc: Value) -> Result<()> {
        let mut cols = self.collections.write().map_err(|_| poisoned("memory"))?;
        cols.entry(collection.to_string())
            .or_default()
            .insert(id.to_string(), doc);
        Ok(())
    }

    async fn update(&self, collection: &str, id: &str, patch: &DocumentPatch) -> Result<bool> {
        let mut cols = self.collections.write().map_err(|_| poisoned("memory"))?;
        match cols.get_mut(collection).and_then(|c| c.get_mut(id)) {
            Some(doc) => {
                patch.apply(doc);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn delete(&self, collection: &str, id: &str) -> Result<bool> {
        let mut cols = self.collections.write().map_err(|_| poisoned("memory"))?;
        Ok(cols
            .get_mut(collection)
            .map(|c| c.remove(id).is_some())
            .unwrap_or(false))
    }

    async fn query_where(&self, collection: &str, filter: &Filter) -> Result<Vec<(String, Value)>> {
        let cols = self.collections.read().map_err(|_| poisoned("memory"))?;
        Ok(cols
            .get(collection)
            .map(|c| {
                c.iter()
                    .filter(|(_, doc)| filter.matches(doc))
                    .map(|(id, doc)| (id.clone(), doc.clone()))
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn scan(&self, collection: &str) -> Result<Vec<(String, Value)>> {
        let cols = self.collections.read().map_err(|_| poisoned("memory"))?;
        Ok(cols
            .get(collection)
            .map(|c| c.iter().map(|(id, doc)| (id.clone(), doc.clone())).collect())
            .unwrap_or_default())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

/// Store that keeps nothing; every lookup misses.
pub struct NullStore;

impl NullStore {
    pub fn new() -> Self {
        Self
    }
}

impl Default for NullStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DocumentStore for NullStore {
    async fn get(&self, _: &str, _: &str) -> Result<Option<Value>> {
        Ok(None)
    }
    async fn put(&self, _: &str, _: &str, _: Value) -> Result<()> {
        Ok(())
    }
    async fn update(&self, _: &str, _: &str, _: &DocumentPatch) -> Result<bool> {
        Ok(false)
    }
    async fn delete(&self, _: &str, _: &str) -> Result<bool> {
        Ok(false)
    }
    async fn query_where(&self, _: &str, _: &Filter) -> Result<Vec<(String, Value)>> {
        Ok(Vec::new())
    }
    async fn scan(&self, _: &str) -> Result<Vec<(String, Value)>> {
        Ok(Vec::new())
    }
    fn name(&self) -> &'static str {
        "null"
    }
}
