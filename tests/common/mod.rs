//! Shared fixtures for integration tests.

#![allow(dead_code)]

use ai_gencache::cache::{DocumentPatch, DocumentStore, Filter};
use ai_gencache::extract::ResponseFormat;
use ai_gencache::{Error, ErrorContext, Result, Upstream};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

/// Upstream that replays scripted replies and records every prompt.
///
/// Once the script runs out it keeps returning the default reply.
pub struct ScriptedUpstream {
    replies: Mutex<VecDeque<Result<String>>>,
    default_reply: String,
    prompts: Mutex<Vec<String>>,
    formats: Mutex<Vec<ResponseFormat>>,
    delay: Option<Duration>,
    gate: Option<Arc<Semaphore>>,
}

impl ScriptedUpstream {
    pub fn new(default_reply: impl Into<String>) -> Self {
        Self {
            replies: Mutex::new(VecDeque::new()),
            default_reply: default_reply.into(),
            prompts: Mutex::new(Vec::new()),
            formats: Mutex::new(Vec::new()),
            delay: None,
            gate: None,
        }
    }

    /// Always answers `reply`.
    pub fn constant(reply: impl Into<String>) -> Arc<Self> {
        Arc::new(Self::new(reply))
    }

    pub fn then_ok(self, reply: impl Into<String>) -> Self {
        self.replies.lock().unwrap().push_back(Ok(reply.into()));
        self
    }

    pub fn then_err(self, err: Error) -> Self {
        self.replies.lock().unwrap().push_back(Err(err));
        self
    }

    /// Sleep (tokio time) before every reply.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Hold every reply until a permit is added to the returned semaphore.
    pub fn held(mut self) -> (Self, Arc<Semaphore>) {
        let gate = Arc::new(Semaphore::new(0));
        self.gate = Some(gate.clone());
        (self, gate)
    }

    pub fn calls(&self) -> usize {
        self.prompts.lock().unwrap().len()
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }

    pub fn formats(&self) -> Vec<ResponseFormat> {
        self.formats.lock().unwrap().clone()
    }
}

#[async_trait]
impl Upstream for ScriptedUpstream {
    async fn generate(&self, prompt: &str, format: &ResponseFormat) -> Result<String> {
        self.prompts.lock().unwrap().push(prompt.to_string());
        self.formats.lock().unwrap().push(format.clone());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(gate) = &self.gate {
            let permit = gate.acquire().await.expect("gate closed");
            permit.forget();
        }
        let next = self.replies.lock().unwrap().pop_front();
        next.unwrap_or_else(|| Ok(self.default_reply.clone()))
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

/// A document store whose every operation fails.
pub struct BrokenStore;

fn broken() -> Error {
    Error::persistence_with_context("connection refused", ErrorContext::new().with_source("test"))
}

#[async_trait]
impl DocumentStore for BrokenStore {
    async fn get(&self, _: &str, _: &str) -> Result<Option<Value>> {
        Err(broken())
    }
    async fn put(&self, _: &str, _: &str, _: Value) -> Result<()> {
        Err(broken())
    }
    async fn update(&self, _: &str, _: &str, _: &DocumentPatch) -> Result<bool> {
        Err(broken())
    }
    async fn delete(&self, _: &str, _: &str) -> Result<bool> {
        Err(broken())
    }
    async fn query_where(&self, _: &str, _: &Filter) -> Result<Vec<(String, Value)>> {
        Err(broken())
    }
    async fn scan(&self, _: &str) -> Result<Vec<(String, Value)>> {
        Err(broken())
    }
    fn name(&self) -> &'static str {
        "broken"
    }
}
