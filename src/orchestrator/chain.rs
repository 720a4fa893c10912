//! Multi-stage generation chains.
//!
//! A stage's prompt may need the outputs of other stages, e.g. study notes
//! need a concept list. Each stage is cached under its own key; dependencies
//! are only resolved when the dependent stage misses the cache.

use super::request::{GenerationRequest, Resolved};
use crate::extract::ExpectedShape;
use crate::{Error, ErrorContext, Result};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// Builds a stage prompt from its request and its dependencies' outputs.
pub type StagePrompt = Arc<dyn Fn(&GenerationRequest, &StageOutputs) -> String + Send + Sync>;

/// One node of a [`StageGraph`].
#[derive(Clone)]
pub struct Stage {
    pub(crate) name: String,
    pub(crate) request: GenerationRequest,
    pub(crate) shape: ExpectedShape,
    pub(crate) depends_on: Vec<String>,
    pub(crate) prompt: StagePrompt,
}

impl std::fmt::Debug for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stage")
            .field("name", &self.name)
            .field("cache_key", &self.request.cache_key)
            .field("shape", &self.shape.name())
            .field("depends_on", &self.depends_on)
            .finish()
    }
}

impl Stage {
    pub fn new<F>(
        name: impl Into<String>,
        request: GenerationRequest,
        shape: ExpectedShape,
        prompt: F,
    ) -> Self
    where
        F: Fn(&GenerationRequest, &StageOutputs) -> String + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            request,
            shape,
            depends_on: Vec::new(),
            prompt: Arc::new(prompt),
        }
    }

    pub fn depends_on(mut self, stage: impl Into<String>) -> Self {
        self.depends_on.push(stage.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn request(&self) -> &GenerationRequest {
        &self.request
    }

    pub fn dependencies(&self) -> &[String] {
        &self.depends_on
    }
}

/// Outputs of already-resolved stages, by stage name.
#[derive(Debug, Clone, Default)]
pub struct StageOutputs {
    resolved: BTreeMap<String, Resolved>,
}

impl StageOutputs {
    pub fn get(&self, stage: &str) -> Option<&Resolved> {
        self.resolved.get(stage)
    }

    /// Output value of `stage`, or `Value::Null` if it has not been resolved.
    pub fn output(&self, stage: &str) -> &Value {
        self.resolved
            .get(stage)
            .map(|r| &r.output)
            .unwrap_or(&Value::Null)
    }

    pub fn contains(&self, stage: &str) -> bool {
        self.resolved.contains_key(stage)
    }

    pub fn len(&self) -> usize {
        self.resolved.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resolved.is_empty()
    }

    pub(crate) fn insert(&mut self, stage: &str, resolved: Resolved) {
        self.resolved.insert(stage.to_string(), resolved);
    }
}

/// A validated, acyclic set of stages.
#[derive(Debug, Clone)]
pub struct StageGraph {
    stages: HashMap<String, Stage>,
    /// Dependency-first order.
    order: Vec<String>,
}

impl StageGraph {
    pub fn builder() -> StageGraphBuilder {
        StageGraphBuilder::default()
    }

    pub fn stage(&self, name: &str) -> Option<&Stage> {
        self.stages.get(name)
    }

    /// Stage names with every dependency before its dependents.
    pub fn order(&self) -> &[String] {
        &self.order
    }

    pub(crate) fn require(&self, name: &str) -> Result<&Stage> {
        self.stages.get(name).ok_or_else(|| {
            Error::configuration_with_context(
                format!("unknown stage '{}'", name),
                ErrorContext::new().with_source("stage_graph"),
            )
        })
    }
}

#[derive(Debug, Default)]
pub struct StageGraphBuilder {
    stages: Vec<Stage>,
}

impl StageGraphBuilder {
    pub fn stage(mut self, stage: Stage) -> Self {
        self.stages.push(stage);
        self
    }

    /// Reject duplicate names, unknown dependencies and cycles.
    pub fn build(self) -> Result<StageGraph> {
        let mut stages: HashMap<String, Stage> = HashMap::new();
        let mut declared = Vec::new();
        for stage in self.stages {
            if stages.contains_key(&stage.name) {
                return Err(graph_error(&stage.name, "duplicate stage name"));
            }
            declared.push(stage.name.clone());
            stages.insert(stage.name.clone(), stage);
        }
        for stage in stages.values() {
            if let Some(missing) = stage.depends_on.iter().find(|d| !stages.contains_key(*d)) {
                return Err(graph_error(
                    &stage.name,
                    &format!("depends on unknown stage '{}'", missing),
                ));
            }
        }

        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Visiting,
            Done,
        }

        fn visit(
            name: &str,
            stages: &HashMap<String, Stage>,
            marks: &mut HashMap<String, Mark>,
            order: &mut Vec<String>,
        ) -> Result<()> {
            match marks.get(name) {
                Some(Mark::Done) => return Ok(()),
                Some(Mark::Visiting) => return Err(graph_error(name, "dependency cycle")),
                None => {}
            }
            marks.insert(name.to_string(), Mark::Visiting);
            if let Some(stage) = stages.get(name) {
                for dep in &stage.depends_on {
                    visit(dep, stages, marks, order)?;
                }
            }
            marks.insert(name.to_string(), Mark::Done);
            order.push(name.to_string());
            Ok(())
        }

        let mut marks = HashMap::new();
        let mut order = Vec::with_capacity(declared.len());
        for name in &declared {
            visit(name, &stages, &mut marks, &mut order)?;
        }
        Ok(StageGraph { stages, order })
    }
}

fn graph_error(stage: &str, message: &str) -> Error {
    Error::configuration_with_context(
        format!("invalid stage graph: {}", message),
        ErrorContext::new()
            .with_field_path(stage)
            .with_source("stage_graph"),
    )
}
