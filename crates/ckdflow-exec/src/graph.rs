//! Stage declarations and the validated stage graph.
//!
//! A `StageGraph` is immutable once built. Construction is where structural
//! problems surface: duplicate names, unknown or cyclic dependencies
//! (`Error::Graph`) and missing required config keys (`Error::Config`). A graph
//! that builds can always be planned and run.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value as JsonValue;

use ckdflow_core::error::{Error, Result};

use crate::context::{StageContext, StageResult};

/// The body of a stage. Runs on a blocking thread; may read dependency
/// artifacts through the context and returns its outputs for the
/// orchestrator to persist.
pub trait Stage: Send + Sync {
    fn run(&self, ctx: &StageContext) -> StageResult;
}

impl<F> Stage for F
where
    F: Fn(&StageContext) -> StageResult + Send + Sync,
{
    fn run(&self, ctx: &StageContext) -> StageResult {
        self(ctx)
    }
}

/// A config key a stage declares. Only declared keys enter the fingerprint.
#[derive(Debug, Clone, PartialEq)]
pub struct ConfigKey {
    pub name: String,
    /// `None` means required.
    pub default: Option<JsonValue>,
}

#[derive(Clone)]
pub struct StageSpec {
    pub name: String,
    pub dependencies: BTreeSet<String>,
    pub config_keys: Vec<ConfigKey>,
    /// Config keys whose values are file paths. The file content hash is
    /// part of the fingerprint, so editing the file invalidates the stage.
    pub file_inputs: BTreeSet<String>,
    pub timeout: Option<Duration>,
    stage: Arc<dyn Stage>,
}

impl StageSpec {
    pub fn new(name: impl Into<String>, stage: impl Stage + 'static) -> Self {
        Self::from_arc(name, Arc::new(stage))
    }

    pub fn from_arc(name: impl Into<String>, stage: Arc<dyn Stage>) -> Self {
        Self {
            name: name.into(),
            dependencies: BTreeSet::new(),
            config_keys: Vec::new(),
            file_inputs: BTreeSet::new(),
            timeout: None,
            stage,
        }
    }

    pub fn depends_on(mut self, dep: impl Into<String>) -> Self {
        self.dependencies.insert(dep.into());
        self
    }

    pub fn required(mut self, key: impl Into<String>) -> Self {
        self.declare(key.into(), None);
        self
    }

    pub fn optional(mut self, key: impl Into<String>, default: JsonValue) -> Self {
        self.declare(key.into(), Some(default));
        self
    }

    /// Declare a required key whose value is a path to a raw input file.
    pub fn file_input(mut self, key: impl Into<String>) -> Self {
        let key = key.into();
        if !self.config_keys.iter().any(|k| k.name == key) {
            self.declare(key.clone(), None);
        }
        self.file_inputs.insert(key);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn stage(&self) -> Arc<dyn Stage> {
        Arc::clone(&self.stage)
    }

    fn declare(&mut self, name: String, default: Option<JsonValue>) {
        self.config_keys.retain(|k| k.name != name);
        self.config_keys.push(ConfigKey { name, default });
    }

    /// Resolve declared keys against `params`. Undeclared params are ignored.
    fn resolve(&self, params: &BTreeMap<String, JsonValue>) -> Result<BTreeMap<String, JsonValue>> {
        let mut resolved = BTreeMap::new();
        for key in &self.config_keys {
            let value = params
                .get(&key.name)
                .or(key.default.as_ref())
                .cloned()
                .ok_or_else(|| {
                    Error::Config(format!(
                        "stage '{}' is missing required config key '{}'",
                        self.name, key.name
                    ))
                })?;
            resolved.insert(key.name.clone(), value);
        }
        for key in &self.file_inputs {
            if !resolved.get(key).map_or(false, JsonValue::is_string) {
                return Err(Error::Config(format!(
                    "stage '{}': file input '{}' must be a path string",
                    self.name, key
                )));
            }
        }
        for key in params.keys() {
            if !resolved.contains_key(key) {
                tracing::debug!(stage = %self.name, key = %key, "ignoring undeclared config key");
            }
        }
        Ok(resolved)
    }
}

impl fmt::Debug for StageSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StageSpec")
            .field("name", &self.name)
            .field("dependencies", &self.dependencies)
            .field("config_keys", &self.config_keys)
            .field("file_inputs", &self.file_inputs)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone)]
pub(crate) struct Node {
    pub(crate) spec: StageSpec,
    pub(crate) config: BTreeMap<String, JsonValue>,
}

/// Validated DAG of stages with a fixed topological order.
#[derive(Debug, Clone)]
pub struct StageGraph {
    nodes: BTreeMap<String, Node>,
    order: Vec<String>,
}

impl StageGraph {
    pub fn builder() -> StageGraphBuilder {
        StageGraphBuilder::default()
    }

    /// Topological order; ties are broken by name so it is deterministic.
    pub fn order(&self) -> &[String] {
        &self.order
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.nodes.contains_key(name)
    }

    pub fn spec(&self, name: &str) -> Option<&StageSpec> {
        self.nodes.get(name).map(|n| &n.spec)
    }

    /// Resolved values of the stage's declared config keys.
    pub fn config(&self, name: &str) -> Option<&BTreeMap<String, JsonValue>> {
        self.nodes.get(name).map(|n| &n.config)
    }

    pub(crate) fn node(&self, name: &str) -> Option<&Node> {
        self.nodes.get(name)
    }

    /// Stages that declare `name` as a direct dependency.
    pub fn dependents(&self, name: &str) -> Vec<&str> {
        self.nodes
            .values()
            .filter(|n| n.spec.dependencies.contains(name))
            .map(|n| n.spec.name.as_str())
            .collect()
    }

    /// `targets` plus everything they transitively depend on.
    pub fn with_ancestors<'a, I>(&self, targets: I) -> Result<BTreeSet<String>>
    where
        I: IntoIterator<Item = &'a String>,
    {
        let mut out = BTreeSet::new();
        let mut stack: Vec<String> = Vec::new();
        for t in targets {
            if !self.contains(t) {
                return Err(Error::Config(format!("unknown target stage '{t}'")));
            }
            stack.push(t.clone());
        }
        while let Some(name) = stack.pop() {
            if !out.insert(name.clone()) {
                continue;
            }
            if let Some(node) = self.nodes.get(&name) {
                stack.extend(node.spec.dependencies.iter().cloned());
            }
        }
        Ok(out)
    }
}

#[derive(Default)]
pub struct StageGraphBuilder {
    stages: Vec<(StageSpec, BTreeMap<String, JsonValue>)>,
}

impl StageGraphBuilder {
    /// Add a stage with its raw config values.
    pub fn add(mut self, spec: StageSpec, params: BTreeMap<String, JsonValue>) -> Self {
        self.stages.push((spec, params));
        self
    }

    pub fn build(self) -> Result<StageGraph> {
        let mut specs: BTreeMap<String, (StageSpec, BTreeMap<String, JsonValue>)> = BTreeMap::new();
        for (spec, params) in self.stages {
            if specs.contains_key(&spec.name) {
                return Err(Error::Graph(format!("duplicate stage '{}'", spec.name)));
            }
            specs.insert(spec.name.clone(), (spec, params));
        }

        for (name, (spec, _)) in &specs {
            for dep in &spec.dependencies {
                if dep == name {
                    return Err(Error::Graph(format!("stage '{name}' depends on itself")));
                }
                if !specs.contains_key(dep) {
                    return Err(Error::Graph(format!(
                        "stage '{name}' depends on unknown stage '{dep}'"
                    )));
                }
            }
        }

        let order = topo_order(&specs)?;

        let mut nodes = BTreeMap::new();
        for (name, (spec, params)) in specs {
            let config = spec.resolve(&params)?;
            nodes.insert(name, Node { spec, config });
        }
        tracing::debug!(stages = nodes.len(), order = ?order, "stage graph built");
        Ok(StageGraph { nodes, order })
    }
}

// Kahn's algorithm over a name-ordered ready set.
fn topo_order(specs: &BTreeMap<String, (StageSpec, BTreeMap<String, JsonValue>)>) -> Result<Vec<String>> {
    let mut pending: BTreeMap<&str, usize> = specs
        .iter()
        .map(|(name, (spec, _))| (name.as_str(), spec.dependencies.len()))
        .collect();
    let mut ready: BTreeSet<&str> = pending
        .iter()
        .filter(|(_, &n)| n == 0)
        .map(|(&name, _)| name)
        .collect();
    let mut order = Vec::with_capacity(specs.len());

    while let Some(name) = ready.pop_first() {
        order.push(name.to_string());
        pending.remove(name);
        for (dependent, (spec, _)) in specs {
            if spec.dependencies.contains(name) {
                if let Some(count) = pending.get_mut(dependent.as_str()) {
                    *count -= 1;
                    if *count == 0 {
                        ready.insert(dependent.as_str());
                    }
                }
            }
        }
    }

    if !pending.is_empty() {
        let stuck: Vec<&str> = pending.keys().copied().collect();
        return Err(Error::Graph(format!(
            "dependency cycle among stages: {}",
            stuck.join(", ")
        )));
    }
    Ok(order)
}
