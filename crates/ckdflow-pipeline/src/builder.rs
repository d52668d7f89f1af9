//! Typed stage table and graph construction from a `PipelineConfig`.
//!
//! Stage kinds are a closed enum; an unknown `kind` string, a missing
//! required key, or a stage wired to the wrong kind of upstream is rejected
//! here, before anything runs.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value as JsonValue};

use ckdflow_core::config::PipelineConfig;
use ckdflow_core::error::{Error, Result};
use ckdflow_exec::{
    ExplainEntry, Orchestrator, RunOptions, RunReport, StageGraph, StageSpec,
};
use ckdflow_store::Stores;

use crate::estimator::{Estimator, LogisticRegression};
use crate::predictor::Predictor;
use crate::stages::{BaselineStage, EvaluateStage, MonitorStage, PreprocessStage, TrainStage};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StageKind {
    Preprocess,
    Train,
    Evaluate,
    Baseline,
    Monitor,
}

impl StageKind {
    pub const ALL: [StageKind; 5] = [
        StageKind::Preprocess,
        StageKind::Train,
        StageKind::Evaluate,
        StageKind::Baseline,
        StageKind::Monitor,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            StageKind::Preprocess => "preprocess",
            StageKind::Train => "train",
            StageKind::Evaluate => "evaluate",
            StageKind::Baseline => "baseline",
            StageKind::Monitor => "monitor",
        }
    }

    /// The kind of the single stage this kind reads from; `None` for sources.
    pub fn upstream(self) -> Option<StageKind> {
        match self {
            StageKind::Preprocess => None,
            StageKind::Train | StageKind::Baseline | StageKind::Monitor => {
                Some(StageKind::Preprocess)
            }
            StageKind::Evaluate => Some(StageKind::Train),
        }
    }

    /// Stage body and declared config keys for a stage of this kind.
    pub fn spec(self, name: &str, estimator: Option<&Arc<dyn Estimator>>) -> StageSpec {
        match self {
            StageKind::Preprocess => StageSpec::new(name, PreprocessStage)
                .required("features")
                .file_input("raw_path")
                .optional("test_size", json!(0.2))
                .optional("seed", json!(42))
                .optional("bins", json!(10)),
            StageKind::Train => {
                let defaults = LogisticRegression::default();
                let stage = match estimator {
                    Some(e) => TrainStage::with_estimator(Arc::clone(e)),
                    None => TrainStage::new(),
                };
                StageSpec::new(name, stage)
                    .optional("algorithm", json!(LogisticRegression::NAME))
                    .optional("learning_rate", json!(defaults.learning_rate))
                    .optional("epochs", json!(defaults.epochs))
                    .optional("l2", json!(defaults.l2))
            }
            StageKind::Evaluate => StageSpec::new(name, EvaluateStage)
                .required("model_name")
                .optional("promote_min_f1", JsonValue::Null),
            StageKind::Baseline => StageSpec::new(name, BaselineStage),
            StageKind::Monitor => StageSpec::new(name, MonitorStage)
                .required("drift")
                .file_input("current_path"),
        }
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StageKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        StageKind::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| {
                let known: Vec<&str> = StageKind::ALL.iter().map(|k| k.as_str()).collect();
                Error::Config(format!("unknown stage kind '{s}' (expected one of {known:?})"))
            })
    }
}

pub fn build_graph(config: &PipelineConfig) -> Result<StageGraph> {
    build_graph_with(config, None)
}

/// Build the stage graph, training with `estimator` instead of the default
/// logistic regression when given.
pub fn build_graph_with(
    config: &PipelineConfig,
    estimator: Option<Arc<dyn Estimator>>,
) -> Result<StageGraph> {
    if config.stages.is_empty() {
        return Err(Error::Config("no stages configured".into()));
    }
    let mut kinds = BTreeMap::new();
    for (name, stage) in &config.stages {
        let kind: StageKind = stage
            .kind_or(name)
            .parse()
            .map_err(|e: Error| Error::Config(format!("stage '{name}': {e}")))?;
        kinds.insert(name.as_str(), kind);
    }

    let mut builder = StageGraph::builder();
    for (name, stage) in &config.stages {
        let kind = kinds[name.as_str()];
        check_wiring(name, kind, &stage.depends_on, &kinds)?;

        let mut params = stage.params.clone();
        match kind {
            StageKind::Preprocess => {
                params.insert("features".into(), serde_json::to_value(&config.features)?);
                params
                    .entry("bins".into())
                    .or_insert_with(|| json!(config.drift.numeric.bins));
            }
            StageKind::Train => {
                if let Some(e) = &estimator {
                    params.insert("algorithm".into(), json!(e.name()));
                }
            }
            StageKind::Evaluate => {
                params
                    .entry("model_name".into())
                    .or_insert_with(|| json!(config.registry.model_name));
            }
            StageKind::Monitor => {
                params.insert("drift".into(), serde_json::to_value(&config.drift)?);
            }
            StageKind::Baseline => {}
        }

        let mut spec = kind.spec(name, estimator.as_ref());
        for dep in &stage.depends_on {
            spec = spec.depends_on(dep.clone());
        }
        if let Some(secs) = stage.timeout_secs {
            spec = spec.timeout(Duration::from_secs(secs));
        }
        builder = builder.add(spec, params);
    }
    builder.build()
}

// Unknown dependency names are left for the graph builder (GraphError).
fn check_wiring(
    name: &str,
    kind: StageKind,
    depends_on: &[String],
    kinds: &BTreeMap<&str, StageKind>,
) -> Result<()> {
    match kind.upstream() {
        None if depends_on.is_empty() => Ok(()),
        None => Err(Error::Config(format!(
            "stage '{name}' ({kind}) takes no dependencies, got {depends_on:?}"
        ))),
        Some(expected) => {
            let [dep] = depends_on else {
                return Err(Error::Config(format!(
                    "stage '{name}' ({kind}) must depend on exactly one {expected} stage, got {depends_on:?}"
                )));
            };
            match kinds.get(dep.as_str()) {
                Some(actual) if *actual != expected => Err(Error::Config(format!(
                    "stage '{name}' ({kind}) must depend on a {expected} stage, '{dep}' is {actual}"
                ))),
                _ => Ok(()),
            }
        }
    }
}

/// A configured pipeline: graph, stores, and orchestrator.
pub struct Pipeline {
    config: PipelineConfig,
    graph: StageGraph,
    orchestrator: Orchestrator,
}

impl Pipeline {
    pub fn new(config: PipelineConfig, stores: Stores) -> Result<Self> {
        Self::with_estimator(config, stores, None)
    }

    pub fn with_estimator(
        config: PipelineConfig,
        stores: Stores,
        estimator: Option<Arc<dyn Estimator>>,
    ) -> Result<Self> {
        config.validate()?;
        let graph = build_graph_with(&config, estimator)?;
        Ok(Self {
            config,
            graph,
            orchestrator: Orchestrator::new(stores),
        })
    }

    /// Open the stores under `registry.root` and build the graph.
    pub fn open(config: PipelineConfig) -> Result<Self> {
        let stores = Stores::open(&config.registry.root)?;
        Self::new(config, stores)
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn graph(&self) -> &StageGraph {
        &self.graph
    }

    pub fn stores(&self) -> &Stores {
        self.orchestrator.stores()
    }

    /// Run options seeded from the `execution` section.
    pub fn run_options(&self) -> RunOptions {
        RunOptions::from_config(&self.config.execution)
    }

    pub async fn run(&self, options: RunOptions) -> Result<RunReport> {
        self.orchestrator.run(&self.graph, options).await
    }

    pub fn explain(&self) -> Result<Vec<ExplainEntry>> {
        self.orchestrator.explain(&self.graph)
    }

    pub fn predictor(&self) -> Predictor {
        Predictor::new(self.stores(), &self.config.registry.model_name)
    }
}
