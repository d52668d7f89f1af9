#![forbid(unsafe_code)]
//! ckdflow-exec: turns named stages into a cacheable, parallel DAG run.
//!
//! - `graph`: `Stage` trait, `StageSpec`, and the validated `StageGraph`
//! - `plan`: fingerprint resolution in topological order
//! - `context`: what a stage sees while running and what it returns
//! - `runtime`: the async `Orchestrator` and its per-stage status report
//! - `metrics`: timing events for stage execution

pub mod context;
pub mod graph;
pub mod metrics;
pub mod plan;
pub mod runtime;

pub use context::{ExtraArtifact, StageContext, StageError, StageOutput, StageResult};
pub use graph::{ConfigKey, Stage, StageGraph, StageGraphBuilder, StageSpec};
pub use plan::{Plan, PlannedStage};
pub use runtime::{ExplainEntry, Orchestrator, RunOptions, RunReport, SkipCause, StageStatus};
