//! Orchestrator: plan, then execute the stage DAG with caching.
//!
//! Behavior:
//! - Fingerprints for every stage are resolved before anything runs.
//! - A stage whose fingerprint already has an artifact is `cached` and not
//!   executed (no run record), unless it is named in `force`.
//! - Independent branches run in parallel, bounded by `max_parallel`. Stage
//!   bodies run on the blocking pool with an optional per-stage timeout. A
//!   stage that times out is recorded as failed right away but keeps its slot
//!   until its thread returns, and its context is cancelled.
//! - A failed stage skips its transitive dependents; siblings continue.
//! - Cancellation stops new stages from starting. Running stages finish and
//!   record their outcome.
//! - Structural errors (config, graph, integrity) abort the whole run.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use ckdflow_core::config::ExecutionConfig;
use ckdflow_core::error::{Error, Result};
use ckdflow_core::hash::Fingerprint;
use ckdflow_core::id::RunId;
use ckdflow_core::record::{FailureReason, RunRecord, ScalarParam};
use ckdflow_store::{ArtifactStore, Stores};

use crate::context::{StageContext, StageError, StageOutput};
use crate::graph::{Stage, StageGraph};
use crate::metrics::{emit_span, StageTimer};
use crate::plan::{Plan, PlannedStage};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipCause {
    UpstreamFailed,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum StageStatus {
    Succeeded,
    Cached,
    Failed {
        reason: FailureReason,
        message: String,
    },
    Skipped {
        cause: SkipCause,
    },
}

impl StageStatus {
    /// Succeeded or cached: the stage's artifact is available.
    pub fn is_ok(&self) -> bool {
        matches!(self, StageStatus::Succeeded | StageStatus::Cached)
    }
}

impl fmt::Display for StageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StageStatus::Succeeded => f.write_str("succeeded"),
            StageStatus::Cached => f.write_str("cached"),
            StageStatus::Failed { reason, .. } => write!(f, "failed({reason})"),
            StageStatus::Skipped {
                cause: SkipCause::UpstreamFailed,
            } => f.write_str("skipped(upstream_failed)"),
            StageStatus::Skipped {
                cause: SkipCause::Cancelled,
            } => f.write_str("skipped(cancelled)"),
        }
    }
}

/// Per-stage outcome of one `Orchestrator::run`.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub execution_id: RunId,
    pub statuses: BTreeMap<String, StageStatus>,
    pub fingerprints: BTreeMap<String, Fingerprint>,
    /// Wall-clock time of stages that actually executed.
    pub durations_ms: BTreeMap<String, u64>,
}

impl RunReport {
    fn new(execution_id: RunId) -> Self {
        Self {
            execution_id,
            statuses: BTreeMap::new(),
            fingerprints: BTreeMap::new(),
            durations_ms: BTreeMap::new(),
        }
    }

    pub fn status(&self, stage: &str) -> Option<&StageStatus> {
        self.statuses.get(stage)
    }

    /// True when every selected stage succeeded or was cached.
    pub fn is_success(&self) -> bool {
        self.statuses.values().all(StageStatus::is_ok)
    }

    pub fn failed_stages(&self) -> Vec<&str> {
        self.statuses
            .iter()
            .filter(|(_, s)| matches!(s, StageStatus::Failed { .. }))
            .map(|(n, _)| n.as_str())
            .collect()
    }

    /// Stages whose body ran (succeeded or failed).
    pub fn executed(&self) -> usize {
        self.statuses
            .values()
            .filter(|s| matches!(s, StageStatus::Succeeded | StageStatus::Failed { .. }))
            .count()
    }

    fn count(&self, pred: impl Fn(&StageStatus) -> bool) -> usize {
        self.statuses.values().filter(|s| pred(s)).count()
    }
}

#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Stages to execute even when cached.
    pub force: BTreeSet<String>,
    /// Restrict the run to these stages and their ancestors. Empty means all.
    pub targets: BTreeSet<String>,
    pub max_parallel: usize,
    /// Default timeout for stages that do not declare their own.
    pub stage_timeout: Option<Duration>,
    pub cancel: CancellationToken,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            force: BTreeSet::new(),
            targets: BTreeSet::new(),
            max_parallel: 4,
            stage_timeout: None,
            cancel: CancellationToken::new(),
        }
    }
}

impl RunOptions {
    pub fn from_config(cfg: &ExecutionConfig) -> Self {
        Self {
            max_parallel: cfg.max_parallel,
            stage_timeout: cfg.stage_timeout_secs.map(Duration::from_secs),
            ..Self::default()
        }
    }

    pub fn force<I, S>(mut self, stages: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.force.extend(stages.into_iter().map(Into::into));
        self
    }

    pub fn targets<I, S>(mut self, stages: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.targets.extend(stages.into_iter().map(Into::into));
        self
    }

    pub fn max_parallel(mut self, n: usize) -> Self {
        self.max_parallel = n;
        self
    }

    pub fn stage_timeout(mut self, timeout: Duration) -> Self {
        self.stage_timeout = Some(timeout);
        self
    }

    pub fn cancel_token(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }
}

/// One row of [`Orchestrator::explain`].
#[derive(Debug, Clone, Serialize)]
pub struct ExplainEntry {
    pub stage: String,
    pub fingerprint: Fingerprint,
    pub dependencies: Vec<String>,
    pub cached: bool,
}

enum Finished {
    Succeeded { elapsed_ms: u64 },
    Failed {
        reason: FailureReason,
        message: String,
        elapsed_ms: u64,
    },
    /// Cancelled while waiting for a slot.
    NotStarted,
    Aborted(Error),
}

struct StageJob {
    planned: PlannedStage,
    stage: Arc<dyn Stage>,
    stores: Stores,
    timeout: Option<Duration>,
    semaphore: Arc<Semaphore>,
    cancel: CancellationToken,
}

/// Drives stage graphs against one set of stores.
pub struct Orchestrator {
    stores: Stores,
}

impl Orchestrator {
    pub fn new(stores: Stores) -> Self {
        Self { stores }
    }

    pub fn stores(&self) -> &Stores {
        &self.stores
    }

    /// Topological order, fingerprints, and cache state; runs nothing.
    pub fn explain(&self, graph: &StageGraph) -> Result<Vec<ExplainEntry>> {
        let plan = Plan::resolve(graph)?;
        Ok(plan
            .stages()
            .iter()
            .map(|s| ExplainEntry {
                stage: s.name.clone(),
                fingerprint: s.fingerprint,
                dependencies: s.inputs.keys().cloned().collect(),
                cached: self.stores.artifacts.exists(&s.fingerprint),
            })
            .collect())
    }

    pub async fn run(&self, graph: &StageGraph, options: RunOptions) -> Result<RunReport> {
        for name in &options.force {
            if !graph.contains(name) {
                return Err(Error::Config(format!("cannot force unknown stage '{name}'")));
            }
        }
        let plan = Plan::resolve(graph)?;
        let selected: BTreeSet<String> = if options.targets.is_empty() {
            graph.order().iter().cloned().collect()
        } else {
            graph.with_ancestors(&options.targets)?
        };

        let execution_id = RunId::new();
        let span = tracing::info_span!("pipeline_run", execution = %execution_id);
        self.execute(graph, &plan, &selected, &options, execution_id)
            .instrument(span)
            .await
    }

    async fn execute(
        &self,
        graph: &StageGraph,
        plan: &Plan,
        selected: &BTreeSet<String>,
        options: &RunOptions,
        execution_id: RunId,
    ) -> Result<RunReport> {
        let mut report = RunReport::new(execution_id);
        let mut pending: BTreeMap<&str, usize> = BTreeMap::new();
        let mut ready: VecDeque<String> = VecDeque::new();
        for name in graph.order().iter().filter(|n| selected.contains(*n)) {
            let planned = planned(plan, name)?;
            report.fingerprints.insert(name.clone(), planned.fingerprint);
            let deps = planned.inputs.len();
            pending.insert(name.as_str(), deps);
            if deps == 0 {
                ready.push_back(name.clone());
            }
        }
        tracing::info!(stages = selected.len(), "pipeline run started");

        let semaphore = Arc::new(Semaphore::new(options.max_parallel.max(1)));
        // Child token: an abort stops new stages without cancelling the caller's token.
        let cancel = options.cancel.child_token();
        let mut tasks: JoinSet<(String, Finished)> = JoinSet::new();
        let mut abort: Option<Error> = None;

        loop {
            while let Some(name) = ready.pop_front() {
                if cancel.is_cancelled() {
                    continue;
                }
                let planned = planned(plan, &name)?.clone();
                if !options.force.contains(&name) && self.stores.artifacts.exists(&planned.fingerprint) {
                    tracing::info!(stage = %name, fingerprint = %planned.fingerprint.short(), "cache hit");
                    report.statuses.insert(name.clone(), StageStatus::Cached);
                    release(graph, selected, &name, &mut pending, &mut ready);
                    continue;
                }

                let spec = graph
                    .spec(&name)
                    .ok_or_else(|| Error::Invariant(format!("stage '{name}' missing from graph")))?;
                let job = StageJob {
                    stage: spec.stage(),
                    timeout: spec.timeout.or(options.stage_timeout),
                    planned,
                    stores: self.stores.clone(),
                    semaphore: Arc::clone(&semaphore),
                    cancel: cancel.clone(),
                };
                let span = tracing::info_span!("stage", name = %name);
                tasks.spawn(
                    async move {
                        let name = job.planned.name.clone();
                        (name, run_stage(job).await)
                    }
                    .instrument(span),
                );
            }

            let Some(joined) = tasks.join_next().await else {
                break;
            };
            let (name, finished) = match joined {
                Ok(done) => done,
                Err(e) => {
                    abort.get_or_insert(Error::Invariant(format!("stage task failed: {e}")));
                    cancel.cancel();
                    continue;
                }
            };
            match finished {
                Finished::Succeeded { elapsed_ms } => {
                    report.durations_ms.insert(name.clone(), elapsed_ms);
                    report.statuses.insert(name.clone(), StageStatus::Succeeded);
                    release(graph, selected, &name, &mut pending, &mut ready);
                }
                Finished::Failed {
                    reason,
                    message,
                    elapsed_ms,
                } => {
                    report.durations_ms.insert(name.clone(), elapsed_ms);
                    report
                        .statuses
                        .insert(name.clone(), StageStatus::Failed { reason, message });
                    skip_downstream(graph, selected, &name, &mut report);
                }
                Finished::NotStarted => {}
                Finished::Aborted(e) => {
                    tracing::error!(stage = %name, error = %e, "structural failure; aborting run");
                    report.statuses.insert(
                        name.clone(),
                        StageStatus::Failed {
                            reason: FailureReason::Error,
                            message: e.to_string(),
                        },
                    );
                    abort.get_or_insert(e);
                    cancel.cancel();
                }
            }
        }

        for name in selected {
            report
                .statuses
                .entry(name.clone())
                .or_insert(StageStatus::Skipped {
                    cause: SkipCause::Cancelled,
                });
        }
        if let Some(e) = abort {
            return Err(e);
        }

        let succeeded = report.count(|s| matches!(s, StageStatus::Succeeded));
        let cached = report.count(|s| matches!(s, StageStatus::Cached));
        let failed = report.count(|s| matches!(s, StageStatus::Failed { .. }));
        let skipped = report.count(|s| matches!(s, StageStatus::Skipped { .. }));
        emit_span(
            "pipeline_run",
            &[
                ("succeeded", succeeded.to_string()),
                ("cached", cached.to_string()),
                ("failed", failed.to_string()),
                ("skipped", skipped.to_string()),
            ],
        );
        tracing::info!(succeeded, cached, failed, skipped, "pipeline run finished");
        Ok(report)
    }
}

fn planned<'a>(plan: &'a Plan, name: &str) -> Result<&'a PlannedStage> {
    plan.get(name)
        .ok_or_else(|| Error::Invariant(format!("stage '{name}' missing from plan")))
}

fn release<'a>(
    graph: &'a StageGraph,
    selected: &BTreeSet<String>,
    name: &str,
    pending: &mut BTreeMap<&'a str, usize>,
    ready: &mut VecDeque<String>,
) {
    for dependent in graph.dependents(name) {
        if !selected.contains(dependent) {
            continue;
        }
        if let Some(count) = pending.get_mut(dependent) {
            *count -= 1;
            if *count == 0 {
                ready.push_back(dependent.to_string());
            }
        }
    }
}

fn skip_downstream(graph: &StageGraph, selected: &BTreeSet<String>, failed: &str, report: &mut RunReport) {
    let mut stack = vec![failed.to_string()];
    while let Some(name) = stack.pop() {
        for dependent in graph.dependents(&name) {
            if !selected.contains(dependent) || report.statuses.contains_key(dependent) {
                continue;
            }
            tracing::warn!(stage = dependent, upstream = failed, "skipping: upstream failed");
            report.statuses.insert(
                dependent.to_string(),
                StageStatus::Skipped {
                    cause: SkipCause::UpstreamFailed,
                },
            );
            stack.push(dependent.to_string());
        }
    }
}

async fn run_stage(job: StageJob) -> Finished {
    let permit = tokio::select! {
        biased;
        _ = job.cancel.cancelled() => return Finished::NotStarted,
        permit = Arc::clone(&job.semaphore).acquire_owned() => match permit {
            Ok(permit) => permit,
            Err(_) => return Finished::Aborted(Error::Invariant("stage semaphore closed".into())),
        },
    };

    let planned = job.planned;
    let mut record = RunRecord::start(planned.name.clone(), planned.fingerprint);
    record.parameters = planned
        .config
        .iter()
        .map(|(k, v)| (k.clone(), ScalarParam::from_json(v)))
        .collect();
    let timer = StageTimer::start(&planned.name);
    tracing::info!(fingerprint = %planned.fingerprint.short(), "stage started");

    let ctx = StageContext {
        run_id: record.run_id,
        name: planned.name.clone(),
        fingerprint: planned.fingerprint,
        config: planned.config.clone(),
        inputs: planned.inputs.clone(),
        stores: job.stores.clone(),
        cancel: CancellationToken::new(),
    };
    let abandon = ctx.cancel.clone();
    let stage = job.stage;
    // The permit travels with the blocking closure: a stage that outlives its
    // timeout keeps its slot until the thread actually returns.
    let handle = tokio::task::spawn_blocking(move || (stage.run(&ctx), permit));
    let joined = match job.timeout {
        Some(limit) => match tokio::time::timeout(limit, handle).await {
            Ok(joined) => joined,
            // The blocking thread is left to finish; its output is discarded.
            Err(_) => {
                abandon.cancel();
                let message = format!("exceeded timeout of {limit:?}");
                return fail(&job.stores, record, FailureReason::Timeout, message, &timer);
            }
        },
        None => handle.await,
    };

    let (result, _permit) = match joined {
        Ok(done) => done,
        Err(join_err) => {
            let message = if join_err.is_panic() {
                "stage panicked".to_string()
            } else {
                join_err.to_string()
            };
            return fail(&job.stores, record, FailureReason::Panicked, message, &timer);
        }
    };
    let output = match result {
        Ok(output) => output,
        Err(StageError::Failed { reason, message }) => {
            return fail(&job.stores, record, reason, message, &timer);
        }
        Err(StageError::Structural(e)) => {
            let record = record.fail(FailureReason::Error, e.to_string());
            if let Err(log_err) = job.stores.runs.record(record) {
                tracing::error!(error = %log_err, "could not record failed run");
            }
            return Finished::Aborted(e);
        }
    };

    let stores = job.stores.clone();
    let name = planned.name.clone();
    let fingerprint = planned.fingerprint;
    let persisted =
        tokio::task::spawn_blocking(move || persist(&stores.artifacts, &name, fingerprint, output)).await;

    match persisted {
        Ok(Ok((refs, output))) => {
            let record = record.succeed(refs, output.params, output.metrics);
            if let Err(e) = job.stores.runs.record(record) {
                return Finished::Aborted(e);
            }
            let elapsed_ms = timer.elapsed_ms();
            tracing::info!(elapsed_ms, "stage succeeded");
            Finished::Succeeded { elapsed_ms }
        }
        Ok(Err(e)) if e.is_structural() => {
            let record = record.fail(FailureReason::Error, e.to_string());
            if let Err(log_err) = job.stores.runs.record(record) {
                tracing::error!(error = %log_err, "could not record failed run");
            }
            Finished::Aborted(e)
        }
        Ok(Err(e)) => fail(&job.stores, record, FailureReason::Io, e.to_string(), &timer),
        Err(join_err) => fail(
            &job.stores,
            record,
            FailureReason::Panicked,
            join_err.to_string(),
            &timer,
        ),
    }
}

fn fail(
    stores: &Stores,
    record: RunRecord,
    reason: FailureReason,
    message: String,
    timer: &StageTimer,
) -> Finished {
    tracing::warn!(stage = timer.stage(), %reason, %message, "stage failed");
    let record = record.fail(reason, message.clone());
    if let Err(e) = stores.runs.record(record) {
        return Finished::Aborted(e);
    }
    Finished::Failed {
        reason,
        message,
        elapsed_ms: timer.elapsed_ms(),
    }
}

/// Extras first, primary artifact last: the primary is the cache-hit marker.
fn persist(
    artifacts: &ArtifactStore,
    stage: &str,
    fingerprint: Fingerprint,
    mut output: StageOutput,
) -> Result<(Vec<Fingerprint>, StageOutput)> {
    let mut refs = vec![fingerprint];
    for extra in output.extras.drain(..) {
        let fp = fingerprint.derive(&extra.label);
        artifacts.put(fp, extra.kind, stage, &extra.payload)?;
        refs.push(fp);
    }
    artifacts.put(fingerprint, output.kind, stage, &output.payload)?;
    Ok((refs, output))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::StageResult;
    use crate::graph::StageSpec;
    use ckdflow_core::record::{ArtifactKind, RunState};
    use ckdflow_store::RunFilter;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting(name: &str, calls: &Arc<AtomicUsize>) -> StageSpec {
        let calls = Arc::clone(calls);
        let payload = name.as_bytes().to_vec();
        StageSpec::new(name, move |_: &StageContext| -> StageResult {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(StageOutput::new(ArtifactKind::Dataset, payload.clone()).metric("rows", 3.0))
        })
    }

    fn failing(name: &str) -> StageSpec {
        StageSpec::new(name, |_: &StageContext| -> StageResult {
            Err(StageError::error("model did not converge"))
        })
    }

    fn sleeping(name: &str, ms: u64) -> StageSpec {
        StageSpec::new(name, move |_: &StageContext| -> StageResult {
            std::thread::sleep(Duration::from_millis(ms));
            Ok(StageOutput::new(ArtifactKind::Report, b"slept".to_vec()))
        })
    }

    fn none() -> BTreeMap<String, serde_json::Value> {
        BTreeMap::new()
    }

    fn pipeline(calls: &Arc<AtomicUsize>) -> StageGraph {
        StageGraph::builder()
            .add(counting("preprocess", calls), none())
            .add(counting("train", calls).depends_on("preprocess"), none())
            .add(counting("evaluate", calls).depends_on("train"), none())
            .add(counting("evaluate_baseline", calls).depends_on("preprocess"), none())
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn rerun_with_unchanged_inputs_is_fully_cached() {
        let calls = Arc::new(AtomicUsize::new(0));
        let graph = pipeline(&calls);
        let orch = Orchestrator::new(Stores::in_memory());

        let first = orch.run(&graph, RunOptions::default()).await.unwrap();
        assert!(first.is_success());
        assert_eq!(first.executed(), 4);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(orch.stores().runs.len(), 4);

        let second = orch.run(&graph, RunOptions::default()).await.unwrap();
        assert_eq!(second.executed(), 0);
        assert!(second.statuses.values().all(|s| *s == StageStatus::Cached));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(orch.stores().runs.len(), 4);
        assert_eq!(first.fingerprints, second.fingerprints);
    }

    #[tokio::test]
    async fn failed_branch_does_not_stop_sibling() {
        let calls = Arc::new(AtomicUsize::new(0));
        let graph = StageGraph::builder()
            .add(counting("preprocess", &calls), none())
            .add(failing("train").depends_on("preprocess"), none())
            .add(counting("evaluate", &calls).depends_on("train"), none())
            .add(counting("evaluate_baseline", &calls).depends_on("preprocess"), none())
            .build()
            .unwrap();
        let orch = Orchestrator::new(Stores::in_memory());
        let report = orch.run(&graph, RunOptions::default()).await.unwrap();

        assert!(matches!(
            report.status("train"),
            Some(StageStatus::Failed { reason: FailureReason::Error, .. })
        ));
        assert_eq!(report.status("evaluate_baseline"), Some(&StageStatus::Succeeded));
        assert_eq!(
            report.status("evaluate"),
            Some(&StageStatus::Skipped { cause: SkipCause::UpstreamFailed })
        );
        assert_eq!(report.failed_stages(), vec!["train"]);
        assert!(!report.is_success());

        let runs = &orch.stores().runs;
        assert_eq!(runs.len(), 3);
        let failed: Vec<_> = runs.query(RunFilter::default().status(RunState::Failed)).unwrap().collect();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].stage_name, "train");
        assert!(!orch.stores().artifacts.exists(&report.fingerprints["train"]));
    }

    #[tokio::test]
    async fn force_reexecutes_only_named_stage() {
        let calls = Arc::new(AtomicUsize::new(0));
        let graph = pipeline(&calls);
        let orch = Orchestrator::new(Stores::in_memory());
        orch.run(&graph, RunOptions::default()).await.unwrap();

        let report = orch
            .run(&graph, RunOptions::default().force(["train"]))
            .await
            .unwrap();
        assert_eq!(report.status("train"), Some(&StageStatus::Succeeded));
        assert_eq!(report.status("evaluate"), Some(&StageStatus::Cached));
        assert_eq!(calls.load(Ordering::SeqCst), 5);
        assert_eq!(orch.stores().runs.len(), 5);

        let err = orch
            .run(&graph, RunOptions::default().force(["nope"]))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[tokio::test]
    async fn targets_limit_run_to_ancestors() {
        let calls = Arc::new(AtomicUsize::new(0));
        let graph = pipeline(&calls);
        let orch = Orchestrator::new(Stores::in_memory());
        let report = orch
            .run(&graph, RunOptions::default().targets(["train"]))
            .await
            .unwrap();
        assert_eq!(report.statuses.len(), 2);
        assert!(report.status("evaluate").is_none());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn slow_stage_times_out_without_artifact() {
        let graph = StageGraph::builder()
            .add(sleeping("slow", 500).timeout(Duration::from_millis(50)), none())
            .add(sleeping("fast", 0), none())
            .build()
            .unwrap();
        let orch = Orchestrator::new(Stores::in_memory());
        let report = orch.run(&graph, RunOptions::default()).await.unwrap();

        assert!(matches!(
            report.status("slow"),
            Some(StageStatus::Failed { reason: FailureReason::Timeout, .. })
        ));
        assert_eq!(report.status("fast"), Some(&StageStatus::Succeeded));
        assert!(!orch.stores().artifacts.exists(&report.fingerprints["slow"]));
        let rec = orch.stores().runs.latest("slow").unwrap().unwrap();
        assert_eq!(rec.status.state(), RunState::Failed);
    }

    #[tokio::test]
    async fn timed_out_stage_cannot_touch_the_model_registry() {
        let graph = StageGraph::builder()
            .add(
                StageSpec::new("evaluate", |ctx: &StageContext| -> StageResult {
                    std::thread::sleep(Duration::from_millis(300));
                    ctx.ensure_active()?;
                    let version = ctx.models().register("ckd", ctx.fingerprint, BTreeMap::new())?;
                    ctx.models().promote("ckd", version.version_number)?;
                    Ok(StageOutput::new(ArtifactKind::Report, b"evaluated".to_vec()))
                })
                .timeout(Duration::from_millis(50)),
                none(),
            )
            .build()
            .unwrap();
        let orch = Orchestrator::new(Stores::in_memory());
        let report = orch.run(&graph, RunOptions::default()).await.unwrap();
        assert!(matches!(
            report.status("evaluate"),
            Some(StageStatus::Failed { reason: FailureReason::Timeout, .. })
        ));

        // Give the abandoned thread time to wake up and return.
        tokio::time::sleep(Duration::from_millis(600)).await;
        let models = &orch.stores().models;
        assert!(models.versions("ckd").unwrap().is_empty());
        assert!(matches!(models.get_active("ckd"), Err(Error::NotFound(_))));
        assert_eq!(orch.stores().runs.len(), 1);
    }

    #[tokio::test]
    async fn timed_out_stage_keeps_its_slot_until_it_returns() {
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let tracked = |name: &str, ms: u64| {
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            StageSpec::new(name, move |_: &StageContext| -> StageResult {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                std::thread::sleep(Duration::from_millis(ms));
                running.fetch_sub(1, Ordering::SeqCst);
                Ok(StageOutput::new(ArtifactKind::Report, Vec::new()))
            })
        };
        let graph = StageGraph::builder()
            .add(tracked("evaluate", 200).timeout(Duration::from_millis(20)), none())
            .add(tracked("monitor", 10), none())
            .add(tracked("summary", 10), none())
            .build()
            .unwrap();
        let orch = Orchestrator::new(Stores::in_memory());
        let report = orch
            .run(&graph, RunOptions::default().max_parallel(1))
            .await
            .unwrap();

        assert!(matches!(
            report.status("evaluate"),
            Some(StageStatus::Failed { reason: FailureReason::Timeout, .. })
        ));
        assert_eq!(report.status("monitor"), Some(&StageStatus::Succeeded));
        assert_eq!(report.status("summary"), Some(&StageStatus::Succeeded));
        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancelled_before_start_skips_everything() {
        let calls = Arc::new(AtomicUsize::new(0));
        let graph = pipeline(&calls);
        let orch = Orchestrator::new(Stores::in_memory());
        let token = CancellationToken::new();
        token.cancel();

        let report = orch
            .run(&graph, RunOptions::default().cancel_token(token))
            .await
            .unwrap();
        assert!(report
            .statuses
            .values()
            .all(|s| *s == StageStatus::Skipped { cause: SkipCause::Cancelled }));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(orch.stores().runs.is_empty());
    }

    #[tokio::test]
    async fn cancellation_lets_running_stage_finish() {
        let calls = Arc::new(AtomicUsize::new(0));
        let graph = StageGraph::builder()
            .add(sleeping("slow", 300), none())
            .add(counting("after", &calls).depends_on("slow"), none())
            .build()
            .unwrap();
        let orch = Orchestrator::new(Stores::in_memory());
        let token = CancellationToken::new();
        let trigger = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let report = orch
            .run(&graph, RunOptions::default().cancel_token(token))
            .await
            .unwrap();
        assert_eq!(report.status("slow"), Some(&StageStatus::Succeeded));
        assert_eq!(
            report.status("after"),
            Some(&StageStatus::Skipped { cause: SkipCause::Cancelled })
        );
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(orch.stores().runs.len(), 1);
    }

    #[tokio::test]
    async fn panicking_stage_is_recorded_as_panicked() {
        let graph = StageGraph::builder()
            .add(
                StageSpec::new("boom", |_: &StageContext| -> StageResult { panic!("bad input") }),
                none(),
            )
            .build()
            .unwrap();
        let orch = Orchestrator::new(Stores::in_memory());
        let report = orch.run(&graph, RunOptions::default()).await.unwrap();
        assert!(matches!(
            report.status("boom"),
            Some(StageStatus::Failed { reason: FailureReason::Panicked, .. })
        ));
    }

    #[tokio::test]
    async fn structural_error_aborts_run() {
        let graph = StageGraph::builder()
            .add(
                StageSpec::new("corrupt", |_: &StageContext| -> StageResult {
                    Err(StageError::Structural(Error::integrity("abc", "payload differs")))
                }),
                none(),
            )
            .build()
            .unwrap();
        let orch = Orchestrator::new(Stores::in_memory());
        let err = orch.run(&graph, RunOptions::default()).await.unwrap_err();
        assert!(matches!(err, Error::Integrity { .. }));
    }

    #[tokio::test]
    async fn nondeterministic_stage_trips_integrity_check_on_force() {
        let counter = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&counter);
        let graph = StageGraph::builder()
            .add(
                StageSpec::new("clock", move |_: &StageContext| -> StageResult {
                    let n = c.fetch_add(1, Ordering::SeqCst);
                    Ok(StageOutput::new(ArtifactKind::Report, n.to_string().into_bytes()))
                }),
                none(),
            )
            .build()
            .unwrap();
        let orch = Orchestrator::new(Stores::in_memory());
        orch.run(&graph, RunOptions::default()).await.unwrap();
        let err = orch
            .run(&graph, RunOptions::default().force(["clock"]))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Integrity { .. }));
    }

    #[tokio::test]
    async fn parallelism_is_bounded() {
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let mut builder = StageGraph::builder();
        for i in 0..6 {
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            builder = builder.add(
                StageSpec::new(format!("branch{i}"), move |_: &StageContext| -> StageResult {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    std::thread::sleep(Duration::from_millis(30));
                    running.fetch_sub(1, Ordering::SeqCst);
                    Ok(StageOutput::new(ArtifactKind::Report, Vec::new()))
                }),
                none(),
            );
        }
        let graph = builder.build().unwrap();
        let orch = Orchestrator::new(Stores::in_memory());
        let report = orch
            .run(&graph, RunOptions::default().max_parallel(2))
            .await
            .unwrap();
        assert!(report.is_success());
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn extras_are_stored_under_derived_fingerprints() {
        let graph = StageGraph::builder()
            .add(
                StageSpec::new("preprocess", |_: &StageContext| -> StageResult {
                    StageOutput::new(ArtifactKind::Dataset, b"rows".to_vec()).with_extra_json(
                        "reference_summary",
                        ArtifactKind::Report,
                        &vec!["gfr"],
                    )
                }),
                none(),
            )
            .build()
            .unwrap();
        let orch = Orchestrator::new(Stores::in_memory());
        let report = orch.run(&graph, RunOptions::default()).await.unwrap();
        let fp = report.fingerprints["preprocess"];
        let summary: Vec<String> = orch
            .stores()
            .artifacts
            .read_json(&fp.derive("reference_summary"))
            .unwrap();
        assert_eq!(summary, vec!["gfr"]);
        let rec = orch.stores().runs.latest("preprocess").unwrap().unwrap();
        assert_eq!(rec.artifact_refs, vec![fp, fp.derive("reference_summary")]);
    }

    #[tokio::test]
    async fn explain_reports_cache_state() {
        let calls = Arc::new(AtomicUsize::new(0));
        let graph = pipeline(&calls);
        let orch = Orchestrator::new(Stores::in_memory());
        assert!(orch.explain(&graph).unwrap().iter().all(|e| !e.cached));
        orch.run(&graph, RunOptions::default().targets(["evaluate_baseline"]))
            .await
            .unwrap();
        let cached: Vec<String> = orch
            .explain(&graph)
            .unwrap()
            .into_iter()
            .filter(|e| e.cached)
            .map(|e| e.stage)
            .collect();
        assert_eq!(cached, vec!["preprocess", "evaluate_baseline"]);
    }
}
