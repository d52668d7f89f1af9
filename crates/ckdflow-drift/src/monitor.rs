//! One monitoring run as an explicit state machine.
//!
//! ```text
//! Scheduled -> ComputingSummaries -> Comparing -> ReportReady
//!     \               \                  \
//!      `---------------`------------------`--> Failed
//! ```
//!
//! `ReportReady` and `Failed` are terminal. Every transition is recorded.

use std::fmt;

use serde::{Deserialize, Serialize};

use ckdflow_core::error::{Error, Result};
use ckdflow_core::hash::Fingerprint;
use ckdflow_core::id::RunId;
use ckdflow_core::schema::FeatureSchema;
use ckdflow_core::time::now_millis;
use ckdflow_core::types::Dataset;

use crate::detector::{DriftDetector, DriftReport};
use crate::summary::{summarize, summarize_against, DatasetSummary};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MonitorState {
    Scheduled,
    ComputingSummaries,
    Comparing,
    ReportReady,
    Failed,
}

impl MonitorState {
    pub fn is_terminal(self) -> bool {
        matches!(self, MonitorState::ReportReady | MonitorState::Failed)
    }

    fn can_move_to(self, next: MonitorState) -> bool {
        use MonitorState::*;
        match (self, next) {
            (Scheduled, ComputingSummaries)
            | (ComputingSummaries, Comparing)
            | (Comparing, ReportReady) => true,
            (from, Failed) => !from.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for MonitorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MonitorState::Scheduled => "scheduled",
            MonitorState::ComputingSummaries => "computing_summaries",
            MonitorState::Comparing => "comparing",
            MonitorState::ReportReady => "report_ready",
            MonitorState::Failed => "failed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transition {
    pub from: MonitorState,
    pub to: MonitorState,
    pub at_ms: u64,
    /// Failure cause, for transitions into `Failed`.
    #[serde(default)]
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitoringRun {
    pub id: RunId,
    state: MonitorState,
    transitions: Vec<Transition>,
    report: Option<DriftReport>,
    error: Option<String>,
}

impl Default for MonitoringRun {
    fn default() -> Self {
        Self::new()
    }
}

impl MonitoringRun {
    pub fn new() -> Self {
        Self {
            id: RunId::new(),
            state: MonitorState::Scheduled,
            transitions: Vec::new(),
            report: None,
            error: None,
        }
    }

    pub fn state(&self) -> MonitorState {
        self.state
    }

    pub fn transitions(&self) -> &[Transition] {
        &self.transitions
    }

    pub fn report(&self) -> Option<&DriftReport> {
        self.report.as_ref()
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    fn advance(&mut self, to: MonitorState, detail: Option<String>) -> Result<()> {
        if !self.state.can_move_to(to) {
            return Err(Error::Invariant(format!(
                "illegal monitoring transition {} -> {}",
                self.state, to
            )));
        }
        tracing::debug!(run = %self.id, from = %self.state, to = %to, "monitoring transition");
        self.transitions.push(Transition {
            from: self.state,
            to,
            at_ms: now_millis(),
            detail,
        });
        self.state = to;
        Ok(())
    }

    fn fail(&mut self, err: &Error) {
        let cause = err.to_string();
        tracing::warn!(run = %self.id, state = %self.state, error = %cause, "monitoring run failed");
        // Only terminal states refuse `Failed`, and callers never fail twice.
        let _ = self.advance(MonitorState::Failed, Some(cause.clone()));
        self.error = Some(cause);
    }

    /// Run against a cached reference summary.
    ///
    /// Never returns an error: failures leave the run in `Failed` with the
    /// cause recorded. Use [`MonitoringRun::into_report`] to get a `Result`.
    pub fn execute(
        detector: &DriftDetector,
        reference: &DatasetSummary,
        current: &Dataset,
        current_source: Fingerprint,
    ) -> Self {
        Self::execute_at(detector, reference, current, current_source, now_millis())
    }

    /// As [`execute`](Self::execute), with a fixed `generated_ms` on the report.
    pub fn execute_at(
        detector: &DriftDetector,
        reference: &DatasetSummary,
        current: &Dataset,
        current_source: Fingerprint,
        generated_ms: u64,
    ) -> Self {
        let mut run = Self::new();
        let drove = run.drive(
            detector,
            || Ok(reference.clone()),
            current,
            current_source,
            generated_ms,
        );
        if let Err(e) = drove {
            run.fail(&e);
        }
        run
    }

    /// Run from raw datasets, summarizing the reference first.
    pub fn execute_datasets(
        detector: &DriftDetector,
        schema: &FeatureSchema,
        reference: &Dataset,
        reference_source: Fingerprint,
        current: &Dataset,
        current_source: Fingerprint,
    ) -> Self {
        let bins = detector.config().numeric.bins;
        let mut run = Self::new();
        let drove = run.drive(
            detector,
            || summarize(reference, schema, bins, reference_source),
            current,
            current_source,
            now_millis(),
        );
        if let Err(e) = drove {
            run.fail(&e);
        }
        run
    }

    fn drive(
        &mut self,
        detector: &DriftDetector,
        reference: impl FnOnce() -> Result<DatasetSummary>,
        current: &Dataset,
        current_source: Fingerprint,
        generated_ms: u64,
    ) -> Result<()> {
        self.advance(MonitorState::ComputingSummaries, None)?;
        let reference = reference()?;
        let current = summarize_against(current, &reference, current_source)?;

        self.advance(MonitorState::Comparing, None)?;
        let report = detector.detect_at(&reference, &current, generated_ms)?;

        self.report = Some(report);
        self.advance(MonitorState::ReportReady, None)
    }

    /// The report, or the recorded failure as `DriftComputation`.
    pub fn into_report(self) -> Result<DriftReport> {
        match (self.state, self.report) {
            (MonitorState::ReportReady, Some(report)) => Ok(report),
            _ => Err(Error::DriftComputation(
                self.error
                    .unwrap_or_else(|| format!("monitoring run ended in state {}", self.state)),
            )),
        }
    }
}
