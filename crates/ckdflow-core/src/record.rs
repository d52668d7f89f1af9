//! Persisted records: artifacts, run records, and model versions.
//!
//! Artifacts and run records are append-only; once written they are never
//! mutated. `ModelVersion::is_active` is the single mutable field and is only
//! flipped by the model registry's promotion operation.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::hash::Fingerprint;
use crate::id::RunId;
use crate::time::now_millis;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    Dataset,
    Model,
    Report,
}

impl fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ArtifactKind::Dataset => "dataset",
            ArtifactKind::Model => "model",
            ArtifactKind::Report => "report",
        };
        f.write_str(s)
    }
}

/// Metadata for one immutable payload in the artifact store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    pub fingerprint: Fingerprint,
    pub kind: ArtifactKind,
    /// Backend-specific location of the payload (path or memory key).
    pub location: String,
    /// Milliseconds since Unix epoch (UTC).
    pub created_ms: u64,
    pub producing_stage: String,
    /// blake3 of the payload bytes; used for idempotency checks without
    /// re-reading the payload.
    pub content_hash: Fingerprint,
    pub size_bytes: u64,
}

/// Scalar run parameter (what experiment trackers call a "param").
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ScalarParam {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl ScalarParam {
    /// Lossy conversion from a config value; arrays/objects are rendered as JSON text.
    pub fn from_json(v: &serde_json::Value) -> Self {
        match v {
            serde_json::Value::Bool(b) => ScalarParam::Bool(*b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => ScalarParam::Int(i),
                None => ScalarParam::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            serde_json::Value::String(s) => ScalarParam::Str(s.clone()),
            other => ScalarParam::Str(other.to_string()),
        }
    }
}

impl fmt::Display for ScalarParam {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScalarParam::Bool(b) => write!(f, "{b}"),
            ScalarParam::Int(i) => write!(f, "{i}"),
            ScalarParam::Float(x) => write!(f, "{x}"),
            ScalarParam::Str(s) => f.write_str(s),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    Error,
    Schema,
    Io,
    Timeout,
    Panicked,
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FailureReason::Error => "error",
            FailureReason::Schema => "schema",
            FailureReason::Io => "io",
            FailureReason::Timeout => "timeout",
            FailureReason::Panicked => "panicked",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum RunStatus {
    Pending,
    Success,
    Failed {
        reason: FailureReason,
        message: String,
    },
}

/// Coarse status used for filtering run queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Pending,
    Success,
    Failed,
}

impl RunStatus {
    pub fn state(&self) -> RunState {
        match self {
            RunStatus::Pending => RunState::Pending,
            RunStatus::Success => RunState::Success,
            RunStatus::Failed { .. } => RunState::Failed,
        }
    }
}

impl std::str::FromStr for RunState {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> crate::error::Result<Self> {
        match s {
            "pending" => Ok(RunState::Pending),
            "success" => Ok(RunState::Success),
            "failed" => Ok(RunState::Failed),
            other => Err(crate::error::Error::Config(format!(
                "unknown run status '{other}' (expected pending|success|failed)"
            ))),
        }
    }
}

/// One execution attempt of a stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: RunId,
    pub stage_name: String,
    pub fingerprint: Fingerprint,
    #[serde(default)]
    pub parameters: BTreeMap<String, ScalarParam>,
    #[serde(default)]
    pub metrics: BTreeMap<String, f64>,
    #[serde(default)]
    pub artifact_refs: Vec<Fingerprint>,
    pub status: RunStatus,
    pub started_ms: u64,
    pub finished_ms: Option<u64>,
    pub engine_version: String,
}

impl RunRecord {
    /// A pending record stamped with the current time.
    pub fn start(stage_name: impl Into<String>, fingerprint: Fingerprint) -> Self {
        Self {
            run_id: RunId::new(),
            stage_name: stage_name.into(),
            fingerprint,
            parameters: BTreeMap::new(),
            metrics: BTreeMap::new(),
            artifact_refs: Vec::new(),
            status: RunStatus::Pending,
            started_ms: now_millis(),
            finished_ms: None,
            engine_version: crate::VERSION.to_string(),
        }
    }

    pub fn succeed(
        mut self,
        artifact_refs: Vec<Fingerprint>,
        parameters: BTreeMap<String, ScalarParam>,
        metrics: BTreeMap<String, f64>,
    ) -> Self {
        self.artifact_refs = artifact_refs;
        self.parameters.extend(parameters);
        self.metrics = metrics;
        self.status = RunStatus::Success;
        self.finished_ms = Some(now_millis());
        self
    }

    pub fn fail(mut self, reason: FailureReason, message: impl Into<String>) -> Self {
        self.status = RunStatus::Failed {
            reason,
            message: message.into(),
        };
        self.finished_ms = Some(now_millis());
        self
    }

    pub fn duration_ms(&self) -> Option<u64> {
        self.finished_ms
            .map(|f| f.saturating_sub(self.started_ms))
    }
}

/// A registered version of a named model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelVersion {
    pub model_name: String,
    /// Monotonic per model name, starting at 1.
    pub version_number: u32,
    pub artifact_fingerprint: Fingerprint,
    #[serde(default)]
    pub metrics: BTreeMap<String, f64>,
    pub is_active: bool,
    pub registered_ms: u64,
    #[serde(default)]
    pub promoted_ms: Option<u64>,
}
