//! What a stage sees while it runs, and what it hands back.
//!
//! Stages never write their own primary artifact. They return a `StageOutput`
//! and the orchestrator persists it after the stage succeeds, so a failed or
//! timed-out stage leaves nothing behind under its fingerprint.

use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use ckdflow_core::error::Error;
use ckdflow_core::hash::Fingerprint;
use ckdflow_core::id::RunId;
use ckdflow_core::record::{ArtifactKind, FailureReason, ScalarParam};
use ckdflow_store::{ArtifactStore, ModelRegistry, RunRegistry, Stores};

pub type StageResult = std::result::Result<StageOutput, StageError>;

#[derive(Debug, Error)]
pub enum StageError {
    /// Stage-local failure: recorded on the run record, siblings continue.
    #[error("{reason}: {message}")]
    Failed {
        reason: FailureReason,
        message: String,
    },

    /// Config/graph/integrity failure raised from inside a stage. Aborts the run.
    #[error(transparent)]
    Structural(Error),
}

impl StageError {
    pub fn new(reason: FailureReason, message: impl Into<String>) -> Self {
        StageError::Failed {
            reason,
            message: message.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new(FailureReason::Error, message)
    }

    pub fn schema(message: impl Into<String>) -> Self {
        Self::new(FailureReason::Schema, message)
    }

    pub fn io(message: impl Into<String>) -> Self {
        Self::new(FailureReason::Io, message)
    }

    pub fn reason(&self) -> FailureReason {
        match self {
            StageError::Failed { reason, .. } => *reason,
            StageError::Structural(_) => FailureReason::Error,
        }
    }
}

impl From<Error> for StageError {
    fn from(e: Error) -> Self {
        if e.is_structural() {
            return StageError::Structural(e);
        }
        let reason = match &e {
            Error::Schema(_) => FailureReason::Schema,
            Error::Storage(_) | Error::NotFound(_) => FailureReason::Io,
            _ => FailureReason::Error,
        };
        StageError::Failed {
            reason,
            message: e.to_string(),
        }
    }
}

/// A secondary output stored under `fingerprint.derive(label)`.
#[derive(Debug, Clone)]
pub struct ExtraArtifact {
    pub label: String,
    pub kind: ArtifactKind,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct StageOutput {
    pub kind: ArtifactKind,
    pub payload: Vec<u8>,
    pub extras: Vec<ExtraArtifact>,
    /// Recorded on the run record next to the resolved config.
    pub params: BTreeMap<String, ScalarParam>,
    pub metrics: BTreeMap<String, f64>,
}

impl StageOutput {
    pub fn new(kind: ArtifactKind, payload: Vec<u8>) -> Self {
        Self {
            kind,
            payload,
            extras: Vec::new(),
            params: BTreeMap::new(),
            metrics: BTreeMap::new(),
        }
    }

    pub fn json<T: Serialize>(kind: ArtifactKind, value: &T) -> Result<Self, StageError> {
        Ok(Self::new(kind, serde_json::to_vec(value).map_err(Error::from)?))
    }

    pub fn with_extra(mut self, label: impl Into<String>, kind: ArtifactKind, payload: Vec<u8>) -> Self {
        self.extras.push(ExtraArtifact {
            label: label.into(),
            kind,
            payload,
        });
        self
    }

    pub fn with_extra_json<T: Serialize>(
        self,
        label: impl Into<String>,
        kind: ArtifactKind,
        value: &T,
    ) -> Result<Self, StageError> {
        let payload = serde_json::to_vec(value).map_err(Error::from)?;
        Ok(self.with_extra(label, kind, payload))
    }

    pub fn param(mut self, key: impl Into<String>, value: ScalarParam) -> Self {
        self.params.insert(key.into(), value);
        self
    }

    pub fn metric(mut self, key: impl Into<String>, value: f64) -> Self {
        self.metrics.insert(key.into(), value);
        self
    }

    pub fn metrics(mut self, metrics: impl IntoIterator<Item = (String, f64)>) -> Self {
        self.metrics.extend(metrics);
        self
    }
}

/// Per-invocation context. The registries are passed in explicitly; there is
/// no process-global tracking client.
#[derive(Clone)]
pub struct StageContext {
    pub run_id: RunId,
    pub name: String,
    pub fingerprint: Fingerprint,
    /// Resolved values of the stage's declared config keys.
    pub config: BTreeMap<String, JsonValue>,
    /// Dependency name -> dependency fingerprint.
    pub inputs: BTreeMap<String, Fingerprint>,
    pub stores: Stores,
    /// Cancelled when the orchestrator stops waiting for this stage.
    pub cancel: CancellationToken,
}

impl StageContext {
    pub fn new(name: impl Into<String>, fingerprint: Fingerprint, stores: Stores) -> Self {
        Self {
            run_id: RunId::new(),
            name: name.into(),
            fingerprint,
            config: BTreeMap::new(),
            inputs: BTreeMap::new(),
            stores,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_config(mut self, config: BTreeMap<String, JsonValue>) -> Self {
        self.config = config;
        self
    }

    pub fn with_input(mut self, dependency: impl Into<String>, fingerprint: Fingerprint) -> Self {
        self.inputs.insert(dependency.into(), fingerprint);
        self
    }

    /// Fails once the stage has been abandoned (timed out). Stages call this
    /// before side effects the orchestrator cannot roll back, such as
    /// registry writes.
    pub fn ensure_active(&self) -> Result<(), StageError> {
        if self.cancel.is_cancelled() {
            return Err(StageError::new(
                FailureReason::Timeout,
                format!("stage '{}' was abandoned", self.name),
            ));
        }
        Ok(())
    }

    pub fn artifacts(&self) -> &ArtifactStore {
        &self.stores.artifacts
    }

    pub fn runs(&self) -> &RunRegistry {
        &self.stores.runs
    }

    pub fn models(&self) -> &ModelRegistry {
        &self.stores.models
    }

    pub fn param<T: DeserializeOwned>(&self, key: &str) -> Result<T, StageError> {
        let value = self.config.get(key).ok_or_else(|| {
            StageError::error(format!("stage '{}' has no config key '{key}'", self.name))
        })?;
        serde_json::from_value(value.clone()).map_err(|e| {
            StageError::error(format!("stage '{}': config key '{key}': {e}", self.name))
        })
    }

    pub fn param_str(&self, key: &str) -> Result<&str, StageError> {
        self.config
            .get(key)
            .and_then(JsonValue::as_str)
            .ok_or_else(|| {
                StageError::error(format!("stage '{}': config key '{key}' is not a string", self.name))
            })
    }

    pub fn input(&self, dependency: &str) -> Result<Fingerprint, StageError> {
        self.inputs.get(dependency).copied().ok_or_else(|| {
            StageError::error(format!("stage '{}' has no input '{dependency}'", self.name))
        })
    }

    /// The first input, for stages with a single dependency of unknown name.
    pub fn sole_input(&self) -> Result<(&str, Fingerprint), StageError> {
        let mut it = self.inputs.iter();
        match (it.next(), it.next()) {
            (Some((name, fp)), None) => Ok((name.as_str(), *fp)),
            _ => Err(StageError::error(format!(
                "stage '{}' expects exactly one input, has {}",
                self.name,
                self.inputs.len()
            ))),
        }
    }

    /// Deserialize a JSON artifact by fingerprint.
    pub fn read_json<T: DeserializeOwned>(&self, fingerprint: &Fingerprint) -> Result<T, StageError> {
        Ok(self.stores.artifacts.read_json(fingerprint)?)
    }

    pub fn read_input<T: DeserializeOwned>(&self, dependency: &str) -> Result<T, StageError> {
        let fp = self.input(dependency)?;
        self.read_json(&fp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ckdflow_core::hash::hash_str;
    use serde_json::json;

    #[test]
    fn core_errors_map_to_failure_reasons() {
        assert!(matches!(
            StageError::from(Error::Schema("x".into())),
            StageError::Failed { reason: FailureReason::Schema, .. }
        ));
        assert_eq!(StageError::from(Error::Storage("disk".into())).reason(), FailureReason::Io);
        assert!(matches!(
            StageError::from(Error::integrity("fp", "differs")),
            StageError::Structural(Error::Integrity { .. })
        ));
    }

    #[test]
    fn context_reads_params_and_inputs() {
        let stores = Stores::in_memory();
        let dep = hash_str("dep");
        stores
            .artifacts
            .put_json(dep, ArtifactKind::Dataset, "preprocess", &vec![1u8, 2, 3])
            .unwrap();

        let mut config = BTreeMap::new();
        config.insert("epochs".to_string(), json!(300));
        config.insert("raw_path".to_string(), json!("data.csv"));
        let ctx = StageContext::new("train", hash_str("train"), stores)
            .with_config(config)
            .with_input("preprocess", dep);

        assert_eq!(ctx.param::<u32>("epochs").unwrap(), 300);
        assert!(ctx.param::<u32>("raw_path").is_err());
        assert_eq!(ctx.param_str("raw_path").unwrap(), "data.csv");
        assert_eq!(ctx.read_input::<Vec<u8>>("preprocess").unwrap(), vec![1, 2, 3]);
        assert_eq!(ctx.sole_input().unwrap(), ("preprocess", dep));
        assert!(ctx.input("missing").is_err());
    }

    #[test]
    fn abandoned_context_refuses_side_effects() {
        let ctx = StageContext::new("evaluate", hash_str("evaluate"), Stores::in_memory());
        assert!(ctx.ensure_active().is_ok());
        ctx.cancel.cancel();
        assert_eq!(ctx.ensure_active().unwrap_err().reason(), FailureReason::Timeout);
    }
}
