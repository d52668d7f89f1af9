//! Convenient re-exports for downstream crates.

pub use crate::config::{DriftConfig, PipelineConfig, StageConfig};
pub use crate::error::{Error, Result};
pub use crate::hash::{Fingerprint, FingerprintBuilder};
pub use crate::id::RunId;
pub use crate::record::{
    Artifact, ArtifactKind, FailureReason, ModelVersion, RunRecord, RunState, RunStatus,
    ScalarParam,
};
pub use crate::schema::{FeatureKind, FeatureSchema, FeatureSpec};
pub use crate::types::{Dataset, Row, Value};
