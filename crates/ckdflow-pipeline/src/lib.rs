#![forbid(unsafe_code)]
//! ckdflow-pipeline: the CKD workflow on top of the generic engine.
//!
//! - `io`: CSV ingestion against a `FeatureSchema`
//! - `preprocess`: imputation, scaling, one-hot encoding, seeded split
//! - `estimator`: the pluggable `Estimator` and the built-in classifiers
//! - `evaluate`: holdout metrics
//! - `stages`: preprocess / train / evaluate / baseline / monitor bodies
//! - `builder`: `PipelineConfig` -> `StageGraph`, and the `Pipeline` facade
//! - `predictor`: the serving boundary over the active model version

pub mod builder;
pub mod estimator;
pub mod evaluate;
pub mod io;
pub mod predictor;
pub mod preprocess;
pub mod stages;

pub use builder::{build_graph, build_graph_with, Pipeline, StageKind};
pub use estimator::{Estimator, Fitted, LogisticRegression, MajorityClass, ModelParams};
pub use evaluate::{EvaluationReport, Metrics};
pub use io::{read_batch, read_batch_path, read_csv, read_csv_path};
pub use predictor::{Prediction, Predictor};
pub use preprocess::{preprocess, FeatureEncoder, ProcessedData};
pub use stages::{ModelArtifact, REFERENCE_SUMMARY};
