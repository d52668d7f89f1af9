//! Concrete stage bodies.
//!
//! Each stage reads everything it needs from its context: resolved config,
//! dependency artifacts, registries. What a stage depends on is therefore
//! exactly what its fingerprint covers.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use ckdflow_core::config::{DriftConfig, FeaturesConfig};
use ckdflow_core::hash::{hash_file, Fingerprint};
use ckdflow_core::record::{ArtifactKind, ScalarParam};
use ckdflow_core::time::now_millis;
use ckdflow_drift::{summarize, DatasetSummary, DriftDetector, DriftReport, MonitoringRun};
use ckdflow_exec::{Stage, StageContext, StageError, StageOutput, StageResult};

use crate::estimator::{Estimator, LogisticRegression, MajorityClass, ModelParams};
use crate::evaluate::{score_matrix, EvaluationReport};
use crate::io::{read_batch_path, read_csv_path};
use crate::preprocess::{preprocess, FeatureEncoder, ProcessedData};

/// Label of the reference summary written next to the processed dataset.
pub const REFERENCE_SUMMARY: &str = "reference_summary";

/// The model artifact: fitted parameters plus the exact transforms and labels
/// needed to serve them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelArtifact {
    pub algorithm: String,
    pub params: ModelParams,
    pub encoder: FeatureEncoder,
    pub positive: String,
    pub negative: String,
    /// Fingerprint of the processed dataset the model was trained on.
    pub trained_on: Fingerprint,
    pub hyperparameters: BTreeMap<String, f64>,
}

impl ModelArtifact {
    pub fn label(&self, score: f64) -> &str {
        if score >= crate::evaluate::THRESHOLD {
            &self.positive
        } else {
            &self.negative
        }
    }
}

fn count(n: usize) -> f64 {
    n as f64
}

/// Reads the raw CSV, preprocesses it, and writes the processed dataset plus
/// the training-split distribution summary (features and target).
pub struct PreprocessStage;

impl Stage for PreprocessStage {
    fn run(&self, ctx: &StageContext) -> StageResult {
        let features: FeaturesConfig = ctx.param("features")?;
        let raw_path = ctx.param_str("raw_path")?;
        let test_size: f64 = ctx.param("test_size")?;
        let seed: u64 = ctx.param("seed")?;
        let bins: usize = ctx.param("bins")?;

        let schema = features.schema();
        let raw = read_csv_path(Path::new(raw_path), &schema, &[features.target.as_str()])?;
        let out = preprocess(&raw, &features, test_size, seed)?;
        let summary = summarize(&out.train_rows, &features.drift_schema(), bins, ctx.fingerprint)?;

        let data = &out.data;
        Ok(StageOutput::json(ArtifactKind::Dataset, data)?
            .with_extra_json(REFERENCE_SUMMARY, ArtifactKind::Report, &summary)?
            .param("positive", ScalarParam::Str(data.positive.clone()))
            .param("negative", ScalarParam::Str(data.negative.clone()))
            .metric("raw_rows", count(raw.num_rows()))
            .metric("dropped_rows", count(data.dropped_rows))
            .metric("train_rows", count(data.train.len()))
            .metric("holdout_rows", count(data.holdout.len()))
            .metric("encoded_width", count(data.encoder.width())))
    }
}

/// Fits an estimator on the training split.
///
/// Without an explicit estimator the stage builds a [`LogisticRegression`]
/// from its `learning_rate`, `epochs` and `l2` config.
#[derive(Default)]
pub struct TrainStage {
    estimator: Option<Arc<dyn Estimator>>,
}

impl TrainStage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_estimator(estimator: Arc<dyn Estimator>) -> Self {
        Self {
            estimator: Some(estimator),
        }
    }
}

impl Stage for TrainStage {
    fn run(&self, ctx: &StageContext) -> StageResult {
        let (_, data_fp) = ctx.sole_input()?;
        let data: ProcessedData = ctx.read_json(&data_fp)?;

        let estimator: Arc<dyn Estimator> = match &self.estimator {
            Some(e) => Arc::clone(e),
            None => Arc::new(LogisticRegression {
                learning_rate: ctx.param("learning_rate")?,
                epochs: ctx.param("epochs")?,
                l2: ctx.param("l2")?,
            }),
        };
        tracing::info!(algorithm = estimator.name(), rows = data.train.len(), "training");
        let fitted = estimator.fit(&data.train.x, &data.train.y)?;

        let hyperparameters = estimator.hyperparameters();
        let artifact = ModelArtifact {
            algorithm: estimator.name().to_string(),
            params: fitted.params,
            encoder: data.encoder,
            positive: data.positive,
            negative: data.negative,
            trained_on: data_fp,
            hyperparameters: hyperparameters.clone(),
        };
        let mut output = StageOutput::json(ArtifactKind::Model, &artifact)?
            .param("algorithm", ScalarParam::Str(artifact.algorithm.clone()))
            .metrics(fitted.metrics);
        for (k, v) in hyperparameters {
            output = output.param(k, ScalarParam::Float(v));
        }
        Ok(output)
    }
}

/// Scores the model on the holdout, registers it, and optionally promotes it.
pub struct EvaluateStage;

impl Stage for EvaluateStage {
    fn run(&self, ctx: &StageContext) -> StageResult {
        let (_, model_fp) = ctx.sole_input()?;
        let model: ModelArtifact = ctx.read_json(&model_fp)?;
        let data: ProcessedData = ctx.read_json(&model.trained_on)?;
        if data.holdout.is_empty() {
            return Err(StageError::error("holdout split is empty; set test_size > 0"));
        }
        let metrics = score_matrix(&model.params, &data.holdout);

        let model_name: String = ctx.param("model_name")?;
        let promote_min_f1: Option<f64> = ctx.param("promote_min_f1")?;
        // Registry writes are not undone; skip them once the run gave up on us.
        ctx.ensure_active()?;
        let registry = ctx.models();
        // A forced re-evaluation of the same model must not mint a new version.
        let version = match registry.find_by_artifact(&model_name, &model_fp)? {
            Some(v) => v,
            None => registry.register(&model_name, model_fp, metrics.to_map())?,
        };
        if let Some(min_f1) = promote_min_f1 {
            if metrics.f1 >= min_f1 {
                if !version.is_active {
                    registry.promote(&model_name, version.version_number)?;
                }
            } else {
                tracing::warn!(
                    f1 = metrics.f1,
                    min_f1,
                    version = version.version_number,
                    "model below promotion threshold; not promoted"
                );
            }
        }

        let report = EvaluationReport {
            subject: "model".to_string(),
            model_fingerprint: Some(model_fp),
            dataset_fingerprint: model.trained_on,
            metrics,
            holdout_rows: data.holdout.len(),
            holdout_positives: data.holdout.positives(),
            model_version: Some(version.version_number),
        };
        Ok(StageOutput::json(ArtifactKind::Report, &report)?
            .param("model_name", ScalarParam::Str(model_name))
            .param("model_version", ScalarParam::Int(i64::from(version.version_number)))
            .metrics(metrics.to_map()))
    }
}

/// Majority-class baseline on the same holdout. Depends only on preprocess.
pub struct BaselineStage;

impl Stage for BaselineStage {
    fn run(&self, ctx: &StageContext) -> StageResult {
        let (_, data_fp) = ctx.sole_input()?;
        let data: ProcessedData = ctx.read_json(&data_fp)?;
        if data.holdout.is_empty() {
            return Err(StageError::error("holdout split is empty; set test_size > 0"));
        }
        let fitted = MajorityClass.fit(&data.train.x, &data.train.y)?;
        let metrics = score_matrix(&fitted.params, &data.holdout);
        let report = EvaluationReport {
            subject: MajorityClass::NAME.to_string(),
            model_fingerprint: None,
            dataset_fingerprint: data_fp,
            metrics,
            holdout_rows: data.holdout.len(),
            holdout_positives: data.holdout.positives(),
            model_version: None,
        };
        Ok(StageOutput::json(ArtifactKind::Report, &report)?.metrics(metrics.to_map()))
    }
}

/// Compares a current batch (CSV) against the cached reference summary.
/// Categories the reference never saw are kept and count toward drift.
pub struct MonitorStage;

impl Stage for MonitorStage {
    fn run(&self, ctx: &StageContext) -> StageResult {
        let (_, data_fp) = ctx.sole_input()?;
        let mut reference: DatasetSummary = ctx.read_json(&data_fp.derive(REFERENCE_SUMMARY))?;
        let data: ProcessedData = ctx.read_json(&data_fp)?;
        let drift: DriftConfig = ctx.param("drift")?;
        let current_path = Path::new(ctx.param_str("current_path")?);

        let schema = data.encoder.schema().with_label(&data.target);
        let current = read_batch_path(current_path, &schema, &[])?;
        // Label drift needs labels; an unlabelled batch is compared on features only.
        if current.categorical_column(&data.target).is_empty() {
            reference.features.remove(&data.target);
        }
        let current_fp = hash_file(current_path)?;
        let detector = DriftDetector::new(drift)?;

        // Re-running an existing report keeps its timestamp so the payload is
        // byte-identical to what is already stored under this fingerprint.
        let generated_ms = if ctx.artifacts().exists(&ctx.fingerprint) {
            ctx.read_json::<DriftReport>(&ctx.fingerprint)?.generated_ms
        } else {
            now_millis()
        };
        let run = MonitoringRun::execute_at(&detector, &reference, &current, current_fp, generated_ms);
        let run_id = run.id;
        let report = run.into_report()?;
        let summary = report.summary();
        tracing::info!(
            monitoring_run = %run_id,
            dataset_drift = summary.dataset_drift,
            drifted = summary.number_of_drifted_columns,
            "drift report ready"
        );

        Ok(StageOutput::json(ArtifactKind::Report, &report)?
            .param("policy", ScalarParam::Str(report.policy.clone()))
            .metric("dataset_drift", if summary.dataset_drift { 1.0 } else { 0.0 })
            .metric("drift_share", summary.drift_share)
            .metric("number_of_columns", count(summary.number_of_columns))
            .metric("number_of_drifted_columns", count(summary.number_of_drifted_columns))
            .metric("current_samples", summary.current_samples as f64))
    }
}
