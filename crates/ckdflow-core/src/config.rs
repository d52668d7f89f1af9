//! Pipeline configuration document.
//!
//! Layering (lowest to highest priority): built-in defaults, the YAML file,
//! `CKDFLOW_*` environment variables, then CLI flags applied by the binary.
//! Unknown keys are ignored at every level.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::schema::{FeatureSchema, FeatureSpec};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub features: FeaturesConfig,
    /// Stage name -> stage settings.
    pub stages: BTreeMap<String, StageConfig>,
    pub drift: DriftConfig,
    pub registry: RegistryConfig,
    pub execution: ExecutionConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FeaturesConfig {
    pub numeric: Vec<String>,
    /// Categorical feature -> allowed values (empty list accepts anything).
    pub categorical: BTreeMap<String, Vec<String>>,
    /// Features that may be absent at serving time (imputed instead).
    pub optional: Vec<String>,
    pub target: String,
    /// Target value treated as the positive class.
    pub positive: String,
}

impl Default for FeaturesConfig {
    fn default() -> Self {
        Self {
            numeric: Vec::new(),
            categorical: BTreeMap::new(),
            optional: Vec::new(),
            target: "classification".to_string(),
            positive: "ckd".to_string(),
        }
    }
}

impl FeaturesConfig {
    /// Build the feature schema: numeric features first (declared order),
    /// then categoricals (sorted by name).
    pub fn schema(&self) -> FeatureSchema {
        let optional: BTreeSet<&str> = self.optional.iter().map(String::as_str).collect();
        let mut features = Vec::with_capacity(self.numeric.len() + self.categorical.len());
        for name in &self.numeric {
            let mut spec = FeatureSpec::numeric(name.clone());
            spec.required = !optional.contains(name.as_str());
            features.push(spec);
        }
        for (name, allowed) in &self.categorical {
            let mut spec = FeatureSpec::categorical(name.clone(), allowed.iter().cloned());
            spec.required = !optional.contains(name.as_str());
            features.push(spec);
        }
        FeatureSchema::new(features)
    }

    /// Feature schema plus the target column, for drift summaries.
    pub fn drift_schema(&self) -> FeatureSchema {
        self.schema().with_label(&self.target)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StageConfig {
    /// Stage kind (e.g. "preprocess", "train"). Defaults to the stage name.
    pub kind: Option<String>,
    pub depends_on: Vec<String>,
    pub params: BTreeMap<String, serde_json::Value>,
    /// Per-stage override of `execution.stage_timeout_secs`.
    pub timeout_secs: Option<u64>,
}

impl StageConfig {
    pub fn kind_or<'a>(&'a self, name: &'a str) -> &'a str {
        self.kind.as_deref().unwrap_or(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NumericStatistic {
    Psi,
    Ks,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CategoricalStatistic {
    Tvd,
    Psi,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NumericDriftConfig {
    pub statistic: NumericStatistic,
    /// Number of quantile bins computed from the reference distribution.
    pub bins: usize,
    pub moderate: f64,
    pub significant: f64,
}

impl Default for NumericDriftConfig {
    fn default() -> Self {
        Self {
            statistic: NumericStatistic::Psi,
            bins: 10,
            moderate: 0.1,
            significant: 0.2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CategoricalDriftConfig {
    pub statistic: CategoricalStatistic,
    pub moderate: f64,
    pub significant: f64,
}

impl Default for CategoricalDriftConfig {
    fn default() -> Self {
        Self {
            statistic: CategoricalStatistic::Tvd,
            moderate: 0.1,
            significant: 0.2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DriftPolicyConfig {
    /// Dataset drift when the drifted share of features exceeds this fraction.
    pub drift_share: f64,
    /// Any of these drifting flags the dataset regardless of share.
    pub critical: Vec<String>,
}

impl Default for DriftPolicyConfig {
    fn default() -> Self {
        Self {
            drift_share: 0.3,
            critical: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DriftConfig {
    pub numeric: NumericDriftConfig,
    pub categorical: CategoricalDriftConfig,
    pub policy: DriftPolicyConfig,
}

impl DriftConfig {
    pub fn validate(&self) -> Result<()> {
        check_thresholds("drift.numeric", self.numeric.moderate, self.numeric.significant)?;
        check_thresholds(
            "drift.categorical",
            self.categorical.moderate,
            self.categorical.significant,
        )?;
        if self.numeric.bins < 2 {
            return Err(Error::Config(format!(
                "drift.numeric.bins must be >= 2, got {}",
                self.numeric.bins
            )));
        }
        let share = self.policy.drift_share;
        if !(0.0..=1.0).contains(&share) {
            return Err(Error::Config(format!(
                "drift.policy.drift_share must be within [0, 1], got {share}"
            )));
        }
        Ok(())
    }
}

fn check_thresholds(section: &str, moderate: f64, significant: f64) -> Result<()> {
    if !(moderate.is_finite() && significant.is_finite()) || moderate < 0.0 || significant < 0.0 {
        return Err(Error::Config(format!(
            "{section}: thresholds must be finite and non-negative"
        )));
    }
    if moderate > significant {
        return Err(Error::Config(format!(
            "{section}: moderate ({moderate}) exceeds significant ({significant})"
        )));
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Storage root: a directory, `file:///abs/path`, or `memory://name`.
    pub root: String,
    /// Name under which trained models are registered.
    pub model_name: String,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            root: ".ckdflow".to_string(),
            model_name: "ckd-classifier".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    /// Upper bound on concurrently executing stages.
    pub max_parallel: usize,
    /// Default per-stage timeout; `None` means unbounded.
    pub stage_timeout_secs: Option<u64>,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            max_parallel: 4,
            stage_timeout_secs: None,
        }
    }
}

impl PipelineConfig {
    pub fn from_yaml_str(s: &str) -> Result<Self> {
        let cfg: PipelineConfig = serde_yaml::from_str(s)?;
        Ok(cfg)
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("read {}: {e}", path.display())))?;
        Self::from_yaml_str(&text)
    }

    /// File + environment + validation; what the binary uses.
    pub fn load(path: &Path) -> Result<Self> {
        let mut cfg = Self::from_path(path)?;
        cfg.apply_env();
        cfg.validate()?;
        Ok(cfg)
    }

    /// Apply environment overrides.
    ///
    /// Environment variables:
    /// - `CKDFLOW_HOME`: registry/artifact storage root
    /// - `CKDFLOW_MODEL_NAME`: registered model name
    /// - `CKDFLOW_MAX_PARALLEL`: max concurrently running stages
    /// - `CKDFLOW_STAGE_TIMEOUT_SECS`: default per-stage timeout
    pub fn apply_env(&mut self) {
        if let Ok(s) = std::env::var("CKDFLOW_HOME") {
            self.registry.root = s;
        }

        if let Ok(s) = std::env::var("CKDFLOW_MODEL_NAME") {
            self.registry.model_name = s;
        }

        if let Ok(s) = std::env::var("CKDFLOW_MAX_PARALLEL") {
            if let Ok(v) = s.parse::<usize>() {
                self.execution.max_parallel = v;
            }
        }

        if let Ok(s) = std::env::var("CKDFLOW_STAGE_TIMEOUT_SECS") {
            if let Ok(v) = s.parse::<u64>() {
                self.execution.stage_timeout_secs = Some(v);
            }
        }
    }

    /// Document-level checks. Stage-level checks (required keys, kinds,
    /// dependencies) happen when the stage graph is built.
    pub fn validate(&self) -> Result<()> {
        self.drift.validate()?;
        if self.execution.max_parallel == 0 {
            return Err(Error::Config("execution.max_parallel must be >= 1".into()));
        }
        if self.registry.model_name.trim().is_empty() {
            return Err(Error::Config("registry.model_name must not be empty".into()));
        }
        let mut seen = BTreeSet::new();
        for name in self
            .features
            .numeric
            .iter()
            .chain(self.features.categorical.keys())
        {
            if !seen.insert(name.as_str()) {
                return Err(Error::Config(format!(
                    "feature '{name}' declared more than once"
                )));
            }
        }
        if seen.contains(self.features.target.as_str()) {
            return Err(Error::Config(format!(
                "target '{}' must not also be a feature",
                self.features.target
            )));
        }
        Ok(())
    }
}
