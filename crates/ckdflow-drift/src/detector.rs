//! Reference-vs-current comparison producing a `DriftReport`.
//!
//! `detect` is pure: it reads two summaries and a config and returns a record.
//! Rendering or persisting the report is up to the caller.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use ckdflow_core::config::{CategoricalStatistic, DriftConfig, NumericStatistic};
use ckdflow_core::error::{Error, Result};
use ckdflow_core::hash::Fingerprint;
use ckdflow_core::time::now_millis;

use crate::policy::{DriftPolicy, ShareOrCritical};
use crate::stats;
use crate::summary::{CategoricalSummary, DatasetSummary, FeatureSummary, NumericSummary};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatisticName {
    Psi,
    Ks,
    Tvd,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    None,
    Moderate,
    Significant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Reason {
    ThresholdExceeded,
    WithinThreshold,
    /// The feature does not appear in the current batch at all.
    MissingInCurrent,
    /// The feature appears, but every value is missing.
    EmptyInCurrent,
    /// Numeric in the reference, categorical in the current batch, or vice versa.
    TypeMismatch,
}

macro_rules! snake_case_display {
    ($ty:ident { $($variant:ident => $name:literal),+ $(,)? }) => {
        impl $ty {
            pub fn as_str(self) -> &'static str {
                match self {
                    $(Self::$variant => $name),+
                }
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.pad(self.as_str())
            }
        }
    };
}

snake_case_display!(StatisticName { Psi => "psi", Ks => "ks", Tvd => "tvd" });
snake_case_display!(Severity { None => "none", Moderate => "moderate", Significant => "significant" });
snake_case_display!(Reason {
    ThresholdExceeded => "threshold_exceeded",
    WithinThreshold => "within_threshold",
    MissingInCurrent => "missing_in_current",
    EmptyInCurrent => "empty_in_current",
    TypeMismatch => "type_mismatch",
});

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureDrift {
    /// "numeric" or "categorical", as seen in the reference.
    pub kind: String,
    pub statistic: StatisticName,
    /// `None` when the statistic is undefined for this feature (see `reason`).
    pub value: Option<f64>,
    pub p_value: Option<f64>,
    pub severity: Severity,
    pub drifted: bool,
    pub reason: Reason,
}

impl FeatureDrift {
    fn unmeasurable(kind: &str, statistic: StatisticName, reason: Reason) -> Self {
        Self {
            kind: kind.to_string(),
            statistic,
            value: None,
            p_value: None,
            severity: Severity::Significant,
            drifted: true,
            reason,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriftReport {
    pub subject_artifact_fingerprint: Fingerprint,
    pub reference_artifact_fingerprint: Fingerprint,
    pub per_feature: BTreeMap<String, FeatureDrift>,
    pub overall_drifted: bool,
    /// Name of the policy that produced `overall_drifted`.
    pub policy: String,
    pub generated_ms: u64,
    pub reference_samples: u64,
    pub current_samples: u64,
}

/// Dataset-level digest of a report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriftSummary {
    pub dataset_drift: bool,
    pub drift_share: f64,
    pub number_of_columns: usize,
    pub number_of_drifted_columns: usize,
    pub reference_samples: u64,
    pub current_samples: u64,
}

impl DriftReport {
    pub fn drifted_features(&self) -> impl Iterator<Item = &str> {
        self.per_feature
            .iter()
            .filter(|(_, f)| f.drifted)
            .map(|(name, _)| name.as_str())
    }

    pub fn summary(&self) -> DriftSummary {
        let drifted = self.drifted_features().count();
        let columns = self.per_feature.len();
        DriftSummary {
            dataset_drift: self.overall_drifted,
            drift_share: if columns == 0 {
                0.0
            } else {
                drifted as f64 / columns as f64
            },
            number_of_columns: columns,
            number_of_drifted_columns: drifted,
            reference_samples: self.reference_samples,
            current_samples: self.current_samples,
        }
    }
}

#[derive(Clone)]
pub struct DriftDetector {
    config: DriftConfig,
    policy: Arc<dyn DriftPolicy>,
}

impl DriftDetector {
    /// Detector with the configured thresholds and the default
    /// [`ShareOrCritical`] policy.
    pub fn new(config: DriftConfig) -> Result<Self> {
        config.validate()?;
        let policy = Arc::new(ShareOrCritical::from_config(&config.policy));
        Ok(Self { config, policy })
    }

    pub fn with_policy(mut self, policy: Arc<dyn DriftPolicy>) -> Self {
        self.policy = policy;
        self
    }

    pub fn config(&self) -> &DriftConfig {
        &self.config
    }

    /// Compare every feature of `reference` against `current`.
    ///
    /// Features only present in `current` are ignored. A reference feature
    /// without values is degenerate and fails with `DriftComputation`.
    pub fn detect(&self, reference: &DatasetSummary, current: &DatasetSummary) -> Result<DriftReport> {
        self.detect_at(reference, current, now_millis())
    }

    /// As [`detect`](Self::detect), stamping the report with `generated_ms`
    /// instead of the wall clock. Reports stored as artifacts use this so equal
    /// inputs give byte-equal payloads.
    pub fn detect_at(
        &self,
        reference: &DatasetSummary,
        current: &DatasetSummary,
        generated_ms: u64,
    ) -> Result<DriftReport> {
        let mut per_feature = BTreeMap::new();
        for (name, ref_summary) in &reference.features {
            let result = self.compare_feature(name, ref_summary, current.get(name))?;
            per_feature.insert(name.clone(), result);
        }

        let overall_drifted = self.policy.overall_drifted(&per_feature);
        let report = DriftReport {
            subject_artifact_fingerprint: current.source,
            reference_artifact_fingerprint: reference.source,
            per_feature,
            overall_drifted,
            policy: self.policy.name().to_string(),
            generated_ms,
            reference_samples: reference.rows,
            current_samples: current.rows,
        };
        let summary = report.summary();
        tracing::info!(
            reference = %reference.source.short(),
            current = %current.source.short(),
            drifted = summary.number_of_drifted_columns,
            columns = summary.number_of_columns,
            dataset_drift = overall_drifted,
            "drift detection finished"
        );
        Ok(report)
    }

    fn compare_feature(
        &self,
        name: &str,
        reference: &FeatureSummary,
        current: Option<&FeatureSummary>,
    ) -> Result<FeatureDrift> {
        let kind = reference.kind_name();
        let statistic = match reference {
            FeatureSummary::Numeric(_) => match self.config.numeric.statistic {
                NumericStatistic::Psi => StatisticName::Psi,
                NumericStatistic::Ks => StatisticName::Ks,
            },
            FeatureSummary::Categorical(_) => match self.config.categorical.statistic {
                CategoricalStatistic::Tvd => StatisticName::Tvd,
                CategoricalStatistic::Psi => StatisticName::Psi,
            },
        };
        if reference.count() == 0 {
            return Err(Error::DriftComputation(format!(
                "reference feature '{name}' has no values"
            )));
        }
        let Some(current) = current else {
            tracing::warn!(feature = name, "feature missing from current batch");
            return Ok(FeatureDrift::unmeasurable(kind, statistic, Reason::MissingInCurrent));
        };

        let (value, p_value, moderate, significant) = match (reference, current) {
            (FeatureSummary::Numeric(r), FeatureSummary::Numeric(c)) => {
                if c.count == 0 {
                    return Ok(FeatureDrift::unmeasurable(kind, statistic, Reason::EmptyInCurrent));
                }
                let (value, p) = self.numeric_statistic(name, r, c)?;
                (value, p, self.config.numeric.moderate, self.config.numeric.significant)
            }
            (FeatureSummary::Categorical(r), FeatureSummary::Categorical(c)) => {
                if c.count == 0 {
                    return Ok(FeatureDrift::unmeasurable(kind, statistic, Reason::EmptyInCurrent));
                }
                let value = self.categorical_statistic(r, c)?;
                (
                    value,
                    None,
                    self.config.categorical.moderate,
                    self.config.categorical.significant,
                )
            }
            _ => {
                tracing::warn!(
                    feature = name,
                    reference = kind,
                    current = current.kind_name(),
                    "feature type changed"
                );
                return Ok(FeatureDrift::unmeasurable(kind, statistic, Reason::TypeMismatch));
            }
        };

        let severity = if value > significant {
            Severity::Significant
        } else if value > moderate {
            Severity::Moderate
        } else {
            Severity::None
        };
        let drifted = severity == Severity::Significant;
        Ok(FeatureDrift {
            kind: kind.to_string(),
            statistic,
            value: Some(value),
            p_value,
            severity,
            drifted,
            reason: if drifted {
                Reason::ThresholdExceeded
            } else {
                Reason::WithinThreshold
            },
        })
    }

    fn numeric_statistic(
        &self,
        name: &str,
        reference: &NumericSummary,
        current: &NumericSummary,
    ) -> Result<(f64, Option<f64>)> {
        if reference.edges != current.edges {
            return Err(Error::DriftComputation(format!(
                "feature '{name}': current batch was not binned with the reference edges"
            )));
        }
        let (Some(r), Some(c)) = (reference.proportions(), current.proportions()) else {
            return Err(Error::DriftComputation(format!(
                "feature '{name}': empty histogram"
            )));
        };
        match self.config.numeric.statistic {
            NumericStatistic::Psi => Ok((stats::psi(&r, &c)?, None)),
            NumericStatistic::Ks => {
                let (d, p) = stats::ks(&r, &c, reference.count, current.count)?;
                Ok((d, Some(p)))
            }
        }
    }

    fn categorical_statistic(
        &self,
        reference: &CategoricalSummary,
        current: &CategoricalSummary,
    ) -> Result<f64> {
        let r = reference.frequencies();
        let c = current.frequencies();
        match self.config.categorical.statistic {
            CategoricalStatistic::Tvd => Ok(stats::tvd(&r, &c)),
            CategoricalStatistic::Psi => stats::categorical_psi(&r, &c),
        }
    }
}

/// One-shot detection with the default policy.
pub fn detect(
    reference: &DatasetSummary,
    current: &DatasetSummary,
    config: &DriftConfig,
) -> Result<DriftReport> {
    DriftDetector::new(config.clone())?.detect(reference, current)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::summary::{summarize, summarize_against};
    use ckdflow_core::hash::hash_str;
    use ckdflow_core::schema::{FeatureSchema, FeatureSpec};
    use ckdflow_core::types::{Dataset, Row, Value};

    fn numeric_rows(name: &str, values: impl IntoIterator<Item = f64>) -> Dataset {
        Dataset::new(
            values
                .into_iter()
                .map(|x| {
                    let mut r = Row::new();
                    r.insert(name.to_string(), Value::Num(x));
                    r
                })
                .collect(),
        )
    }

    fn categorical_rows(name: &str, counts: &[(&str, usize)]) -> Dataset {
        let mut rows = Vec::new();
        for (cat, n) in counts {
            for _ in 0..*n {
                let mut r = Row::new();
                r.insert(name.to_string(), Value::Cat(cat.to_string()));
                rows.push(r);
            }
        }
        Dataset::new(rows)
    }

    fn uniform(lo: f64, hi: f64, n: usize) -> impl Iterator<Item = f64> {
        (0..n).map(move |i| lo + (hi - lo) * i as f64 / (n - 1) as f64)
    }

    fn compare(
        schema: &FeatureSchema,
        reference: &Dataset,
        current: &Dataset,
        config: &DriftConfig,
    ) -> DriftReport {
        let r = summarize(reference, schema, config.numeric.bins, hash_str("ref")).unwrap();
        let c = summarize_against(current, &r, hash_str("cur")).unwrap();
        detect(&r, &c, config).unwrap()
    }

    #[test]
    fn identical_distributions_do_not_drift() {
        let schema = FeatureSchema::new(vec![
            FeatureSpec::numeric("gfr"),
            FeatureSpec::categorical("dm", ["Yes", "No"]),
        ]);
        let mut ds = numeric_rows("gfr", uniform(60.0, 120.0, 100));
        for (i, row) in ds.rows.iter_mut().enumerate() {
            let v = if i % 10 < 3 { "Yes" } else { "No" };
            row.insert("dm".into(), Value::Cat(v.into()));
        }
        let report = compare(&schema, &ds, &ds, &DriftConfig::default());
        assert!(!report.overall_drifted);
        for f in report.per_feature.values() {
            assert_eq!(f.value, Some(0.0));
            assert_eq!(f.severity, Severity::None);
            assert_eq!(f.reason, Reason::WithinThreshold);
        }
        assert_eq!(report.reference_artifact_fingerprint, hash_str("ref"));
        assert_eq!(report.subject_artifact_fingerprint, hash_str("cur"));
    }

    #[test]
    fn gfr_shift_out_of_range_is_significant() {
        let schema = FeatureSchema::new(vec![FeatureSpec::numeric("GFR")]);
        let reference = numeric_rows("GFR", uniform(60.0, 120.0, 200));
        let current = numeric_rows("GFR", uniform(10.0, 40.0, 50));
        let config = DriftConfig::default();
        let report = compare(&schema, &reference, &current, &config);

        let gfr = &report.per_feature["GFR"];
        assert_eq!(gfr.statistic, StatisticName::Psi);
        assert!(gfr.value.unwrap() > config.numeric.significant);
        assert!(gfr.drifted);
        assert_eq!(gfr.reason, Reason::ThresholdExceeded);
        assert!(report.overall_drifted);
    }

    #[test]
    fn ks_variant_reports_p_value() {
        let schema = FeatureSchema::new(vec![FeatureSpec::numeric("GFR")]);
        let reference = numeric_rows("GFR", uniform(60.0, 120.0, 200));
        let current = numeric_rows("GFR", uniform(10.0, 40.0, 50));
        let mut config = DriftConfig::default();
        config.numeric.statistic = NumericStatistic::Ks;
        let gfr = compare(&schema, &reference, &current, &config).per_feature["GFR"].clone();
        assert_eq!(gfr.statistic, StatisticName::Ks);
        // every current value falls in the first reference decile
        assert!((gfr.value.unwrap() - 0.9).abs() < 1e-9);
        assert!(gfr.p_value.unwrap() < 0.001);
        assert!(gfr.drifted);
    }

    #[test]
    fn diabetes_collapsing_to_one_category_drifts() {
        let schema = FeatureSchema::new(vec![FeatureSpec::categorical("Diabetes", ["Yes", "No"])]);
        let reference = categorical_rows("Diabetes", &[("Yes", 30), ("No", 70)]);
        let current = categorical_rows("Diabetes", &[("Yes", 40)]);
        let report = compare(&schema, &reference, &current, &DriftConfig::default());

        let dm = &report.per_feature["Diabetes"];
        assert_eq!(dm.statistic, StatisticName::Tvd);
        assert!((dm.value.unwrap() - 0.7).abs() < 1e-12);
        assert!(dm.drifted);
        assert!(report.overall_drifted);
    }

    #[test]
    fn novel_category_is_not_an_error() {
        let schema = FeatureSchema::new(vec![FeatureSpec::categorical("htn", Vec::<String>::new())]);
        let reference = categorical_rows("htn", &[("yes", 50), ("no", 50)]);
        let current = categorical_rows("htn", &[("yes", 48), ("no", 50), ("unknown", 2)]);
        let report = compare(&schema, &reference, &current, &DriftConfig::default());
        let htn = &report.per_feature["htn"];
        assert!(htn.value.unwrap() > 0.0);
        assert!(!htn.drifted);
    }

    #[test]
    fn missing_feature_is_flagged_with_its_own_reason() {
        let schema = FeatureSchema::new(vec![
            FeatureSpec::numeric("gfr"),
            FeatureSpec::numeric("age"),
        ]);
        let mut reference = numeric_rows("gfr", uniform(60.0, 120.0, 50));
        for (i, row) in reference.rows.iter_mut().enumerate() {
            row.insert("age".into(), Value::Num(30.0 + i as f64));
        }
        let current = numeric_rows("gfr", uniform(60.0, 120.0, 50));
        let report = compare(&schema, &reference, &current, &DriftConfig::default());

        let age = &report.per_feature["age"];
        assert!(age.drifted);
        assert_eq!(age.reason, Reason::MissingInCurrent);
        assert_eq!(age.value, None);
        assert!(!report.per_feature["gfr"].drifted);
        assert_eq!(report.summary().number_of_drifted_columns, 1);
    }

    #[test]
    fn all_missing_and_mistyped_features_get_reason_codes() {
        let schema = FeatureSchema::new(vec![
            FeatureSpec::numeric("gfr"),
            FeatureSpec::numeric("bp"),
        ]);
        let mut reference = numeric_rows("gfr", uniform(60.0, 120.0, 20));
        for row in reference.rows.iter_mut() {
            row.insert("bp".into(), Value::Num(80.0));
        }
        let mut current = numeric_rows("gfr", [0.0, 0.0]);
        for row in current.rows.iter_mut() {
            row.insert("gfr".into(), Value::Missing);
            row.insert("bp".into(), Value::Cat("high".into()));
        }
        let report = compare(&schema, &reference, &current, &DriftConfig::default());
        assert_eq!(report.per_feature["gfr"].reason, Reason::EmptyInCurrent);
        assert_eq!(report.per_feature["bp"].reason, Reason::TypeMismatch);
        assert!(report.overall_drifted);
    }

    #[test]
    fn pluggable_policy_overrides_verdict() {
        struct Never;
        impl DriftPolicy for Never {
            fn name(&self) -> &str {
                "never"
            }
            fn overall_drifted(&self, _: &BTreeMap<String, FeatureDrift>) -> bool {
                false
            }
        }

        let schema = FeatureSchema::new(vec![FeatureSpec::numeric("GFR")]);
        let reference = numeric_rows("GFR", uniform(60.0, 120.0, 100));
        let current = numeric_rows("GFR", uniform(10.0, 40.0, 100));
        let r = summarize(&reference, &schema, 10, hash_str("r")).unwrap();
        let c = summarize_against(&current, &r, hash_str("c")).unwrap();
        let report = DriftDetector::new(DriftConfig::default())
            .unwrap()
            .with_policy(Arc::new(Never))
            .detect(&r, &c)
            .unwrap();
        assert!(report.per_feature["GFR"].drifted);
        assert!(!report.overall_drifted);
        assert_eq!(report.policy, "never");
    }

    #[test]
    fn summary_mirrors_report() {
        let schema = FeatureSchema::new(vec![FeatureSpec::numeric("GFR")]);
        let reference = numeric_rows("GFR", uniform(60.0, 120.0, 80));
        let current = numeric_rows("GFR", uniform(10.0, 40.0, 20));
        let s = compare(&schema, &reference, &current, &DriftConfig::default()).summary();
        assert!(s.dataset_drift);
        assert_eq!(s.drift_share, 1.0);
        assert_eq!(s.reference_samples, 80);
        assert_eq!(s.current_samples, 20);
    }

    #[test]
    fn fixed_timestamp_gives_identical_reports() {
        let schema = FeatureSchema::new(vec![FeatureSpec::numeric("GFR")]);
        let reference = numeric_rows("GFR", uniform(60.0, 120.0, 40));
        let r = summarize(&reference, &schema, 10, hash_str("r")).unwrap();
        let detector = DriftDetector::new(DriftConfig::default()).unwrap();
        let a = detector.detect_at(&r, &r, 0).unwrap();
        let b = detector.detect_at(&r, &r, 0).unwrap();
        assert_eq!(serde_json::to_vec(&a).unwrap(), serde_json::to_vec(&b).unwrap());
        assert_eq!(a.generated_ms, 0);
    }

    #[test]
    fn labels_match_serialized_names() {
        for reason in [Reason::ThresholdExceeded, Reason::MissingInCurrent, Reason::TypeMismatch] {
            assert_eq!(
                serde_json::to_value(reason).unwrap(),
                serde_json::Value::String(reason.to_string())
            );
        }
        assert_eq!(format!("{:<8}|", Severity::None), "none    |");
        assert_eq!(StatisticName::Ks.as_str(), "ks");
    }
}
