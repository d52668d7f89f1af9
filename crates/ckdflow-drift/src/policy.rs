//! Dataset-level drift verdicts.

use std::collections::{BTreeMap, BTreeSet};

use ckdflow_core::config::DriftPolicyConfig;

use crate::detector::FeatureDrift;

/// Decides `overall_drifted` from the per-feature results.
pub trait DriftPolicy: Send + Sync {
    fn name(&self) -> &str;

    fn overall_drifted(&self, per_feature: &BTreeMap<String, FeatureDrift>) -> bool;
}

/// Drifted when the share of drifted features exceeds `drift_share`, or when
/// any critical feature drifts.
#[derive(Debug, Clone)]
pub struct ShareOrCritical {
    pub drift_share: f64,
    pub critical: BTreeSet<String>,
}

impl ShareOrCritical {
    pub fn new(drift_share: f64, critical: impl IntoIterator<Item = String>) -> Self {
        Self {
            drift_share,
            critical: critical.into_iter().collect(),
        }
    }

    pub fn from_config(cfg: &DriftPolicyConfig) -> Self {
        Self::new(cfg.drift_share, cfg.critical.iter().cloned())
    }
}

impl Default for ShareOrCritical {
    fn default() -> Self {
        Self::from_config(&DriftPolicyConfig::default())
    }
}

impl DriftPolicy for ShareOrCritical {
    fn name(&self) -> &str {
        "share_or_critical"
    }

    fn overall_drifted(&self, per_feature: &BTreeMap<String, FeatureDrift>) -> bool {
        if per_feature.is_empty() {
            return false;
        }
        let drifted: Vec<&String> = per_feature
            .iter()
            .filter(|(_, f)| f.drifted)
            .map(|(name, _)| name)
            .collect();
        if let Some(name) = drifted.iter().find(|n| self.critical.contains(n.as_str())) {
            tracing::debug!(feature = %name, "critical feature drifted");
            return true;
        }
        drifted.len() as f64 / per_feature.len() as f64 > self.drift_share
    }
}
