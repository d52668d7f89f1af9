//! Holdout metrics for binary classifiers.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use ckdflow_core::hash::Fingerprint;

use crate::estimator::ModelParams;
use crate::preprocess::LabeledMatrix;

/// Decision threshold on the positive-class probability.
pub const THRESHOLD: f64 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Metrics {
    pub accuracy: f64,
    pub precision: f64,
    pub recall: f64,
    pub f1: f64,
    /// 0.5 when the holdout holds a single class.
    pub roc_auc: f64,
}

impl Metrics {
    pub fn compute(scores: &[f64], labels: &[u8]) -> Self {
        let (mut tp, mut fp, mut tn, mut fn_) = (0usize, 0usize, 0usize, 0usize);
        for (&s, &y) in scores.iter().zip(labels) {
            match (s >= THRESHOLD, y == 1) {
                (true, true) => tp += 1,
                (true, false) => fp += 1,
                (false, false) => tn += 1,
                (false, true) => fn_ += 1,
            }
        }
        let ratio = |num: usize, den: usize| if den == 0 { 0.0 } else { num as f64 / den as f64 };
        let precision = ratio(tp, tp + fp);
        let recall = ratio(tp, tp + fn_);
        let f1 = if precision + recall > 0.0 {
            2.0 * precision * recall / (precision + recall)
        } else {
            0.0
        };
        Self {
            accuracy: ratio(tp + tn, labels.len()),
            precision,
            recall,
            f1,
            roc_auc: roc_auc(scores, labels),
        }
    }

    pub fn to_map(&self) -> BTreeMap<String, f64> {
        BTreeMap::from([
            ("accuracy".to_string(), self.accuracy),
            ("precision".to_string(), self.precision),
            ("recall".to_string(), self.recall),
            ("f1".to_string(), self.f1),
            ("roc_auc".to_string(), self.roc_auc),
        ])
    }
}

/// Rank-based AUC (Mann-Whitney U) with average ranks for ties.
fn roc_auc(scores: &[f64], labels: &[u8]) -> f64 {
    let positives = labels.iter().filter(|&&y| y == 1).count();
    let negatives = labels.len() - positives;
    if positives == 0 || negatives == 0 {
        return 0.5;
    }
    let mut order: Vec<usize> = (0..scores.len()).collect();
    order.sort_by(|&a, &b| scores[a].total_cmp(&scores[b]));

    let mut rank_sum = 0.0;
    let mut i = 0;
    while i < order.len() {
        let mut j = i;
        while j + 1 < order.len() && scores[order[j + 1]] == scores[order[i]] {
            j += 1;
        }
        // 1-based ranks i+1..=j+1 share their average
        let avg = (i + j + 2) as f64 / 2.0;
        for &k in &order[i..=j] {
            if labels[k] == 1 {
                rank_sum += avg;
            }
        }
        i = j + 1;
    }
    let p = positives as f64;
    (rank_sum - p * (p + 1.0) / 2.0) / (p * negatives as f64)
}

/// The evaluation report artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationReport {
    /// "model" for a trained model, or the baseline's name.
    pub subject: String,
    pub model_fingerprint: Option<Fingerprint>,
    pub dataset_fingerprint: Fingerprint,
    pub metrics: Metrics,
    pub holdout_rows: usize,
    pub holdout_positives: usize,
    /// Registry version the model was registered as, if any.
    pub model_version: Option<u32>,
}

pub fn score_matrix(params: &ModelParams, data: &LabeledMatrix) -> Metrics {
    let scores: Vec<f64> = data.x.iter().map(|x| params.score(x)).collect();
    Metrics::compute(&scores, &data.y)
}
