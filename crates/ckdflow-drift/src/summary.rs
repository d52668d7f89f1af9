//! Per-feature distribution summaries.
//!
//! Numeric features are summarized as a histogram over quantile bins of the
//! reference distribution. The cut points are stored with the summary so the
//! current batch is binned with exactly the same edges. Categorical features
//! are summarized as category counts.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use ckdflow_core::error::{Error, Result};
use ckdflow_core::hash::Fingerprint;
use ckdflow_core::schema::FeatureSchema;
use ckdflow_core::types::Dataset;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NumericSummary {
    pub count: u64,
    pub missing: u64,
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub std: f64,
    /// Interior cut points, strictly increasing. Bin `i` covers
    /// `(edges[i-1], edges[i]]`; the first and last bins are open-ended.
    pub edges: Vec<f64>,
    /// One count per bin (`edges.len() + 1`).
    pub counts: Vec<u64>,
}

impl NumericSummary {
    fn build(values: &[f64], missing: u64, edges: Vec<f64>) -> Self {
        let mut counts = vec![0u64; edges.len() + 1];
        for &x in values {
            counts[bin_index(&edges, x)] += 1;
        }
        let n = values.len() as f64;
        let (mut min, mut max, mut sum) = (f64::INFINITY, f64::NEG_INFINITY, 0.0);
        for &x in values {
            min = min.min(x);
            max = max.max(x);
            sum += x;
        }
        let (min, max, mean, std) = if values.is_empty() {
            (0.0, 0.0, 0.0, 0.0)
        } else {
            let mean = sum / n;
            let var = values.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / n;
            (min, max, mean, var.sqrt())
        };
        Self {
            count: values.len() as u64,
            missing,
            min,
            max,
            mean,
            std,
            edges,
            counts,
        }
    }

    /// Bin proportions; `None` when no values were observed.
    pub fn proportions(&self) -> Option<Vec<f64>> {
        proportions(&self.counts)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategoricalSummary {
    pub count: u64,
    pub missing: u64,
    pub counts: BTreeMap<String, u64>,
}

impl CategoricalSummary {
    fn build<'a>(values: impl IntoIterator<Item = &'a str>, missing: u64) -> Self {
        let mut counts = BTreeMap::new();
        let mut count = 0;
        for v in values {
            *counts.entry(v.to_string()).or_insert(0) += 1;
            count += 1;
        }
        Self {
            count,
            missing,
            counts,
        }
    }

    /// Category -> relative frequency. Empty when no values were observed.
    pub fn frequencies(&self) -> BTreeMap<String, f64> {
        if self.count == 0 {
            return BTreeMap::new();
        }
        let total = self.count as f64;
        self.counts
            .iter()
            .map(|(k, &c)| (k.clone(), c as f64 / total))
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum FeatureSummary {
    Numeric(NumericSummary),
    Categorical(CategoricalSummary),
}

impl FeatureSummary {
    pub fn kind_name(&self) -> &'static str {
        match self {
            FeatureSummary::Numeric(_) => "numeric",
            FeatureSummary::Categorical(_) => "categorical",
        }
    }

    /// Number of non-missing values.
    pub fn count(&self) -> u64 {
        match self {
            FeatureSummary::Numeric(s) => s.count,
            FeatureSummary::Categorical(s) => s.count,
        }
    }
}

/// Summary of one dataset. Also the renderable "data summary" record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetSummary {
    /// Fingerprint of the dataset this summary describes.
    pub source: Fingerprint,
    pub rows: u64,
    pub features: BTreeMap<String, FeatureSummary>,
}

impl DatasetSummary {
    pub fn get(&self, feature: &str) -> Option<&FeatureSummary> {
        self.features.get(feature)
    }
}

/// Summarize `dataset` as a reference: numeric features get fresh quantile
/// edges (`bins` bins, fewer if values repeat). Features declared in the schema
/// but absent from every row are left out.
pub fn summarize(
    dataset: &Dataset,
    schema: &FeatureSchema,
    bins: usize,
    source: Fingerprint,
) -> Result<DatasetSummary> {
    if dataset.is_empty() {
        return Err(Error::DriftComputation(
            "cannot summarize an empty dataset".into(),
        ));
    }
    let mut features = BTreeMap::new();
    for spec in &schema.features {
        if !dataset.has_feature(&spec.name) {
            continue;
        }
        let summary = summarize_feature(dataset, &spec.name, spec.is_numeric(), |values| {
            let mut sorted = values.to_vec();
            sorted.sort_by(f64::total_cmp);
            quantile_edges(&sorted, bins)
        });
        features.insert(spec.name.clone(), summary);
    }
    Ok(DatasetSummary {
        source,
        rows: dataset.num_rows() as u64,
        features,
    })
}

/// Summarize `dataset` for comparison with `reference`, reusing the
/// reference's bin edges for every numeric feature.
pub fn summarize_against(
    dataset: &Dataset,
    reference: &DatasetSummary,
    source: Fingerprint,
) -> Result<DatasetSummary> {
    if dataset.is_empty() {
        return Err(Error::DriftComputation(
            "cannot summarize an empty dataset".into(),
        ));
    }
    let mut features = BTreeMap::new();
    for (name, ref_summary) in &reference.features {
        if !dataset.has_feature(name) {
            continue;
        }
        let summary = match ref_summary {
            FeatureSummary::Numeric(r) => {
                summarize_feature(dataset, name, true, |_| r.edges.clone())
            }
            FeatureSummary::Categorical(_) => {
                summarize_feature(dataset, name, false, |_| Vec::new())
            }
        };
        features.insert(name.clone(), summary);
    }
    Ok(DatasetSummary {
        source,
        rows: dataset.num_rows() as u64,
        features,
    })
}

// A column whose observed values are all of the other type is summarized as
// what it actually holds, so the detector can report the mismatch.
fn summarize_feature(
    dataset: &Dataset,
    name: &str,
    expect_numeric: bool,
    edges: impl FnOnce(&[f64]) -> Vec<f64>,
) -> FeatureSummary {
    let missing = dataset.missing_count(name) as u64;
    let nums = dataset.numeric_column(name);
    let cats = dataset.categorical_column(name);
    let numeric = if expect_numeric {
        !(nums.is_empty() && !cats.is_empty())
    } else {
        !nums.is_empty() && cats.is_empty()
    };
    if numeric {
        let edges = if expect_numeric { edges(&nums) } else { Vec::new() };
        FeatureSummary::Numeric(NumericSummary::build(&nums, missing, edges))
    } else {
        FeatureSummary::Categorical(CategoricalSummary::build(cats, missing))
    }
}

/// Cut points at the `i / bins` quantiles (linear interpolation), with
/// duplicates removed. `sorted` must be ascending.
pub fn quantile_edges(sorted: &[f64], bins: usize) -> Vec<f64> {
    let mut edges: Vec<f64> = Vec::with_capacity(bins.saturating_sub(1));
    if sorted.is_empty() {
        return edges;
    }
    let last = (sorted.len() - 1) as f64;
    for i in 1..bins {
        let pos = last * i as f64 / bins as f64;
        let lo = pos.floor() as usize;
        let hi = pos.ceil() as usize;
        let frac = pos - lo as f64;
        let q = sorted[lo] + (sorted[hi] - sorted[lo]) * frac;
        if edges.last().map_or(true, |&prev| q > prev) {
            edges.push(q);
        }
    }
    edges
}

pub(crate) fn bin_index(edges: &[f64], x: f64) -> usize {
    edges.partition_point(|&e| e < x)
}

pub(crate) fn proportions(counts: &[u64]) -> Option<Vec<f64>> {
    let total: u64 = counts.iter().sum();
    if total == 0 {
        return None;
    }
    Some(counts.iter().map(|&c| c as f64 / total as f64).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ckdflow_core::hash::hash_str;
    use ckdflow_core::schema::FeatureSpec;
    use ckdflow_core::types::{Row, Value};

    fn dataset(gfr: &[f64], dm: &[&str]) -> Dataset {
        let n = gfr.len().max(dm.len());
        let rows = (0..n)
            .map(|i| {
                let mut r = Row::new();
                if let Some(x) = gfr.get(i) {
                    r.insert("gfr".into(), Value::Num(*x));
                }
                if let Some(c) = dm.get(i) {
                    r.insert("dm".into(), Value::Cat(c.to_string()));
                }
                r
            })
            .collect();
        Dataset::new(rows)
    }

    fn schema() -> FeatureSchema {
        FeatureSchema::new(vec![
            FeatureSpec::numeric("gfr"),
            FeatureSpec::categorical("dm", ["yes", "no"]),
        ])
    }

    #[test]
    fn quantile_edges_split_evenly() {
        let sorted: Vec<f64> = (0..=100).map(f64::from).collect();
        assert_eq!(quantile_edges(&sorted, 4), vec![25.0, 50.0, 75.0]);
        // constant column collapses to a single edge
        assert_eq!(quantile_edges(&[3.0; 10], 5), vec![3.0]);
        assert!(quantile_edges(&[], 5).is_empty());
    }

    #[test]
    fn out_of_range_values_land_in_edge_bins() {
        let edges = vec![10.0, 20.0];
        assert_eq!(bin_index(&edges, -5.0), 0);
        assert_eq!(bin_index(&edges, 10.0), 0);
        assert_eq!(bin_index(&edges, 15.0), 1);
        assert_eq!(bin_index(&edges, 1e9), 2);
    }

    #[test]
    fn reference_summary_has_stats_and_frequencies() {
        let gfr: Vec<f64> = (1..=10).map(f64::from).collect();
        let ds = dataset(&gfr, &["yes", "no", "no", "no", "yes", "no", "no", "yes", "no", "no"]);
        let s = summarize(&ds, &schema(), 5, hash_str("ref")).unwrap();
        assert_eq!(s.rows, 10);

        let FeatureSummary::Numeric(n) = s.get("gfr").unwrap() else {
            panic!("gfr should be numeric");
        };
        assert_eq!(n.count, 10);
        assert_eq!(n.min, 1.0);
        assert_eq!(n.max, 10.0);
        assert!((n.mean - 5.5).abs() < 1e-12);
        assert_eq!(n.counts.iter().sum::<u64>(), 10);
        assert_eq!(n.counts.len(), n.edges.len() + 1);

        let FeatureSummary::Categorical(c) = s.get("dm").unwrap() else {
            panic!("dm should be categorical");
        };
        let f = c.frequencies();
        assert!((f["yes"] - 0.3).abs() < 1e-12);
        assert!((f["no"] - 0.7).abs() < 1e-12);
    }

    #[test]
    fn current_summary_reuses_reference_edges() {
        let gfr: Vec<f64> = (60..=120).map(f64::from).collect();
        let reference = summarize(&dataset(&gfr, &[]), &schema(), 10, hash_str("ref")).unwrap();
        let current =
            summarize_against(&dataset(&[10.0, 20.0, 200.0], &[]), &reference, hash_str("cur"))
                .unwrap();
        let (FeatureSummary::Numeric(r), FeatureSummary::Numeric(c)) =
            (&reference.features["gfr"], &current.features["gfr"])
        else {
            panic!("expected numeric summaries");
        };
        assert_eq!(r.edges, c.edges);
        assert_eq!(c.counts[0], 2);
        assert_eq!(*c.counts.last().unwrap(), 1);
    }

    #[test]
    fn empty_dataset_is_a_drift_computation_error() {
        assert!(matches!(
            summarize(&Dataset::default(), &schema(), 10, hash_str("x")),
            Err(Error::DriftComputation(_))
        ));
    }

    #[test]
    fn mistyped_column_is_summarized_as_observed() {
        let reference = summarize(&dataset(&[1.0, 2.0], &[]), &schema(), 2, hash_str("r")).unwrap();
        let mut rows = Vec::new();
        let mut r = Row::new();
        r.insert("gfr".into(), Value::Cat("high".into()));
        rows.push(r);
        let current = summarize_against(&Dataset::new(rows), &reference, hash_str("c")).unwrap();
        assert_eq!(current.features["gfr"].kind_name(), "categorical");
    }
}
