//! Training-time preprocessing.
//!
//! - rows without a target are dropped
//! - numeric gaps are filled with the training median, categorical gaps with
//!   the training mode
//! - numeric features are standardized with the training mean/std
//! - categoricals are one-hot encoded
//! - rows are split into train/holdout by a seeded hash ranking, so the split
//!   is stable across runs and machines
//!
//! The fitted [`FeatureEncoder`] travels with the processed dataset and with
//! the model artifact, so serving applies exactly the training transforms.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use ckdflow_core::config::FeaturesConfig;
use ckdflow_core::error::{Error, Result};
use ckdflow_core::hash::{hash_bytes, Fingerprint};
use ckdflow_core::schema::{FeatureKind, FeatureSchema};
use ckdflow_core::types::{Dataset, Row, Value};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NumericEncoding {
    pub name: String,
    /// Training median; replaces missing values.
    pub fill: f64,
    pub mean: f64,
    pub std: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategoricalEncoding {
    pub name: String,
    /// Training mode; replaces missing values.
    pub fill: String,
    /// One output column per category, in this order.
    pub categories: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureEncoder {
    schema: FeatureSchema,
    numeric: Vec<NumericEncoding>,
    categorical: Vec<CategoricalEncoding>,
}

impl FeatureEncoder {
    pub fn fit(train: &Dataset, schema: &FeatureSchema) -> Result<Self> {
        let mut numeric = Vec::new();
        let mut categorical = Vec::new();
        for spec in &schema.features {
            match &spec.kind {
                FeatureKind::Numeric => {
                    let mut values = train.numeric_column(&spec.name);
                    if values.is_empty() {
                        return Err(no_values(&spec.name));
                    }
                    values.sort_by(f64::total_cmp);
                    let fill = median(&values);
                    let missing = train.num_rows() - values.len();
                    values.extend(std::iter::repeat(fill).take(missing));
                    let (mean, std) = mean_std(&values);
                    numeric.push(NumericEncoding {
                        name: spec.name.clone(),
                        fill,
                        mean,
                        std: if std > 0.0 { std } else { 1.0 },
                    });
                }
                FeatureKind::Categorical { allowed } => {
                    let observed = train.categorical_column(&spec.name);
                    let fill = mode(&observed).ok_or_else(|| no_values(&spec.name))?;
                    let categories: BTreeSet<String> = if allowed.is_empty() {
                        observed.iter().map(|s| s.to_string()).collect()
                    } else {
                        allowed.clone()
                    };
                    categorical.push(CategoricalEncoding {
                        name: spec.name.clone(),
                        fill,
                        categories: categories.into_iter().collect(),
                    });
                }
            }
        }
        Ok(Self {
            schema: schema.clone(),
            numeric,
            categorical,
        })
    }

    pub fn schema(&self) -> &FeatureSchema {
        &self.schema
    }

    pub fn numeric(&self) -> &[NumericEncoding] {
        &self.numeric
    }

    pub fn categorical(&self) -> &[CategoricalEncoding] {
        &self.categorical
    }

    /// Length of an encoded vector.
    pub fn width(&self) -> usize {
        self.numeric.len() + self.categorical.iter().map(|c| c.categories.len()).sum::<usize>()
    }

    /// Names of the encoded columns: numeric names, then `feature=category`.
    pub fn column_names(&self) -> Vec<String> {
        let mut out: Vec<String> = self.numeric.iter().map(|n| n.name.clone()).collect();
        for c in &self.categorical {
            out.extend(c.categories.iter().map(|cat| format!("{}={}", c.name, cat)));
        }
        out
    }

    /// Fill missing schema features with the training fills.
    pub fn impute(&self, row: &Row) -> Row {
        let mut out = row.clone();
        for n in &self.numeric {
            if row.get(&n.name).and_then(Value::as_f64).is_none() {
                out.insert(n.name.clone(), Value::Num(n.fill));
            }
        }
        for c in &self.categorical {
            if row.get(&c.name).and_then(Value::as_str).is_none() {
                out.insert(c.name.clone(), Value::Cat(c.fill.clone()));
            }
        }
        out
    }

    /// Impute, standardize and one-hot encode one row. Categories never seen
    /// in training encode as all zeros.
    pub fn encode(&self, row: &Row) -> Vec<f64> {
        let mut x = Vec::with_capacity(self.width());
        for n in &self.numeric {
            let v = row.get(&n.name).and_then(Value::as_f64).unwrap_or(n.fill);
            x.push((v - n.mean) / n.std);
        }
        for c in &self.categorical {
            let v = row
                .get(&c.name)
                .and_then(Value::as_str)
                .unwrap_or(c.fill.as_str());
            x.extend(c.categories.iter().map(|cat| if cat == v { 1.0 } else { 0.0 }));
        }
        x
    }
}

fn no_values(feature: &str) -> Error {
    Error::Schema(format!("feature '{feature}' has no values in the training split"))
}

fn median(sorted: &[f64]) -> f64 {
    let n = sorted.len();
    if n % 2 == 1 {
        sorted[n / 2]
    } else {
        (sorted[n / 2 - 1] + sorted[n / 2]) / 2.0
    }
}

fn mean_std(values: &[f64]) -> (f64, f64) {
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    (mean, var.sqrt())
}

/// Most frequent value; ties go to the lexicographically smallest.
fn mode(values: &[&str]) -> Option<String> {
    let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
    for &v in values {
        *counts.entry(v).or_default() += 1;
    }
    let mut best: Option<(&str, usize)> = None;
    for (v, n) in counts {
        if best.map_or(true, |(_, b)| n > b) {
            best = Some((v, n));
        }
    }
    best.map(|(v, _)| v.to_string())
}

/// Deterministic train/holdout split of `n` rows. Rows are ranked by a hash of
/// `(seed, index)`; the lowest `round(n * test_size)` form the holdout. When
/// both parts can be non-empty they are.
pub fn split_indices(n: usize, test_size: f64, seed: u64) -> (Vec<usize>, Vec<usize>) {
    let mut n_test = (n as f64 * test_size.clamp(0.0, 1.0)).round() as usize;
    if n >= 2 && test_size > 0.0 {
        n_test = n_test.clamp(1, n - 1);
    }

    let mut ranked: Vec<(Fingerprint, usize)> = (0..n)
        .map(|i| {
            let mut key = Vec::with_capacity(21);
            key.extend_from_slice(b"split");
            key.extend_from_slice(&seed.to_le_bytes());
            key.extend_from_slice(&(i as u64).to_le_bytes());
            (hash_bytes(&key), i)
        })
        .collect();
    ranked.sort();

    let mut holdout: Vec<usize> = ranked.iter().take(n_test).map(|(_, i)| *i).collect();
    let mut train: Vec<usize> = ranked.iter().skip(n_test).map(|(_, i)| *i).collect();
    holdout.sort_unstable();
    train.sort_unstable();
    (train, holdout)
}

/// Encoded features with 0/1 labels (1 = positive class).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LabeledMatrix {
    pub x: Vec<Vec<f64>>,
    pub y: Vec<u8>,
}

impl LabeledMatrix {
    pub fn len(&self) -> usize {
        self.y.len()
    }

    pub fn is_empty(&self) -> bool {
        self.y.is_empty()
    }

    pub fn positives(&self) -> usize {
        self.y.iter().filter(|&&y| y == 1).count()
    }
}

/// The processed dataset artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessedData {
    pub encoder: FeatureEncoder,
    pub target: String,
    pub positive: String,
    pub negative: String,
    pub train: LabeledMatrix,
    pub holdout: LabeledMatrix,
    /// Rows dropped because their target was missing.
    pub dropped_rows: usize,
}

#[derive(Debug, Clone)]
pub struct Preprocessed {
    pub data: ProcessedData,
    /// Raw (unencoded) training rows, for the reference distribution summary.
    pub train_rows: Dataset,
}

pub fn preprocess(
    raw: &Dataset,
    features: &FeaturesConfig,
    test_size: f64,
    seed: u64,
) -> Result<Preprocessed> {
    if !(0.0..1.0).contains(&test_size) {
        return Err(Error::Stage(format!("test_size must be within [0, 1), got {test_size}")));
    }
    let schema = features.schema();
    for spec in &schema.features {
        if !raw.has_feature(&spec.name) {
            return Err(Error::Schema(format!(
                "training data has no column '{}'",
                spec.name
            )));
        }
    }

    let target = features.target.as_str();
    let mut labelled: Vec<(&Row, String)> = Vec::with_capacity(raw.num_rows());
    for row in &raw.rows {
        if let Some(label) = row.get(target).and_then(Value::as_str) {
            labelled.push((row, label.to_string()));
        }
    }
    let dropped_rows = raw.num_rows() - labelled.len();
    if labelled.is_empty() {
        return Err(Error::Schema(format!("no rows carry the target '{target}'")));
    }

    let negatives: Vec<&str> = labelled
        .iter()
        .map(|(_, l)| l.as_str())
        .filter(|l| *l != features.positive)
        .collect();
    let negative = mode(&negatives).ok_or_else(|| {
        Error::Schema(format!(
            "target '{target}' has only the positive class '{}'",
            features.positive
        ))
    })?;
    if negatives.len() == labelled.len() {
        return Err(Error::Schema(format!(
            "target '{target}' never takes the positive class '{}'",
            features.positive
        )));
    }

    let (train_idx, holdout_idx) = split_indices(labelled.len(), test_size, seed);
    let train_rows = Dataset::new(train_idx.iter().map(|&i| labelled[i].0.clone()).collect());
    let encoder = FeatureEncoder::fit(&train_rows, &schema)?;

    let matrix = |idx: &[usize]| LabeledMatrix {
        x: idx.iter().map(|&i| encoder.encode(labelled[i].0)).collect(),
        y: idx
            .iter()
            .map(|&i| u8::from(labelled[i].1 == features.positive))
            .collect(),
    };
    let train = matrix(&train_idx);
    let holdout = matrix(&holdout_idx);
    tracing::info!(
        train = train.len(),
        holdout = holdout.len(),
        dropped = dropped_rows,
        width = encoder.width(),
        "preprocessing complete"
    );

    Ok(Preprocessed {
        data: ProcessedData {
            encoder,
            target: target.to_string(),
            positive: features.positive.clone(),
            negative,
            train,
            holdout,
            dropped_rows,
        },
        train_rows,
    })
}
