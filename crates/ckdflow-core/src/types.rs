//! Tabular data as the pipeline sees it: a sequence of rows, each a mapping
//! from feature name to a numeric or categorical value.
//!
//! This is deliberately row-oriented and small. Column helpers exist for the
//! statistics code, which wants one feature at a time.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Missing,
    Num(f64),
    Cat(String),
}

impl Value {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Num(x) => Some(*x),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Cat(s) => Some(s),
            _ => None,
        }
    }

    pub fn is_missing(&self) -> bool {
        matches!(self, Value::Missing)
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Missing => "missing",
            Value::Num(_) => "numeric",
            Value::Cat(_) => "categorical",
        }
    }
}

impl From<f64> for Value {
    fn from(x: f64) -> Self {
        Value::Num(x)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Cat(s.to_string())
    }
}

pub type Row = BTreeMap<String, Value>;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Dataset {
    pub rows: Vec<Row>,
}

impl Dataset {
    pub fn new(rows: Vec<Row>) -> Self {
        Self { rows }
    }

    pub fn num_rows(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Union of keys across all rows, sorted.
    pub fn feature_names(&self) -> BTreeSet<String> {
        self.rows
            .iter()
            .flat_map(|r| r.keys().cloned())
            .collect()
    }

    /// True if at least one row carries the feature (even as `Missing`).
    pub fn has_feature(&self, name: &str) -> bool {
        self.rows.iter().any(|r| r.contains_key(name))
    }

    /// Non-missing numeric values of a feature. Non-numeric cells are skipped.
    pub fn numeric_column(&self, name: &str) -> Vec<f64> {
        self.rows
            .iter()
            .filter_map(|r| r.get(name).and_then(Value::as_f64))
            .filter(|x| x.is_finite())
            .collect()
    }

    /// Non-missing categorical values of a feature.
    pub fn categorical_column(&self, name: &str) -> Vec<&str> {
        self.rows
            .iter()
            .filter_map(|r| r.get(name).and_then(Value::as_str))
            .collect()
    }

    /// Count of rows where the feature is absent or `Missing`.
    pub fn missing_count(&self, name: &str) -> usize {
        self.rows
            .iter()
            .filter(|r| r.get(name).map(Value::is_missing).unwrap_or(true))
            .count()
    }
}
