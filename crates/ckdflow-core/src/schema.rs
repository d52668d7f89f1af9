//! Feature schema: declared type per feature and, for categoricals, the
//! allowed value set. Used both at ingestion (cell parsing) and at serving
//! time (row validation).

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::types::{Row, Value};

/// Cell tokens treated as missing after trimming.
pub const MISSING_TOKENS: &[&str] = &["", "?", "NA", "na", "NaN", "nan", "null"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum FeatureKind {
    Numeric,
    Categorical {
        /// Empty means "any value accepted".
        #[serde(default)]
        allowed: BTreeSet<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureSpec {
    pub name: String,
    pub kind: FeatureKind,
    /// Required features must be present at serving time. Training data may
    /// still carry gaps; preprocessing imputes them.
    #[serde(default = "default_required")]
    pub required: bool,
}

fn default_required() -> bool {
    true
}

impl FeatureSpec {
    pub fn numeric(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: FeatureKind::Numeric,
            required: true,
        }
    }

    pub fn categorical<I, S>(name: impl Into<String>, allowed: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            kind: FeatureKind::Categorical {
                allowed: allowed.into_iter().map(Into::into).collect(),
            },
            required: true,
        }
    }

    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self.kind, FeatureKind::Numeric)
    }

    /// Parse one raw text cell according to the declared type, including the
    /// allowed-set check for categoricals.
    pub fn parse_cell(&self, raw: &str) -> Result<Value> {
        let value = self.parse_typed(raw)?;
        self.check_value(&value)?;
        Ok(value)
    }

    /// Parse by type only. Numbers must be finite; any categorical value is
    /// accepted, so batches compared for drift keep categories the reference
    /// never saw.
    pub fn parse_typed(&self, raw: &str) -> Result<Value> {
        let cell = raw.trim();
        if MISSING_TOKENS.contains(&cell) {
            return Ok(Value::Missing);
        }
        match &self.kind {
            FeatureKind::Numeric => match cell.parse::<f64>() {
                Ok(x) if x.is_finite() => Ok(Value::Num(x)),
                Ok(_) => Err(Error::Schema(format!(
                    "feature '{}' expects a finite number, got '{}'",
                    self.name, cell
                ))),
                Err(_) => Err(Error::Schema(format!(
                    "feature '{}' expects a number, got '{}'",
                    self.name, cell
                ))),
            },
            FeatureKind::Categorical { .. } => Ok(Value::Cat(cell.to_string())),
        }
    }

    /// Type and allowed-set check for a single value. `Missing` always passes.
    pub fn check_value(&self, value: &Value) -> Result<()> {
        match (&self.kind, value) {
            (_, Value::Missing) => Ok(()),
            (FeatureKind::Numeric, Value::Num(x)) if x.is_finite() => Ok(()),
            (FeatureKind::Numeric, Value::Num(_)) => Err(Error::Schema(format!(
                "feature '{}' has a non-finite value",
                self.name
            ))),
            (FeatureKind::Categorical { allowed }, Value::Cat(s)) => {
                if allowed.is_empty() || allowed.contains(s) {
                    Ok(())
                } else {
                    Err(Error::Schema(format!(
                        "feature '{}' value '{}' not in allowed set {:?}",
                        self.name, s, allowed
                    )))
                }
            }
            (kind, other) => Err(Error::Schema(format!(
                "feature '{}' expects {}, got {}",
                self.name,
                match kind {
                    FeatureKind::Numeric => "numeric",
                    FeatureKind::Categorical { .. } => "categorical",
                },
                other.type_name()
            ))),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureSchema {
    pub features: Vec<FeatureSpec>,
}

impl FeatureSchema {
    pub fn new(features: Vec<FeatureSpec>) -> Self {
        Self { features }
    }

    pub fn get(&self, name: &str) -> Option<&FeatureSpec> {
        self.features.iter().find(|f| f.name == name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.features.iter().map(|f| f.name.as_str())
    }

    pub fn len(&self) -> usize {
        self.features.len()
    }

    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }

    /// The schema plus `name` as an optional categorical with an open value
    /// set. Drift monitoring uses it to track the label mix.
    pub fn with_label(&self, name: &str) -> FeatureSchema {
        let mut schema = self.clone();
        if schema.get(name).is_none() {
            let spec = FeatureSpec::categorical(name, Vec::<String>::new()).optional();
            schema.features.push(spec);
        }
        schema
    }

    /// Validate a serving-time row: every required feature present and
    /// non-missing, every present feature well-typed. Unknown keys are ignored.
    pub fn validate_row(&self, row: &Row) -> Result<()> {
        for spec in &self.features {
            match row.get(&spec.name) {
                None | Some(Value::Missing) if spec.required => {
                    return Err(Error::Schema(format!(
                        "required feature '{}' is missing",
                        spec.name
                    )));
                }
                None => {}
                Some(v) => spec.check_value(v)?,
            }
        }
        Ok(())
    }
}
