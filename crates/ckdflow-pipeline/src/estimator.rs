//! Pluggable estimators.
//!
//! An [`Estimator`] turns an encoded training matrix into [`ModelParams`], a
//! small closed set of serializable scoring functions. Any linear classifier
//! fits `Linear`; constant predictors fit `Constant`.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use ckdflow_core::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "form")]
pub enum ModelParams {
    /// `sigmoid(w · x + b)`
    Linear { weights: Vec<f64>, bias: f64 },
    /// The same probability for every input.
    Constant { probability: f64 },
}

impl ModelParams {
    /// Probability of the positive class.
    pub fn score(&self, x: &[f64]) -> f64 {
        match self {
            ModelParams::Linear { weights, bias } => {
                let z: f64 = weights.iter().zip(x).map(|(w, v)| w * v).sum::<f64>() + bias;
                sigmoid(z)
            }
            ModelParams::Constant { probability } => *probability,
        }
    }

    pub fn input_width(&self) -> Option<usize> {
        match self {
            ModelParams::Linear { weights, .. } => Some(weights.len()),
            ModelParams::Constant { .. } => None,
        }
    }
}

/// A fitted model plus whatever the estimator wants on the run record.
#[derive(Debug, Clone)]
pub struct Fitted {
    pub params: ModelParams,
    pub metrics: BTreeMap<String, f64>,
}

pub trait Estimator: Send + Sync {
    /// Stable algorithm name, recorded on the model artifact.
    fn name(&self) -> &str;

    /// Hyperparameters, recorded on the run record.
    fn hyperparameters(&self) -> BTreeMap<String, f64> {
        BTreeMap::new()
    }

    fn fit(&self, x: &[Vec<f64>], y: &[u8]) -> Result<Fitted>;
}

fn sigmoid(z: f64) -> f64 {
    if z >= 0.0 {
        1.0 / (1.0 + (-z).exp())
    } else {
        let e = z.exp();
        e / (1.0 + e)
    }
}

fn check_shape(x: &[Vec<f64>], y: &[u8]) -> Result<usize> {
    if x.is_empty() {
        return Err(Error::Stage("cannot fit on an empty training set".into()));
    }
    if x.len() != y.len() {
        return Err(Error::Invariant(format!(
            "{} feature rows but {} labels",
            x.len(),
            y.len()
        )));
    }
    let width = x[0].len();
    if x.iter().any(|row| row.len() != width) {
        return Err(Error::Invariant("ragged feature matrix".into()));
    }
    Ok(width)
}

/// L2-regularized logistic regression, full-batch gradient descent.
#[derive(Debug, Clone, PartialEq)]
pub struct LogisticRegression {
    pub learning_rate: f64,
    pub epochs: usize,
    pub l2: f64,
}

impl Default for LogisticRegression {
    fn default() -> Self {
        Self {
            learning_rate: 0.1,
            epochs: 300,
            l2: 0.01,
        }
    }
}

impl LogisticRegression {
    pub const NAME: &'static str = "logistic_regression";
}

impl Estimator for LogisticRegression {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn hyperparameters(&self) -> BTreeMap<String, f64> {
        BTreeMap::from([
            ("learning_rate".to_string(), self.learning_rate),
            ("epochs".to_string(), self.epochs as f64),
            ("l2".to_string(), self.l2),
        ])
    }

    fn fit(&self, x: &[Vec<f64>], y: &[u8]) -> Result<Fitted> {
        let width = check_shape(x, y)?;
        if !(self.learning_rate > 0.0 && self.learning_rate.is_finite()) {
            return Err(Error::Stage(format!(
                "learning_rate must be positive, got {}",
                self.learning_rate
            )));
        }
        let n = x.len() as f64;
        let mut weights = vec![0.0; width];
        let mut bias = 0.0;
        let mut grad = vec![0.0; width];

        for _ in 0..self.epochs {
            grad.iter_mut().for_each(|g| *g = 0.0);
            let mut grad_b = 0.0;
            for (row, &label) in x.iter().zip(y) {
                let z: f64 = weights.iter().zip(row).map(|(w, v)| w * v).sum::<f64>() + bias;
                let err = sigmoid(z) - f64::from(label);
                for (g, v) in grad.iter_mut().zip(row) {
                    *g += err * v;
                }
                grad_b += err;
            }
            for (w, g) in weights.iter_mut().zip(&grad) {
                *w -= self.learning_rate * (g / n + self.l2 * *w);
            }
            bias -= self.learning_rate * grad_b / n;
        }

        let params = ModelParams::Linear { weights, bias };
        let mut log_loss = 0.0;
        let mut correct = 0usize;
        for (row, &label) in x.iter().zip(y) {
            let p = params.score(row).clamp(1e-12, 1.0 - 1e-12);
            log_loss -= if label == 1 { p.ln() } else { (1.0 - p).ln() };
            if u8::from(p >= 0.5) == label {
                correct += 1;
            }
        }
        if !log_loss.is_finite() {
            return Err(Error::Stage("training diverged".into()));
        }
        tracing::debug!(epochs = self.epochs, log_loss = log_loss / n, "logistic regression fitted");
        Ok(Fitted {
            params,
            metrics: BTreeMap::from([
                ("train_log_loss".to_string(), log_loss / n),
                ("train_accuracy".to_string(), correct as f64 / n),
            ]),
        })
    }
}

/// Always predicts the training majority class.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct MajorityClass;

impl MajorityClass {
    pub const NAME: &'static str = "majority_class";
}

impl Estimator for MajorityClass {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn fit(&self, x: &[Vec<f64>], y: &[u8]) -> Result<Fitted> {
        check_shape(x, y)?;
        let positives = y.iter().filter(|&&l| l == 1).count();
        let probability = if positives * 2 >= y.len() { 1.0 } else { 0.0 };
        Ok(Fitted {
            params: ModelParams::Constant { probability },
            metrics: BTreeMap::from([(
                "train_positive_rate".to_string(),
                positives as f64 / y.len() as f64,
            )]),
        })
    }
}
