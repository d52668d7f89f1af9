//! Divergence statistics over aligned histograms and frequency maps.

use std::collections::{BTreeMap, BTreeSet};

use ckdflow_core::error::{Error, Result};

/// Proportions below this are clamped before taking logs in PSI.
pub const PSI_EPSILON: f64 = 1e-4;

/// Population Stability Index over aligned bin proportions.
///
/// `sum((cur - ref) * ln(cur / ref))`, with both sides clamped to
/// [`PSI_EPSILON`] so empty bins stay finite. Zero iff the histograms match.
pub fn psi(reference: &[f64], current: &[f64]) -> Result<f64> {
    check_aligned(reference, current)?;
    Ok(reference
        .iter()
        .zip(current)
        .map(|(&r, &c)| {
            let r = r.max(PSI_EPSILON);
            let c = c.max(PSI_EPSILON);
            (c - r) * (c / r).ln()
        })
        .sum())
}

/// Two-sample Kolmogorov-Smirnov statistic over shared bins, with the
/// asymptotic p-value. `n_ref`/`n_cur` are the sample sizes behind the
/// proportions.
pub fn ks(reference: &[f64], current: &[f64], n_ref: u64, n_cur: u64) -> Result<(f64, f64)> {
    check_aligned(reference, current)?;
    if n_ref == 0 || n_cur == 0 {
        return Err(Error::DriftComputation(
            "KS statistic needs non-empty samples".into(),
        ));
    }
    let (mut cdf_r, mut cdf_c, mut d) = (0.0f64, 0.0f64, 0.0f64);
    for (&r, &c) in reference.iter().zip(current) {
        cdf_r += r;
        cdf_c += c;
        d = d.max((cdf_r - cdf_c).abs());
    }
    let n_eff = (n_ref as f64 * n_cur as f64) / (n_ref + n_cur) as f64;
    let sqrt_n = n_eff.sqrt();
    let p = kolmogorov_q((sqrt_n + 0.12 + 0.11 / sqrt_n) * d);
    Ok((d, p))
}

/// Survival function of the Kolmogorov distribution,
/// `Q(l) = 2 * sum_{j>=1} (-1)^(j-1) exp(-2 j^2 l^2)`.
pub fn kolmogorov_q(lambda: f64) -> f64 {
    if lambda < 1e-3 {
        return 1.0;
    }
    let a = -2.0 * lambda * lambda;
    let mut sum = 0.0;
    let mut sign = 1.0;
    for j in 1..=100 {
        let j = j as f64;
        let term = sign * (a * j * j).exp();
        sum += term;
        if term.abs() < 1e-12 {
            break;
        }
        sign = -sign;
    }
    (2.0 * sum).clamp(0.0, 1.0)
}

/// Total variation distance between two frequency maps. Categories missing
/// from either side count as zero frequency there.
pub fn tvd(reference: &BTreeMap<String, f64>, current: &BTreeMap<String, f64>) -> f64 {
    let keys: BTreeSet<&String> = reference.keys().chain(current.keys()).collect();
    0.5 * keys
        .into_iter()
        .map(|k| {
            let r = reference.get(k).copied().unwrap_or(0.0);
            let c = current.get(k).copied().unwrap_or(0.0);
            (r - c).abs()
        })
        .sum::<f64>()
}

/// PSI over frequency maps aligned on the union of categories.
pub fn categorical_psi(
    reference: &BTreeMap<String, f64>,
    current: &BTreeMap<String, f64>,
) -> Result<f64> {
    let keys: BTreeSet<&String> = reference.keys().chain(current.keys()).collect();
    let (r, c): (Vec<f64>, Vec<f64>) = keys
        .into_iter()
        .map(|k| {
            (
                reference.get(k).copied().unwrap_or(0.0),
                current.get(k).copied().unwrap_or(0.0),
            )
        })
        .unzip();
    psi(&r, &c)
}

fn check_aligned(reference: &[f64], current: &[f64]) -> Result<()> {
    if reference.is_empty() {
        return Err(Error::DriftComputation("no bins to compare".into()));
    }
    if reference.len() != current.len() {
        return Err(Error::DriftComputation(format!(
            "histograms are not aligned ({} vs {} bins)",
            reference.len(),
            current.len()
        )));
    }
    Ok(())
}
