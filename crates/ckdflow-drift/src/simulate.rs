//! Synthetic "current" batches derived from a reference dataset.

use ckdflow_core::hash::{hash_bytes, Fingerprint};
use ckdflow_core::types::{Dataset, Value};

/// Default share of reference rows kept in a simulated batch.
pub const DEFAULT_FRACTION: f64 = 0.3;
/// Default multiplicative shift applied to numeric features.
pub const DEFAULT_SCALE: f64 = 1.05;

/// Deterministically sample `fraction` of the rows (at least one, if any) and
/// multiply every numeric value by `scale`. Row order is preserved.
pub fn simulate_shift(dataset: &Dataset, fraction: f64, scale: f64, seed: u64) -> Dataset {
    let n = dataset.num_rows();
    if n == 0 {
        return Dataset::default();
    }
    let keep = ((n as f64 * fraction.clamp(0.0, 1.0)).round() as usize).clamp(1, n);

    let mut ranked: Vec<(Fingerprint, usize)> = (0..n)
        .map(|i| {
            let mut key = [0u8; 16];
            key[..8].copy_from_slice(&seed.to_le_bytes());
            key[8..].copy_from_slice(&(i as u64).to_le_bytes());
            (hash_bytes(&key), i)
        })
        .collect();
    ranked.sort();
    let mut chosen: Vec<usize> = ranked.into_iter().take(keep).map(|(_, i)| i).collect();
    chosen.sort_unstable();

    let rows = chosen
        .into_iter()
        .map(|i| {
            dataset.rows[i]
                .iter()
                .map(|(k, v)| {
                    let v = match v {
                        Value::Num(x) => Value::Num(x * scale),
                        other => other.clone(),
                    };
                    (k.clone(), v)
                })
                .collect()
        })
        .collect();
    Dataset::new(rows)
}
