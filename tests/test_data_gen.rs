//! Synthetic CKD-like data and scratch directories for integration tests.

#![allow(dead_code)]

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use ckdflow_core::config::PipelineConfig;

pub const NUMERIC: [&str; 7] = ["age", "bp", "bgr", "bu", "sc", "hemo", "gfr"];

/// Fresh directory under the system temp dir, unique per test name and process.
pub fn create_temp_dir(name: &str) -> PathBuf {
    let dir = std::env::temp_dir()
        .join("ckdflow-tests")
        .join(format!("{name}-{}", std::process::id()));
    let _ = fs::remove_dir_all(&dir);
    fs::create_dir_all(&dir).expect("Failed to create temp dir");
    dir
}

struct Lcg(u64);

impl Lcg {
    fn next_f64(&mut self) -> f64 {
        self.0 = self
            .0
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        (self.0 >> 11) as f64 / (1u64 << 53) as f64
    }

    fn between(&mut self, lo: f64, hi: f64) -> f64 {
        lo + (hi - lo) * self.next_f64()
    }
}

/// Options for [`write_ckd_csv`].
#[derive(Debug, Clone, Copy)]
pub struct Batch {
    pub rows: usize,
    pub seed: u64,
    /// Multiplier applied to every numeric value.
    pub scale: f64,
    /// Every `n`th row gets `?` for `bp` (0 disables).
    pub missing_every: usize,
    /// Append rows with an empty target.
    pub unlabelled: usize,
    /// Rows out of every five drawn from the sick population.
    pub sick_of_five: usize,
}

impl Default for Batch {
    fn default() -> Self {
        Self {
            rows: 200,
            seed: 7,
            scale: 1.0,
            missing_every: 17,
            unlabelled: 2,
            sick_of_five: 3,
        }
    }
}

/// Write a two-population CKD table: sick rows have low gfr/hemo and high
/// sc/bu, healthy rows the opposite.
pub fn write_ckd_csv(path: &Path, batch: Batch) {
    let mut rng = Lcg(batch.seed.wrapping_add(0x9e37_79b9_7f4a_7c15));
    let mut file = fs::File::create(path).expect("Failed to create csv");
    writeln!(file, "id,age,bp,bgr,bu,sc,hemo,gfr,htn,dm,classification")
        .expect("Failed to write header");

    for i in 0..batch.rows + batch.unlabelled {
        let sick = i % 5 < batch.sick_of_five;
        let (age, bp, bgr, bu, sc, hemo, gfr) = if sick {
            (
                rng.between(45.0, 80.0),
                rng.between(80.0, 100.0),
                rng.between(120.0, 250.0),
                rng.between(50.0, 120.0),
                rng.between(2.0, 6.0),
                rng.between(7.0, 11.0),
                rng.between(10.0, 55.0),
            )
        } else {
            (
                rng.between(20.0, 60.0),
                rng.between(60.0, 80.0),
                rng.between(80.0, 130.0),
                rng.between(15.0, 40.0),
                rng.between(0.5, 1.2),
                rng.between(13.0, 17.0),
                rng.between(80.0, 120.0),
            )
        };
        let s = batch.scale;
        let bp = if batch.missing_every > 0 && i % batch.missing_every == 0 {
            "?".to_string()
        } else {
            format!("{:.1}", bp * s)
        };
        let htn = if sick == (rng.next_f64() < 0.8) { "yes" } else { "no" };
        let dm = if sick == (rng.next_f64() < 0.7) { "yes" } else { "no" };
        let label = if i >= batch.rows {
            ""
        } else if sick {
            "ckd"
        } else {
            "notckd"
        };
        writeln!(
            file,
            "{i},{:.1},{bp},{:.1},{:.1},{:.2},{:.1},{:.1},{htn},{dm},{label}",
            age * s,
            bgr * s,
            bu * s,
            sc * s,
            hemo * s,
            gfr * s,
        )
        .expect("Failed to write row");
    }
}

/// A five-stage pipeline over `raw` and `current`, storing under `root`.
pub fn pipeline_yaml(raw: &Path, current: &Path, root: &Path) -> String {
    format!(
        r#"
features:
  numeric: [age, bp, bgr, bu, sc, hemo, gfr]
  categorical:
    htn: [yes, no]
    dm: [yes, no]
  target: classification
  positive: ckd
stages:
  preprocess:
    params: {{ raw_path: "{raw}", test_size: 0.2, seed: 42 }}
  train:
    depends_on: [preprocess]
    params: {{ learning_rate: 0.5, epochs: 200 }}
  evaluate:
    depends_on: [train]
    params: {{ promote_min_f1: 0.5 }}
  evaluate_baseline:
    kind: baseline
    depends_on: [preprocess]
  monitor:
    depends_on: [preprocess]
    params: {{ current_path: "{current}" }}
drift:
  numeric: {{ statistic: psi, bins: 10, moderate: 0.1, significant: 0.2 }}
  categorical: {{ statistic: tvd, moderate: 0.05, significant: 0.1 }}
  policy: {{ drift_share: 0.3 }}
registry: {{ root: "{root}", model_name: ckd-classifier }}
execution: {{ max_parallel: 3 }}
"#,
        raw = raw.display(),
        current = current.display(),
        root = root.display(),
    )
}

pub struct Fixture {
    pub dir: PathBuf,
    pub raw: PathBuf,
    pub current: PathBuf,
    pub root: PathBuf,
}

impl Fixture {
    /// Raw training data plus a current batch drawn from the same populations.
    pub fn new(name: &str) -> Self {
        let dir = create_temp_dir(name);
        let raw = dir.join("kidney.csv");
        let current = dir.join("current.csv");
        write_ckd_csv(&raw, Batch::default());
        write_ckd_csv(
            &current,
            Batch {
                rows: 200,
                seed: 7,
                unlabelled: 0,
                ..Batch::default()
            },
        );
        let root = dir.join("store");
        Self {
            dir,
            raw,
            current,
            root,
        }
    }

    pub fn config(&self) -> PipelineConfig {
        PipelineConfig::from_yaml_str(&pipeline_yaml(&self.raw, &self.current, &self.root))
            .expect("fixture config parses")
    }
}
