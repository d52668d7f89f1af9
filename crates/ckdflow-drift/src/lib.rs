#![forbid(unsafe_code)]
//! ckdflow-drift: reference-vs-current distribution comparison.
//!
//! - `summary`: per-feature distribution summaries (quantile histograms,
//!   category frequencies), computed once per dataset and cached
//! - `stats`: PSI, binned Kolmogorov-Smirnov, total variation distance
//! - `policy`: pluggable dataset-level verdicts
//! - `detector`: the pure `detect(reference, current) -> DriftReport`
//! - `monitor`: one monitoring run as an explicit state machine
//! - `simulate`: shifted batches for demos and tests

pub mod detector;
pub mod monitor;
pub mod policy;
pub mod simulate;
pub mod stats;
pub mod summary;

pub use detector::{
    detect, DriftDetector, DriftReport, DriftSummary, FeatureDrift, Reason, Severity,
    StatisticName,
};
pub use monitor::{MonitorState, MonitoringRun, Transition};
pub use policy::{DriftPolicy, ShareOrCritical};
pub use simulate::simulate_shift;
pub use summary::{
    summarize, summarize_against, CategoricalSummary, DatasetSummary, FeatureSummary,
    NumericSummary,
};
