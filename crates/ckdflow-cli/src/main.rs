//! ckdflow CLI: run the pipeline, inspect registries, report drift, predict.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing_subscriber::prelude::*;

use ckdflow_core::config::PipelineConfig;
use ckdflow_core::hash::{hash_file, hash_serde};
use ckdflow_core::record::{RunState, RunStatus};
use ckdflow_core::types::Row;
use ckdflow_drift::simulate::{DEFAULT_FRACTION, DEFAULT_SCALE};
use ckdflow_drift::{simulate_shift, summarize, DriftDetector, DriftReport, MonitoringRun};
use ckdflow_exec::RunOptions;
use ckdflow_pipeline::{build_graph, read_batch_path, Pipeline, Predictor};
use ckdflow_store::{RunFilter, Stores};

type CliResult<T = ()> = Result<T, Box<dyn std::error::Error>>;

#[derive(Parser)]
#[command(name = "ckdflow")]
#[command(about = "Cacheable, versioned CKD risk pipeline with drift monitoring", long_about = None)]
struct Cli {
    /// Path to the pipeline YAML file. Relative data paths inside it resolve
    /// against the working directory.
    #[arg(short, long, global = true, default_value = "ckdflow.yaml")]
    config: PathBuf,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute the pipeline, reusing cached stage outputs
    Run {
        /// Re-execute this stage even if its output is cached (repeatable)
        #[arg(long)]
        force: Vec<String>,

        /// Only run this stage and its ancestors (repeatable)
        #[arg(long)]
        target: Vec<String>,

        /// Maximum concurrently running stages (overrides config)
        #[arg(long)]
        max_parallel: Option<usize>,

        /// Default per-stage timeout in seconds (overrides config)
        #[arg(long)]
        timeout_secs: Option<u64>,
    },

    /// Check the configuration and build the stage graph
    Validate,

    /// Show stage order, fingerprints, and cache state
    Explain,

    /// Compare a current batch against a reference dataset
    Drift {
        /// Reference CSV
        #[arg(long)]
        reference: PathBuf,

        /// Current CSV
        #[arg(long, required_unless_present = "simulate", conflicts_with = "simulate")]
        current: Option<PathBuf>,

        /// Use a shifted sample of the reference as the current batch
        #[arg(long)]
        simulate: bool,

        /// Seed for --simulate
        #[arg(long, default_value_t = 42)]
        seed: u64,

        /// Write the full report as JSON
        #[arg(long)]
        out: Option<PathBuf>,
    },

    /// Print the distribution summary of a CSV dataset
    Summarize {
        /// Dataset CSV
        #[arg(long)]
        data: PathBuf,

        /// Write the summary as JSON instead of printing it
        #[arg(long)]
        out: Option<PathBuf>,
    },

    /// Query the run log
    Runs {
        #[arg(long)]
        stage: Option<String>,

        /// pending | success | failed
        #[arg(long)]
        status: Option<String>,

        /// Only runs started at or after this time (ms since epoch)
        #[arg(long)]
        since_ms: Option<u64>,
    },

    /// Inspect or promote registered model versions
    Models {
        /// Model name (defaults to registry.model_name)
        #[arg(long)]
        model: Option<String>,

        #[command(subcommand)]
        action: ModelsAction,
    },

    /// Score one feature row with the active model
    Predict {
        /// JSON object of feature name -> value
        #[arg(long)]
        features: String,
    },
}

#[derive(Subcommand)]
enum ModelsAction {
    /// List all versions
    List,
    /// Make a version the active one
    Promote { version: u32 },
    /// Show the active version
    Active,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.json);

    let result = match cli.command {
        Commands::Run {
            force,
            target,
            max_parallel,
            timeout_secs,
        } => run_pipeline(&cli.config, force, target, max_parallel, timeout_secs).await,
        Commands::Validate => validate_pipeline(&cli.config),
        Commands::Explain => explain_pipeline(&cli.config),
        Commands::Drift {
            reference,
            current,
            simulate: _,
            seed,
            out,
        } => drift_report(&cli.config, &reference, current.as_deref(), seed, out.as_deref()),
        Commands::Summarize { data, out } => summarize_dataset(&cli.config, &data, out.as_deref()),
        Commands::Runs {
            stage,
            status,
            since_ms,
        } => list_runs(&cli.config, stage, status, since_ms),
        Commands::Models { model, action } => manage_models(&cli.config, model, action),
        Commands::Predict { features } => predict(&cli.config, &features),
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info".into());
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

/// CLI flags take precedence over the config file and the environment.
fn run_options(
    pipeline: &Pipeline,
    force: Vec<String>,
    targets: Vec<String>,
    max_parallel: Option<usize>,
    timeout_secs: Option<u64>,
) -> RunOptions {
    let mut options = pipeline.run_options().force(force).targets(targets);
    if let Some(n) = max_parallel {
        options = options.max_parallel(n);
    }
    if let Some(secs) = timeout_secs {
        options = options.stage_timeout(Duration::from_secs(secs));
    }
    options
}

async fn run_pipeline(
    config_path: &Path,
    force: Vec<String>,
    targets: Vec<String>,
    max_parallel: Option<usize>,
    timeout_secs: Option<u64>,
) -> CliResult {
    let pipeline = Pipeline::open(PipelineConfig::load(config_path)?)?;
    let options = run_options(&pipeline, force, targets, max_parallel, timeout_secs);

    let cancel = options.cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received; waiting for running stages to finish");
            cancel.cancel();
        }
    });

    let report = pipeline.run(options).await?;

    println!("Execution {}", report.execution_id);
    for stage in pipeline.graph().order() {
        let Some(status) = report.status(stage) else {
            continue;
        };
        let fingerprint = report
            .fingerprints
            .get(stage)
            .map(|fp| fp.short())
            .unwrap_or_default();
        let duration = report
            .durations_ms
            .get(stage)
            .map(|ms| format!("{ms}ms"))
            .unwrap_or_default();
        println!(
            "  {:<24} {:<28} {:<12} {}",
            stage,
            status.to_string(),
            fingerprint,
            duration
        );
    }

    if !report.is_success() {
        return Err(format!(
            "failed stages: {} (fix and re-run with --force <stage>)",
            report.failed_stages().join(", ")
        )
        .into());
    }
    println!("✓ Pipeline executed successfully");
    Ok(())
}

fn validate_pipeline(config_path: &Path) -> CliResult {
    let config = PipelineConfig::load(config_path)?;
    let graph = build_graph(&config)?;
    println!("✓ Pipeline is valid ({} stages)", graph.len());
    Ok(())
}

fn explain_pipeline(config_path: &Path) -> CliResult {
    let pipeline = Pipeline::open(PipelineConfig::load(config_path)?)?;
    let entries = pipeline.explain()?;

    println!("Pipeline Execution Plan");
    println!("=======================");
    println!();
    println!("Registry root: {}", pipeline.config().registry.root);
    println!("Max parallel:  {}", pipeline.config().execution.max_parallel);
    println!();
    println!("Stage Order:");
    for (i, entry) in entries.iter().enumerate() {
        let deps = if entry.dependencies.is_empty() {
            "-".to_string()
        } else {
            entry.dependencies.join(", ")
        };
        println!(
            "  {}. {} [{}] {} (depends on: {})",
            i + 1,
            entry.stage,
            entry.fingerprint.short(),
            if entry.cached { "cached" } else { "will run" },
            deps
        );
    }
    Ok(())
}

fn drift_report(
    config_path: &Path,
    reference: &Path,
    current: Option<&Path>,
    seed: u64,
    out: Option<&Path>,
) -> CliResult {
    let config = PipelineConfig::load(config_path)?;
    let labelled = config.features.drift_schema();

    let reference_data = read_batch_path(reference, &labelled, &[])?;
    let reference_fp = hash_file(reference)?;
    let (current_data, current_fp) = match current {
        Some(path) => (read_batch_path(path, &labelled, &[])?, hash_file(path)?),
        None => {
            let simulated =
                simulate_shift(&reference_data, DEFAULT_FRACTION, DEFAULT_SCALE, seed);
            let fp = hash_serde(&simulated)?;
            tracing::info!(rows = simulated.num_rows(), seed, "simulated current batch");
            (simulated, fp)
        }
    };

    let schema = if current_data.categorical_column(&config.features.target).is_empty() {
        config.features.schema()
    } else {
        labelled
    };
    let detector = DriftDetector::new(config.drift.clone())?;
    let run = MonitoringRun::execute_datasets(
        &detector,
        &schema,
        &reference_data,
        reference_fp,
        &current_data,
        current_fp,
    );
    for t in run.transitions() {
        tracing::debug!(from = %t.from, to = %t.to, "monitoring transition");
    }
    let report = run.into_report()?;
    print_drift(&report);

    if let Some(path) = out {
        fs::write(path, serde_json::to_vec_pretty(&report)?)?;
        println!("Report written to {}", path.display());
    }
    Ok(())
}

fn print_drift(report: &DriftReport) {
    let summary = report.summary();
    println!("Drift Report");
    println!("============");
    println!(
        "Dataset drift: {} (policy {})",
        if summary.dataset_drift { "YES" } else { "no" },
        report.policy
    );
    println!(
        "Drifted columns: {}/{} (share {:.2})",
        summary.number_of_drifted_columns, summary.number_of_columns, summary.drift_share
    );
    println!(
        "Samples: reference {}, current {}",
        summary.reference_samples, summary.current_samples
    );
    println!();
    for (feature, drift) in &report.per_feature {
        let value = drift
            .value
            .map(|v| format!("{v:.4}"))
            .unwrap_or_else(|| "n/a".to_string());
        println!(
            "  {:<16} {:<4} {:>8} {:<12} {}{}",
            feature,
            drift.statistic,
            value,
            drift.severity,
            drift.reason,
            if drift.drifted { "  *" } else { "" }
        );
    }
}

fn summarize_dataset(config_path: &Path, data: &Path, out: Option<&Path>) -> CliResult {
    let config = PipelineConfig::load(config_path)?;
    let schema = config.features.drift_schema();
    let dataset = read_batch_path(data, &schema, &[])?;
    let summary = summarize(&dataset, &schema, config.drift.numeric.bins, hash_file(data)?)?;
    let json = serde_json::to_string_pretty(&summary)?;
    match out {
        Some(path) => {
            fs::write(path, json)?;
            println!("Summary written to {}", path.display());
        }
        None => println!("{json}"),
    }
    Ok(())
}

fn open_stores(config: &PipelineConfig) -> CliResult<Stores> {
    Ok(Stores::open(&config.registry.root)?)
}

fn list_runs(
    config_path: &Path,
    stage: Option<String>,
    status: Option<String>,
    since_ms: Option<u64>,
) -> CliResult {
    let config = PipelineConfig::load(config_path)?;
    let stores = open_stores(&config)?;
    let filter = RunFilter {
        stage,
        status: status.map(|s| s.parse::<RunState>()).transpose()?,
        since_ms,
    };
    let mut shown = 0usize;
    for record in stores.runs.query(filter)? {
        let duration = record
            .duration_ms()
            .map(|ms| format!("{ms}ms"))
            .unwrap_or_default();
        let status = match &record.status {
            RunStatus::Pending => "pending".to_string(),
            RunStatus::Success => "success".to_string(),
            RunStatus::Failed { reason, message } => format!("failed({reason}): {message}"),
        };
        println!(
            "{}  {:<24} {} {:>8}  {}",
            record.run_id,
            record.stage_name,
            record.fingerprint.short(),
            duration,
            status
        );
        shown += 1;
    }
    println!("{shown} run(s)");
    Ok(())
}

fn manage_models(config_path: &Path, model: Option<String>, action: ModelsAction) -> CliResult {
    let config = PipelineConfig::load(config_path)?;
    let stores = open_stores(&config)?;
    let name = model.unwrap_or_else(|| config.registry.model_name.clone());

    match action {
        ModelsAction::List => {
            let versions = stores.models.versions(&name)?;
            if versions.is_empty() {
                println!("No versions registered for '{name}'");
            }
            for v in versions {
                let f1 = v
                    .metrics
                    .get("f1")
                    .map(|f| format!("{f:.3}"))
                    .unwrap_or_else(|| "-".to_string());
                println!(
                    "{}{} v{:<4} artifact {} f1 {}",
                    if v.is_active { "*" } else { " " },
                    name,
                    v.version_number,
                    v.artifact_fingerprint.short(),
                    f1
                );
            }
        }
        ModelsAction::Promote { version } => {
            let v = stores.models.promote(&name, version)?;
            println!("✓ {} v{} is now active", v.model_name, v.version_number);
        }
        ModelsAction::Active => {
            let v = stores.models.get_active(&name)?;
            println!("{}", serde_json::to_string_pretty(&v)?);
        }
    }
    Ok(())
}

fn parse_features(json: &str) -> CliResult<Row> {
    serde_json::from_str(json).map_err(|e| format!("--features must be a JSON object: {e}").into())
}

fn predict(config_path: &Path, features: &str) -> CliResult {
    let config = PipelineConfig::load(config_path)?;
    let stores = open_stores(&config)?;
    let row = parse_features(features)?;
    let prediction = Predictor::new(&stores, &config.registry.model_name).predict(&row)?;
    println!("{}", serde_json::to_string_pretty(&prediction)?);
    Ok(())
}
