//! CLI entry point for the vehicle inference engine.
//!
//! Provides subcommands for replaying a recorded trace of raw vehicle
//! reports against a schedule bundle and for inspecting a bundle.

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::collections::HashMap;
use std::ffi::OsStr;
use std::path::Path;
use std::sync::Arc;
use tracing::Instrument;
use tracing::{error, info, warn};
use tracing_subscriber::{
    EnvFilter, Layer,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};
use vehicle_inference::{
    config::InferenceConfig,
    error::Error,
    inference::instance::{BestEstimate, VehicleInferenceInstance},
    observation::{Observation, RawReport},
    output::append_record,
    schedule::ScheduleIndex,
    service::derive_seed,
};

#[derive(Parser)]
#[command(name = "vehicle_inference")]
#[command(about = "Infer transit vehicle schedule positions from raw location reports", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Replay a CSV trace of raw reports through the inference engine
    Replay {
        /// Path to the schedule bundle (JSON)
        #[arg(short, long)]
        schedule: String,

        /// CSV trace of raw vehicle reports, in timestamp order
        #[arg(short, long)]
        trace: String,

        /// CSV file to append inferred estimates to
        #[arg(short, long, default_value = "estimates.csv")]
        output: String,

        /// Optional JSON file of inference parameter overrides
        #[arg(short, long)]
        config: Option<String>,

        /// Override the configured RNG base seed
        #[arg(long)]
        seed: Option<u64>,
    },
    /// Load a schedule bundle and report what it contains
    Inspect {
        /// Path to the schedule bundle (JSON)
        #[arg(short, long)]
        schedule: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok(); // Load .env file

    // Logging setup: colored stderr + JSON rolling log file
    let log_file_path = std::env::var("LOG_FILE_PATH")
        .unwrap_or_else(|_| "logs/vehicle_inference.log".to_string());
    let log_dir = Path::new(&log_file_path)
        .parent()
        .unwrap_or(Path::new("logs"));
    let log_file_name = Path::new(&log_file_path)
        .file_name()
        .unwrap_or(OsStr::new("vehicle_inference.log"));

    let file_appender = tracing_appender::rolling::daily(log_dir, log_file_name);
    let (non_blocking_file, _file_guard) = tracing_appender::non_blocking(file_appender);

    let stderr_layer = fmt::layer()
        .with_target(true)
        .with_span_events(FmtSpan::CLOSE)
        .with_ansi(true)
        .with_writer(std::io::stderr)
        .with_filter(EnvFilter::from_env("RUST_LOG").add_directive("info".parse()?));

    let json_layer = fmt::layer()
        .json()
        .with_current_span(true)
        .with_span_list(true)
        .with_writer(non_blocking_file)
        .with_filter(EnvFilter::from_env("RUST_LOG_JSON").add_directive("debug".parse()?));

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(json_layer)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Replay {
            schedule,
            trace,
            output,
            config,
            seed,
        } => {
            let mut cfg = load_config(config.as_deref())?;
            if let Some(seed) = seed {
                cfg.seed = seed;
            }
            replay(&schedule, &trace, &output, cfg).await?;
        }
        Commands::Inspect { schedule } => {
            let index = ScheduleIndex::load(&schedule)?;
            info!(
                path = %schedule,
                block_count = index.block_count(),
                "Schedule bundle loaded"
            );
        }
    }

    Ok(())
}

/// Reads inference parameters from a JSON file, or the defaults when no
/// file is given. Absent fields fall back to their defaults.
fn load_config(path: Option<&str>) -> Result<InferenceConfig> {
    match path {
        Some(path) => {
            let bytes = std::fs::read(path)?;
            Ok(serde_json::from_slice(&bytes)?)
        }
        None => Ok(InferenceConfig::default()),
    }
}

/// Per-vehicle counters accumulated during a replay.
#[derive(Debug, Default)]
struct ReplayTally {
    accepted: usize,
    invalid: usize,
    stale: usize,
    estimates: Vec<BestEstimate>,
}

/// Replays a recorded trace through the engine, one task per vehicle.
///
/// All reports for a vehicle are processed by the same task in trace
/// order, so results are deterministic for a given seed regardless of
/// how the tasks interleave.
#[tracing::instrument(skip(cfg), fields(schedule_path, trace_path, output_path))]
async fn replay(
    schedule_path: &str,
    trace_path: &str,
    output_path: &str,
    cfg: InferenceConfig,
) -> Result<()> {
    let index = Arc::new(ScheduleIndex::load(schedule_path)?);
    let cfg = Arc::new(cfg);

    info!(
        block_count = index.block_count(),
        particle_count = cfg.particle_count,
        seed = cfg.seed,
        "Schedule bundle loaded, starting replay"
    );

    // Group the trace by vehicle, preserving per-vehicle report order
    let mut reader = csv::Reader::from_path(trace_path)?;
    let mut by_vehicle: HashMap<String, Vec<RawReport>> = HashMap::new();
    let mut total_reports = 0usize;
    for record in reader.deserialize() {
        let report: RawReport = record?;
        total_reports += 1;
        by_vehicle
            .entry(report.vehicle_id.clone())
            .or_default()
            .push(report);
    }

    info!(
        vehicle_count = by_vehicle.len(),
        total_reports, "Trace loaded"
    );

    let mut tasks = vec![];
    for (vehicle_id, reports) in by_vehicle {
        let index = Arc::clone(&index);
        let cfg = Arc::clone(&cfg);

        let vehicle_span = tracing::info_span!("replay_vehicle", vehicle_id = %vehicle_id);

        let task = tokio::spawn(
            async move {
                let seed = derive_seed(cfg.seed, &vehicle_id);
                let mut instance = VehicleInferenceInstance::new(
                    vehicle_id.clone(),
                    Arc::clone(&index),
                    cfg,
                    seed,
                );

                let mut tally = ReplayTally::default();
                for report in &reports {
                    let obs = match Observation::from_report(report, &index) {
                        Ok(obs) => Arc::new(obs),
                        Err(e) => {
                            warn!(error = %e, "Skipping invalid report");
                            tally.invalid += 1;
                            continue;
                        }
                    };

                    match instance.ingest(obs) {
                        Ok(()) => {
                            tally.accepted += 1;
                            if let Some(estimate) = instance.best_estimate() {
                                tally.estimates.push(estimate);
                            }
                        }
                        Err(Error::StaleObservation { .. }) => {
                            tally.stale += 1;
                        }
                        Err(e) => {
                            error!(error = %e, "Report ingest failed");
                            tally.invalid += 1;
                        }
                    }
                }

                info!(
                    accepted = tally.accepted,
                    invalid = tally.invalid,
                    stale = tally.stale,
                    "Vehicle replay complete"
                );
                tally
            }
            .instrument(vehicle_span),
        );

        tasks.push(task);
    }

    let mut accepted = 0usize;
    let mut invalid = 0usize;
    let mut stale = 0usize;
    let mut estimates: Vec<BestEstimate> = vec![];
    for task in tasks {
        let tally = task.await?;
        accepted += tally.accepted;
        invalid += tally.invalid;
        stale += tally.stale;
        estimates.extend(tally.estimates);
    }

    // One writer; stable row order across runs
    estimates.sort_by(|a, b| {
        a.last_update
            .cmp(&b.last_update)
            .then_with(|| a.vehicle_id.cmp(&b.vehicle_id))
    });
    for estimate in &estimates {
        append_record(output_path, estimate)?;
    }

    info!(
        accepted,
        invalid,
        stale,
        estimates = estimates.len(),
        output = output_path,
        "Replay finished"
    );
    Ok(())
}
