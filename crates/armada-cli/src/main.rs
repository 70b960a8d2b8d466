//! `Armada` CLI
//!
//! Plans batches of dependent work items into parallel waves and simulates
//! their execution through the warm worker pool and context cache.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing::info;

use armada_cli::plan_cmd::{self, PlanArgs};
use armada_cli::run_cmd::{self, RunArgs};
use armada_core::config::{load_config, load_config_file};

/// Exit status for a plan that left items unscheduled.
const EXIT_INCOMPLETE: u8 = 2;

#[derive(Parser, Debug)]
#[command(name = "armada")]
#[command(version, about = "Wave planner and worker pool simulator", long_about = None)]
struct Cli {
    /// Settings file to use instead of the global and project settings.
    #[arg(long, global = true, env = "ARMADA_CONFIG")]
    config: Option<PathBuf>,

    /// Log level filter (e.g. "info", "debug", "warn").
    #[arg(long, global = true, env = "ARMADA_LOG_LEVEL")]
    log_level: Option<String>,

    /// Output logs as JSON (for structured log aggregation).
    #[arg(long, global = true, env = "ARMADA_LOG_JSON")]
    log_json: bool,

    /// OpenTelemetry OTLP endpoint for traces and metrics export
    /// (e.g. `http://localhost:4317`). Requires the `metrics` feature.
    #[cfg(feature = "metrics")]
    #[arg(long, global = true, env = "ARMADA_METRICS_ENDPOINT")]
    metrics_endpoint: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the wave plan for a batch of work items.
    Plan(PlanArgs),
    /// Simulate execution of a batch through the worker pool.
    Run(RunArgs),
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => load_config_file(path)?,
        None => load_config(std::env::current_dir().ok().as_deref())?,
    };
    if let Some(level) = &cli.log_level {
        config.log_level.clone_from(level);
    }

    #[cfg(feature = "metrics")]
    let metrics_endpoint = cli.metrics_endpoint.as_deref();
    #[cfg(not(feature = "metrics"))]
    let metrics_endpoint: Option<&str> = None;

    let log_filter = format!(
        "armada={level},armada_cli={level},armada_orchestration={level},armada_core={level}",
        level = config.log_level
    );
    let telemetry = armada_core::tracing_init::init_tracing_with_metrics(
        &log_filter,
        cli.log_json,
        metrics_endpoint,
    );

    info!(
        version = env!("CARGO_PKG_VERSION"),
        telemetry = telemetry.has_metrics(),
        "Starting armada"
    );

    let complete = match &cli.command {
        Command::Plan(args) => plan_cmd::run(args, &config)?,
        Command::Run(args) => run_cmd::run(args, &config).await?,
    };

    telemetry.shutdown();

    Ok(if complete {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(EXIT_INCOMPLETE)
    })
}
