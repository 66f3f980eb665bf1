//! Devfleet - Main Entry Point
//! `devfleet run <batch.json>` drives a batch; `devfleet worker` is what it spawns

mod builtin;
mod config;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info, warn};

use devfleet_core::application::{AggregatorConfig, EngineConfig, FanOutEngine, LogAggregator, PackageCatalog};
use devfleet_core::domain::{CallError, CallResult, CallSpec, LogLevel};
use devfleet_core::port::SystemTimeProvider;
use devfleet_infra_logging::{init_logging, FileDestination, StreamDestination};
use devfleet_infra_system::{ProcessPoolConfig, ProcessPoolFactory, WorkerInit};

use builtin::BuiltinPackage;
use config::DaemonConfig;

#[derive(Parser)]
#[command(name = "devfleet")]
#[command(about = "Run fleet functions across isolated worker processes", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the worker protocol on stdin/stdout (started by the controller)
    Worker,

    /// Execute a JSON array of call specs and print ordered results
    Run {
        /// Path to the batch file
        batch: PathBuf,

        /// Fail the whole run if any call fails
        #[arg(long)]
        fail_fast: bool,
    },
}

/// Every extension package this binary can install
fn catalog() -> PackageCatalog {
    PackageCatalog::new().with(BuiltinPackage)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Worker => devfleet_infra_system::serve(&catalog())
            .await
            .context("Worker failed"),
        Commands::Run { batch, fail_fast } => run_batch(&batch, !fail_fast).await,
    }
}

async fn run_batch(batch: &Path, isolate_errors: bool) -> Result<()> {
    // 1. Load configuration and the batch
    let config = DaemonConfig::from_env()?;
    let text = std::fs::read_to_string(batch)
        .with_context(|| format!("Failed to read batch file {}", batch.display()))?;
    let specs: Vec<CallSpec> = serde_json::from_str(&text)
        .with_context(|| format!("Invalid batch file {}", batch.display()))?;

    // Unknown packages fail here rather than in every worker
    catalog().build_registry(&config.packages)?;

    // 2. Logging: aggregator first, then destinations, then the tracing bridge
    let aggregator = LogAggregator::start(AggregatorConfig::default())?;
    aggregator.add_destination(
        "console",
        Arc::new(StreamDestination::stderr(config.log_format, config.console_level)),
    )?;
    if let Some(path) = &config.log_file {
        match FileDestination::open(path, true, LogLevel::Debug) {
            Ok(file) => aggregator.add_destination("file", Arc::new(file))?,
            Err(e) => eprintln!("devfleet: file logging disabled ({}): {}", path.display(), e),
        }
    }
    init_logging(config.log_filter.as_deref(), aggregator.sink())?;
    info!("Devfleet v{} starting", devfleet_core::VERSION);

    // 3. Wire the engine (DI)
    let pool_config = ProcessPoolConfig {
        program: std::env::current_exe().context("Cannot locate the devfleet executable")?,
        init: WorkerInit {
            packages: config.packages.clone(),
            log_filter: config
                .log_filter
                .clone()
                .or_else(|| std::env::var("RUST_LOG").ok()),
        },
        ..ProcessPoolConfig::default()
    };
    let engine = FanOutEngine::new(
        Arc::new(ProcessPoolFactory::new(pool_config, aggregator.sink())),
        Arc::new(SystemTimeProvider),
        EngineConfig {
            max_workers: config.max_workers,
            kill_stragglers: config.kill_stragglers,
        },
    );

    // 4. Execute, report, then drain logs whatever happened
    let outcome = engine
        .execute_concurrently(specs, config.deadline, isolate_errors)
        .await;
    let report = match outcome {
        Ok((results, errors)) => {
            let failed = errors.iter().flatten().count();
            info!(calls = results.len(), failed, "Batch finished");
            Ok(batch_report(&results, &errors))
        }
        Err(e) => {
            error!(error = %e, "Batch failed");
            Err(e)
        }
    };

    if let Err(e) = aggregator.sync().await {
        warn!(error = %e, "Log sync incomplete");
    }
    aggregator.terminate().await?;

    let report = report?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

/// `results[i]` is null for NO_RESULT; `errors[i]` says why
fn batch_report(results: &[CallResult], errors: &[Option<CallError>]) -> Value {
    json!({
        "results": results
            .iter()
            .map(|r| r.value.clone().unwrap_or(Value::Null))
            .collect::<Vec<_>>(),
        "errors": errors,
    })
}
