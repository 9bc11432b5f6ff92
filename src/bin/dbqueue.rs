use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use dbqueue::config::OrchestratorConfig;
use dbqueue::logging::init_tracing;
use dbqueue::{DbQueueError, QueueManager};
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(author, version, about = "Run the database queues described by a JSON config")]
struct Args {
    /// Orchestrator config file (JSON).
    #[arg(long)]
    config: PathBuf,
    /// Stop after this long instead of waiting for Ctrl-C, e.g. "30s" or "5m".
    #[arg(long, value_parser = humantime::parse_duration)]
    run_for: Option<Duration>,
    /// How long each database may take to reach steady state.
    #[arg(long, value_parser = humantime::parse_duration, default_value = "60s")]
    startup_timeout: Duration,
    /// Tracing filter directives; falls back to RUST_LOG.
    #[arg(long)]
    log: Option<String>,
}

fn main() -> ExitCode {
    let args = Args::parse();
    init_tracing(args.log.as_deref());

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(err) => {
            eprintln!("failed to start runtime: {err}");
            return ExitCode::FAILURE;
        }
    };
    match runtime.block_on(run(&args)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{err}");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: &Args) -> Result<(), DbQueueError> {
    let config = OrchestratorConfig::from_path(&args.config)?;
    let manager = QueueManager::from_config(&config)?;

    for name in manager.database_names() {
        if let Some(queue) = manager.get_database(&name) {
            match queue.wait_until_steady(args.startup_timeout).await {
                Ok(()) => info!(dqm = %queue.label(), children = queue.child_count(), "ready"),
                Err(err) => warn!(dqm = %queue.label(), "not ready: {err}"),
            }
        }
    }
    println!("{}", manager.stats_json()?);

    match args.run_for {
        Some(duration) => tokio::time::sleep(duration).await,
        None => {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!("cannot listen for Ctrl-C: {err}");
            }
        }
    }

    manager.shutdown().await;
    info!(stats = %manager.stats_string(), "stopped");
    Ok(())
}
