use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use budgetguard::app::{AppConfig, AppState, LoggingConfig};
use budgetguard::budget::{BudgetNotification, HandleOutcome, UsageSample};
use budgetguard::cli::{Cli, Commands};
use budgetguard::platform::AppPaths;
use budgetguard::storage::ControlStateStore;
use chrono::Utc;
use clap::Parser;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

fn init_logging(
    debug: bool,
    logging: &LoggingConfig,
    logs_dir: &Path,
) -> anyhow::Result<Option<WorkerGuard>> {
    let level = if debug { "debug" } else { logging.level.as_str() };
    let filter = EnvFilter::from_default_env()
        .add_directive(format!("budgetguard={}", level).parse()?);

    let (file_layer, guard) = if logging.file_logging {
        let appender = tracing_appender::rolling::daily(logs_dir, "budgetguard.log");
        let (writer, guard) = tracing_appender::non_blocking(appender);
        let layer = tracing_subscriber::fmt::layer()
            .with_writer(writer)
            .with_ansi(false);
        (Some(layer), Some(guard))
    } else {
        (None, None)
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .try_init()?;

    Ok(guard)
}

async fn load_config(cli: &Cli, paths: &AppPaths) -> anyhow::Result<AppConfig> {
    let config = match &cli.config {
        Some(path) => AppConfig::load_from(path)?,
        None => AppConfig::load(paths).await?,
    };
    Ok(config)
}

fn print_outcome(outcome: &HandleOutcome) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(outcome)?);
    Ok(())
}

async fn ingest<R>(state: &AppState, reader: R) -> anyhow::Result<()>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = reader.lines();
    let mut line_number = 0usize;
    let mut failures = 0usize;

    while let Some(line) = lines.next_line().await? {
        line_number += 1;
        if line.trim().is_empty() {
            continue;
        }

        let notification: BudgetNotification = match serde_json::from_str(&line) {
            Ok(notification) => notification,
            Err(e) => {
                warn!("Skipping malformed notification on line {}: {}", line_number, e);
                failures += 1;
                continue;
            }
        };

        match state.handle_notification(&notification).await {
            Ok(outcome) => print_outcome(&outcome)?,
            Err(e) => {
                error!("Budget notification on line {} failed: {}", line_number, e);
                failures += 1;
            }
        }
    }

    info!("Ingested {} lines, {} failed", line_number, failures);
    if failures > 0 {
        anyhow::bail!("{} budget notifications could not be handled", failures);
    }
    Ok(())
}

async fn run_command(state: &AppState, command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::Event {
            cost,
            budget,
            project,
            timestamp,
        } => {
            let sample = UsageSample::new(cost, budget, timestamp.unwrap_or_else(Utc::now));
            let project_id = project.unwrap_or_else(|| state.get_config().budget.default_project_id);
            let outcome = state.handler().handle(&sample, &project_id).await?;
            print_outcome(&outcome)?;
        }
        Commands::Ingest { file } => match file {
            Some(path) => {
                let file = tokio::fs::File::open(&path)
                    .await
                    .with_context(|| format!("Failed to open {}", path.display()))?;
                ingest(state, BufReader::new(file)).await?;
            }
            None => ingest(state, BufReader::new(tokio::io::stdin())).await?,
        },
        Commands::Estimate => {
            let sample = state.estimator().sample().await?;
            println!("{}", serde_json::to_string_pretty(&sample)?);
        }
        Commands::Monitor { interval_secs } => {
            let mut estimator = state.estimator();
            if let Some(secs) = interval_secs {
                estimator = estimator.with_interval(Duration::from_secs(secs.max(1)));
            }

            let (shutdown_tx, shutdown_rx) = watch::channel(false);
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    info!("Interrupt received, stopping monitor");
                }
                let _ = shutdown_tx.send(true);
            });

            estimator.run(shutdown_rx).await;
        }
        Commands::Policy => match state.current_policy().await? {
            Some(committed) => println!("{}", serde_json::to_string_pretty(&committed)?),
            None => println!("No storage-control policy has been committed yet"),
        },
        Commands::Alerts { limit } => {
            let records = state.store().recent_audit_records(limit).await?;
            println!("{}", serde_json::to_string_pretty(&records)?);
        }
        Commands::Stats { limit } => {
            let samples = state.store().recent_stats_samples(limit).await?;
            let statistics = state.get_database().get_statistics().await?;
            println!(
                "{}",
                serde_json::to_string_pretty(&serde_json::json!({
                    "samples": samples,
                    "database": statistics,
                }))?
            );
        }
        Commands::RegisterObject { id, image } => {
            state.store().register_object(&id, image.as_deref()).await?;
            println!("Registered object {}", id);
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let paths = match &cli.data_dir {
        Some(dir) => AppPaths::with_data_dir(dir)?,
        None => {
            let paths = AppPaths::new()?;
            paths.ensure_dirs_exist()?;
            paths
        }
    };

    let config = load_config(&cli, &paths).await?;
    let _guard = init_logging(cli.debug, &config.logging, &paths.logs_dir())?;
    info!("Starting BudgetGuard {}", env!("CARGO_PKG_VERSION"));

    let state = AppState::new(config, paths).await?;
    let result = run_command(&state, cli.command).await;

    state.get_database().pool().close().await;

    result
}
