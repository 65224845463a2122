use anyhow::Result;
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;

use recovery_server::config::{self, AppConfig};
use recovery_server::db::connection::{close_pool, create_pool};
use recovery_server::db::migrate::migrate;
use recovery_server::models::job::BackupType;
use recovery_server::services::retention::KEEP_ALL;
use recovery_server::services::scheduler::{CronTicker, ManualTicker, Ticker};
use recovery_server::state::AppState;
use recovery_server::utils;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the scheduler and health monitor until interrupted (default)
    Serve,
    /// Run one backup immediately
    Backup {
        /// Job name recorded in the catalog
        job: String,
        /// FULL, INCREMENTAL or ARCHIVE
        #[arg(short = 't', long = "type", default_value = "FULL")]
        backup_type: BackupType,
        /// Delete this job's artifacts older than N days afterwards; omit to keep all
        #[arg(short, long, value_parser = clap::value_parser!(u32).range(1..))]
        retention_days: Option<u32>,
    },
    /// Apply a stored artifact to the primary store
    Restore { backup_id: String },
    /// Decrypt and checksum an artifact without applying it
    Verify { backup_id: String },
    /// Run the disaster-recovery readiness checks
    FailoverTest,
    /// Evaluate backup health over the last 24 hours
    Health,
    /// Recent runs and 30-day statistics
    Status {
        #[arg(short, long, default_value_t = 10)]
        limit: i64,
    },
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = cli.log_level.clone().unwrap_or_else(config::log_level_from_env);
    utils::logger::init(&log_level)?;

    let config = AppConfig::from_env()?;

    std::fs::create_dir_all(&config.data_dir)?;
    std::fs::create_dir_all(&config.backups_dir)?;

    let catalog_db = create_pool(&config.catalog_db_path, config.pool_size)?;
    migrate(&catalog_db)?;
    let source_db = create_pool(&config.source_db_path, config.pool_size)?;

    let command = cli.command.unwrap_or(Command::Serve);
    let ticker: Arc<dyn Ticker> = match command {
        Command::Serve => Arc::new(CronTicker::new().await?),
        _ => Arc::new(ManualTicker::new()),
    };
    let state = AppState::new(config, catalog_db, source_db, ticker);

    let outcome = match command {
        Command::Serve => serve(&state).await,
        Command::Backup {
            job,
            backup_type,
            retention_days,
        } => {
            let retention_days = retention_days.unwrap_or(KEEP_ALL);
            let result = state.pipeline.perform_backup(&job, backup_type, retention_days).await?;
            print_json(&result)
        }
        Command::Restore { backup_id } => {
            let result = state.restore.restore_from_backup(&backup_id).await?;
            print_json(&result)
        }
        Command::Verify { backup_id } => {
            let report = state.restore.verify_artifact(&backup_id).await?;
            print_json(&report)
        }
        Command::FailoverTest => print_json(&state.failover.test_failover().await),
        Command::Health => print_json(&state.health.check().await),
        Command::Status { limit } => print_json(&state.pipeline.status(limit).await?),
    };

    close_pool(&state.catalog_db);
    close_pool(&state.source_db);
    outcome
}

async fn serve(state: &AppState) -> Result<()> {
    tracing::info!("Starting recovery-server v{}", env!("CARGO_PKG_VERSION"));

    let registered = state.scheduler.register_all(state.config.jobs.clone()).await?;
    tracing::info!("Registered {} backup job(s)", registered);
    if let Err(e) = state.scheduler.start().await {
        tracing::warn!("Failed to start scheduler: {}", e);
    }

    let health = state.health.clone().start(state.cancel.clone());

    shutdown_signal(state.cancel.clone()).await;

    tracing::info!("Shutting down...");
    if let Err(e) = state.scheduler.stop().await {
        tracing::warn!("Scheduler shutdown error: {}", e);
    }
    let _ = health.await;
    tracing::info!("Server stopped");
    Ok(())
}

async fn shutdown_signal(cancel: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to listen for ctrl+c: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received SIGINT"),
        _ = terminate => tracing::info!("Received SIGTERM"),
        _ = cancel.cancelled() => {}
    }

    cancel.cancel();
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backup_args(extra: &[&str]) -> Result<Option<u32>, clap::Error> {
        let mut args = vec!["recovery-server", "backup", "daily_full"];
        args.extend_from_slice(extra);
        match Cli::try_parse_from(args)?.command {
            Some(Command::Backup { retention_days, .. }) => Ok(retention_days),
            other => panic!("parsed as {other:?}"),
        }
    }

    #[test]
    fn test_retention_is_optional_and_positive() {
        assert_eq!(backup_args(&[]).unwrap(), None);
        assert_eq!(backup_args(&["--retention-days", "7"]).unwrap(), Some(7));
        assert!(backup_args(&["--retention-days", "0"]).is_err());
    }

    #[test]
    fn test_serve_is_default() {
        let cli = Cli::try_parse_from(["recovery-server"]).unwrap();
        assert!(cli.command.is_none());
    }
}
