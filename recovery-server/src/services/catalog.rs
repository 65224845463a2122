//! Append-only record of backup runs.
//!
//! Every mutation is keyed by the `backup_id` assigned at run start, and a
//! terminal update only applies to a row that is still RUNNING.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;

use crate::db::connection::{checkout, DbConn, DbPool};
use crate::error::BackupError;
use crate::models::backup_run::{self, BackupRun, CompletionData, CreateRunData, HealthCounts, RunStatistics};
use crate::models::failover::FailoverReport;
use crate::models::job::BackupType;
use crate::models::{format_timestamp, parse_timestamp};

#[derive(Debug, Clone)]
pub struct NewRun {
    pub backup_id: String,
    pub job_name: String,
    pub backup_type: BackupType,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub enum RunOutcome {
    Completed {
        completed_at: DateTime<Utc>,
        size_bytes: u64,
        duration_seconds: f64,
        file_path: String,
        checksum: String,
    },
    Failed {
        completed_at: DateTime<Utc>,
        duration_seconds: f64,
        error_message: String,
    },
}

pub trait Catalog: Send + Sync {
    fn append(&self, run: &NewRun) -> Result<(), BackupError>;

    /// The single terminal transition of a run.
    fn update_status(&self, backup_id: &str, outcome: &RunOutcome) -> Result<(), BackupError>;

    /// Completion time of the newest COMPLETED run of `job_name` before `before`.
    fn last_completed_before(
        &self,
        job_name: &str,
        before: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>, BackupError>;

    fn find(&self, backup_id: &str) -> Result<Option<BackupRun>, BackupError>;

    fn delete(&self, backup_id: &str) -> Result<bool, BackupError>;

    fn health_window(&self, since: DateTime<Utc>) -> Result<HealthCounts, BackupError>;

    fn recent(&self, limit: i64) -> Result<Vec<BackupRun>, BackupError>;

    fn statistics(&self, since: DateTime<Utc>) -> Result<RunStatistics, BackupError>;

    fn record_failover_test(&self, report: &FailoverReport) -> Result<(), BackupError>;
}

/// Runs a catalog call on the blocking pool.
pub async fn with_catalog<T, F>(catalog: &Arc<dyn Catalog>, f: F) -> Result<T, BackupError>
where
    T: Send + 'static,
    F: FnOnce(&dyn Catalog) -> Result<T, BackupError> + Send + 'static,
{
    let catalog = catalog.clone();
    tokio::task::spawn_blocking(move || f(catalog.as_ref())).await?
}

fn catalog_err(e: anyhow::Error) -> BackupError {
    BackupError::Catalog(format!("{e:#}"))
}

pub struct SqliteCatalog {
    pool: DbPool,
    checkout_timeout: Duration,
}

impl SqliteCatalog {
    pub fn new(pool: DbPool, checkout_timeout: Duration) -> Self {
        Self {
            pool,
            checkout_timeout,
        }
    }

    fn conn(&self) -> Result<DbConn, BackupError> {
        checkout(&self.pool, self.checkout_timeout).map_err(catalog_err)
    }
}

impl Catalog for SqliteCatalog {
    fn append(&self, run: &NewRun) -> Result<(), BackupError> {
        let conn = self.conn()?;
        backup_run::create(
            &conn,
            &CreateRunData {
                backup_id: &run.backup_id,
                backup_name: &run.job_name,
                backup_type: run.backup_type.as_str(),
                started_at: &format_timestamp(run.started_at),
            },
        )
        .map_err(catalog_err)
    }

    fn update_status(&self, backup_id: &str, outcome: &RunOutcome) -> Result<(), BackupError> {
        let conn = self.conn()?;
        let changed = match outcome {
            RunOutcome::Completed {
                completed_at,
                size_bytes,
                duration_seconds,
                file_path,
                checksum,
            } => backup_run::update_completed(
                &conn,
                backup_id,
                &CompletionData {
                    completed_at: &format_timestamp(*completed_at),
                    size_bytes: *size_bytes as i64,
                    duration_seconds: *duration_seconds,
                    file_path,
                    checksum,
                },
            ),
            RunOutcome::Failed {
                completed_at,
                duration_seconds,
                error_message,
            } => backup_run::update_failed(
                &conn,
                backup_id,
                &format_timestamp(*completed_at),
                *duration_seconds,
                error_message,
            ),
        }
        .map_err(catalog_err)?;

        if changed == 0 {
            return Err(BackupError::Catalog(format!(
                "run {backup_id} is not RUNNING; terminal status already recorded or row missing"
            )));
        }
        Ok(())
    }

    fn last_completed_before(
        &self,
        job_name: &str,
        before: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>, BackupError> {
        let conn = self.conn()?;
        let raw = backup_run::last_completed_before(&conn, job_name, &format_timestamp(before))
            .map_err(catalog_err)?;
        raw.map(|ts| parse_timestamp(&ts).map_err(catalog_err)).transpose()
    }

    fn find(&self, backup_id: &str) -> Result<Option<BackupRun>, BackupError> {
        let conn = self.conn()?;
        backup_run::find_by_id(&conn, backup_id).map_err(catalog_err)
    }

    fn delete(&self, backup_id: &str) -> Result<bool, BackupError> {
        let conn = self.conn()?;
        backup_run::delete(&conn, backup_id).map_err(catalog_err)
    }

    fn health_window(&self, since: DateTime<Utc>) -> Result<HealthCounts, BackupError> {
        let conn = self.conn()?;
        backup_run::health_counts(&conn, &format_timestamp(since)).map_err(catalog_err)
    }

    fn recent(&self, limit: i64) -> Result<Vec<BackupRun>, BackupError> {
        let conn = self.conn()?;
        backup_run::find_recent(&conn, limit).map_err(catalog_err)
    }

    fn statistics(&self, since: DateTime<Utc>) -> Result<RunStatistics, BackupError> {
        let conn = self.conn()?;
        backup_run::statistics(&conn, &format_timestamp(since)).map_err(catalog_err)
    }

    fn record_failover_test(&self, report: &FailoverReport) -> Result<(), BackupError> {
        let conn = self.conn()?;
        let json = serde_json::to_string(report)
            .map_err(|e| BackupError::Catalog(format!("cannot encode failover report: {e}")))?;
        backup_run::insert_failover_test(
            &conn,
            &uuid::Uuid::new_v4().to_string(),
            &report.timestamp,
            report.overall_status.as_str(),
            &json,
        )
        .map_err(catalog_err)
    }
}
