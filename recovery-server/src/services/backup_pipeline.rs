//! extract -> serialize -> compress -> encrypt -> checksum -> persist,
//! bracketed by catalog bookkeeping and followed by retention.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use super::catalog::{with_catalog, Catalog, NewRun, RunOutcome};
use super::extract::{ExtractionPlan, Extractor, RunContext};
use super::retention::RetentionManager;
use super::storage::{ArtifactStore, StoredArtifact};
use crate::crypto::{seal_payload, ArtifactCipher, SealedArtifact};
use crate::error::{BackupError, PipelineError};
use crate::models::backup_run::{BackupRun, RunStatistics};
use crate::models::job::{job_name_of, new_backup_id, validate_job_name, BackupType, PROBE_JOB_NAME};
use crate::models::{epoch, format_timestamp};

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupResult {
    pub backup_id: String,
    pub job_name: String,
    pub backup_type: BackupType,
    pub file_path: String,
    pub size_bytes: u64,
    pub checksum: String,
    pub duration_seconds: f64,
    pub started_at: String,
    pub completed_at: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupStatus {
    pub recent_backups: Vec<BackupRun>,
    pub statistics: RunStatistics,
}

struct Persisted {
    path: PathBuf,
    sealed: SealedArtifact,
    rows: usize,
}

pub struct BackupPipeline {
    catalog: Arc<dyn Catalog>,
    extractor: Extractor,
    cipher: Arc<ArtifactCipher>,
    store: ArtifactStore,
    retention: RetentionManager,
    running_jobs: Arc<Mutex<HashSet<String>>>,
    cancel: CancellationToken,
}

impl BackupPipeline {
    pub fn new(
        catalog: Arc<dyn Catalog>,
        extractor: Extractor,
        cipher: Arc<ArtifactCipher>,
        store: ArtifactStore,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            catalog,
            extractor,
            cipher,
            retention: RetentionManager::new(store.clone()),
            store,
            running_jobs: Arc::new(Mutex::new(HashSet::new())),
            cancel,
        }
    }

    pub fn store(&self) -> &ArtifactStore {
        &self.store
    }

    pub async fn is_running(&self, job_name: &str) -> bool {
        self.running_jobs.lock().await.contains(job_name)
    }

    pub async fn perform_backup(
        &self,
        job_name: &str,
        backup_type: BackupType,
        retention_days: u32,
    ) -> Result<BackupResult, PipelineError> {
        let started_at = Utc::now();
        let backup_id = new_backup_id(job_name, started_at);
        let fail = |source: BackupError| PipelineError {
            backup_id: backup_id.clone(),
            job_name: job_name.to_string(),
            source,
        };

        validate_job_name(job_name).map_err(fail)?;

        // Check if already running
        {
            let mut running = self.running_jobs.lock().await;
            if running.contains(job_name) {
                return Err(fail(BackupError::AlreadyRunning(job_name.to_string())));
            }
            running.insert(job_name.to_string());
        }

        let result = self
            .run(&backup_id, job_name, backup_type, retention_days, started_at)
            .await;

        // Always remove from running set
        {
            let mut running = self.running_jobs.lock().await;
            running.remove(job_name);
        }

        result.map_err(fail)
    }

    async fn run(
        &self,
        backup_id: &str,
        job_name: &str,
        backup_type: BackupType,
        retention_days: u32,
        started_at: DateTime<Utc>,
    ) -> Result<BackupResult, BackupError> {
        let clock = Instant::now();
        tracing::info!(backup_id = %backup_id, job = %job_name, kind = %backup_type, "Starting backup");

        let new_run = NewRun {
            backup_id: backup_id.to_string(),
            job_name: job_name.to_string(),
            backup_type,
            started_at,
        };
        if let Err(e) = with_catalog(&self.catalog, move |c| c.append(&new_run)).await {
            tracing::error!(backup_id = %backup_id, error = %e, "Failed to record backup start");
        }

        let plan = self.plan_for(job_name, backup_type, started_at).await;
        let run = RunContext {
            backup_id: backup_id.to_string(),
            job_name: job_name.to_string(),
            captured_at: started_at,
        };

        match self.produce_artifact(plan, run).await {
            Ok(persisted) => {
                let completed_at = Utc::now();
                let duration_seconds = clock.elapsed().as_secs_f64();
                let size_bytes = persisted.sealed.bytes.len() as u64;
                let file_path = persisted.path.to_string_lossy().to_string();
                let checksum = persisted.sealed.checksum.clone();

                let outcome = RunOutcome::Completed {
                    completed_at,
                    size_bytes,
                    duration_seconds,
                    file_path: file_path.clone(),
                    checksum: checksum.clone(),
                };
                self.record_outcome(backup_id, outcome).await;

                tracing::info!(
                    backup_id = %backup_id,
                    rows = persisted.rows,
                    plain = persisted.sealed.plain_len,
                    size = size_bytes,
                    duration_s = duration_seconds,
                    "Backup completed"
                );

                self.apply_retention(job_name, retention_days).await;

                Ok(BackupResult {
                    backup_id: backup_id.to_string(),
                    job_name: job_name.to_string(),
                    backup_type,
                    file_path,
                    size_bytes,
                    checksum,
                    duration_seconds,
                    started_at: format_timestamp(started_at),
                    completed_at: format_timestamp(completed_at),
                })
            }
            Err(e) => {
                tracing::error!(backup_id = %backup_id, stage = e.kind(), error = %e, "Backup failed");
                let outcome = RunOutcome::Failed {
                    completed_at: Utc::now(),
                    duration_seconds: clock.elapsed().as_secs_f64(),
                    error_message: e.to_string(),
                };
                self.record_outcome(backup_id, outcome).await;
                Err(e)
            }
        }
    }

    /// Incremental runs start where the last completed run of the same job
    /// ended; with no such run (or an unreadable catalog) they start at epoch.
    async fn plan_for(&self, job_name: &str, backup_type: BackupType, started_at: DateTime<Utc>) -> ExtractionPlan {
        match backup_type {
            BackupType::Full => ExtractionPlan::Full,
            BackupType::Archive => ExtractionPlan::Archive,
            BackupType::Incremental => {
                let name = job_name.to_string();
                let since = match with_catalog(&self.catalog, move |c| c.last_completed_before(&name, started_at)).await {
                    Ok(last) => last.unwrap_or_else(epoch),
                    Err(e) => {
                        tracing::warn!(job = %job_name, error = %e, "Last completed run unknown, capturing from epoch");
                        epoch()
                    }
                };
                tracing::debug!(job = %job_name, since = %format_timestamp(since), "Incremental lower bound");
                ExtractionPlan::Incremental { since }
            }
        }
    }

    async fn produce_artifact(&self, plan: ExtractionPlan, run: RunContext) -> Result<Persisted, BackupError> {
        let extractor = self.extractor.clone();
        let cipher = self.cipher.clone();
        let store = self.store.clone();
        let cancel = self.cancel.clone();

        tokio::task::spawn_blocking(move || {
            let payload = extractor.extract(plan, &run, &cancel)?;
            let rows = payload.total_rows();
            let sealed = seal_payload(&payload, payload.metadata.compression_level, &cipher)?;
            if cancel.is_cancelled() {
                return Err(BackupError::Cancelled);
            }
            let path = store.write(&run.backup_id, &sealed.bytes)?;
            Ok(Persisted { path, sealed, rows })
        })
        .await?
    }

    async fn record_outcome(&self, backup_id: &str, outcome: RunOutcome) {
        let id = backup_id.to_string();
        if let Err(e) = with_catalog(&self.catalog, move |c| c.update_status(&id, &outcome)).await {
            tracing::error!(backup_id = %backup_id, error = %e, "Failed to record backup outcome");
        }
    }

    async fn apply_retention(&self, job_name: &str, retention_days: u32) {
        let retention = self.retention.clone();
        let name = job_name.to_string();
        match tokio::task::spawn_blocking(move || retention.clean_old_backups(&name, retention_days)).await {
            Ok(Ok(outcome)) if !outcome.deleted.is_empty() => {
                tracing::info!(job = %job_name, deleted = outcome.deleted.len(), "Retention applied");
            }
            Ok(Ok(_)) => {}
            Ok(Err(e)) => tracing::warn!(job = %job_name, error = %e, "Retention failed"),
            Err(e) => tracing::warn!(job = %job_name, error = %e, "Retention task failed"),
        }
    }

    /// Removes an artifact and its catalog row.
    pub async fn delete_backup(&self, backup_id: &str) -> Result<bool, BackupError> {
        let store = self.store.clone();
        let id = backup_id.to_string();
        let removed = tokio::task::spawn_blocking(move || store.delete(&id)).await??;

        let id = backup_id.to_string();
        if let Err(e) = with_catalog(&self.catalog, move |c| c.delete(&id)).await {
            tracing::warn!(backup_id = %backup_id, error = %e, "Failed to remove catalog row");
        }
        tracing::info!(backup_id = %backup_id, removed, "Backup deleted");
        Ok(removed)
    }

    /// Newest artifact, ignoring the failover test's disposable runs.
    pub async fn latest_backup(&self) -> Result<Option<StoredArtifact>, BackupError> {
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || {
            store.latest_matching(|a| job_name_of(&a.backup_id) != Some(PROBE_JOB_NAME))
        })
        .await?
    }

    /// Recent runs plus statistics over the trailing 30 days.
    pub async fn status(&self, limit: i64) -> Result<BackupStatus, BackupError> {
        let since = Utc::now() - chrono::Duration::days(30);
        with_catalog(&self.catalog, move |c| {
            Ok(BackupStatus {
                recent_backups: c.recent(limit)?,
                statistics: c.statistics(since)?,
            })
        })
        .await
    }
}
