//! Extraction strategies, one per backup type.
//!
//! Everything here is synchronous and talks to the primary store; callers
//! run it under `spawn_blocking`.

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use super::source::DataSource;
use crate::config::ChangeSource;
use crate::error::BackupError;
use crate::models::format_timestamp;
use crate::models::job::BackupType;
use crate::models::payload::{BackupPayload, ChangeSet, PayloadBody, PayloadMetadata, TableSnapshot};

/// What to capture for one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtractionPlan {
    Full,
    /// Changes in `(since, captured_at]`.
    Incremental { since: DateTime<Utc> },
    Archive,
}

/// Identity of the run an extraction belongs to.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub backup_id: String,
    pub job_name: String,
    pub captured_at: DateTime<Utc>,
}

fn extraction_err(e: anyhow::Error) -> BackupError {
    BackupError::Extraction(format!("{e:#}"))
}

#[derive(Clone)]
pub struct Extractor {
    source: Arc<dyn DataSource>,
    max_rows_per_table: usize,
    change_sources: Vec<ChangeSource>,
}

impl Extractor {
    pub fn new(source: Arc<dyn DataSource>, max_rows_per_table: usize, change_sources: Vec<ChangeSource>) -> Self {
        Self {
            source,
            max_rows_per_table,
            change_sources,
        }
    }

    pub fn extract(
        &self,
        plan: ExtractionPlan,
        run: &RunContext,
        cancel: &CancellationToken,
    ) -> Result<BackupPayload, BackupError> {
        match plan {
            ExtractionPlan::Full => self.full(run, cancel),
            ExtractionPlan::Incremental { since } => self.incremental(run, since),
            ExtractionPlan::Archive => self.archive(run, cancel),
        }
    }

    fn full(&self, run: &RunContext, cancel: &CancellationToken) -> Result<BackupPayload, BackupError> {
        let tables = self.source.list_tables().map_err(extraction_err)?;
        let mut content: BTreeMap<String, BTreeMap<String, TableSnapshot>> = BTreeMap::new();

        for table in &tables {
            if cancel.is_cancelled() {
                tracing::warn!(backup_id = %run.backup_id, "Extraction cancelled between tables");
                return Err(BackupError::Cancelled);
            }

            let structure = self.source.table_structure(table).map_err(extraction_err)?;
            let rows = self
                .source
                .read_rows(table, self.max_rows_per_table)
                .map_err(extraction_err)?;
            if rows.len() == self.max_rows_per_table {
                tracing::warn!(
                    table = %table.qualified(),
                    limit = self.max_rows_per_table,
                    "Table truncated at row cap"
                );
            }

            content.entry(table.schema.clone()).or_default().insert(
                table.table.clone(),
                TableSnapshot {
                    structure,
                    row_count: rows.len(),
                    rows,
                },
            );
        }

        let payload = BackupPayload {
            backup_type: BackupType::Full,
            timestamp: format_timestamp(run.captured_at),
            body: PayloadBody::Content(content),
            metadata: PayloadMetadata {
                backup_id: run.backup_id.clone(),
                job_name: run.job_name.clone(),
                source_version: self.source.version().ok(),
                compression_level: BackupType::Full.compression_level(),
                table_count: tables.len(),
                ..Default::default()
            },
        };
        Ok(with_totals(payload))
    }

    fn incremental(&self, run: &RunContext, since: DateTime<Utc>) -> Result<BackupPayload, BackupError> {
        let since = format_timestamp(since);
        let until = format_timestamp(run.captured_at);

        let mut sets = BTreeMap::new();
        for source in &self.change_sources {
            let rows = self
                .source
                .rows_changed_between(source, &since, &until)
                .map_err(|e| BackupError::Extraction(format!("{}: {e:#}", source.table)))?;
            tracing::debug!(table = %source.table, rows = rows.len(), "Change set captured");
            sets.insert(source.table.clone(), rows);
        }

        let payload = BackupPayload {
            backup_type: BackupType::Incremental,
            timestamp: until.clone(),
            body: PayloadBody::Changes(ChangeSet { since, until, sets }),
            metadata: PayloadMetadata {
                backup_id: run.backup_id.clone(),
                job_name: run.job_name.clone(),
                source_version: self.source.version().ok(),
                compression_level: BackupType::Incremental.compression_level(),
                table_count: self.change_sources.len(),
                ..Default::default()
            },
        };
        Ok(with_totals(payload))
    }

    fn archive(&self, run: &RunContext, cancel: &CancellationToken) -> Result<BackupPayload, BackupError> {
        let mut payload = self.full(run, cancel)?;
        payload.backup_type = BackupType::Archive;
        payload.metadata.archive = true;
        payload.metadata.compression_level = BackupType::Archive.compression_level();
        Ok(payload)
    }
}

fn with_totals(mut payload: BackupPayload) -> BackupPayload {
    payload.metadata.total_rows = payload.total_rows();
    payload
}
