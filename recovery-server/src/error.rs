//! Error taxonomy for the backup and recovery pipelines.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum BackupError {
    #[error("Extraction error: {0}")]
    Extraction(String),

    #[error("Compression error: {0}")]
    Compression(String),

    #[error("Encryption error: {0}")]
    Encryption(String),

    /// Includes authentication-tag mismatches (tampering or corruption).
    #[error("Decryption error: {0}")]
    Decryption(String),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Catalog error: {0}")]
    Catalog(String),

    #[error("Integrity error: {0}")]
    Integrity(String),

    #[error("Artifact not found: {0}")]
    NotFound(String),

    #[error("Apply error: {0}")]
    Apply(String),

    #[error("Job '{0}' is already running")]
    AlreadyRunning(String),

    #[error("Invalid job definition: {0}")]
    InvalidJob(String),

    #[error("Scheduler error: {0}")]
    Scheduler(String),

    #[error("Operation cancelled")]
    Cancelled,
}

impl BackupError {
    /// Stable short name of the error class, used in events and reports.
    pub fn kind(&self) -> &'static str {
        match self {
            BackupError::Extraction(_) => "extraction",
            BackupError::Compression(_) => "compression",
            BackupError::Encryption(_) => "encryption",
            BackupError::Decryption(_) => "decryption",
            BackupError::Persistence(_) => "persistence",
            BackupError::Catalog(_) => "catalog",
            BackupError::Integrity(_) => "integrity",
            BackupError::NotFound(_) => "not_found",
            BackupError::Apply(_) => "apply",
            BackupError::AlreadyRunning(_) => "already_running",
            BackupError::InvalidJob(_) => "invalid_job",
            BackupError::Scheduler(_) => "scheduler",
            BackupError::Cancelled => "cancelled",
        }
    }
}

impl From<tokio::task::JoinError> for BackupError {
    fn from(e: tokio::task::JoinError) -> Self {
        if e.is_cancelled() {
            BackupError::Cancelled
        } else {
            BackupError::Persistence(format!("background task panicked: {e}"))
        }
    }
}

/// A failed `perform_backup` invocation.
#[derive(Error, Debug)]
#[error("Backup {backup_id} of job '{job_name}' failed: {source}")]
pub struct PipelineError {
    pub backup_id: String,
    pub job_name: String,
    #[source]
    pub source: BackupError,
}

/// A failed `restore_from_backup` invocation. Nothing is committed at the
/// destination when this is returned.
#[derive(Error, Debug)]
#[error("Restore of {backup_id} failed: {source}")]
pub struct RestoreError {
    pub backup_id: String,
    #[source]
    pub source: BackupError,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pipeline_error_message_carries_identifiers() {
        let err = PipelineError {
            backup_id: "daily_full_1700000000000000".into(),
            job_name: "daily_full".into(),
            source: BackupError::Extraction("no such table: patients".into()),
        };
        let msg = err.to_string();
        assert!(msg.contains("daily_full_1700000000000000"));
        assert!(msg.contains("'daily_full'"));
        assert!(msg.contains("no such table: patients"));
    }

    #[test]
    fn test_kind_names() {
        assert_eq!(BackupError::Cancelled.kind(), "cancelled");
        assert_eq!(BackupError::Decryption("tag".into()).kind(), "decryption");
    }
}
