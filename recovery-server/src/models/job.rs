use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::BackupError;

/// Job name reserved for the disposable run made by the failover test.
pub const PROBE_JOB_NAME: &str = "failover_probe";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BackupType {
    Full,
    Incremental,
    Archive,
}

impl BackupType {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackupType::Full => "FULL",
            BackupType::Incremental => "INCREMENTAL",
            BackupType::Archive => "ARCHIVE",
        }
    }

    /// zstd level used for this kind of artifact.
    pub fn compression_level(&self) -> i32 {
        match self {
            BackupType::Full | BackupType::Incremental => 3,
            BackupType::Archive => 19,
        }
    }
}

impl fmt::Display for BackupType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackupType {
    type Err = BackupError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "FULL" => Ok(BackupType::Full),
            "INCREMENTAL" => Ok(BackupType::Incremental),
            "ARCHIVE" => Ok(BackupType::Archive),
            other => Err(BackupError::InvalidJob(format!("unknown backup type: {other}"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupJobDefinition {
    pub name: String,
    pub schedule: String,
    #[serde(rename = "type")]
    pub backup_type: BackupType,
    pub retention_days: u32,
}

impl BackupJobDefinition {
    pub fn new(name: &str, schedule: &str, backup_type: BackupType, retention_days: u32) -> Self {
        Self {
            name: name.to_string(),
            schedule: schedule.to_string(),
            backup_type,
            retention_days,
        }
    }

    pub fn validate(&self) -> Result<(), BackupError> {
        validate_job_name(&self.name)?;
        if self.name == PROBE_JOB_NAME {
            return Err(BackupError::InvalidJob(format!(
                "'{PROBE_JOB_NAME}' is reserved for failover testing"
            )));
        }
        if self.schedule.trim().is_empty() {
            return Err(BackupError::InvalidJob(format!(
                "job '{}' has an empty schedule",
                self.name
            )));
        }
        if self.retention_days == 0 {
            return Err(BackupError::InvalidJob(format!(
                "job '{}' must retain artifacts for at least one day",
                self.name
            )));
        }
        Ok(())
    }
}

pub fn validate_job_name(name: &str) -> Result<(), BackupError> {
    if name.is_empty() {
        return Err(BackupError::InvalidJob("job name is required".into()));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(BackupError::InvalidJob(format!(
            "job name '{name}' may only contain letters, digits, '_' and '-'"
        )));
    }
    Ok(())
}

/// `<job>_<unix micros>`; the suffix is what `job_name_of` strips.
pub fn new_backup_id(job_name: &str, at: DateTime<Utc>) -> String {
    format!("{}_{}", job_name, at.timestamp_micros())
}

/// Recovers the owning job name from a backup id. Matching is on the whole
/// segment before the trailing timestamp, so `daily` never claims
/// `daily_full_...`.
pub fn job_name_of(backup_id: &str) -> Option<&str> {
    let (job, stamp) = backup_id.rsplit_once('_')?;
    if job.is_empty() || stamp.is_empty() || !stamp.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    Some(job)
}
