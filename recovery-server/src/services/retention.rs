//! Age-based pruning of artifacts, per job.

use std::time::{Duration, SystemTime};

use super::storage::ArtifactStore;
use crate::error::BackupError;
use crate::models::job::job_name_of;

const SECS_PER_DAY: u64 = 24 * 60 * 60;

/// Retention setting for one-off runs that prune nothing. Registered jobs
/// cannot use it: definitions with zero retention fail validation.
pub const KEEP_ALL: u32 = 0;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RetentionOutcome {
    pub deleted: Vec<String>,
    pub kept: usize,
}

#[derive(Debug, Clone)]
pub struct RetentionManager {
    store: ArtifactStore,
}

impl RetentionManager {
    pub fn new(store: ArtifactStore) -> Self {
        Self { store }
    }

    pub fn clean_old_backups(&self, job_name: &str, retention_days: u32) -> Result<RetentionOutcome, BackupError> {
        self.clean_old_backups_at(job_name, retention_days, SystemTime::now())
    }

    /// Deletes artifacts owned by `job_name` whose mtime is before
    /// `now - retention_days`. Ownership is exact: `daily` never matches
    /// `daily_full_<ts>`.
    pub fn clean_old_backups_at(
        &self,
        job_name: &str,
        retention_days: u32,
        now: SystemTime,
    ) -> Result<RetentionOutcome, BackupError> {
        // A zero-day window would prune every artifact of the job; it means
        // "keep all" here instead.
        if retention_days == KEEP_ALL {
            tracing::debug!(job = %job_name, "Retention disabled for this run");
            return Ok(RetentionOutcome::default());
        }

        let cutoff = now
            .checked_sub(Duration::from_secs(u64::from(retention_days) * SECS_PER_DAY))
            .unwrap_or(SystemTime::UNIX_EPOCH);

        let mut outcome = RetentionOutcome::default();
        for artifact in self.store.list()? {
            if job_name_of(&artifact.backup_id) != Some(job_name) {
                continue;
            }
            if artifact.modified >= cutoff {
                outcome.kept += 1;
                continue;
            }
            match self.store.delete(&artifact.backup_id) {
                Ok(_) => {
                    tracing::info!(job = %job_name, backup_id = %artifact.backup_id, "Removed expired artifact");
                    outcome.deleted.push(artifact.backup_id);
                }
                Err(e) => {
                    tracing::warn!(backup_id = %artifact.backup_id, error = %e, "Failed to remove expired artifact");
                }
            }
        }
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use tempfile::TempDir;

    fn age(store: &ArtifactStore, id: &str, days: u64) {
        let file = File::options().write(true).open(store.path_for(id)).unwrap();
        file.set_modified(SystemTime::now() - Duration::from_secs(days * SECS_PER_DAY))
            .unwrap();
    }

    #[test]
    fn test_removes_only_expired_artifacts_of_job() {
        let dir = TempDir::new().unwrap();
        let store = ArtifactStore::new(dir.path());
        for id in ["daily_1", "daily_2", "daily_3", "daily_full_1", "weekly_1"] {
            store.write(id, b"x").unwrap();
        }
        age(&store, "daily_1", 10);
        age(&store, "daily_2", 3);
        age(&store, "daily_full_1", 10);
        age(&store, "weekly_1", 10);

        let outcome = RetentionManager::new(store.clone()).clean_old_backups("daily", 7).unwrap();
        assert_eq!(outcome.deleted, vec!["daily_1".to_string()]);
        assert_eq!(outcome.kept, 2);

        let remaining: Vec<String> = store.list().unwrap().into_iter().map(|a| a.backup_id).collect();
        assert!(remaining.contains(&"daily_full_1".to_string()));
        assert!(remaining.contains(&"weekly_1".to_string()));
        assert!(!remaining.contains(&"daily_1".to_string()));
    }

    #[test]
    fn test_no_remaining_artifact_is_older_than_window() {
        let dir = TempDir::new().unwrap();
        let store = ArtifactStore::new(dir.path());
        for (i, days) in [0u64, 1, 2, 4, 6, 8, 30].iter().enumerate() {
            let id = format!("hourly_{i}");
            store.write(&id, b"x").unwrap();
            age(&store, &id, *days);
        }

        RetentionManager::new(store.clone()).clean_old_backups("hourly", 5).unwrap();

        let cutoff = SystemTime::now() - Duration::from_secs(5 * SECS_PER_DAY);
        let remaining = store.list().unwrap();
        assert_eq!(remaining.len(), 4);
        assert!(remaining.iter().all(|a| a.modified >= cutoff - Duration::from_secs(60)));
    }

    #[test]
    fn test_keep_all_prunes_nothing() {
        let dir = TempDir::new().unwrap();
        let store = ArtifactStore::new(dir.path());
        store.write("x_1", b"x").unwrap();
        age(&store, "x_1", 100);
        let outcome = RetentionManager::new(store.clone()).clean_old_backups("x", KEEP_ALL).unwrap();
        assert!(outcome.deleted.is_empty());
        assert_eq!(store.list().unwrap().len(), 1);
    }
}
