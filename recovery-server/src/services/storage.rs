//! Artifact files under the backup root, one `<backup_id>.backup` per run.

use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use crate::error::BackupError;

pub const ARTIFACT_EXTENSION: &str = "backup";

#[derive(Debug, Clone)]
pub struct StoredArtifact {
    pub backup_id: String,
    pub path: PathBuf,
    pub size: u64,
    pub modified: SystemTime,
}

#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_for(&self, backup_id: &str) -> PathBuf {
        self.root.join(format!("{backup_id}.{ARTIFACT_EXTENSION}"))
    }

    /// Write via a temp file and rename, so a `.backup` file is always whole.
    pub fn write(&self, backup_id: &str, bytes: &[u8]) -> Result<PathBuf, BackupError> {
        fs::create_dir_all(&self.root).map_err(|e| {
            BackupError::Persistence(format!("cannot create {}: {e}", self.root.display()))
        })?;

        let target = self.path_for(backup_id);
        let tmp = target.with_extension(format!("{ARTIFACT_EXTENSION}.tmp"));

        let result = (|| -> std::io::Result<()> {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(bytes)?;
            file.sync_all()?;
            fs::rename(&tmp, &target)
        })();

        if let Err(e) = result {
            let _ = fs::remove_file(&tmp);
            return Err(BackupError::Persistence(format!(
                "failed to write {}: {e}",
                target.display()
            )));
        }

        tracing::debug!(path = %target.display(), size = bytes.len(), "Artifact written");
        Ok(target)
    }

    pub fn read(&self, backup_id: &str) -> Result<Vec<u8>, BackupError> {
        let path = self.path_for(backup_id);
        fs::read(&path).map_err(|e| match e.kind() {
            ErrorKind::NotFound => BackupError::NotFound(backup_id.to_string()),
            _ => BackupError::Persistence(format!("failed to read {}: {e}", path.display())),
        })
    }

    /// Returns whether a file was removed.
    pub fn delete(&self, backup_id: &str) -> Result<bool, BackupError> {
        let path = self.path_for(backup_id);
        match fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(BackupError::Persistence(format!(
                "failed to delete {}: {e}",
                path.display()
            ))),
        }
    }

    /// All complete artifacts. A missing root is an empty store.
    pub fn list(&self) -> Result<Vec<StoredArtifact>, BackupError> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(BackupError::Persistence(format!(
                    "cannot list {}: {e}",
                    self.root.display()
                )))
            }
        };

        let mut artifacts = Vec::new();
        for entry in entries.filter_map(|e| e.ok()) {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(ARTIFACT_EXTENSION) {
                continue;
            }
            let Some(backup_id) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let Ok(meta) = entry.metadata() else { continue };
            if !meta.is_file() {
                continue;
            }
            artifacts.push(StoredArtifact {
                backup_id: backup_id.to_string(),
                size: meta.len(),
                modified: meta.modified().unwrap_or(SystemTime::UNIX_EPOCH),
                path,
            });
        }
        Ok(artifacts)
    }

    pub fn latest(&self) -> Result<Option<StoredArtifact>, BackupError> {
        self.latest_matching(|_| true)
    }

    /// Newest artifact by mtime among those `keep` accepts.
    pub fn latest_matching<F>(&self, keep: F) -> Result<Option<StoredArtifact>, BackupError>
    where
        F: Fn(&StoredArtifact) -> bool,
    {
        Ok(self
            .list()?
            .into_iter()
            .filter(|a| keep(a))
            .max_by_key(|a| a.modified))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;

    #[test]
    fn test_write_read_delete() {
        let dir = TempDir::new().unwrap();
        let store = ArtifactStore::new(dir.path().join("backups"));

        let path = store.write("daily_1", b"sealed").unwrap();
        assert!(path.ends_with("daily_1.backup"));
        assert_eq!(store.read("daily_1").unwrap(), b"sealed");
        assert!(!dir.path().join("backups/daily_1.backup.tmp").exists());

        assert!(store.delete("daily_1").unwrap());
        assert!(!store.delete("daily_1").unwrap());
        assert!(matches!(store.read("daily_1"), Err(BackupError::NotFound(_))));
    }

    #[test]
    fn test_list_skips_foreign_files() {
        let dir = TempDir::new().unwrap();
        let store = ArtifactStore::new(dir.path());
        store.write("a_1", b"x").unwrap();
        fs::write(dir.path().join("notes.txt"), b"hi").unwrap();
        fs::write(dir.path().join("b_2.backup.tmp"), b"partial").unwrap();

        let listed = store.list().unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].backup_id, "a_1");
        assert_eq!(listed[0].size, 1);
    }

    #[test]
    fn test_latest_by_mtime() {
        let dir = TempDir::new().unwrap();
        let store = ArtifactStore::new(dir.path());
        assert!(store.latest().unwrap().is_none());

        let old = store.write("a_1", b"x").unwrap();
        store.write("a_2", b"y").unwrap();
        let file = fs::File::options().write(true).open(&old).unwrap();
        file.set_modified(SystemTime::now() + Duration::from_secs(60)).unwrap();

        assert_eq!(store.latest().unwrap().unwrap().backup_id, "a_1");
    }

    #[test]
    fn test_missing_root_lists_empty() {
        let dir = TempDir::new().unwrap();
        let store = ArtifactStore::new(dir.path().join("nope"));
        assert!(store.list().unwrap().is_empty());
    }
}
