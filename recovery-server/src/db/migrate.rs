use crate::db::connection::DbPool;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS backup_history (
  backup_id TEXT PRIMARY KEY,
  backup_name TEXT NOT NULL,
  backup_type TEXT NOT NULL CHECK(backup_type IN ('FULL','INCREMENTAL','ARCHIVE')),
  started_at TEXT NOT NULL,
  completed_at TEXT,
  status TEXT NOT NULL DEFAULT 'RUNNING' CHECK(status IN ('RUNNING','COMPLETED','FAILED')),
  size_bytes INTEGER,
  duration_seconds REAL,
  file_path TEXT,
  checksum TEXT,
  error_message TEXT
);

CREATE INDEX IF NOT EXISTS idx_backup_history_name_status ON backup_history(backup_name, status);
CREATE INDEX IF NOT EXISTS idx_backup_history_started_at ON backup_history(started_at DESC);

CREATE TABLE IF NOT EXISTS failover_tests (
  id TEXT PRIMARY KEY,
  tested_at TEXT NOT NULL,
  overall_status TEXT NOT NULL CHECK(overall_status IN ('PASSED','PARTIAL','FAILED')),
  report TEXT NOT NULL
);
"#;

pub fn migrate(pool: &DbPool) -> anyhow::Result<()> {
    tracing::info!("[Catalog] Starting catalog migration...");

    let conn = pool.get()?;
    conn.execute_batch(SCHEMA)?;

    tracing::info!("[Catalog] Migration completed successfully");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::connection::create_pool;
    use tempfile::TempDir;

    #[test]
    fn test_migrate_is_idempotent() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let pool = create_pool(&dir.path().join("catalog.db"), 2)?;
        migrate(&pool)?;
        migrate(&pool)?;

        let conn = pool.get()?;
        let tables: i64 = conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name IN ('backup_history', 'failover_tests')",
            [],
            |row| row.get(0),
        )?;
        assert_eq!(tables, 2);
        Ok(())
    }
}
