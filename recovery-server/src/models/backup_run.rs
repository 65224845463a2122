use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

// ── BackupRun ──

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "RUNNING",
            RunStatus::Completed => "COMPLETED",
            RunStatus::Failed => "FAILED",
        }
    }

    fn parse(raw: &str) -> rusqlite::Result<Self> {
        match raw {
            "RUNNING" => Ok(RunStatus::Running),
            "COMPLETED" => Ok(RunStatus::Completed),
            "FAILED" => Ok(RunStatus::Failed),
            other => Err(rusqlite::Error::InvalidColumnType(
                0,
                format!("status={other}"),
                rusqlite::types::Type::Text,
            )),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupRun {
    pub backup_id: String,
    pub backup_name: String,
    pub backup_type: String,
    pub started_at: String,
    pub completed_at: Option<String>,
    pub status: RunStatus,
    pub size_bytes: Option<i64>,
    pub duration_seconds: Option<f64>,
    pub file_path: Option<String>,
    pub checksum: Option<String>,
    pub error_message: Option<String>,
}

fn row_to_run(row: &Row) -> rusqlite::Result<BackupRun> {
    let status: String = row.get("status")?;
    Ok(BackupRun {
        backup_id: row.get("backup_id")?,
        backup_name: row.get("backup_name")?,
        backup_type: row.get("backup_type")?,
        started_at: row.get("started_at")?,
        completed_at: row.get("completed_at")?,
        status: RunStatus::parse(&status)?,
        size_bytes: row.get("size_bytes")?,
        duration_seconds: row.get("duration_seconds")?,
        file_path: row.get("file_path")?,
        checksum: row.get("checksum")?,
        error_message: row.get("error_message")?,
    })
}

pub struct CreateRunData<'a> {
    pub backup_id: &'a str,
    pub backup_name: &'a str,
    pub backup_type: &'a str,
    pub started_at: &'a str,
}

pub fn create(conn: &Connection, data: &CreateRunData) -> anyhow::Result<()> {
    conn.execute(
        "INSERT INTO backup_history (backup_id, backup_name, backup_type, started_at, status)
         VALUES (?1, ?2, ?3, ?4, 'RUNNING')",
        params![data.backup_id, data.backup_name, data.backup_type, data.started_at],
    )?;
    Ok(())
}

pub fn find_by_id(conn: &Connection, backup_id: &str) -> anyhow::Result<Option<BackupRun>> {
    let mut stmt = conn.prepare("SELECT * FROM backup_history WHERE backup_id = ?")?;
    let mut rows = stmt.query_map(params![backup_id], row_to_run)?;
    Ok(rows.next().transpose()?)
}

pub fn find_recent(conn: &Connection, limit: i64) -> anyhow::Result<Vec<BackupRun>> {
    let mut stmt = conn.prepare(
        "SELECT * FROM backup_history ORDER BY started_at DESC LIMIT ?",
    )?;
    let rows = stmt.query_map(params![limit], row_to_run)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

pub struct CompletionData<'a> {
    pub completed_at: &'a str,
    pub size_bytes: i64,
    pub duration_seconds: f64,
    pub file_path: &'a str,
    pub checksum: &'a str,
}

/// Returns the number of rows changed; 0 means the run was not RUNNING.
pub fn update_completed(conn: &Connection, backup_id: &str, data: &CompletionData) -> anyhow::Result<usize> {
    let changes = conn.execute(
        "UPDATE backup_history
         SET status = 'COMPLETED', completed_at = ?, size_bytes = ?, duration_seconds = ?, file_path = ?, checksum = ?
         WHERE backup_id = ? AND status = 'RUNNING'",
        params![
            data.completed_at,
            data.size_bytes,
            data.duration_seconds,
            data.file_path,
            data.checksum,
            backup_id,
        ],
    )?;
    Ok(changes)
}

pub fn update_failed(
    conn: &Connection,
    backup_id: &str,
    completed_at: &str,
    duration_seconds: f64,
    error_message: &str,
) -> anyhow::Result<usize> {
    let changes = conn.execute(
        "UPDATE backup_history
         SET status = 'FAILED', completed_at = ?, duration_seconds = ?, error_message = ?
         WHERE backup_id = ? AND status = 'RUNNING'",
        params![completed_at, duration_seconds, error_message, backup_id],
    )?;
    Ok(changes)
}

pub fn last_completed_before(
    conn: &Connection,
    backup_name: &str,
    before: &str,
) -> anyhow::Result<Option<String>> {
    let last = conn
        .query_row(
            "SELECT MAX(completed_at) FROM backup_history
             WHERE backup_name = ? AND status = 'COMPLETED' AND completed_at < ?",
            params![backup_name, before],
            |row| row.get::<_, Option<String>>(0),
        )
        .optional()?
        .flatten();
    Ok(last)
}

pub fn delete(conn: &Connection, backup_id: &str) -> anyhow::Result<bool> {
    let changes = conn.execute("DELETE FROM backup_history WHERE backup_id = ?", params![backup_id])?;
    Ok(changes > 0)
}

// ── Aggregates ──

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HealthCounts {
    pub failed: i64,
    pub completed: i64,
    pub last_completed_at: Option<String>,
}

/// Runs started after `since`, plus the last completion across all jobs.
pub fn health_counts(conn: &Connection, since: &str) -> anyhow::Result<HealthCounts> {
    let counts = conn.query_row(
        "SELECT
            COALESCE(SUM(CASE WHEN status = 'FAILED' AND started_at > ?1 THEN 1 ELSE 0 END), 0),
            COALESCE(SUM(CASE WHEN status = 'COMPLETED' AND started_at > ?1 THEN 1 ELSE 0 END), 0),
            MAX(CASE WHEN status = 'COMPLETED' THEN completed_at END)
         FROM backup_history",
        params![since],
        |row| {
            Ok(HealthCounts {
                failed: row.get(0)?,
                completed: row.get(1)?,
                last_completed_at: row.get(2)?,
            })
        },
    )?;
    Ok(counts)
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunStatistics {
    pub total_backups: i64,
    pub successful_backups: i64,
    pub failed_backups: i64,
    pub total_size_bytes: i64,
    pub avg_duration_seconds: Option<f64>,
}

pub fn statistics(conn: &Connection, since: &str) -> anyhow::Result<RunStatistics> {
    let stats = conn.query_row(
        "SELECT
            COUNT(*),
            COALESCE(SUM(CASE WHEN status = 'COMPLETED' THEN 1 ELSE 0 END), 0),
            COALESCE(SUM(CASE WHEN status = 'FAILED' THEN 1 ELSE 0 END), 0),
            COALESCE(SUM(size_bytes), 0),
            AVG(CASE WHEN status = 'COMPLETED' THEN duration_seconds END)
         FROM backup_history
         WHERE started_at >= ?",
        params![since],
        |row| {
            Ok(RunStatistics {
                total_backups: row.get(0)?,
                successful_backups: row.get(1)?,
                failed_backups: row.get(2)?,
                total_size_bytes: row.get(3)?,
                avg_duration_seconds: row.get(4)?,
            })
        },
    )?;
    Ok(stats)
}

// ── Failover test log ──

pub fn insert_failover_test(
    conn: &Connection,
    id: &str,
    tested_at: &str,
    overall_status: &str,
    report_json: &str,
) -> anyhow::Result<()> {
    conn.execute(
        "INSERT INTO failover_tests (id, tested_at, overall_status, report) VALUES (?1, ?2, ?3, ?4)",
        params![id, tested_at, overall_status, report_json],
    )?;
    Ok(())
}

pub fn count_failover_tests(conn: &Connection) -> anyhow::Result<i64> {
    Ok(conn.query_row("SELECT COUNT(*) FROM failover_tests", [], |row| row.get(0))?)
}
