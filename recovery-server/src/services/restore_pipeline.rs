//! read -> decrypt -> decompress -> deserialize -> checksum check -> apply.

use chrono::Utc;
use rusqlite::types::Value as SqlValue;
use rusqlite::{params_from_iter, Transaction};
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use super::catalog::Catalog;
use super::source::{parse_table_name, quote_ident, TableRef};
use super::storage::ArtifactStore;
use crate::crypto::{checksum, open_payload, ArtifactCipher};
use crate::db::connection::{checkout, DbPool};
use crate::error::{BackupError, RestoreError};
use crate::models::format_timestamp;
use crate::models::job::BackupType;
use crate::models::payload::{BackupPayload, ChangeSet, ColumnInfo, PayloadBody, Row, TableSnapshot};

/// Destination-side application of a recovered payload.
///
/// Each call must be all-or-nothing: on error nothing it wrote is visible.
pub trait PayloadApplier: Send + Sync {
    /// FULL and ARCHIVE content. Returns rows written.
    fn apply_snapshot(&self, content: &BTreeMap<String, BTreeMap<String, TableSnapshot>>) -> anyhow::Result<usize>;

    /// INCREMENTAL change sets. Returns rows written.
    fn apply_changes(&self, changes: &ChangeSet) -> anyhow::Result<usize>;
}

/// Applies payloads to a SQLite store inside one transaction per call.
/// Missing tables are created from the captured structure; rows are upserted.
pub struct SqliteApplier {
    pool: DbPool,
    checkout_timeout: Duration,
}

impl SqliteApplier {
    pub fn new(pool: DbPool, checkout_timeout: Duration) -> Self {
        Self {
            pool,
            checkout_timeout,
        }
    }
}

fn schema_attached(tx: &Transaction, schema: &str) -> anyhow::Result<bool> {
    let mut stmt = tx.prepare("PRAGMA database_list")?;
    let names = stmt
        .query_map([], |row| row.get::<_, String>(1))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(names.iter().any(|n| n == schema))
}

fn table_exists(tx: &Transaction, table: &TableRef) -> anyhow::Result<bool> {
    let sql = format!(
        "SELECT COUNT(*) FROM {}.sqlite_master WHERE type = 'table' AND name = ?1",
        quote_ident(&table.schema)
    );
    let count: i64 = tx.query_row(&sql, [&table.table], |row| row.get(0))?;
    Ok(count > 0)
}

fn create_table_sql(table: &TableRef, structure: &[ColumnInfo]) -> String {
    let mut defs: Vec<String> = structure
        .iter()
        .map(|c| {
            let mut def = format!("{} {}", quote_ident(&c.name), c.data_type);
            if !c.nullable {
                def.push_str(" NOT NULL");
            }
            if let Some(default) = &c.default_value {
                def.push_str(&format!(" DEFAULT {default}"));
            }
            def
        })
        .collect();

    let mut pk: Vec<&ColumnInfo> = structure.iter().filter(|c| c.primary_key > 0).collect();
    pk.sort_by_key(|c| c.primary_key);
    if !pk.is_empty() {
        let cols: Vec<String> = pk.iter().map(|c| quote_ident(&c.name)).collect();
        defs.push(format!("PRIMARY KEY ({})", cols.join(", ")));
    }

    format!("CREATE TABLE IF NOT EXISTS {} ({})", table.qualified(), defs.join(", "))
}

fn to_sql_value(value: &Value, column: Option<&ColumnInfo>) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
        Value::Number(n) => match n.as_i64() {
            Some(i) => SqlValue::Integer(i),
            None => SqlValue::Real(n.as_f64().unwrap_or_default()),
        },
        Value::String(s) => {
            let is_blob = column.is_some_and(|c| c.data_type.to_ascii_uppercase().contains("BLOB"));
            match is_blob.then(|| hex::decode(s).ok()).flatten() {
                Some(bytes) => SqlValue::Blob(bytes),
                None => SqlValue::Text(s.clone()),
            }
        }
        other => SqlValue::Text(other.to_string()),
    }
}

fn upsert_rows(tx: &Transaction, table: &TableRef, rows: &[Row], structure: &[ColumnInfo]) -> anyhow::Result<usize> {
    let by_name: BTreeMap<&str, &ColumnInfo> = structure.iter().map(|c| (c.name.as_str(), c)).collect();
    let mut written = 0;
    for row in rows {
        if row.is_empty() {
            continue;
        }
        let columns: Vec<&String> = row.keys().collect();
        let sql = format!(
            "INSERT OR REPLACE INTO {} ({}) VALUES ({})",
            table.qualified(),
            columns.iter().map(|c| quote_ident(c)).collect::<Vec<_>>().join(", "),
            (1..=columns.len()).map(|i| format!("?{i}")).collect::<Vec<_>>().join(", "),
        );
        let values = row
            .iter()
            .map(|(name, value)| to_sql_value(value, by_name.get(name.as_str()).copied()));
        let mut stmt = tx.prepare_cached(&sql)?;
        written += stmt.execute(params_from_iter(values))?;
    }
    Ok(written)
}

impl PayloadApplier for SqliteApplier {
    fn apply_snapshot(&self, content: &BTreeMap<String, BTreeMap<String, TableSnapshot>>) -> anyhow::Result<usize> {
        let mut conn = checkout(&self.pool, self.checkout_timeout)?;
        let tx = conn.transaction()?;
        let mut written = 0;

        for (schema, tables) in content {
            if !schema_attached(&tx, schema)? {
                anyhow::bail!("schema '{schema}' is not attached at the destination");
            }
            for (name, snapshot) in tables {
                let table = TableRef::new(schema, name);
                tx.execute_batch(&create_table_sql(&table, &snapshot.structure))?;
                written += upsert_rows(&tx, &table, &snapshot.rows, &snapshot.structure)?;
            }
        }

        tx.commit()?;
        Ok(written)
    }

    fn apply_changes(&self, changes: &ChangeSet) -> anyhow::Result<usize> {
        let mut conn = checkout(&self.pool, self.checkout_timeout)?;
        let tx = conn.transaction()?;
        let mut written = 0;

        for (name, rows) in &changes.sets {
            if rows.is_empty() {
                continue;
            }
            let table = parse_table_name(name);
            if !table_exists(&tx, &table)? {
                // Change sets carry no structure; create untyped columns
                let mut columns: Vec<&String> = rows.iter().flat_map(|r| r.keys()).collect();
                columns.sort();
                columns.dedup();
                let defs: Vec<String> = columns.iter().map(|c| quote_ident(c)).collect();
                tx.execute_batch(&format!(
                    "CREATE TABLE IF NOT EXISTS {} ({})",
                    table.qualified(),
                    defs.join(", ")
                ))?;
            }
            written += upsert_rows(&tx, &table, rows, &[])?;
        }

        tx.commit()?;
        Ok(written)
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RestoreResult {
    pub backup_id: String,
    pub restored_at: String,
    pub backup_type: BackupType,
    pub rows_applied: usize,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyReport {
    pub backup_id: String,
    pub backup_type: BackupType,
    pub timestamp: String,
    pub total_rows: usize,
    pub size_bytes: usize,
    pub checksum: String,
    pub checksum_verified: bool,
}

#[derive(Clone)]
pub struct RestorePipeline {
    catalog: Arc<dyn Catalog>,
    store: ArtifactStore,
    cipher: Arc<ArtifactCipher>,
    applier: Arc<dyn PayloadApplier>,
}

struct Decoded {
    payload: BackupPayload,
    report: VerifyReport,
}

impl RestorePipeline {
    pub fn new(
        catalog: Arc<dyn Catalog>,
        store: ArtifactStore,
        cipher: Arc<ArtifactCipher>,
        applier: Arc<dyn PayloadApplier>,
    ) -> Self {
        Self {
            catalog,
            store,
            cipher,
            applier,
        }
    }

    pub async fn restore_from_backup(&self, backup_id: &str) -> Result<RestoreResult, RestoreError> {
        tracing::info!(backup_id = %backup_id, "Starting restore");
        let this = self.clone();
        let id = backup_id.to_string();

        let result = tokio::task::spawn_blocking(move || {
            let Decoded { payload, .. } = this.decode(&id)?;
            let rows_applied = match &payload.body {
                PayloadBody::Content(content) => this.applier.apply_snapshot(content),
                PayloadBody::Changes(changes) => this.applier.apply_changes(changes),
            }
            .map_err(|e| BackupError::Apply(format!("{e:#}")))?;

            Ok::<_, BackupError>(RestoreResult {
                backup_id: id,
                restored_at: format_timestamp(Utc::now()),
                backup_type: payload.backup_type,
                rows_applied,
            })
        })
        .await
        .map_err(BackupError::from)
        .and_then(|r| r);

        match result {
            Ok(restored) => {
                tracing::info!(
                    backup_id = %backup_id,
                    kind = %restored.backup_type,
                    rows = restored.rows_applied,
                    "Restore completed"
                );
                Ok(restored)
            }
            Err(source) => {
                tracing::error!(backup_id = %backup_id, stage = source.kind(), error = %source, "Restore failed");
                Err(RestoreError {
                    backup_id: backup_id.to_string(),
                    source,
                })
            }
        }
    }

    /// Decode an artifact end to end without applying it.
    pub async fn verify_artifact(&self, backup_id: &str) -> Result<VerifyReport, BackupError> {
        let this = self.clone();
        let id = backup_id.to_string();
        let report = tokio::task::spawn_blocking(move || this.decode(&id).map(|d| d.report)).await??;
        tracing::info!(backup_id = %backup_id, rows = report.total_rows, "Artifact verified");
        Ok(report)
    }

    /// Authentication runs before the catalog comparison, so a modified
    /// artifact always surfaces as a decryption failure.
    fn decode(&self, backup_id: &str) -> Result<Decoded, BackupError> {
        let bytes = self.store.read(backup_id)?;
        let payload = open_payload(&bytes, &self.cipher)?;
        let actual = checksum(&bytes);

        let recorded = match self.catalog.find(backup_id) {
            Ok(run) => run.and_then(|r| r.checksum),
            Err(e) => {
                tracing::warn!(backup_id = %backup_id, error = %e, "Catalog unavailable, skipping checksum comparison");
                None
            }
        };
        if let Some(expected) = &recorded {
            if *expected != actual {
                return Err(BackupError::Integrity(format!(
                    "checksum mismatch for {backup_id}: catalog has {expected}, artifact hashes to {actual}"
                )));
            }
        }

        let report = VerifyReport {
            backup_id: backup_id.to_string(),
            backup_type: payload.backup_type,
            timestamp: payload.timestamp.clone(),
            total_rows: payload.total_rows(),
            size_bytes: bytes.len(),
            checksum: actual,
            checksum_verified: recorded.is_some(),
        };
        Ok(Decoded { payload, report })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil;

    fn count(pool: &DbPool, table: &str) -> Option<i64> {
        let conn = pool.get().unwrap();
        conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| row.get(0))
            .ok()
    }

    #[tokio::test]
    async fn test_full_restore_into_empty_store() {
        let h = testutil::harness_core();
        let backup = h.pipeline.perform_backup("daily_full", BackupType::Full, 30).await.unwrap();

        let restored = h.restore.restore_from_backup(&backup.backup_id).await.unwrap();
        assert_eq!(restored.backup_id, backup.backup_id);
        assert_eq!(restored.rows_applied, 15);
        assert_eq!(count(&h.dest_pool, "patients"), Some(10));
        assert_eq!(count(&h.dest_pool, "visits"), Some(5));
        assert_eq!(count(&h.dest_pool, "invoices"), Some(0));

        // Upserts make a repeated restore idempotent
        h.restore.restore_from_backup(&backup.backup_id).await.unwrap();
        assert_eq!(count(&h.dest_pool, "patients"), Some(10));
    }

    #[tokio::test]
    async fn test_tampered_artifact_applies_nothing() {
        let h = testutil::harness();
        let backup = h.pipeline.perform_backup("daily_full", BackupType::Full, 30).await.unwrap();

        let mut bytes = std::fs::read(&backup.file_path).unwrap();
        let at = crate::crypto::HEADER_LEN + 5;
        bytes[at] ^= 0x01;
        std::fs::write(&backup.file_path, &bytes).unwrap();

        let err = h.restore.restore_from_backup(&backup.backup_id).await.unwrap_err();
        assert_eq!(err.backup_id, backup.backup_id);
        assert!(matches!(err.source, BackupError::Decryption(_)));
        assert_eq!(count(&h.dest_pool, "patients"), None);
    }

    #[tokio::test]
    async fn test_checksum_mismatch_is_integrity_error() {
        let h = testutil::harness();
        let a = h.pipeline.perform_backup("a", BackupType::Full, 30).await.unwrap();
        let b = h.pipeline.perform_backup("b", BackupType::Full, 30).await.unwrap();
        std::fs::copy(&b.file_path, &a.file_path).unwrap();

        let err = h.restore.restore_from_backup(&a.backup_id).await.unwrap_err();
        assert!(matches!(err.source, BackupError::Integrity(_)));
        assert_eq!(count(&h.dest_pool, "patients"), None);
    }

    #[tokio::test]
    async fn test_incremental_restore_applies_change_sets() {
        let h = testutil::harness();
        let backup = h
            .pipeline
            .perform_backup("hourly", BackupType::Incremental, 7)
            .await
            .unwrap();
        let restored = h.restore.restore_from_backup(&backup.backup_id).await.unwrap();
        assert_eq!(restored.backup_type, BackupType::Incremental);
        assert_eq!(count(&h.dest_pool, "audit_log"), Some(4));
        assert_eq!(count(&h.dest_pool, "patient_visits"), Some(3));
    }

    #[tokio::test]
    async fn test_failed_apply_rolls_back() {
        let h = testutil::harness();
        let backup = h.pipeline.perform_backup("daily_full", BackupType::Full, 30).await.unwrap();
        {
            // A conflicting table definition makes the visits insert fail
            let conn = h.dest_pool.get().unwrap();
            conn.execute_batch("CREATE TABLE visits (only_column TEXT)").unwrap();
        }

        let err = h.restore.restore_from_backup(&backup.backup_id).await.unwrap_err();
        assert!(matches!(err.source, BackupError::Apply(_)));
        assert_eq!(count(&h.dest_pool, "patients"), None);
        assert_eq!(count(&h.dest_pool, "visits"), Some(0));
    }

    #[tokio::test]
    async fn test_verify_and_missing_artifact() {
        let h = testutil::harness_core();
        let backup = h.pipeline.perform_backup("weekly", BackupType::Archive, 90).await.unwrap();
        let report = h.restore.verify_artifact(&backup.backup_id).await.unwrap();
        assert_eq!(report.backup_type, BackupType::Archive);
        assert_eq!(report.total_rows, 15);
        assert!(report.checksum_verified);

        let err = h.restore.restore_from_backup("weekly_42").await.unwrap_err();
        assert!(matches!(err.source, BackupError::NotFound(_)));
    }

    #[test]
    fn test_create_table_sql() {
        let cols = vec![
            ColumnInfo {
                name: "id".into(),
                data_type: "INTEGER".into(),
                nullable: false,
                default_value: None,
                primary_key: 1,
            },
            ColumnInfo {
                name: "note".into(),
                data_type: "TEXT".into(),
                nullable: true,
                default_value: Some("'n/a'".into()),
                primary_key: 0,
            },
        ];
        assert_eq!(
            create_table_sql(&TableRef::new("main", "t"), &cols),
            "CREATE TABLE IF NOT EXISTS \"main\".\"t\" (\"id\" INTEGER NOT NULL, \"note\" TEXT DEFAULT 'n/a', PRIMARY KEY (\"id\"))"
        );
    }
}
