//! The logical snapshot carried inside an artifact.
//!
//! Serialized as `{type, timestamp, content|changes, metadata}`. All maps are
//! `BTreeMap` so the JSON encoding of a payload is canonical.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use super::job::BackupType;
use crate::error::BackupError;

/// One row, column name to JSON value.
pub type Row = serde_json::Map<String, Value>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupPayload {
    #[serde(rename = "type")]
    pub backup_type: BackupType,
    pub timestamp: String,
    #[serde(flatten)]
    pub body: PayloadBody,
    pub metadata: PayloadMetadata,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PayloadBody {
    /// FULL and ARCHIVE: schema -> table -> snapshot.
    Content(BTreeMap<String, BTreeMap<String, TableSnapshot>>),
    /// INCREMENTAL.
    Changes(ChangeSet),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableSnapshot {
    pub structure: Vec<ColumnInfo>,
    pub rows: Vec<Row>,
    pub row_count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ColumnInfo {
    pub name: String,
    pub data_type: String,
    pub nullable: bool,
    pub default_value: Option<String>,
    /// 1-based position in the primary key, 0 when not part of it.
    pub primary_key: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeSet {
    /// Exclusive lower bound: completion time of the previous run.
    pub since: String,
    /// Inclusive upper bound: capture time of this run.
    pub until: String,
    pub sets: BTreeMap<String, Vec<Row>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PayloadMetadata {
    pub backup_id: String,
    pub job_name: String,
    #[serde(default)]
    pub source_version: Option<String>,
    pub compression_level: i32,
    #[serde(default)]
    pub table_count: usize,
    #[serde(default)]
    pub total_rows: usize,
    #[serde(default)]
    pub archive: bool,
}

impl BackupPayload {
    /// Structural check applied before a decoded payload is trusted.
    pub fn validate(&self) -> Result<(), BackupError> {
        if self.timestamp.is_empty() {
            return Err(BackupError::Integrity("payload has no timestamp".into()));
        }
        match (&self.backup_type, &self.body) {
            (BackupType::Full | BackupType::Archive, PayloadBody::Content(schemas)) => {
                for (schema, tables) in schemas {
                    for (table, snapshot) in tables {
                        if snapshot.row_count != snapshot.rows.len() {
                            return Err(BackupError::Integrity(format!(
                                "{schema}.{table}: rowCount {} does not match {} rows",
                                snapshot.row_count,
                                snapshot.rows.len()
                            )));
                        }
                    }
                }
                Ok(())
            }
            (BackupType::Incremental, PayloadBody::Changes(_)) => Ok(()),
            (kind, _) => Err(BackupError::Integrity(format!(
                "{kind} payload carries the wrong body"
            ))),
        }
    }

    pub fn total_rows(&self) -> usize {
        match &self.body {
            PayloadBody::Content(schemas) => schemas
                .values()
                .flat_map(|tables| tables.values())
                .map(|t| t.rows.len())
                .sum(),
            PayloadBody::Changes(changes) => changes.sets.values().map(Vec::len).sum(),
        }
    }
}
