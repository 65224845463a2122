//! The primary operational store, as seen by backup and failover checks.

use rusqlite::types::ValueRef;
use rusqlite::Connection;
use serde_json::Value;
use std::time::Duration;

use crate::config::ChangeSource;
use crate::db::connection::{checkout, DbConn, DbPool};
use crate::models::payload::{ColumnInfo, Row};

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct TableRef {
    pub schema: String,
    pub table: String,
}

impl TableRef {
    pub fn new(schema: &str, table: &str) -> Self {
        Self {
            schema: schema.to_string(),
            table: table.to_string(),
        }
    }

    pub fn qualified(&self) -> String {
        format!("{}.{}", quote_ident(&self.schema), quote_ident(&self.table))
    }
}

pub trait DataSource: Send + Sync {
    /// Trivial read proving the store answers.
    fn ping(&self) -> anyhow::Result<()>;

    /// Runs a read-only statement and returns its rows.
    fn query(&self, sql: &str) -> anyhow::Result<Vec<Row>>;

    fn list_tables(&self) -> anyhow::Result<Vec<TableRef>>;

    fn table_structure(&self, table: &TableRef) -> anyhow::Result<Vec<ColumnInfo>>;

    fn read_rows(&self, table: &TableRef, limit: usize) -> anyhow::Result<Vec<Row>>;

    /// Rows whose change column lies in `(since, until]`.
    fn rows_changed_between(&self, source: &ChangeSource, since: &str, until: &str) -> anyhow::Result<Vec<Row>>;

    fn version(&self) -> anyhow::Result<String>;
}

pub fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

/// `schema.table` or bare `table` (resolved against `main`).
pub fn parse_table_name(name: &str) -> TableRef {
    match name.split_once('.') {
        Some((schema, table)) => TableRef::new(schema, table),
        None => TableRef::new("main", name),
    }
}

pub fn value_to_json(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::from(i),
        ValueRef::Real(f) => serde_json::Number::from_f64(f)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        ValueRef::Text(t) => Value::String(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => Value::String(hex::encode(b)),
    }
}

fn collect_rows(conn: &Connection, sql: &str, params: &[&dyn rusqlite::ToSql]) -> anyhow::Result<Vec<Row>> {
    let mut stmt = conn.prepare(sql)?;
    let columns: Vec<String> = stmt.column_names().iter().map(|c| c.to_string()).collect();
    let mut rows = stmt.query(params)?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        let mut record = Row::new();
        for (i, name) in columns.iter().enumerate() {
            record.insert(name.clone(), value_to_json(row.get_ref(i)?));
        }
        out.push(record);
    }
    Ok(out)
}

/// SQLite primary store. Attached databases are the schemas.
pub struct SqliteSource {
    pool: DbPool,
    checkout_timeout: Duration,
}

impl SqliteSource {
    pub fn new(pool: DbPool, checkout_timeout: Duration) -> Self {
        Self {
            pool,
            checkout_timeout,
        }
    }

    fn conn(&self) -> anyhow::Result<DbConn> {
        checkout(&self.pool, self.checkout_timeout)
    }
}

impl DataSource for SqliteSource {
    fn ping(&self) -> anyhow::Result<()> {
        let conn = self.conn()?;
        conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))?;
        Ok(())
    }

    fn query(&self, sql: &str) -> anyhow::Result<Vec<Row>> {
        let conn = self.conn()?;
        collect_rows(&conn, sql, &[])
    }

    fn list_tables(&self) -> anyhow::Result<Vec<TableRef>> {
        let conn = self.conn()?;
        let schemas: Vec<String> = {
            let mut stmt = conn.prepare("PRAGMA database_list")?;
            let names = stmt
                .query_map([], |row| row.get::<_, String>(1))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            names.into_iter().filter(|s| s != "temp").collect()
        };

        let mut tables = Vec::new();
        for schema in schemas {
            let sql = format!(
                "SELECT name FROM {}.sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
                quote_ident(&schema)
            );
            let mut stmt = conn.prepare(&sql)?;
            let names = stmt
                .query_map([], |row| row.get::<_, String>(0))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            tables.extend(names.into_iter().map(|t| TableRef::new(&schema, &t)));
        }
        Ok(tables)
    }

    fn table_structure(&self, table: &TableRef) -> anyhow::Result<Vec<ColumnInfo>> {
        let conn = self.conn()?;
        let sql = format!(
            "PRAGMA {}.table_info({})",
            quote_ident(&table.schema),
            quote_ident(&table.table)
        );
        let mut stmt = conn.prepare(&sql)?;
        let columns = stmt
            .query_map([], |row| {
                Ok(ColumnInfo {
                    name: row.get("name")?,
                    data_type: row.get("type")?,
                    nullable: row.get::<_, i64>("notnull")? == 0,
                    default_value: row.get("dflt_value")?,
                    primary_key: row.get::<_, i64>("pk")? as u32,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        if columns.is_empty() {
            anyhow::bail!("table {} does not exist", table.qualified());
        }
        Ok(columns)
    }

    fn read_rows(&self, table: &TableRef, limit: usize) -> anyhow::Result<Vec<Row>> {
        let conn = self.conn()?;
        let sql = format!("SELECT * FROM {} LIMIT ?1", table.qualified());
        collect_rows(&conn, &sql, &[&(limit as i64)])
    }

    fn rows_changed_between(&self, source: &ChangeSource, since: &str, until: &str) -> anyhow::Result<Vec<Row>> {
        let conn = self.conn()?;
        let table = parse_table_name(&source.table);
        let column = quote_ident(&source.timestamp_column);
        // julianday() accepts both "YYYY-MM-DD HH:MM:SS" and RFC 3339 text
        let sql = format!(
            "SELECT * FROM {table} WHERE julianday({column}) > julianday(?1) AND julianday({column}) <= julianday(?2) ORDER BY {column}",
            table = table.qualified(),
        );
        collect_rows(&conn, &sql, &[&since, &until])
    }

    fn version(&self) -> anyhow::Result<String> {
        let conn = self.conn()?;
        let version: String = conn.query_row("SELECT sqlite_version()", [], |row| row.get(0))?;
        Ok(format!("SQLite {version}"))
    }
}
