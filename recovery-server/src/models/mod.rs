pub mod backup_run;
pub mod failover;
pub mod job;
pub mod payload;

use chrono::{DateTime, SecondsFormat, Utc};

/// Catalog and payload timestamps are fixed-width RFC 3339 UTC strings, so
/// text ordering in SQLite matches chronological ordering.
pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn parse_timestamp(raw: &str) -> anyhow::Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(raw)?.with_timezone(&Utc))
}

/// Lower bound used by an incremental run with no completed predecessor.
pub fn epoch() -> DateTime<Utc> {
    DateTime::<Utc>::UNIX_EPOCH
}
