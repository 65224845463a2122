use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use std::path::Path;
use std::time::Duration;

pub type DbPool = Pool<SqliteConnectionManager>;
pub type DbConn = PooledConnection<SqliteConnectionManager>;

pub fn create_pool(db_path: &Path, max_size: u32) -> anyhow::Result<DbPool> {
    let manager = SqliteConnectionManager::file(db_path).with_init(|conn| {
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = FULL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
    });
    let pool = Pool::builder().max_size(max_size).build(manager)?;
    Ok(pool)
}

/// Scoped, bounded checkout: the connection returns to the pool when the
/// guard drops, and a saturated pool fails after `timeout` instead of
/// queueing behind foreground consumers.
pub fn checkout(pool: &DbPool, timeout: Duration) -> anyhow::Result<DbConn> {
    pool.get_timeout(timeout)
        .map_err(|e| anyhow::anyhow!("no database connection available within {timeout:?}: {e}"))
}

pub fn close_pool(pool: &DbPool) {
    // r2d2 closes connections when the pool is dropped; flush the WAL first.
    if let Ok(conn) = pool.get() {
        let _ = conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE)");
    }
}
