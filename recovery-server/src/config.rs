use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::crypto::KdfParams;
use crate::models::job::{BackupJobDefinition, BackupType};

/// A table whose rows carry a "changed at" column, read by incremental runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeSource {
    pub table: String,
    pub timestamp_column: String,
}

impl ChangeSource {
    pub fn new(table: &str, timestamp_column: &str) -> Self {
        Self {
            table: table.to_string(),
            timestamp_column: timestamp_column.to_string(),
        }
    }

    /// Parses `table:column[,table:column...]`.
    pub fn parse_list(raw: &str) -> anyhow::Result<Vec<Self>> {
        raw.split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|entry| {
                let (table, column) = entry
                    .split_once(':')
                    .ok_or_else(|| anyhow::anyhow!("change source '{entry}' is not table:column"))?;
                Ok(ChangeSource::new(table.trim(), column.trim()))
            })
            .collect()
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub data_dir: PathBuf,
    pub catalog_db_path: PathBuf,
    pub source_db_path: PathBuf,
    pub backups_dir: PathBuf,
    pub encryption_secret: String,
    pub kdf: KdfParams,
    pub max_rows_per_table: usize,
    pub change_sources: Vec<ChangeSource>,
    pub scheduler_enabled: bool,
    pub health_interval: Duration,
    pub expected_daily_backups: i64,
    pub rto_target: Duration,
    pub probe_timeout: Duration,
    pub pool_size: u32,
    pub pool_checkout_timeout: Duration,
    pub jobs: Vec<BackupJobDefinition>,
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    parse_or(key, std::env::var(key).ok(), default)
}

fn parse_or<T: std::str::FromStr>(key: &str, raw: Option<String>, default: T) -> T {
    let Some(raw) = raw else {
        return default;
    };
    match raw.trim().parse() {
        Ok(value) => value,
        Err(_) => {
            tracing::warn!(key, value = %raw, "Unparseable setting, using default");
            default
        }
    }
}

/// `LOG_LEVEL` from the environment or `.env`, read before the rest of the
/// config so parse warnings are logged.
pub fn log_level_from_env() -> String {
    let _ = dotenvy::dotenv();
    std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".into())
}

impl AppConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let _ = dotenvy::dotenv();

        let data_dir = PathBuf::from(std::env::var("BACKUP_DATA_DIR").unwrap_or_else(|_| "./data".into()));
        let encryption_secret = std::env::var("BACKUP_ENCRYPTION_KEY")
            .map_err(|_| anyhow::anyhow!("BACKUP_ENCRYPTION_KEY must be set"))?;

        let change_sources = match std::env::var("BACKUP_CHANGE_SOURCES") {
            Ok(raw) => ChangeSource::parse_list(&raw)?,
            Err(_) => default_change_sources(),
        };

        let jobs = match std::env::var("BACKUP_JOBS_FILE") {
            Ok(path) => load_jobs_file(Path::new(&path))?,
            Err(_) => default_jobs(),
        };

        let defaults = KdfParams::default();

        Ok(Self {
            catalog_db_path: std::env::var("BACKUP_CATALOG_DB")
                .map(PathBuf::from)
                .unwrap_or_else(|_| data_dir.join("catalog.db")),
            source_db_path: std::env::var("BACKUP_SOURCE_DB")
                .map(PathBuf::from)
                .unwrap_or_else(|_| data_dir.join("primary.db")),
            backups_dir: std::env::var("BACKUP_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| data_dir.join("backups")),
            data_dir,
            encryption_secret,
            kdf: KdfParams {
                memory_kib: env_or("BACKUP_KDF_MEMORY_KIB", defaults.memory_kib),
                iterations: env_or("BACKUP_KDF_ITERATIONS", defaults.iterations),
                parallelism: env_or("BACKUP_KDF_PARALLELISM", defaults.parallelism),
            },
            max_rows_per_table: env_or("BACKUP_MAX_ROWS_PER_TABLE", 10_000),
            change_sources,
            scheduler_enabled: env_or("BACKUP_SCHEDULER_ENABLED", false),
            health_interval: Duration::from_secs(env_or("BACKUP_HEALTH_INTERVAL_SECS", 3600)),
            expected_daily_backups: env_or("BACKUP_EXPECTED_DAILY", 25),
            rto_target: Duration::from_millis(env_or("BACKUP_RTO_TARGET_MS", 5000)),
            probe_timeout: Duration::from_millis(env_or("BACKUP_PROBE_TIMEOUT_MS", 5000)),
            pool_size: env_or("BACKUP_POOL_SIZE", 4),
            pool_checkout_timeout: Duration::from_millis(env_or("BACKUP_POOL_CHECKOUT_MS", 2000)),
            jobs,
        })
    }
}

fn default_change_sources() -> Vec<ChangeSource> {
    vec![
        ChangeSource::new("audit_log", "event_timestamp"),
        ChangeSource::new("patient_visits", "created_at"),
    ]
}

/// Daily full at 02:00, hourly incremental, weekly archive on Sunday 03:00.
pub fn default_jobs() -> Vec<BackupJobDefinition> {
    vec![
        BackupJobDefinition::new("daily_full", "0 0 2 * * *", BackupType::Full, 30),
        BackupJobDefinition::new("hourly_incremental", "0 0 * * * *", BackupType::Incremental, 7),
        BackupJobDefinition::new("weekly_archive", "0 0 3 * * Sun", BackupType::Archive, 90),
    ]
}

#[derive(Debug, Deserialize)]
struct JobsFile {
    #[serde(default)]
    jobs: Vec<BackupJobDefinition>,
}

pub fn parse_jobs(content: &str) -> anyhow::Result<Vec<BackupJobDefinition>> {
    let file: JobsFile = toml::from_str(content)?;
    Ok(file.jobs)
}

/// Load job definitions from a TOML file of `[[jobs]]` tables.
pub fn load_jobs_file(path: &Path) -> anyhow::Result<Vec<BackupJobDefinition>> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("cannot read jobs file {}: {e}", path.display()))?;
    parse_jobs(&content)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{self, Write};
    use std::sync::{Arc, Mutex};
    use tracing_subscriber::fmt::MakeWriter;

    #[test]
    fn test_parse_change_sources() {
        let sources = ChangeSource::parse_list("audit_log:event_timestamp, visits : created_at,").unwrap();
        assert_eq!(
            sources,
            vec![
                ChangeSource::new("audit_log", "event_timestamp"),
                ChangeSource::new("visits", "created_at"),
            ]
        );
        assert!(ChangeSource::parse_list("audit_log").is_err());
    }

    #[test]
    fn test_parse_jobs_file() {
        let jobs = parse_jobs(
            r#"
            [[jobs]]
            name = "nightly"
            schedule = "0 30 1 * * *"
            type = "FULL"
            retention_days = 14

            [[jobs]]
            name = "quarter_hourly"
            schedule = "0 */15 * * * *"
            type = "INCREMENTAL"
            retention_days = 2
            "#,
        )
        .unwrap();
        assert_eq!(jobs.len(), 2);
        assert_eq!(jobs[0].backup_type, BackupType::Full);
        assert_eq!(jobs[1].retention_days, 2);
    }

    #[test]
    fn test_unknown_type_rejected() {
        let result = parse_jobs(
            r#"
            [[jobs]]
            name = "bad"
            schedule = "0 0 * * * *"
            type = "SNAPSHOT"
            retention_days = 1
            "#,
        );
        assert!(result.is_err());
    }

    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<u8>>>);

    impl Write for Captured {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl<'a> MakeWriter<'a> for Captured {
        type Writer = Captured;

        fn make_writer(&'a self) -> Self::Writer {
            self.clone()
        }
    }

    #[test]
    fn test_unparseable_setting_warns_and_falls_back() {
        let captured = Captured::default();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(captured.clone())
            .with_ansi(false)
            .finish();

        let enabled = tracing::subscriber::with_default(subscriber, || {
            parse_or("BACKUP_SCHEDULER_ENABLED", Some("yes".into()), false)
        });
        assert!(!enabled);

        let logs = String::from_utf8(captured.0.lock().unwrap().clone()).unwrap();
        assert!(logs.contains("WARN"));
        assert!(logs.contains("BACKUP_SCHEDULER_ENABLED"));
        assert!(logs.contains("yes"));
    }

    #[test]
    fn test_parse_or_accepts_valid_values() {
        assert!(parse_or("BACKUP_SCHEDULER_ENABLED", Some(" true ".into()), false));
        assert_eq!(parse_or("BACKUP_POOL_SIZE", Some("8".into()), 4u32), 8);
        assert_eq!(parse_or("BACKUP_POOL_SIZE", None, 4u32), 4);
    }

    #[test]
    fn test_default_jobs_are_valid() {
        for job in default_jobs() {
            job.validate().unwrap();
        }
    }
}
