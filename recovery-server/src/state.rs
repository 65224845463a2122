use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::config::AppConfig;
use crate::crypto::ArtifactCipher;
use crate::db::connection::DbPool;
use crate::notify::EventBroadcaster;
use crate::services::backup_pipeline::BackupPipeline;
use crate::services::catalog::{Catalog, SqliteCatalog};
use crate::services::extract::Extractor;
use crate::services::failover::FailoverVerifier;
use crate::services::health_monitor::HealthMonitor;
use crate::services::restore_pipeline::{RestorePipeline, SqliteApplier};
use crate::services::scheduler::{SchedulerRegistry, Ticker};
use crate::services::source::{DataSource, SqliteSource};
use crate::services::storage::ArtifactStore;

/// Every service, built once at startup and shared by handle.
pub struct AppState {
    pub config: AppConfig,
    pub catalog_db: DbPool,
    pub source_db: DbPool,
    pub events: EventBroadcaster,
    pub catalog: Arc<dyn Catalog>,
    pub pipeline: Arc<BackupPipeline>,
    pub restore: RestorePipeline,
    pub failover: FailoverVerifier,
    pub health: Arc<HealthMonitor>,
    pub scheduler: SchedulerRegistry,
    pub cancel: CancellationToken,
}

impl AppState {
    /// Restores are applied to the primary store itself.
    pub fn new(config: AppConfig, catalog_db: DbPool, source_db: DbPool, ticker: Arc<dyn Ticker>) -> Self {
        let checkout = config.pool_checkout_timeout;
        let cancel = CancellationToken::new();
        let events = EventBroadcaster::new();

        let catalog: Arc<dyn Catalog> = Arc::new(SqliteCatalog::new(catalog_db.clone(), checkout));
        let source: Arc<dyn DataSource> = Arc::new(SqliteSource::new(source_db.clone(), checkout));
        let store = ArtifactStore::new(config.backups_dir.clone());
        let cipher = Arc::new(ArtifactCipher::new(&config.encryption_secret, config.kdf));

        let pipeline = Arc::new(BackupPipeline::new(
            catalog.clone(),
            Extractor::new(source.clone(), config.max_rows_per_table, config.change_sources.clone()),
            cipher.clone(),
            store.clone(),
            cancel.clone(),
        ));
        let restore = RestorePipeline::new(
            catalog.clone(),
            store,
            cipher,
            Arc::new(SqliteApplier::new(source_db.clone(), checkout)),
        );
        let failover = FailoverVerifier::new(
            source,
            catalog.clone(),
            pipeline.clone(),
            restore.clone(),
            config.rto_target,
            config.probe_timeout,
        );
        let health = Arc::new(HealthMonitor::new(
            catalog.clone(),
            Arc::new(events.clone()),
            config.expected_daily_backups,
            config.health_interval,
        ));
        let scheduler = SchedulerRegistry::new(pipeline.clone(), ticker, config.scheduler_enabled);

        Self {
            config,
            catalog_db,
            source_db,
            events,
            catalog,
            pipeline,
            restore,
            failover,
            health,
            scheduler,
            cancel,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{default_jobs, ChangeSource};
    use crate::db::connection::create_pool;
    use crate::db::migrate::migrate;
    use crate::models::failover::OverallStatus;
    use crate::services::scheduler::ManualTicker;
    use crate::testutil;
    use std::time::Duration;
    use tempfile::TempDir;

    fn config(dir: &TempDir) -> AppConfig {
        AppConfig {
            data_dir: dir.path().to_path_buf(),
            catalog_db_path: dir.path().join("catalog.db"),
            source_db_path: dir.path().join("primary.db"),
            backups_dir: dir.path().join("backups"),
            encryption_secret: "state-test".into(),
            kdf: testutil::cheap_kdf(),
            max_rows_per_table: 100,
            change_sources: vec![ChangeSource::new("events", "at")],
            scheduler_enabled: true,
            health_interval: Duration::from_secs(3600),
            expected_daily_backups: 25,
            rto_target: Duration::from_secs(5),
            probe_timeout: Duration::from_secs(5),
            pool_size: 2,
            pool_checkout_timeout: Duration::from_secs(2),
            jobs: default_jobs(),
        }
    }

    #[tokio::test]
    async fn test_wired_state_runs_end_to_end() {
        let dir = TempDir::new().unwrap();
        let config = config(&dir);
        let catalog_db = create_pool(&config.catalog_db_path, 2).unwrap();
        migrate(&catalog_db).unwrap();
        let source_db = create_pool(&config.source_db_path, 2).unwrap();
        source_db
            .get()
            .unwrap()
            .execute_batch(
                "CREATE TABLE events (id INTEGER PRIMARY KEY, at TEXT NOT NULL);
                 INSERT INTO events VALUES (1, '2024-01-01T00:00:00Z');",
            )
            .unwrap();

        let ticker = Arc::new(ManualTicker::new());
        let jobs = config.jobs.clone();
        let state = AppState::new(config, catalog_db, source_db, ticker.clone());
        assert_eq!(state.scheduler.register_all(jobs).await.unwrap(), 3);
        state.scheduler.start().await.unwrap();

        assert!(ticker.tick("hourly_incremental").await);
        let backup = state.scheduler.run_now("daily_full").await.unwrap();
        state.restore.verify_artifact(&backup.backup_id).await.unwrap();

        let report = state.failover.test_failover().await;
        assert_eq!(report.overall_status, OverallStatus::Passed);

        let status = state.pipeline.status(10).await.unwrap();
        assert_eq!(status.statistics.successful_backups, 2);
        state.scheduler.stop().await.unwrap();
    }
}
