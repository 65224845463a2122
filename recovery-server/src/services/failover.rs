use chrono::Utc;
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use super::backup_pipeline::BackupPipeline;
use super::catalog::{with_catalog, Catalog};
use super::restore_pipeline::RestorePipeline;
use super::source::DataSource;
use crate::error::BackupError;
use crate::models::failover::{CheckResult, CheckStatus, FailoverReport};
use crate::models::format_timestamp;
use crate::models::job::{BackupType, PROBE_JOB_NAME};

pub const CONNECTIVITY_CHECK: &str = "Primary Database";
pub const LATEST_BACKUP_CHECK: &str = "Latest Backup";
pub const ROUND_TRIP_CHECK: &str = "Backup/Restore Capability";
pub const RTO_CHECK: &str = "Recovery Time Objective";

/// Runs a blocking probe against the primary store with a deadline.
async fn probe<T, F>(timeout: Duration, f: F) -> Result<T, String>
where
    T: Send + 'static,
    F: FnOnce() -> anyhow::Result<T> + Send + 'static,
{
    match tokio::time::timeout(timeout, tokio::task::spawn_blocking(f)).await {
        Ok(Ok(Ok(value))) => Ok(value),
        Ok(Ok(Err(e))) => Err(format!("{e:#}")),
        Ok(Err(e)) => Err(format!("probe task failed: {e}")),
        Err(_) => Err(format!("timed out after {} ms", timeout.as_millis())),
    }
}

fn elapsed_ms(start: Instant) -> u64 {
    start.elapsed().as_millis() as u64
}

pub struct FailoverVerifier {
    source: Arc<dyn DataSource>,
    catalog: Arc<dyn Catalog>,
    pipeline: Arc<BackupPipeline>,
    restore: RestorePipeline,
    rto_target: Duration,
    probe_timeout: Duration,
}

impl FailoverVerifier {
    pub fn new(
        source: Arc<dyn DataSource>,
        catalog: Arc<dyn Catalog>,
        pipeline: Arc<BackupPipeline>,
        restore: RestorePipeline,
        rto_target: Duration,
        probe_timeout: Duration,
    ) -> Self {
        Self {
            source,
            catalog,
            pipeline,
            restore,
            rto_target,
            probe_timeout,
        }
    }

    pub async fn test_failover(&self) -> FailoverReport {
        tracing::info!("Starting failover test");

        // The round trip writes its own artifact, so it runs after the
        // latest-artifact and recovery-time readings.
        let (connectivity, latest, rto) = tokio::join!(
            self.check_connectivity(),
            self.check_latest_backup(),
            self.check_rto(),
        );
        let round_trip = self.check_round_trip().await;

        let report = FailoverReport::from_checks(
            format_timestamp(Utc::now()),
            vec![connectivity, latest, round_trip, rto],
        );

        for test in &report.tests {
            tracing::info!(check = %test.name, status = ?test.status, time_ms = ?test.time_ms, "Failover check");
        }
        tracing::info!(overall = report.overall_status.as_str(), "Failover test finished");

        let logged = report.clone();
        if let Err(e) = with_catalog(&self.catalog, move |c| c.record_failover_test(&logged)).await {
            tracing::warn!(error = %e, "Failed to record failover test");
        }
        report
    }

    async fn check_connectivity(&self) -> CheckResult {
        let source = self.source.clone();
        let start = Instant::now();
        match probe(self.probe_timeout, move || source.ping()).await {
            Ok(()) => CheckResult::new(CONNECTIVITY_CHECK, CheckStatus::Available).with_time(elapsed_ms(start)),
            Err(e) => CheckResult::new(CONNECTIVITY_CHECK, CheckStatus::Unavailable)
                .with_time(elapsed_ms(start))
                .with_error(e),
        }
    }

    async fn check_latest_backup(&self) -> CheckResult {
        match self.pipeline.latest_backup().await {
            Ok(Some(artifact)) => {
                let age = SystemTime::now()
                    .duration_since(artifact.modified)
                    .unwrap_or_default();
                CheckResult::new(LATEST_BACKUP_CHECK, CheckStatus::Available).with_details(json!({
                    "backupId": artifact.backup_id,
                    "sizeBytes": artifact.size,
                    "ageHours": age.as_secs_f64() / 3600.0,
                }))
            }
            Ok(None) => CheckResult::new(LATEST_BACKUP_CHECK, CheckStatus::NotFound),
            Err(e) => CheckResult::new(LATEST_BACKUP_CHECK, CheckStatus::Error).with_error(e.to_string()),
        }
    }

    /// Disposable incremental backup, decoded and then removed again.
    async fn check_round_trip(&self) -> CheckResult {
        let start = Instant::now();
        let outcome = match self
            .pipeline
            .perform_backup(PROBE_JOB_NAME, BackupType::Incremental, 1)
            .await
        {
            Ok(backup) => {
                let verified = self.restore.verify_artifact(&backup.backup_id).await;
                self.discard_probe(&backup.backup_id).await;
                verified.and_then(|report| {
                    if report.timestamp.is_empty() {
                        Err(BackupError::Integrity("probe payload has no timestamp".into()))
                    } else {
                        Ok(report)
                    }
                })
            }
            Err(e) => {
                self.discard_probe(&e.backup_id).await;
                Err(e.source)
            }
        };

        match outcome {
            Ok(report) => CheckResult::new(ROUND_TRIP_CHECK, CheckStatus::Operational)
                .with_time(elapsed_ms(start))
                .with_details(json!({ "backupType": report.backup_type, "sizeBytes": report.size_bytes })),
            Err(e) => CheckResult::new(ROUND_TRIP_CHECK, CheckStatus::Failed)
                .with_time(elapsed_ms(start))
                .with_error(e.to_string()),
        }
    }

    async fn discard_probe(&self, backup_id: &str) {
        if backup_id.is_empty() {
            return;
        }
        if let Err(e) = self.pipeline.delete_backup(backup_id).await {
            tracing::warn!(backup_id = %backup_id, error = %e, "Failed to discard failover probe");
        }
    }

    /// Times a structure-plus-first-row read of every table, the read path
    /// a recovery starts with.
    async fn check_rto(&self) -> CheckResult {
        let source = self.source.clone();
        let start = Instant::now();
        let result = probe(self.probe_timeout, move || {
            let tables = source.list_tables()?;
            for table in &tables {
                source.table_structure(table)?;
                source.read_rows(table, 1)?;
            }
            Ok(tables.len())
        })
        .await;
        let time_ms = elapsed_ms(start);
        let target_ms = self.rto_target.as_millis() as u64;

        match result {
            Ok(tables) => {
                let status = if time_ms < target_ms {
                    CheckStatus::MeetsTarget
                } else {
                    CheckStatus::ExceedsTarget
                };
                CheckResult::new(RTO_CHECK, status)
                    .with_time(time_ms)
                    .with_details(json!({ "targetMs": target_ms, "tables": tables }))
            }
            Err(e) => CheckResult::new(RTO_CHECK, CheckStatus::Failed)
                .with_time(time_ms)
                .with_error(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ChangeSource;
    use crate::models::backup_run;
    use crate::models::failover::OverallStatus;
    use crate::models::payload::{ColumnInfo, Row};
    use crate::services::source::TableRef;
    use crate::testutil;

    fn verifier(h: &testutil::Harness, source: Arc<dyn DataSource>, probe_timeout: Duration) -> FailoverVerifier {
        FailoverVerifier::new(
            source,
            h.catalog.clone(),
            h.pipeline.clone(),
            h.restore.clone(),
            Duration::from_secs(5),
            probe_timeout,
        )
    }

    #[tokio::test]
    async fn test_healthy_system_passes() {
        let h = testutil::harness();
        let existing = h.pipeline.perform_backup("daily_full", BackupType::Full, 30).await.unwrap();

        let report = verifier(&h, h.source.clone(), Duration::from_secs(5)).test_failover().await;
        assert_eq!(report.overall_status, OverallStatus::Passed);
        assert_eq!(report.tests.len(), 4);
        assert!(report.tests.iter().all(|t| !t.status.is_failure()));
        assert_eq!(report.tests[0].status, CheckStatus::Available);
        assert_eq!(report.tests[2].status, CheckStatus::Operational);
        assert_eq!(report.tests[3].status, CheckStatus::MeetsTarget);

        // Probe artifact and row are gone, the real backup stays
        let ids: Vec<String> = h.store.list().unwrap().into_iter().map(|a| a.backup_id).collect();
        assert_eq!(ids, vec![existing.backup_id]);
        assert!(h
            .catalog
            .recent(10)
            .unwrap()
            .iter()
            .all(|r| r.backup_name != PROBE_JOB_NAME));

        let conn = h.catalog_pool.get().unwrap();
        assert_eq!(backup_run::count_failover_tests(&conn).unwrap(), 1);
    }

    #[tokio::test]
    async fn test_latest_check_ignores_round_trip_artifact() {
        let h = testutil::harness();
        let report = verifier(&h, h.source.clone(), Duration::from_secs(5)).test_failover().await;

        assert_eq!(report.tests[1].name, LATEST_BACKUP_CHECK);
        assert_eq!(report.tests[1].status, CheckStatus::NotFound);
        assert!(report.tests[1].details.is_null());
        assert_eq!(report.tests[2].status, CheckStatus::Operational);
        assert!(h.store.list().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unreachable_store_fails() {
        let h = testutil::harness_with_source(Arc::new(testutil::FailingSource));
        let report = verifier(&h, Arc::new(testutil::FailingSource), Duration::from_secs(5))
            .test_failover()
            .await;

        assert_eq!(report.tests[0].status, CheckStatus::Unavailable);
        assert_eq!(report.tests[1].status, CheckStatus::NotFound);
        assert_eq!(report.tests[2].status, CheckStatus::Failed);
        assert_eq!(report.tests[3].status, CheckStatus::Failed);
        assert_eq!(report.overall_status, OverallStatus::Failed);
        assert!(h.catalog.recent(10).unwrap().is_empty());
    }

    struct SlowSource;

    impl DataSource for SlowSource {
        fn ping(&self) -> anyhow::Result<()> {
            std::thread::sleep(Duration::from_millis(300));
            Ok(())
        }
        fn query(&self, _sql: &str) -> anyhow::Result<Vec<Row>> {
            Ok(Vec::new())
        }
        fn list_tables(&self) -> anyhow::Result<Vec<TableRef>> {
            Ok(Vec::new())
        }
        fn table_structure(&self, _table: &TableRef) -> anyhow::Result<Vec<ColumnInfo>> {
            Ok(Vec::new())
        }
        fn read_rows(&self, _table: &TableRef, _limit: usize) -> anyhow::Result<Vec<Row>> {
            Ok(Vec::new())
        }
        fn rows_changed_between(&self, _s: &ChangeSource, _since: &str, _until: &str) -> anyhow::Result<Vec<Row>> {
            Ok(Vec::new())
        }
        fn version(&self) -> anyhow::Result<String> {
            Ok("slow".into())
        }
    }

    #[tokio::test]
    async fn test_connectivity_probe_times_out() {
        let h = testutil::harness();
        let check = verifier(&h, Arc::new(SlowSource), Duration::from_millis(50))
            .check_connectivity()
            .await;
        assert_eq!(check.status, CheckStatus::Unavailable);
        assert!(check.error.unwrap().contains("timed out"));
    }
}
