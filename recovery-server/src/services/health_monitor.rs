//! Periodic classification of backup health over the trailing 24 hours.

use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::catalog::{with_catalog, Catalog};
use crate::models::format_timestamp;
use crate::notify::NotificationSink;

pub const HEALTH_EVENT: &str = "backup:health";
pub const CRITICAL_EVENT: &str = "backup:critical";

const MISSING_CRITICAL_THRESHOLD: i64 = 5;
const FAILED_WARNING_THRESHOLD: i64 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HealthStatus {
    Healthy,
    Warning,
    Critical,
    Unknown,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub status: HealthStatus,
    pub last_backup: Option<String>,
    pub successful_backups: i64,
    pub failed_backups: i64,
    pub missing_backups: i64,
    pub checked_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Expected ticks that produced no run at all. This is not
/// `expected - successful`: failed runs are subtracted as well, so a failure
/// is counted once in `failed_backups` and never again as missing.
pub fn missing_backups(expected: i64, completed: i64, failed: i64) -> i64 {
    (expected - completed - failed).max(0)
}

pub fn classify(missing: i64, failed: i64) -> HealthStatus {
    if missing > MISSING_CRITICAL_THRESHOLD {
        HealthStatus::Critical
    } else if failed > FAILED_WARNING_THRESHOLD {
        HealthStatus::Warning
    } else {
        HealthStatus::Healthy
    }
}

pub struct HealthMonitor {
    catalog: Arc<dyn Catalog>,
    sink: Arc<dyn NotificationSink>,
    expected_daily: i64,
    interval: Duration,
}

impl HealthMonitor {
    pub fn new(
        catalog: Arc<dyn Catalog>,
        sink: Arc<dyn NotificationSink>,
        expected_daily: i64,
        interval: Duration,
    ) -> Self {
        Self {
            catalog,
            sink,
            expected_daily,
            interval,
        }
    }

    /// Classify and emit. Never remediates.
    pub async fn check(&self) -> HealthReport {
        let now = Utc::now();
        let since = now - chrono::Duration::hours(24);
        let report = match with_catalog(&self.catalog, move |c| c.health_window(since)).await {
            Ok(counts) => {
                let missing = missing_backups(self.expected_daily, counts.completed, counts.failed);
                HealthReport {
                    status: classify(missing, counts.failed),
                    last_backup: counts.last_completed_at,
                    successful_backups: counts.completed,
                    failed_backups: counts.failed,
                    missing_backups: missing,
                    checked_at: format_timestamp(now),
                    error: None,
                }
            }
            Err(e) => {
                tracing::error!(error = %e, "Backup health check failed");
                HealthReport {
                    status: HealthStatus::Unknown,
                    last_backup: None,
                    successful_backups: 0,
                    failed_backups: 0,
                    missing_backups: 0,
                    checked_at: format_timestamp(now),
                    error: Some(e.to_string()),
                }
            }
        };

        let payload = serde_json::to_value(&report).unwrap_or_default();
        self.sink.notify(HEALTH_EVENT, payload.clone());
        match report.status {
            HealthStatus::Critical => {
                tracing::error!(missing = report.missing_backups, failed = report.failed_backups, "Backup health CRITICAL");
                self.sink.notify(CRITICAL_EVENT, payload);
            }
            HealthStatus::Warning => {
                tracing::warn!(missing = report.missing_backups, failed = report.failed_backups, "Backup health WARNING");
            }
            _ => {
                tracing::info!(status = ?report.status, "Backup health checked");
            }
        }
        report
    }

    pub fn start(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        self.check().await;
                    }
                }
            }
            tracing::info!("Health monitor stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::job::BackupType;
    use crate::notify::EventBroadcaster;
    use crate::services::catalog::{NewRun, RunOutcome};
    use crate::testutil;

    fn seed(catalog: &dyn Catalog, completed: usize, failed: usize) {
        let now = Utc::now();
        for i in 0..(completed + failed) {
            let id = format!("job_{i}");
            catalog
                .append(&NewRun {
                    backup_id: id.clone(),
                    job_name: "job".into(),
                    backup_type: BackupType::Incremental,
                    started_at: now,
                })
                .unwrap();
            let outcome = if i < completed {
                RunOutcome::Completed {
                    completed_at: now,
                    size_bytes: 1,
                    duration_seconds: 0.1,
                    file_path: format!("{id}.backup"),
                    checksum: "x".into(),
                }
            } else {
                RunOutcome::Failed {
                    completed_at: now,
                    duration_seconds: 0.1,
                    error_message: "boom".into(),
                }
            };
            catalog.update_status(&id, &outcome).unwrap();
        }
    }

    #[test]
    fn test_classification_rules() {
        assert_eq!(classify(6, 0), HealthStatus::Critical);
        assert_eq!(classify(6, 9), HealthStatus::Critical);
        assert_eq!(classify(5, 3), HealthStatus::Warning);
        assert_eq!(classify(5, 2), HealthStatus::Healthy);
        assert_eq!(missing_backups(25, 30, 0), 0);
    }

    #[tokio::test]
    async fn test_warning_with_three_failures() {
        let (_dir, catalog) = testutil::catalog();
        seed(&catalog, 20, 3);
        let sink = EventBroadcaster::new();
        let monitor = HealthMonitor::new(Arc::new(catalog), Arc::new(sink.clone()), 25, Duration::from_secs(3600));

        let report = monitor.check().await;
        assert_eq!(report.missing_backups, 2);
        assert_eq!(report.failed_backups, 3);
        assert_eq!(report.successful_backups, 20);
        assert_eq!(report.status, HealthStatus::Warning);
        assert!(report.last_backup.is_some());

        let events = sink.recent(HEALTH_EVENT, 0);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].payload["status"], "WARNING");
        assert!(sink.recent(CRITICAL_EVENT, 0).is_empty());
    }

    #[tokio::test]
    async fn test_empty_catalog_escalates() {
        let (_dir, catalog) = testutil::catalog();
        let sink = EventBroadcaster::new();
        let monitor = HealthMonitor::new(Arc::new(catalog), Arc::new(sink.clone()), 25, Duration::from_secs(3600));

        let report = monitor.check().await;
        assert_eq!(report.status, HealthStatus::Critical);
        assert_eq!(report.missing_backups, 25);
        assert_eq!(sink.recent(CRITICAL_EVENT, 0).len(), 1);
    }

    #[tokio::test]
    async fn test_unreadable_catalog_is_unknown() {
        let sink = EventBroadcaster::new();
        let monitor = HealthMonitor::new(
            Arc::new(testutil::UnavailableCatalog),
            Arc::new(sink.clone()),
            25,
            Duration::from_secs(3600),
        );

        let report = monitor.check().await;
        assert_eq!(report.status, HealthStatus::Unknown);
        assert!(report.error.unwrap().contains("database is locked"));
        assert_eq!(sink.recent(HEALTH_EVENT, 0)[0].payload["status"], "UNKNOWN");
        assert!(sink.recent(CRITICAL_EVENT, 0).is_empty());
    }

    #[tokio::test]
    async fn test_healthy() {
        let (_dir, catalog) = testutil::catalog();
        seed(&catalog, 24, 1);
        let sink = EventBroadcaster::new();
        let monitor = HealthMonitor::new(Arc::new(catalog), Arc::new(sink), 25, Duration::from_secs(3600));
        assert_eq!(monitor.check().await.status, HealthStatus::Healthy);
    }

    #[tokio::test]
    async fn test_loop_emits_until_cancelled() {
        let (_dir, catalog) = testutil::catalog();
        let sink = EventBroadcaster::new();
        let mut rx = sink.subscribe();
        let monitor = Arc::new(HealthMonitor::new(
            Arc::new(catalog),
            Arc::new(sink),
            1,
            Duration::from_millis(20),
        ));

        let cancel = CancellationToken::new();
        let handle = monitor.start(cancel.clone());
        let first = rx.recv().await.unwrap();
        assert_eq!(first.event_type, HEALTH_EVENT);

        cancel.cancel();
        handle.await.unwrap();
    }
}
