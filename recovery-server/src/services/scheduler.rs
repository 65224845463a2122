//! Job registry and the tickers that drive it.

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};

use super::backup_pipeline::{BackupPipeline, BackupResult};
use crate::error::{BackupError, PipelineError};
use crate::models::job::BackupJobDefinition;

/// Work fired on each tick of a schedule.
pub type TickTask = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

/// Source of periodic triggers.
#[async_trait]
pub trait Ticker: Send + Sync {
    async fn attach(&self, name: &str, schedule: &str, task: TickTask) -> Result<(), BackupError>;
    async fn start(&self) -> Result<(), BackupError>;
    async fn stop(&self) -> Result<(), BackupError>;
}

/// Wall-clock cron triggers (six fields, seconds first).
pub struct CronTicker {
    scheduler: Mutex<JobScheduler>,
}

impl CronTicker {
    pub async fn new() -> Result<Self, BackupError> {
        let scheduler = JobScheduler::new()
            .await
            .map_err(|e| BackupError::Scheduler(e.to_string()))?;
        Ok(Self {
            scheduler: Mutex::new(scheduler),
        })
    }
}

#[async_trait]
impl Ticker for CronTicker {
    async fn attach(&self, name: &str, schedule: &str, task: TickTask) -> Result<(), BackupError> {
        let job = Job::new_async(schedule, move |_uuid, _lock| task())
            .map_err(|e| BackupError::InvalidJob(format!("job '{name}': bad schedule '{schedule}': {e}")))?;
        self.scheduler
            .lock()
            .await
            .add(job)
            .await
            .map_err(|e| BackupError::Scheduler(e.to_string()))?;
        tracing::info!(job = %name, cron = %schedule, "Job scheduled");
        Ok(())
    }

    async fn start(&self) -> Result<(), BackupError> {
        self.scheduler
            .lock()
            .await
            .start()
            .await
            .map_err(|e| BackupError::Scheduler(e.to_string()))
    }

    async fn stop(&self) -> Result<(), BackupError> {
        self.scheduler
            .lock()
            .await
            .shutdown()
            .await
            .map_err(|e| BackupError::Scheduler(e.to_string()))
    }
}

/// Ticks only when told to. Lets tests drive schedules without waiting.
#[derive(Default)]
pub struct ManualTicker {
    tasks: Mutex<BTreeMap<String, TickTask>>,
    running: Mutex<bool>,
}

impl ManualTicker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fires `name` once and waits for it. False when stopped or unknown.
    pub async fn tick(&self, name: &str) -> bool {
        if !*self.running.lock().await {
            return false;
        }
        let task = self.tasks.lock().await.get(name).cloned();
        match task {
            Some(task) => {
                task().await;
                true
            }
            None => false,
        }
    }

    pub async fn tick_all(&self) -> usize {
        let names: Vec<String> = self.tasks.lock().await.keys().cloned().collect();
        let mut fired = 0;
        for name in names {
            if self.tick(&name).await {
                fired += 1;
            }
        }
        fired
    }

    pub async fn attached(&self) -> usize {
        self.tasks.lock().await.len()
    }
}

#[async_trait]
impl Ticker for ManualTicker {
    async fn attach(&self, name: &str, _schedule: &str, task: TickTask) -> Result<(), BackupError> {
        self.tasks.lock().await.insert(name.to_string(), task);
        Ok(())
    }

    async fn start(&self) -> Result<(), BackupError> {
        *self.running.lock().await = true;
        Ok(())
    }

    async fn stop(&self) -> Result<(), BackupError> {
        *self.running.lock().await = false;
        Ok(())
    }
}

/// Owns the job definitions for the life of the process. When background
/// jobs are disabled, definitions are still registered (and can be run by
/// hand) but nothing is attached to the ticker.
pub struct SchedulerRegistry {
    jobs: Mutex<BTreeMap<String, BackupJobDefinition>>,
    pipeline: Arc<BackupPipeline>,
    ticker: Arc<dyn Ticker>,
    enabled: bool,
}

impl SchedulerRegistry {
    pub fn new(pipeline: Arc<BackupPipeline>, ticker: Arc<dyn Ticker>, enabled: bool) -> Self {
        Self {
            jobs: Mutex::new(BTreeMap::new()),
            pipeline,
            ticker,
            enabled,
        }
    }

    pub async fn register(&self, definition: BackupJobDefinition) -> Result<(), BackupError> {
        definition.validate()?;

        let mut jobs = self.jobs.lock().await;
        if jobs.contains_key(&definition.name) {
            return Err(BackupError::InvalidJob(format!(
                "job '{}' is already registered",
                definition.name
            )));
        }

        if self.enabled {
            self.ticker
                .attach(&definition.name, &definition.schedule, self.task_for(&definition))
                .await?;
        }

        tracing::info!(
            job = %definition.name,
            cron = %definition.schedule,
            kind = %definition.backup_type,
            retention_days = definition.retention_days,
            "Job registered"
        );
        jobs.insert(definition.name.clone(), definition);
        Ok(())
    }

    pub async fn register_all(&self, definitions: Vec<BackupJobDefinition>) -> Result<usize, BackupError> {
        let count = definitions.len();
        for definition in definitions {
            self.register(definition).await?;
        }
        tracing::info!(count, enabled = self.enabled, "Backup schedules initialized");
        Ok(count)
    }

    fn task_for(&self, definition: &BackupJobDefinition) -> TickTask {
        let pipeline = self.pipeline.clone();
        let definition = definition.clone();
        Arc::new(move || -> BoxFuture<'static, ()> {
            let pipeline = pipeline.clone();
            let definition = definition.clone();
            Box::pin(async move {
                if pipeline.is_running(&definition.name).await {
                    tracing::warn!(job = %definition.name, "Skipping scheduled run: job already running");
                    return;
                }
                tracing::info!(job = %definition.name, "Starting scheduled backup");
                if let Err(e) = pipeline
                    .perform_backup(&definition.name, definition.backup_type, definition.retention_days)
                    .await
                {
                    tracing::error!(job = %definition.name, backup_id = %e.backup_id, error = %e.source, "Scheduled backup failed");
                }
            })
        })
    }

    pub async fn start(&self) -> Result<(), BackupError> {
        if !self.enabled {
            tracing::info!("Background backup jobs disabled");
            return Ok(());
        }
        self.ticker.start().await?;
        tracing::info!("Backup scheduler started");
        Ok(())
    }

    pub async fn stop(&self) -> Result<(), BackupError> {
        if !self.enabled {
            return Ok(());
        }
        self.ticker.stop().await?;
        tracing::info!("Backup scheduler stopped");
        Ok(())
    }

    pub async fn definitions(&self) -> Vec<BackupJobDefinition> {
        self.jobs.lock().await.values().cloned().collect()
    }

    /// Runs a registered job now, outside its schedule.
    pub async fn run_now(&self, name: &str) -> Result<BackupResult, PipelineError> {
        let definition = self.jobs.lock().await.get(name).cloned();
        let Some(definition) = definition else {
            return Err(PipelineError {
                backup_id: String::new(),
                job_name: name.to_string(),
                source: BackupError::InvalidJob(format!("job '{name}' is not registered")),
            });
        };
        self.pipeline
            .perform_backup(&definition.name, definition.backup_type, definition.retention_days)
            .await
    }
}
