use crate::config::QueueOptions;
use crate::database::setup_database;
use crate::errors::QueueError;
use crate::maintenance::{Maintenance, MaintenanceReport};
use crate::observer::{NoopObserver, QueueObserver};
use crate::scheduler::{CronSchedule, PARKED_NEXT_RUN};
use crate::schema::{Job, JobFilter, ScheduledJob};
use crate::storage;
use crate::util::now_millis;
use serde::Serialize;
use sqlx::SqlitePool;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Handle to the persisted job queue.
///
/// Every operation is safe to call concurrently, from any number of clones,
/// tasks or processes sharing the same database file: claims are decided by
/// the database, not by this process.
///
/// The queue owns a background maintenance task from construction until
/// [`Queue::close`] (or until the last clone is dropped).
#[derive(Clone)]
pub struct Queue {
    inner: Arc<QueueInner>,
}

struct QueueInner {
    pool: SqlitePool,
    maintenance: Arc<Maintenance>,
    shutdown: CancellationToken,
    maintenance_task: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for QueueInner {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

impl std::fmt::Debug for Queue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Queue")
            .field("options", self.options())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

/// Builder for a [`Queue`].
pub struct QueueBuilder {
    pool: SqlitePool,
    options: QueueOptions,
    observer: Arc<dyn QueueObserver>,
}

impl std::fmt::Debug for QueueBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueBuilder")
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl QueueBuilder {
    /// Replace all options at once.
    pub fn options(mut self, options: QueueOptions) -> Self {
        self.options = options;
        self
    }

    /// Set how often the maintenance sweep runs. Zero disables it.
    pub fn maintenance_interval(mut self, interval: Duration) -> Self {
        self.options.maintenance_interval = interval;
        self
    }

    /// Set how long a job may stay claimed before it is requeued.
    pub fn processing_timeout(mut self, timeout: Duration) -> Self {
        self.options.processing_timeout = timeout;
        self
    }

    /// Set how long `done` jobs are kept.
    pub fn remove_done_jobs_older_than(mut self, retention: Duration) -> Self {
        self.options.remove_done_jobs_older_than = retention;
        self
    }

    /// Set how long `failed` jobs are kept.
    pub fn remove_failed_jobs_older_than(mut self, retention: Duration) -> Self {
        self.options.remove_failed_jobs_older_than = retention;
        self
    }

    /// Receive maintenance notifications.
    pub fn observer(mut self, observer: impl QueueObserver) -> Self {
        self.observer = Arc::new(observer);
        self
    }

    /// Apply migrations and start the maintenance task.
    ///
    /// Must be called from within a Tokio runtime.
    pub async fn build(self) -> Result<Queue, QueueError> {
        setup_database(&self.pool).await?;

        let maintenance = Arc::new(Maintenance::new(
            self.pool.clone(),
            self.options,
            self.observer,
        ));
        let shutdown = CancellationToken::new();
        let maintenance_task = maintenance.clone().start(shutdown.clone());

        Ok(Queue {
            inner: Arc::new(QueueInner {
                pool: self.pool,
                maintenance,
                shutdown,
                maintenance_task: Mutex::new(maintenance_task),
            }),
        })
    }
}

impl Queue {
    /// Start configuring a queue on top of `pool`.
    pub fn builder(pool: SqlitePool) -> QueueBuilder {
        QueueBuilder {
            pool,
            options: QueueOptions::default(),
            observer: Arc::new(NoopObserver),
        }
    }

    /// Create a queue with default options.
    pub async fn new(pool: SqlitePool) -> Result<Self, QueueError> {
        Self::builder(pool).build().await
    }

    /// The underlying connection pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.inner.pool
    }

    /// The options this queue was built with.
    pub fn options(&self) -> &QueueOptions {
        self.inner.maintenance.options()
    }

    /// Serialize `data` as JSON and enqueue a pending job of `job_type`.
    #[instrument(name = "queue.add", skip(self, data))]
    pub async fn add<T: Serialize + ?Sized>(
        &self,
        job_type: &str,
        data: &T,
    ) -> Result<i64, QueueError> {
        let data = serde_json::to_string(data)?;
        let id = storage::insert_job(&self.inner.pool, job_type, &data, now_millis()).await?;
        debug!(job.id = %id, "Enqueued job");
        Ok(id)
    }

    /// Register a recurring job of `job_type` firing on `cron`.
    ///
    /// The expression is validated before anything is written. Registering an
    /// existing type again only replaces its cron expression and returns the
    /// existing id. A new schedule is due immediately, and so is one that was
    /// parked because its previous expression could not be evaluated.
    #[instrument(name = "queue.schedule", skip(self))]
    pub async fn schedule(&self, job_type: &str, cron: &str) -> Result<i64, QueueError> {
        CronSchedule::parse(cron)?;
        let id = storage::upsert_scheduled_job(
            &self.inner.pool,
            job_type,
            cron,
            now_millis(),
            PARKED_NEXT_RUN,
        )
        .await?;
        info!(scheduled_job.id = %id, "Registered scheduled job");
        Ok(id)
    }

    /// Count jobs matching `filter`; `JobFilter::new()` counts everything.
    pub async fn count_jobs(&self, filter: impl Into<JobFilter>) -> Result<i64, QueueError> {
        Ok(storage::count_jobs(&self.inner.pool, &filter.into()).await?)
    }

    /// Look up a job by id.
    pub async fn get_job_by_id(&self, id: i64) -> Result<Option<Job>, QueueError> {
        Ok(storage::find_job(&self.inner.pool, id).await?)
    }

    /// Distinct job types currently stored, sorted.
    pub async fn get_job_types(&self) -> Result<Vec<String>, QueueError> {
        Ok(storage::job_types(&self.inner.pool).await?)
    }

    /// All schedules in registration order.
    pub async fn get_scheduled_jobs(&self) -> Result<Vec<ScheduledJob>, QueueError> {
        Ok(storage::list_scheduled_jobs(&self.inner.pool).await?)
    }

    /// Look up a schedule by id.
    pub async fn get_scheduled_job_by_id(
        &self,
        id: i64,
    ) -> Result<Option<ScheduledJob>, QueueError> {
        Ok(storage::find_scheduled_job(&self.inner.pool, id).await?)
    }

    /// Atomically claim the oldest pending job of `job_type`.
    ///
    /// Returns `None` without writing anything when no job is pending. No two
    /// callers, in this process or another, ever receive the same job.
    pub async fn get_and_mark_job_as_processing(
        &self,
        job_type: &str,
    ) -> Result<Option<Job>, QueueError> {
        let mut tx = self.inner.pool.begin().await?;
        let job = storage::claim_next_job(&mut *tx, job_type, now_millis()).await?;
        tx.commit().await?;
        Ok(job)
    }

    /// Atomically claim the idle schedule that has been due the longest.
    pub async fn get_and_mark_scheduled_job_as_processing(
        &self,
    ) -> Result<Option<ScheduledJob>, QueueError> {
        let mut tx = self.inner.pool.begin().await?;
        let scheduled = storage::claim_next_scheduled_job(&mut *tx, now_millis()).await?;
        tx.commit().await?;
        Ok(scheduled)
    }

    /// Return jobs claimed longer than `timeout` ago to `pending`.
    pub async fn requeue_timed_out_jobs(&self, timeout: Duration) -> Result<u64, QueueError> {
        self.inner.maintenance.requeue_timed_out_jobs(timeout).await
    }

    /// Delete `done` jobs created more than `older_than` ago.
    pub async fn remove_done_jobs(&self, older_than: Duration) -> Result<u64, QueueError> {
        self.inner.maintenance.remove_done_jobs(older_than).await
    }

    /// Delete `failed` jobs that failed more than `older_than` ago.
    pub async fn remove_failed_jobs(&self, older_than: Duration) -> Result<u64, QueueError> {
        self.inner.maintenance.remove_failed_jobs(older_than).await
    }

    /// Run one maintenance sweep now, with the configured thresholds.
    pub async fn run_maintenance(&self) -> Result<MaintenanceReport, QueueError> {
        self.inner.maintenance.run_once().await
    }

    /// Mark a job as successfully finished.
    pub async fn mark_job_as_done(&self, id: i64) -> Result<(), QueueError> {
        Ok(storage::mark_job_done(&self.inner.pool, id).await?)
    }

    /// Mark a job as failed, recording `error` and the failure time.
    pub async fn mark_job_as_failed(&self, id: i64, error: &str) -> Result<(), QueueError> {
        Ok(storage::mark_job_failed(&self.inner.pool, id, error, now_millis()).await?)
    }

    /// Re-arm a claimed schedule to fire at `next_run` (epoch milliseconds).
    pub async fn mark_scheduled_job_as_idle(
        &self,
        id: i64,
        next_run: i64,
    ) -> Result<(), QueueError> {
        Ok(storage::mark_scheduled_job_idle(&self.inner.pool, id, next_run).await?)
    }

    /// Whether [`Queue::close`] has been called.
    pub fn is_closed(&self) -> bool {
        self.inner.pool.is_closed()
    }

    /// Stop the maintenance task and close the connection pool.
    ///
    /// Subsequent operations fail with [`QueueError::DatabaseError`]. Calling
    /// `close` again is a no-op.
    pub async fn close(&self) {
        self.inner.shutdown.cancel();

        let task = self
            .inner
            .maintenance_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            if let Err(error) = task.await {
                warn!(%error, "Maintenance task panicked");
            }
        }

        self.inner.pool.close().await;
    }
}
