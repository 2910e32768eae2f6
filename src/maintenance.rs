use crate::config::QueueOptions;
use crate::errors::QueueError;
use crate::observer::{QueueObserver, notify};
use crate::storage;
use crate::util::{duration_millis, now_millis};
use sqlx::SqlitePool;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, warn};

/// Row counts affected by one maintenance sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    /// Jobs returned from `processing` to `pending`
    pub requeued: u64,
    /// Expired `done` jobs deleted
    pub done_removed: u64,
    /// Expired `failed` jobs deleted
    pub failed_removed: u64,
}

/// This is in charge of requeueing stuck jobs and pruning finished ones.
pub(crate) struct Maintenance {
    pool: SqlitePool,
    options: QueueOptions,
    observer: Arc<dyn QueueObserver>,
}

impl Maintenance {
    pub(crate) fn new(
        pool: SqlitePool,
        options: QueueOptions,
        observer: Arc<dyn QueueObserver>,
    ) -> Self {
        Self {
            pool,
            options,
            observer,
        }
    }

    pub(crate) fn options(&self) -> &QueueOptions {
        &self.options
    }

    pub(crate) async fn requeue_timed_out_jobs(&self, timeout: Duration) -> Result<u64, QueueError> {
        let cutoff = now_millis().saturating_sub(duration_millis(timeout));
        let count = storage::requeue_processing_jobs(&self.pool, cutoff).await?;
        if count > 0 {
            info!(count, "Requeued timed out jobs");
            notify("on_processing_jobs_requeued", || {
                self.observer.on_processing_jobs_requeued(count);
            });
        }
        Ok(count)
    }

    pub(crate) async fn remove_done_jobs(&self, older_than: Duration) -> Result<u64, QueueError> {
        let cutoff = now_millis().saturating_sub(duration_millis(older_than));
        let count = storage::delete_done_jobs(&self.pool, cutoff).await?;
        if count > 0 {
            debug!(count, "Removed done jobs");
            notify("on_done_jobs_removed", || self.observer.on_done_jobs_removed(count));
        }
        Ok(count)
    }

    pub(crate) async fn remove_failed_jobs(&self, older_than: Duration) -> Result<u64, QueueError> {
        let cutoff = now_millis().saturating_sub(duration_millis(older_than));
        let count = storage::delete_failed_jobs(&self.pool, cutoff).await?;
        if count > 0 {
            debug!(count, "Removed failed jobs");
            notify("on_failed_jobs_removed", || {
                self.observer.on_failed_jobs_removed(count);
            });
        }
        Ok(count)
    }

    /// One full sweep with the configured thresholds.
    pub(crate) async fn run_once(&self) -> Result<MaintenanceReport, QueueError> {
        Ok(MaintenanceReport {
            requeued: self
                .requeue_timed_out_jobs(self.options.processing_timeout)
                .await?,
            done_removed: self
                .remove_done_jobs(self.options.remove_done_jobs_older_than)
                .await?,
            failed_removed: self
                .remove_failed_jobs(self.options.remove_failed_jobs_older_than)
                .await?,
        })
    }

    /// Sweep every `maintenance_interval` until `shutdown` is cancelled.
    ///
    /// A zero interval disables the background sweep; `None` is returned and
    /// maintenance only runs when requested explicitly.
    pub(crate) fn start(self: Arc<Self>, shutdown: CancellationToken) -> Option<JoinHandle<()>> {
        let period = self.options.maintenance_interval;
        if period.is_zero() {
            debug!("Background maintenance disabled");
            return None;
        }

        let task = async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    () = shutdown.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                match self.run_once().await {
                    Ok(report) => debug!(?report, "Maintenance sweep finished"),
                    Err(error) => warn!("Maintenance sweep failed: {error}"),
                }
            }

            debug!("Maintenance task stopped");
        };

        Some(tokio::spawn(task.instrument(info_span!("queue_maintenance"))))
    }
}
