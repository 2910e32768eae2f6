use crate::background_job::BackgroundJob;
use crate::config::WorkerOptions;
use crate::errors::QueueError;
use crate::observer::{NoopObserver, WorkerObserver, notify};
use crate::queue::Queue;
use crate::scheduler;
use crate::schema::{Job, JobStatus};
use crate::util::try_to_extract_panic_info;
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use rand::Rng;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, trace, warn};

const DRAIN_CHECK_INTERVAL: Duration = Duration::from_millis(10);

/// Application code that processes one claimed job.
///
/// Implemented for every `Fn(Job) -> impl Future<Output = anyhow::Result<()>>`,
/// so plain async closures can be used as handlers.
pub trait JobHandler: Send + Sync + 'static {
    /// Process `job`. An error or a panic marks the job as failed.
    fn handle(&self, job: Job) -> BoxFuture<'static, anyhow::Result<()>>;
}

impl<F, Fut> JobHandler for F
where
    F: Fn(Job) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    fn handle(&self, job: Job) -> BoxFuture<'static, anyhow::Result<()>> {
        self(job).boxed()
    }
}

/// A polling loop bound to one job type.
///
/// Each iteration first materializes at most one due schedule (of any type),
/// then claims and runs at most one job of its own type, and sleeps for the
/// poll interval if neither found anything. One worker runs one job at a time;
/// run several workers against the same queue to scale out.
#[derive(Clone)]
pub struct Worker {
    queue: Queue,
    job_type: String,
    handler: Arc<dyn JobHandler>,
    observer: Arc<dyn WorkerObserver>,
    options: WorkerOptions,
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("job_type", &self.job_type)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl Worker {
    /// Create a worker that runs `handler` for jobs of `job_type`.
    pub fn new(queue: Queue, job_type: impl Into<String>, handler: impl JobHandler) -> Self {
        Self {
            queue,
            job_type: job_type.into(),
            handler: Arc::new(handler),
            observer: Arc::new(NoopObserver),
            options: WorkerOptions::default(),
        }
    }

    /// Create a worker for a typed [`BackgroundJob`].
    ///
    /// The payload is deserialized into `J` and `J::run` is called with a
    /// clone of `context`.
    pub fn for_job<J: BackgroundJob>(queue: Queue, context: J::Context) -> Self {
        Self::new(queue, J::JOB_TYPE, move |job: Job| {
            let context = context.clone();
            async move {
                let payload: J = job.json_data()?;
                payload.run(context).await
            }
        })
    }

    /// Replace all loop options at once.
    pub fn options(mut self, options: WorkerOptions) -> Self {
        self.options = options;
        self
    }

    /// Set how long to sleep when no work was found.
    pub fn poll_interval(mut self, poll_interval: Duration) -> Self {
        self.options.poll_interval = poll_interval;
        self
    }

    /// Set the maximum random jitter to add to poll intervals.
    ///
    /// Jitter helps reduce thundering herd effects when multiple workers
    /// are polling for jobs simultaneously. The actual jitter applied will
    /// be a random value between 0 and the specified duration.
    pub fn jitter(mut self, jitter: Duration) -> Self {
        self.options.jitter = jitter;
        self
    }

    /// Receive per-job notifications.
    pub fn observer(mut self, observer: impl WorkerObserver) -> Self {
        self.observer = Arc::new(observer);
        self
    }

    /// The job type this worker claims.
    pub fn job_type(&self) -> &str {
        &self.job_type
    }

    /// Spawn the poll loop on the Tokio runtime.
    pub fn start(self) -> WorkerHandle {
        let name = format!("background-worker-{}", self.job_type);
        let shutdown = CancellationToken::new();
        let handle = self.spawn(name, shutdown.clone());
        WorkerHandle { shutdown, handle }
    }

    pub(crate) fn spawn(self, name: String, shutdown: CancellationToken) -> JoinHandle<()> {
        info!(worker.name = %name, "Starting worker…");
        let span = info_span!("worker", worker.name = %name);
        tokio::spawn(async move { self.run(shutdown).await }.instrument(span))
    }

    /// Calculate the sleep duration with random jitter applied.
    fn sleep_duration_with_jitter(&self) -> Duration {
        let WorkerOptions {
            poll_interval,
            jitter,
        } = self.options;
        if jitter.is_zero() {
            return poll_interval;
        }

        let jitter_millis = u64::try_from(jitter.as_millis()).unwrap_or(u64::MAX);
        let random_jitter = rand::thread_rng().gen_range(0..=jitter_millis);
        poll_interval + Duration::from_millis(random_jitter)
    }

    /// Poll until `shutdown` is cancelled.
    ///
    /// Cancellation never interrupts a running handler; it ends the loop after
    /// the current iteration and cuts an idle sleep short.
    pub async fn run(&self, shutdown: CancellationToken) {
        while !shutdown.is_cancelled() {
            let sleep_duration = match self.run_once().await {
                Ok(true) => continue,
                Ok(false) => {
                    let sleep_duration = self.sleep_duration_with_jitter();
                    trace!("No pending jobs found. Polling again in {sleep_duration:?}…");
                    sleep_duration
                }
                Err(error) => {
                    error!("Failed to poll for jobs: {error}");
                    self.sleep_duration_with_jitter()
                }
            };

            tokio::select! {
                () = shutdown.cancelled() => break,
                () = sleep(sleep_duration) => {}
            }
        }

        debug!("Worker stopped");
    }

    /// Run one iteration of the loop without sleeping.
    ///
    /// Returns whether a schedule was materialized or a job was processed.
    /// A failure to materialize schedules is logged and does not keep the
    /// worker from claiming its own jobs.
    pub async fn run_once(&self) -> Result<bool, QueueError> {
        let materialized = match scheduler::materialize_next_due(&self.queue).await {
            Ok(job_id) => job_id.is_some(),
            Err(error) => {
                error!("Failed to materialize scheduled job: {error}");
                false
            }
        };
        let processed = self.run_next_job().await?.is_some();
        Ok(materialized || processed)
    }

    /// Run the next job in the queue, if there is one.
    ///
    /// Returns:
    /// - `Ok(Some(job_id))` if a job was run, whatever its outcome
    /// - `Ok(None)` if no jobs were waiting
    /// - `Err(...)` if there was an error claiming the job or recording the outcome
    async fn run_next_job(&self) -> Result<Option<i64>, QueueError> {
        trace!("Looking for next job…");

        let Some(job) = self
            .queue
            .get_and_mark_job_as_processing(&self.job_type)
            .await?
        else {
            return Ok(None);
        };

        let span = info_span!("job", job.id = %job.id, job.type = %job.job_type);

        async {
            debug!("Running job…");
            notify("on_processing", || self.observer.on_processing(&job));

            // Calling the handler may panic before its future exists
            let result = AssertUnwindSafe(async { self.handler.handle(job.clone()).await })
                .catch_unwind()
                .await
                .map_err(|e| try_to_extract_panic_info(&*e))
                .and_then(std::convert::identity);

            match result {
                Ok(()) => {
                    self.queue.mark_job_as_done(job.id).await?;
                    debug!(status = %JobStatus::Done, "Job completed");
                    notify("on_completed", || self.observer.on_completed(&job));
                }
                Err(error) => {
                    warn!("Failed to run job: {error}");
                    let message = format!("{error:?}");
                    self.queue.mark_job_as_failed(job.id, &message).await?;
                    notify("on_failed", || self.observer.on_failed(&job, &message));
                }
            }

            Ok::<_, QueueError>(Some(job.id))
        }
        .instrument(span)
        .await
    }
}

/// Handle to a spawned [`Worker`].
#[derive(Debug)]
pub struct WorkerHandle {
    shutdown: CancellationToken,
    handle: JoinHandle<()>,
}

impl WorkerHandle {
    /// A token that stops the worker when cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Whether the loop has exited.
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Ask the worker to stop and wait until its loop has exited.
    ///
    /// An idle worker stops immediately; a busy one finishes its current job first.
    pub async fn stop(self) {
        self.shutdown.cancel();
        self.wait_for_shutdown().await;
    }

    /// Wait for the loop to exit without asking it to.
    pub async fn wait_for_shutdown(self) {
        if let Err(error) = self.handle.await {
            warn!(%error, "Background worker task panicked");
        }
    }
}

/// Run `worker` until no job is `pending` or `processing`, then stop it.
///
/// Counts cover every job type in the queue. Fails with
/// [`QueueError::DrainTimeout`] if the queue does not drain within `timeout`;
/// the worker is stopped in either case.
pub async fn process_all(queue: &Queue, worker: Worker, timeout: Duration) -> Result<(), QueueError> {
    let handle = worker.start();
    let drained = tokio::time::timeout(timeout, wait_until_drained(queue)).await;
    handle.stop().await;

    match drained {
        Ok(result) => result,
        Err(_) => Err(QueueError::DrainTimeout(timeout)),
    }
}

async fn wait_until_drained(queue: &Queue) -> Result<(), QueueError> {
    loop {
        let pending = queue.count_jobs(JobStatus::Pending).await?;
        let processing = queue.count_jobs(JobStatus::Processing).await?;
        if pending + processing == 0 {
            return Ok(());
        }
        sleep(DRAIN_CHECK_INTERVAL).await;
    }
}
