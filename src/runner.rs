use crate::background_job::BackgroundJob;
use crate::config::WorkerOptions;
use crate::queue::Queue;
use crate::worker::Worker;
use futures_util::future::join_all;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Starts and stops a set of workers sharing one queue.
///
/// Each registered worker can run as several independent instances; they
/// coordinate only through the queue's atomic claims.
pub struct Runner {
    queue: Queue,
    workers: Vec<(Worker, usize)>,
    options: WorkerOptions,
}

impl std::fmt::Debug for Runner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runner")
            .field(
                "workers",
                &self
                    .workers
                    .iter()
                    .map(|(worker, count)| (worker.job_type(), count))
                    .collect::<Vec<_>>(),
            )
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl Runner {
    /// Create a runner for `queue` with no workers.
    pub fn new(queue: Queue) -> Self {
        Self {
            queue,
            workers: Vec::new(),
            options: WorkerOptions::default(),
        }
    }

    /// Set how often workers registered through [`Runner::register`] poll for new jobs.
    pub fn poll_interval(mut self, poll_interval: Duration) -> Self {
        self.options.poll_interval = poll_interval;
        self
    }

    /// Set the jitter of workers registered through [`Runner::register`].
    pub fn jitter(mut self, jitter: Duration) -> Self {
        self.options.jitter = jitter;
        self
    }

    /// Run `num_workers` instances of a typed job's worker.
    pub fn register<J: BackgroundJob>(self, context: J::Context, num_workers: usize) -> Self {
        let worker =
            Worker::for_job::<J>(self.queue.clone(), context).options(self.options.clone());
        self.add_worker(worker, num_workers)
    }

    /// Run `num_workers` instances of an already configured worker.
    pub fn add_worker(mut self, worker: Worker, num_workers: usize) -> Self {
        self.workers.push((worker, num_workers));
        self
    }

    /// Start the background workers.
    ///
    /// This returns a `RunHandle` which can be used to stop the workers or wait for them.
    pub fn start(self) -> RunHandle {
        let shutdown = CancellationToken::new();
        let mut handles = Vec::new();

        for (worker, num_workers) in self.workers {
            for i in 1..=num_workers {
                let name = format!("background-worker-{}-{i}", worker.job_type());
                handles.push(worker.clone().spawn(name, shutdown.child_token()));
            }
        }

        RunHandle { shutdown, handles }
    }
}

/// Handle to the workers started by a [`Runner`]
#[derive(Debug)]
pub struct RunHandle {
    shutdown: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl RunHandle {
    /// Number of worker instances started.
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    /// Whether no worker was started.
    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// A token that stops every worker when cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Stop all workers and wait until every loop has exited.
    pub async fn stop(self) {
        self.shutdown.cancel();
        self.wait_for_shutdown().await;
    }

    /// Wait for all background workers to shut down.
    pub async fn wait_for_shutdown(self) {
        join_all(self.handles).await.into_iter().for_each(|result| {
            if let Err(error) = result {
                warn!(%error, "Background worker task panicked");
            }
        });
    }
}
