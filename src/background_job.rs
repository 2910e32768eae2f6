use crate::errors::QueueError;
use crate::queue::Queue;
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::future::Future;
use tracing::instrument;

/// Trait for defining background jobs that can be enqueued and executed asynchronously.
///
/// The job itself is the payload: it is stored as JSON and deserialized again
/// by [`Worker::for_job`](crate::Worker::for_job) before `run` is called.
/// Jobs materialized from a schedule carry the payload `{}`, so jobs meant to
/// be scheduled should deserialize from an empty object (a struct with braces
/// and only defaulted fields).
pub trait BackgroundJob: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Unique name of the task.
    ///
    /// This MUST be unique for the whole application.
    const JOB_TYPE: &'static str;

    /// The application data provided to this job at runtime.
    type Context: Clone + Send + Sync + 'static;

    /// Execute the task. This method should define its logic.
    fn run(&self, ctx: Self::Context) -> impl Future<Output = anyhow::Result<()>> + Send;

    /// Enqueue this job for background execution.
    ///
    /// Returns the id of the new job.
    #[instrument(name = "jobs.enqueue", skip(self, queue), fields(message = Self::JOB_TYPE))]
    fn enqueue<'a>(&'a self, queue: &'a Queue) -> BoxFuture<'a, Result<i64, QueueError>> {
        queue.add(Self::JOB_TYPE, self).boxed()
    }

    /// Run this job on a cron schedule.
    ///
    /// Returns the id of the schedule; registering again updates the expression.
    fn schedule<'a>(queue: &'a Queue, cron: &'a str) -> BoxFuture<'a, Result<i64, QueueError>> {
        queue.schedule(Self::JOB_TYPE, cron).boxed()
    }
}
