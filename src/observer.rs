//! Synchronous notification hooks for queue maintenance and job outcomes.
//!
//! Every method has a no-op default, so implementors only override what they
//! care about. A panicking observer is caught and logged; it never takes down
//! the maintenance task or a worker loop.

use crate::schema::Job;
use std::panic::{self, AssertUnwindSafe};
use tracing::error;

/// Receives the results of maintenance sweeps.
///
/// Methods are only called when the affected row count is non-zero.
pub trait QueueObserver: Send + Sync + 'static {
    /// Jobs stuck in `processing` past the timeout were returned to `pending`.
    fn on_processing_jobs_requeued(&self, _count: u64) {}

    /// Expired `done` jobs were deleted.
    fn on_done_jobs_removed(&self, _count: u64) {}

    /// Expired `failed` jobs were deleted.
    fn on_failed_jobs_removed(&self, _count: u64) {}
}

/// Receives per-job events from a [`Worker`](crate::Worker).
pub trait WorkerObserver: Send + Sync + 'static {
    /// The job was claimed and its handler is about to run.
    fn on_processing(&self, _job: &Job) {}

    /// The handler succeeded and the job is marked `done`.
    fn on_completed(&self, _job: &Job) {}

    /// The handler failed and the job is marked `failed` with `error`.
    fn on_failed(&self, _job: &Job, _error: &str) {}
}

/// Observer that ignores every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopObserver;

impl QueueObserver for NoopObserver {}

impl WorkerObserver for NoopObserver {}

/// Runs an observer callback, logging instead of unwinding if it panics.
pub(crate) fn notify(callback: &'static str, f: impl FnOnce()) {
    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(f)) {
        let error = crate::util::try_to_extract_panic_info(&*payload);
        error!(callback, "Observer callback {error}");
    }
}
