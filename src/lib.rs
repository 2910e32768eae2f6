#![doc = include_str!("../README.md")]
#![warn(missing_docs)]
#![forbid(unsafe_code)]

mod background_job;
mod config;
/// Connection setup and schema migrations.
pub mod database;
mod errors;
mod maintenance;
mod observer;
mod queue;
mod runner;
mod scheduler;
/// Database row types.
pub mod schema;
mod storage;
mod util;
mod worker;

/// The main trait for defining typed background jobs.
pub use self::background_job::BackgroundJob;
/// Queue and worker options.
pub use self::config::{QueueOptions, WorkerOptions};
/// Database helpers.
pub use self::database::{connect, open, setup_database};
/// Error type for every queue operation.
pub use self::errors::QueueError;
/// Result of a maintenance sweep.
pub use self::maintenance::MaintenanceReport;
/// Notification hooks.
pub use self::observer::{NoopObserver, QueueObserver, WorkerObserver};
/// The persisted queue.
pub use self::queue::{Queue, QueueBuilder};
/// Starts several workers at once.
pub use self::runner::{RunHandle, Runner};
/// Cron expression handling.
pub use self::scheduler::CronSchedule;
/// Row types and filters.
pub use self::schema::{Job, JobFilter, JobStatus, ScheduledJob, ScheduledJobStatus};
/// Polling workers.
pub use self::worker::{JobHandler, Worker, WorkerHandle, process_all};
