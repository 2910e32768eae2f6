//! Database row types for the job queue.
//!
//! Both tables store timestamps as milliseconds since the Unix epoch. Status
//! columns are `TEXT` in the database and closed enums here.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::fmt;

/// Lifecycle of a one-off [`Job`].
///
/// Jobs move forward `Pending -> Processing -> Done | Failed`. The only way back
/// is the maintenance sweep returning a timed-out `Processing` job to `Pending`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum JobStatus {
    /// Waiting to be claimed by a worker
    Pending,
    /// Claimed by a worker and currently running
    Processing,
    /// Finished successfully
    Done,
    /// The handler returned an error or panicked
    Failed,
}

impl JobStatus {
    /// The value stored in the `status` column.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }

    /// Whether the job will not be touched again except by retention pruning.
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle of a [`ScheduledJob`] tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum ScheduledJobStatus {
    /// Eligible to fire once `next_run` has passed
    Idle,
    /// A worker claimed the current tick and is re-arming the schedule
    Processing,
}

impl ScheduledJobStatus {
    /// The value stored in the `status` column.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Processing => "processing",
        }
    }
}

impl fmt::Display for ScheduledJobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Represents a one-off job record in the database
#[derive(Debug, Clone, PartialEq, Eq, Serialize, FromRow)]
pub struct Job {
    /// Unique identifier for the job, assigned by the database
    pub id: i64,
    /// Type identifier for the job (used to pick the worker)
    #[sqlx(rename = "type")]
    #[serde(rename = "type")]
    pub job_type: String,
    /// Serialized payload; the queue never interprets it
    pub data: String,
    /// Current lifecycle state
    pub status: JobStatus,
    /// When a worker last claimed the job
    pub claimed_at: Option<i64>,
    /// When the job was marked as failed
    pub failed_at: Option<i64>,
    /// Rendered error of the failed run
    pub error: Option<String>,
    /// When the job was enqueued
    pub created_at: i64,
}

impl Job {
    /// Deserialize the JSON payload into `T`.
    pub fn json_data<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_str(&self.data)
    }
}

/// Represents a recurring job definition in the database
#[derive(Debug, Clone, PartialEq, Eq, Serialize, FromRow)]
pub struct ScheduledJob {
    /// Unique identifier for the schedule
    pub id: i64,
    /// Type of the jobs this schedule materializes; unique across schedules
    #[sqlx(rename = "type")]
    #[serde(rename = "type")]
    pub job_type: String,
    /// Whether the current tick is claimed
    pub status: ScheduledJobStatus,
    /// Cron expression as registered (5 or 6 fields)
    pub cron_expression: String,
    /// When the schedule is next due; `0` means immediately
    pub next_run: i64,
    /// When the schedule was first registered
    pub created_at: i64,
}

/// Conjunctive filter for [`Queue::count_jobs`](crate::Queue::count_jobs).
///
/// An empty filter matches every job.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobFilter {
    /// Only count jobs of this type
    pub job_type: Option<String>,
    /// Only count jobs in this state
    pub status: Option<JobStatus>,
}

impl JobFilter {
    /// A filter matching every job.
    pub fn new() -> Self {
        Self::default()
    }

    /// Restrict to jobs of `job_type`.
    #[must_use]
    pub fn job_type(mut self, job_type: impl Into<String>) -> Self {
        self.job_type = Some(job_type.into());
        self
    }

    /// Restrict to jobs in `status`.
    #[must_use]
    pub fn status(mut self, status: JobStatus) -> Self {
        self.status = Some(status);
        self
    }
}

impl From<JobStatus> for JobFilter {
    fn from(status: JobStatus) -> Self {
        Self::new().status(status)
    }
}
