use std::time::Duration;
use thiserror::Error;

/// Errors returned by [`Queue`](crate::Queue) operations and helpers.
#[derive(Debug, Error)]
pub enum QueueError {
    /// The cron expression passed to `schedule` could not be parsed.
    #[error("Invalid cron expression {expression:?}: {reason}")]
    InvalidCron {
        /// The expression as given by the caller
        expression: String,
        /// Why it was rejected
        reason: String,
    },

    /// The cron expression is valid but never fires again.
    #[error("Cron expression {expression:?} has no upcoming run")]
    NoUpcomingRun {
        /// The expression that ran out of occurrences
        expression: String,
    },

    /// Error serializing job data
    #[error("Failed to serialize job data: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// Error from the underlying database, including a closed pool
    #[error(transparent)]
    DatabaseError(#[from] sqlx::Error),

    /// Error applying the embedded schema migrations
    #[error(transparent)]
    MigrationError(#[from] sqlx::migrate::MigrateError),

    /// `process_all` gave up before the queue drained.
    #[error("Queue did not drain within {0:?}")]
    DrainTimeout(Duration),
}
