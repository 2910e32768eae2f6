//! Connection setup and schema migrations.

use crate::errors::QueueError;
use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, instrument};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Connect to the SQLite database at `url` (e.g. `sqlite://jobs.db`).
///
/// The file is created if missing. The connection runs in WAL mode with a busy
/// timeout, so several workers and processes can share one database file.
pub async fn connect(url: &str) -> Result<SqlitePool, QueueError> {
    let options = SqliteConnectOptions::from_str(url)?;
    connect_with(options).await
}

/// Open the SQLite database file at `path`, creating it if missing.
pub async fn open(path: impl AsRef<Path>) -> Result<SqlitePool, QueueError> {
    connect_with(SqliteConnectOptions::new().filename(path)).await
}

async fn connect_with(options: SqliteConnectOptions) -> Result<SqlitePool, QueueError> {
    let options = options
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(BUSY_TIMEOUT);

    Ok(SqlitePoolOptions::new().connect_with(options).await?)
}

/// Set up the database schema for the job queue.
///
/// Runs the embedded migrations; calling it on an up-to-date database is a
/// no-op. [`QueueBuilder::build`](crate::QueueBuilder::build) calls this itself.
#[instrument(skip_all)]
pub async fn setup_database(pool: &SqlitePool) -> Result<(), QueueError> {
    debug!("Running job queue migrations…");
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}
