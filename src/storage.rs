use crate::schema::{Job, JobFilter, ScheduledJob};
use sqlx::sqlite::SqliteExecutor;

/// Inserts a new pending job and returns its id.
pub(crate) async fn insert_job(
    executor: impl SqliteExecutor<'_>,
    job_type: &str,
    data: &str,
    created_at: i64,
) -> Result<i64, sqlx::Error> {
    sqlx::query_scalar::<_, i64>(
        "INSERT INTO jobs (type, data, status, created_at) VALUES (?, ?, 'pending', ?) RETURNING id",
    )
    .bind(job_type)
    .bind(data)
    .bind(created_at)
    .fetch_one(executor)
    .await
}

/// Counts jobs matching every constraint set on `filter`.
pub(crate) async fn count_jobs(
    executor: impl SqliteExecutor<'_>,
    filter: &JobFilter,
) -> Result<i64, sqlx::Error> {
    let mut query = "SELECT COUNT(*) FROM jobs".to_string();

    let mut conditions = Vec::new();
    if filter.job_type.is_some() {
        conditions.push("type = ?");
    }
    if filter.status.is_some() {
        conditions.push("status = ?");
    }
    if !conditions.is_empty() {
        query.push_str(" WHERE ");
        query.push_str(&conditions.join(" AND "));
    }

    let mut query_builder = sqlx::query_scalar::<_, i64>(&query);

    if let Some(job_type) = &filter.job_type {
        query_builder = query_builder.bind(job_type.as_str());
    }

    if let Some(status) = filter.status {
        query_builder = query_builder.bind(status);
    }

    query_builder.fetch_one(executor).await
}

pub(crate) async fn find_job(
    executor: impl SqliteExecutor<'_>,
    id: i64,
) -> Result<Option<Job>, sqlx::Error> {
    sqlx::query_as::<_, Job>(
        r"
        SELECT id, type, data, status, claimed_at, failed_at, error, created_at
        FROM jobs
        WHERE id = ?
        ",
    )
    .bind(id)
    .fetch_optional(executor)
    .await
}

/// Distinct job types currently present in the table.
pub(crate) async fn job_types(executor: impl SqliteExecutor<'_>) -> Result<Vec<String>, sqlx::Error> {
    sqlx::query_scalar::<_, String>("SELECT DISTINCT type FROM jobs ORDER BY type")
        .fetch_all(executor)
        .await
}

/// Claims the oldest pending job of `job_type`.
///
/// The select and the update happen in one statement, so the write lock is
/// held before the row is chosen and two callers can never claim the same row.
pub(crate) async fn claim_next_job(
    executor: impl SqliteExecutor<'_>,
    job_type: &str,
    claimed_at: i64,
) -> Result<Option<Job>, sqlx::Error> {
    sqlx::query_as::<_, Job>(
        r"
        UPDATE jobs
        SET status = 'processing', claimed_at = ?
        WHERE status = 'pending'
          AND id = (
            SELECT id FROM jobs
            WHERE status = 'pending' AND type = ?
            ORDER BY created_at ASC, id ASC
            LIMIT 1
          )
        RETURNING id, type, data, status, claimed_at, failed_at, error, created_at
        ",
    )
    .bind(claimed_at)
    .bind(job_type)
    .fetch_optional(executor)
    .await
}

pub(crate) async fn mark_job_done(
    executor: impl SqliteExecutor<'_>,
    id: i64,
) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE jobs SET status = 'done' WHERE id = ?")
        .bind(id)
        .execute(executor)
        .await?;
    Ok(())
}

pub(crate) async fn mark_job_failed(
    executor: impl SqliteExecutor<'_>,
    id: i64,
    error: &str,
    failed_at: i64,
) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE jobs SET status = 'failed', failed_at = ?, error = ? WHERE id = ?")
        .bind(failed_at)
        .bind(error)
        .bind(id)
        .execute(executor)
        .await?;
    Ok(())
}

/// Returns jobs claimed before `cutoff` to `pending`.
///
/// Jobs claimed before `claimed_at` existed fall back to `created_at`.
pub(crate) async fn requeue_processing_jobs(
    executor: impl SqliteExecutor<'_>,
    cutoff: i64,
) -> Result<u64, sqlx::Error> {
    let result = sqlx::query(
        r"
        UPDATE jobs
        SET status = 'pending', claimed_at = NULL
        WHERE status = 'processing' AND COALESCE(claimed_at, created_at) < ?
        ",
    )
    .bind(cutoff)
    .execute(executor)
    .await?;
    Ok(result.rows_affected())
}

pub(crate) async fn delete_done_jobs(
    executor: impl SqliteExecutor<'_>,
    cutoff: i64,
) -> Result<u64, sqlx::Error> {
    let result = sqlx::query("DELETE FROM jobs WHERE status = 'done' AND created_at < ?")
        .bind(cutoff)
        .execute(executor)
        .await?;
    Ok(result.rows_affected())
}

pub(crate) async fn delete_failed_jobs(
    executor: impl SqliteExecutor<'_>,
    cutoff: i64,
) -> Result<u64, sqlx::Error> {
    let result = sqlx::query("DELETE FROM jobs WHERE status = 'failed' AND failed_at < ?")
        .bind(cutoff)
        .execute(executor)
        .await?;
    Ok(result.rows_affected())
}

/// Inserts a schedule, or updates the cron expression of the existing one.
///
/// `next_run` and `status` of an existing schedule are left untouched.
pub(crate) async fn upsert_scheduled_job(
    executor: impl SqliteExecutor<'_>,
    job_type: &str,
    cron_expression: &str,
    created_at: i64,
    parked_next_run: i64,
) -> Result<i64, sqlx::Error> {
    sqlx::query_scalar::<_, i64>(
        r"
        INSERT INTO scheduled_jobs (type, status, cron_expression, next_run, created_at)
        VALUES (?, 'idle', ?, 0, ?)
        ON CONFLICT (type) DO UPDATE SET
            cron_expression = excluded.cron_expression,
            next_run = CASE
                WHEN scheduled_jobs.next_run = ? THEN 0
                ELSE scheduled_jobs.next_run
            END
        RETURNING id
        ",
    )
    .bind(job_type)
    .bind(cron_expression)
    .bind(created_at)
    .bind(parked_next_run)
    .fetch_one(executor)
    .await
}

pub(crate) async fn list_scheduled_jobs(
    executor: impl SqliteExecutor<'_>,
) -> Result<Vec<ScheduledJob>, sqlx::Error> {
    sqlx::query_as::<_, ScheduledJob>(
        r"
        SELECT id, type, status, cron_expression, next_run, created_at
        FROM scheduled_jobs
        ORDER BY created_at ASC, id ASC
        ",
    )
    .fetch_all(executor)
    .await
}

pub(crate) async fn find_scheduled_job(
    executor: impl SqliteExecutor<'_>,
    id: i64,
) -> Result<Option<ScheduledJob>, sqlx::Error> {
    sqlx::query_as::<_, ScheduledJob>(
        r"
        SELECT id, type, status, cron_expression, next_run, created_at
        FROM scheduled_jobs
        WHERE id = ?
        ",
    )
    .bind(id)
    .fetch_optional(executor)
    .await
}

/// Claims the idle schedule that has been due the longest, across all types.
pub(crate) async fn claim_next_scheduled_job(
    executor: impl SqliteExecutor<'_>,
    now: i64,
) -> Result<Option<ScheduledJob>, sqlx::Error> {
    sqlx::query_as::<_, ScheduledJob>(
        r"
        UPDATE scheduled_jobs
        SET status = 'processing'
        WHERE status = 'idle'
          AND id = (
            SELECT id FROM scheduled_jobs
            WHERE status = 'idle' AND next_run <= ?
            ORDER BY next_run ASC, id ASC
            LIMIT 1
          )
        RETURNING id, type, status, cron_expression, next_run, created_at
        ",
    )
    .bind(now)
    .fetch_optional(executor)
    .await
}

pub(crate) async fn mark_scheduled_job_idle(
    executor: impl SqliteExecutor<'_>,
    id: i64,
    next_run: i64,
) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE scheduled_jobs SET status = 'idle', next_run = ? WHERE id = ?")
        .bind(next_run)
        .bind(id)
        .execute(executor)
        .await?;
    Ok(())
}
