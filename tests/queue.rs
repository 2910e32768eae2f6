#![allow(missing_docs)]
#![allow(clippy::expect_used)]
#![allow(clippy::panic)]
#![allow(clippy::unwrap_used)]
#![allow(clippy::indexing_slicing)]

use claims::{assert_err, assert_matches, assert_none, assert_ok, assert_some};
use durable_jobs::{
    JobFilter, JobStatus, MaintenanceReport, Queue, QueueBuilder, QueueError, QueueObserver,
    ScheduledJobStatus, open,
};
use serde_json::json;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tempfile::TempDir;

/// Test utilities and common setup
mod test_utils {
    use super::*;

    /// Create a queue on a fresh database file, with background maintenance disabled
    pub(super) async fn setup_queue() -> anyhow::Result<(Queue, TempDir)> {
        setup_queue_with(|builder| builder).await
    }

    /// Create a queue on a fresh database file with extra configuration
    pub(super) async fn setup_queue_with(
        configure: impl FnOnce(QueueBuilder) -> QueueBuilder,
    ) -> anyhow::Result<(Queue, TempDir)> {
        let dir = tempfile::tempdir()?;
        let pool = open(dir.path().join("jobs.db")).await?;
        let builder = Queue::builder(pool).maintenance_interval(Duration::ZERO);
        let queue = configure(builder).build().await?;
        Ok((queue, dir))
    }

    /// Open a second, independent queue on the same database file
    pub(super) async fn second_queue(dir: &TempDir) -> anyhow::Result<Queue> {
        let pool = open(dir.path().join("jobs.db")).await?;
        Ok(Queue::builder(pool)
            .maintenance_interval(Duration::ZERO)
            .build()
            .await?)
    }
}

#[derive(Clone, Default)]
struct CountingObserver {
    requeued: Arc<AtomicU64>,
    done_removed: Arc<AtomicU64>,
    failed_removed: Arc<AtomicU64>,
}

impl QueueObserver for CountingObserver {
    fn on_processing_jobs_requeued(&self, count: u64) {
        self.requeued.fetch_add(count, Ordering::SeqCst);
    }

    fn on_done_jobs_removed(&self, count: u64) {
        self.done_removed.fetch_add(count, Ordering::SeqCst);
    }

    fn on_failed_jobs_removed(&self, count: u64) {
        self.failed_removed.fetch_add(count, Ordering::SeqCst);
    }
}

#[tokio::test]
async fn setup_creates_tables() -> anyhow::Result<()> {
    let (queue, _dir) = test_utils::setup_queue().await?;

    let table_count: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name IN ('jobs', 'scheduled_jobs')",
    )
    .fetch_one(queue.pool())
    .await?;
    assert_eq!(table_count, 2);

    // Running the migrations again is harmless
    durable_jobs::setup_database(queue.pool()).await?;

    Ok(())
}

#[tokio::test]
async fn added_jobs_are_pending() -> anyhow::Result<()> {
    let (queue, _dir) = test_utils::setup_queue().await?;

    let id = queue.add("email", &json!({"to": "someone@example.com"})).await?;

    let job = assert_some!(queue.get_job_by_id(id).await?);
    assert_eq!(job.id, id);
    assert_eq!(job.job_type, "email");
    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(job.data, r#"{"to":"someone@example.com"}"#);
    assert_none!(job.claimed_at);
    assert_none!(job.failed_at);
    assert_none!(job.error);
    assert!(job.created_at > 0);

    assert_none!(queue.get_job_by_id(id + 1).await?);

    Ok(())
}

#[tokio::test]
async fn count_jobs_combines_filters() -> anyhow::Result<()> {
    let (queue, _dir) = test_utils::setup_queue().await?;

    queue.add("a", &1).await?;
    queue.add("a", &2).await?;
    queue.add("b", &3).await?;
    assert_some!(queue.get_and_mark_job_as_processing("a").await?);

    assert_eq!(queue.count_jobs(JobFilter::new()).await?, 3);
    assert_eq!(queue.count_jobs(JobFilter::new().job_type("a")).await?, 2);
    assert_eq!(queue.count_jobs(JobStatus::Pending).await?, 2);
    assert_eq!(
        queue
            .count_jobs(JobFilter::new().job_type("a").status(JobStatus::Processing))
            .await?,
        1
    );
    assert_eq!(
        queue
            .count_jobs(JobFilter::new().job_type("b").status(JobStatus::Done))
            .await?,
        0
    );
    assert_eq!(queue.count_jobs(JobFilter::new().job_type("c")).await?, 0);

    assert_eq!(queue.get_job_types().await?, vec!["a", "b"]);

    Ok(())
}

#[tokio::test]
async fn claims_are_fifo_per_type() -> anyhow::Result<()> {
    let (queue, _dir) = test_utils::setup_queue().await?;

    let first = queue.add("t", &json!({"value": 1})).await?;
    let other = queue.add("other", &json!({})).await?;
    let second = queue.add("t", &json!({"value": 2})).await?;

    let claimed = assert_some!(queue.get_and_mark_job_as_processing("t").await?);
    assert_eq!(claimed.id, first);
    assert_eq!(claimed.status, JobStatus::Processing);
    assert_some!(claimed.claimed_at);

    let claimed = assert_some!(queue.get_and_mark_job_as_processing("t").await?);
    assert_eq!(claimed.id, second);

    assert_none!(queue.get_and_mark_job_as_processing("t").await?);

    let untouched = assert_some!(queue.get_job_by_id(other).await?);
    assert_eq!(untouched.status, JobStatus::Pending);

    Ok(())
}

#[tokio::test]
async fn claiming_from_an_empty_queue_returns_none() -> anyhow::Result<()> {
    let (queue, _dir) = test_utils::setup_queue().await?;

    assert_none!(queue.get_and_mark_job_as_processing("t").await?);
    assert_none!(queue.get_and_mark_scheduled_job_as_processing().await?);
    assert_eq!(queue.count_jobs(JobFilter::new()).await?, 0);

    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_claims_never_share_a_job() -> anyhow::Result<()> {
    const JOBS: usize = 60;

    let (queue, dir) = test_utils::setup_queue().await?;
    // A second pool on the same file stands in for another process
    let other_process = test_utils::second_queue(&dir).await?;

    let mut ids = HashSet::new();
    for i in 0..JOBS {
        ids.insert(queue.add("race", &i).await?);
    }

    let mut tasks = Vec::new();
    for i in 0..8 {
        let queue = if i % 2 == 0 {
            queue.clone()
        } else {
            other_process.clone()
        };
        tasks.push(tokio::spawn(async move {
            let mut claimed = Vec::new();
            while let Some(job) = queue.get_and_mark_job_as_processing("race").await? {
                claimed.push(job.id);
            }
            Ok::<_, QueueError>(claimed)
        }));
    }

    let mut claimed = Vec::new();
    for task in tasks {
        claimed.extend(task.await??);
    }

    assert_eq!(claimed.len(), JOBS);
    let unique: HashSet<i64> = claimed.into_iter().collect();
    assert_eq!(unique, ids);
    assert_eq!(queue.count_jobs(JobStatus::Processing).await?, JOBS as i64);

    Ok(())
}

#[tokio::test]
async fn jobs_can_be_marked_done_or_failed() -> anyhow::Result<()> {
    let (queue, _dir) = test_utils::setup_queue().await?;

    let ok = queue.add("t", &json!({})).await?;
    let bad = queue.add("t", &json!({})).await?;
    assert_some!(queue.get_and_mark_job_as_processing("t").await?);
    assert_some!(queue.get_and_mark_job_as_processing("t").await?);

    queue.mark_job_as_done(ok).await?;
    // Marking twice is harmless
    queue.mark_job_as_done(ok).await?;
    queue.mark_job_as_failed(bad, "Error: boom").await?;

    let job = assert_some!(queue.get_job_by_id(ok).await?);
    assert_eq!(job.status, JobStatus::Done);
    assert!(job.status.is_terminal());
    assert_none!(job.failed_at);

    let job = assert_some!(queue.get_job_by_id(bad).await?);
    assert_eq!(job.status, JobStatus::Failed);
    assert_some!(job.failed_at);
    assert_eq!(job.error.as_deref(), Some("Error: boom"));

    Ok(())
}

#[tokio::test]
async fn schedules_are_upserted_by_type() -> anyhow::Result<()> {
    let (queue, _dir) = test_utils::setup_queue().await?;

    let id = queue.schedule("x", "* * * * *").await?;
    let again = queue.schedule("x", "0 * * * *").await?;
    assert_eq!(id, again);

    let scheduled = queue.get_scheduled_jobs().await?;
    assert_eq!(scheduled.len(), 1);
    assert_eq!(scheduled[0].id, id);
    assert_eq!(scheduled[0].job_type, "x");
    assert_eq!(scheduled[0].cron_expression, "0 * * * *");
    assert_eq!(scheduled[0].status, ScheduledJobStatus::Idle);
    assert_eq!(scheduled[0].next_run, 0);

    Ok(())
}

#[tokio::test]
async fn rescheduling_keeps_next_run() -> anyhow::Result<()> {
    let (queue, _dir) = test_utils::setup_queue().await?;

    let id = queue.schedule("x", "* * * * *").await?;
    let claimed = assert_some!(queue.get_and_mark_scheduled_job_as_processing().await?);
    assert_eq!(claimed.id, id);
    assert_eq!(claimed.status, ScheduledJobStatus::Processing);
    queue.mark_scheduled_job_as_idle(id, 4_102_444_800_000).await?;

    queue.schedule("x", "*/5 * * * *").await?;

    let scheduled = assert_some!(queue.get_scheduled_job_by_id(id).await?);
    assert_eq!(scheduled.cron_expression, "*/5 * * * *");
    assert_eq!(scheduled.next_run, 4_102_444_800_000);
    assert_eq!(scheduled.status, ScheduledJobStatus::Idle);

    Ok(())
}

#[tokio::test]
async fn invalid_cron_is_rejected_before_writing() -> anyhow::Result<()> {
    let (queue, _dir) = test_utils::setup_queue().await?;

    let error = assert_err!(queue.schedule("x", "not a cron").await);
    assert_matches!(&error, QueueError::InvalidCron { expression, .. } if expression == "not a cron");
    assert!(error.to_string().contains("not a cron"), "{error}");
    assert!(queue.get_scheduled_jobs().await?.is_empty());

    // An existing schedule keeps its expression
    let id = queue.schedule("x", "0 0 * * *").await?;
    assert_err!(queue.schedule("x", "99 * * * *").await);
    let scheduled = assert_some!(queue.get_scheduled_job_by_id(id).await?);
    assert_eq!(scheduled.cron_expression, "0 0 * * *");

    Ok(())
}

#[tokio::test]
async fn due_schedules_are_claimed_once_per_tick() -> anyhow::Result<()> {
    let (queue, _dir) = test_utils::setup_queue().await?;

    let a = queue.schedule("a", "* * * * *").await?;
    let b = queue.schedule("b", "* * * * *").await?;

    let ids: Vec<i64> = queue.get_scheduled_jobs().await?.iter().map(|s| s.id).collect();
    assert_eq!(ids, vec![a, b]);

    let first = assert_some!(queue.get_and_mark_scheduled_job_as_processing().await?);
    let second = assert_some!(queue.get_and_mark_scheduled_job_as_processing().await?);
    assert_eq!((first.id, second.id), (a, b));

    // Both ticks are claimed
    assert_none!(queue.get_and_mark_scheduled_job_as_processing().await?);

    // Re-armed in the future: not due yet
    queue.mark_scheduled_job_as_idle(a, 4_102_444_800_000).await?;
    assert_none!(queue.get_and_mark_scheduled_job_as_processing().await?);

    // Re-armed in the past: due again
    queue.mark_scheduled_job_as_idle(b, 1).await?;
    let again = assert_some!(queue.get_and_mark_scheduled_job_as_processing().await?);
    assert_eq!(again.id, b);

    Ok(())
}

#[tokio::test]
async fn timed_out_jobs_are_requeued() -> anyhow::Result<()> {
    let observer = CountingObserver::default();
    let (queue, _dir) = test_utils::setup_queue_with(|b| b.observer(observer.clone())).await?;

    let id = queue.add("t", &json!({})).await?;
    assert_some!(queue.get_and_mark_job_as_processing("t").await?);

    // Not yet timed out
    assert_eq!(queue.requeue_timed_out_jobs(Duration::from_secs(60)).await?, 0);
    assert_eq!(observer.requeued.load(Ordering::SeqCst), 0);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(queue.requeue_timed_out_jobs(Duration::from_millis(10)).await?, 1);
    assert_eq!(observer.requeued.load(Ordering::SeqCst), 1);

    let job = assert_some!(queue.get_job_by_id(id).await?);
    assert_eq!(job.status, JobStatus::Pending);
    assert_none!(job.claimed_at);

    // Claimable again
    let claimed = assert_some!(queue.get_and_mark_job_as_processing("t").await?);
    assert_eq!(claimed.id, id);

    Ok(())
}

#[tokio::test]
async fn maintenance_requeues_and_prunes() -> anyhow::Result<()> {
    let observer = CountingObserver::default();
    let (queue, _dir) = test_utils::setup_queue_with(|b| {
        b.observer(observer.clone())
            .processing_timeout(Duration::from_millis(10))
            .remove_done_jobs_older_than(Duration::from_millis(10))
            .remove_failed_jobs_older_than(Duration::from_millis(10))
    })
    .await?;

    let stuck = queue.add("t", &json!({})).await?;
    let done = queue.add("t", &json!({})).await?;
    let failed = queue.add("t", &json!({})).await?;
    for _ in 0..3 {
        assert_some!(queue.get_and_mark_job_as_processing("t").await?);
    }
    queue.mark_job_as_done(done).await?;
    queue.mark_job_as_failed(failed, "boom").await?;

    tokio::time::sleep(Duration::from_millis(50)).await;

    let report = queue.run_maintenance().await?;
    assert_eq!(
        report,
        MaintenanceReport {
            requeued: 1,
            done_removed: 1,
            failed_removed: 1,
        }
    );
    assert_eq!(observer.requeued.load(Ordering::SeqCst), 1);
    assert_eq!(observer.done_removed.load(Ordering::SeqCst), 1);
    assert_eq!(observer.failed_removed.load(Ordering::SeqCst), 1);

    assert_none!(queue.get_job_by_id(done).await?);
    assert_none!(queue.get_job_by_id(failed).await?);
    let job = assert_some!(queue.get_job_by_id(stuck).await?);
    assert_eq!(job.status, JobStatus::Pending);

    // Nothing left to do; observers stay quiet
    assert_eq!(queue.run_maintenance().await?, MaintenanceReport::default());
    assert_eq!(observer.done_removed.load(Ordering::SeqCst), 1);

    Ok(())
}

#[tokio::test]
async fn recent_terminal_jobs_are_kept() -> anyhow::Result<()> {
    let (queue, _dir) = test_utils::setup_queue().await?;

    let done = queue.add("t", &json!({})).await?;
    let pending = queue.add("t", &json!({})).await?;
    assert_some!(queue.get_and_mark_job_as_processing("t").await?);
    queue.mark_job_as_done(done).await?;

    assert_eq!(queue.run_maintenance().await?, MaintenanceReport::default());
    assert_some!(queue.get_job_by_id(done).await?);
    assert_some!(queue.get_job_by_id(pending).await?);

    // Pending jobs are never pruned, however old
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(queue.remove_done_jobs(Duration::from_millis(1)).await?, 1);
    assert_eq!(queue.remove_failed_jobs(Duration::from_millis(1)).await?, 0);
    assert_some!(queue.get_job_by_id(pending).await?);

    Ok(())
}

#[tokio::test]
async fn background_maintenance_runs_on_its_interval() -> anyhow::Result<()> {
    let observer = CountingObserver::default();
    let (queue, _dir) = test_utils::setup_queue_with(|b| {
        b.observer(observer.clone())
            .maintenance_interval(Duration::from_millis(50))
            .remove_done_jobs_older_than(Duration::from_millis(1))
    })
    .await?;

    let id = queue.add("t", &json!({})).await?;
    assert_some!(queue.get_and_mark_job_as_processing("t").await?);
    queue.mark_job_as_done(id).await?;

    let removed = tokio::time::timeout(Duration::from_secs(5), async {
        while queue.get_job_by_id(id).await?.is_some() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        Ok::<_, QueueError>(())
    })
    .await;
    assert_ok!(assert_ok!(removed));
    assert_eq!(observer.done_removed.load(Ordering::SeqCst), 1);

    queue.close().await;

    Ok(())
}

#[tokio::test]
async fn panicking_observers_do_not_break_maintenance() -> anyhow::Result<()> {
    struct Exploding;

    impl QueueObserver for Exploding {
        fn on_done_jobs_removed(&self, _count: u64) {
            panic!("observer bug");
        }
    }

    let (queue, _dir) = test_utils::setup_queue_with(|b| b.observer(Exploding)).await?;

    let id = queue.add("t", &json!({})).await?;
    assert_some!(queue.get_and_mark_job_as_processing("t").await?);
    queue.mark_job_as_done(id).await?;
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert_eq!(queue.remove_done_jobs(Duration::from_millis(1)).await?, 1);
    assert_none!(queue.get_job_by_id(id).await?);

    Ok(())
}

#[tokio::test]
async fn close_is_idempotent() -> anyhow::Result<()> {
    let (queue, _dir) =
        test_utils::setup_queue_with(|b| b.maintenance_interval(Duration::from_millis(10))).await?;

    assert!(!queue.is_closed());
    queue.close().await;
    assert!(queue.is_closed());
    queue.close().await;

    let error = assert_err!(queue.add("t", &json!({})).await);
    assert_matches!(error, QueueError::DatabaseError(_));

    Ok(())
}
