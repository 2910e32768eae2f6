//! Runs a cron schedule and a burst of one-off jobs through a small runner.
//!
//! ```bash
//! cargo run --example scheduled
//! ```

use anyhow::Result;
use durable_jobs::{BackgroundJob, JobFilter, JobStatus, Queue, Runner, open};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::info;

#[derive(Debug, Serialize, Deserialize)]
struct ReticulateSplines {
    count: u32,
}

impl BackgroundJob for ReticulateSplines {
    const JOB_TYPE: &'static str = "reticulate_splines";
    type Context = ();

    async fn run(&self, _ctx: Self::Context) -> Result<()> {
        info!("Reticulating {} splines", self.count);
        tokio::time::sleep(Duration::from_millis(100)).await;
        Ok(())
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Heartbeat {}

impl BackgroundJob for Heartbeat {
    const JOB_TYPE: &'static str = "heartbeat";
    type Context = ();

    async fn run(&self, _ctx: Self::Context) -> Result<()> {
        info!("Still alive");
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn,scheduled=info,durable_jobs=info".into()),
        )
        .compact()
        .init();

    let dir = tempfile::tempdir()?;
    let pool = open(dir.path().join("jobs.db")).await?;
    let queue = Queue::builder(pool)
        .maintenance_interval(Duration::from_secs(1))
        .remove_done_jobs_older_than(Duration::from_secs(2))
        .build()
        .await?;

    Heartbeat::schedule(&queue, "* * * * * *").await?;
    for count in 1..=10 {
        ReticulateSplines { count }.enqueue(&queue).await?;
    }
    info!("Enqueued 10 jobs");

    let handle = Runner::new(queue.clone())
        .poll_interval(Duration::from_millis(100))
        .register::<ReticulateSplines>((), 3)
        .register::<Heartbeat>((), 1)
        .start();

    tokio::time::sleep(Duration::from_secs(4)).await;
    handle.stop().await;

    let done = queue.count_jobs(JobFilter::new().status(JobStatus::Done)).await?;
    let total = queue.count_jobs(JobFilter::new()).await?;
    info!(done, total, "Finished; old done jobs were pruned by maintenance");

    queue.close().await;
    Ok(())
}
