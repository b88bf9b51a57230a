use std::future::Future;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info};

use crate::orchestrator::{Orchestrator, Trigger};

/// A job running `task` on every tick of `cron` (six fields, seconds first,
/// UTC).
pub fn cron_job<F, Fut>(cron: &str, task: F) -> Result<Job>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Job::new_async(cron, move |_uuid, _scheduler| Box::pin(task()))
        .with_context(|| format!("invalid schedule cron expression `{cron}`"))
}

pub fn pipeline_job(cron: &str, orchestrator: Arc<Orchestrator>) -> Result<Job> {
    cron_job(cron, move || {
        let orchestrator = Arc::clone(&orchestrator);
        async move {
            match orchestrator.run(Trigger::Schedule).await {
                Ok(receipt) => info!(
                    run_id = %receipt.run_id,
                    outcome = receipt.outcome.as_str(),
                    "Scheduled pipeline run finished"
                ),
                Err(err) => error!("Scheduled pipeline run failed: {err:#}"),
            }
        }
    })
}

/// Runs the scheduler until Ctrl-C.
pub async fn run_schedule(orchestrator: Arc<Orchestrator>, cron: &str) -> Result<()> {
    let mut scheduler = JobScheduler::new().await.context("creating scheduler")?;
    scheduler
        .add(pipeline_job(cron, orchestrator)?)
        .await
        .context("adding pipeline job")?;
    scheduler.start().await.context("starting scheduler")?;
    info!(cron, "Scheduler started");

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    info!("Shutting down scheduler");
    scheduler.shutdown().await.context("stopping scheduler")?;
    Ok(())
}
