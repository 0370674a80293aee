use chrono::Utc;
use domain_embeddings::RetryCoordinator;
use eyre::Result;
use std::sync::Arc;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info};

/// Run retry passes on a cron schedule until the process is interrupted.
pub async fn run_scheduled(coordinator: RetryCoordinator, cron_expr: &str) -> Result<()> {
    info!(cron = cron_expr, "Starting scheduled retry passes");

    let sched = JobScheduler::new().await?;
    let coordinator = Arc::new(coordinator);

    let job = Job::new_async(cron_expr, move |_uuid, _l| {
        let coordinator = coordinator.clone();

        Box::pin(async move {
            match coordinator.run_once(Utc::now()).await {
                Ok(report) => {
                    info!(
                        claimed = report.claimed,
                        resolved = report.resolved,
                        rescheduled = report.rescheduled,
                        abandoned = report.abandoned,
                        "Scheduled retry pass complete"
                    );
                }
                Err(e) => {
                    error!(error = %e, "Scheduled retry pass failed");
                }
            }
        })
    })?;

    sched.add(job).await?;
    sched.start().await?;

    info!("Scheduler started, waiting for jobs...");
    tokio::signal::ctrl_c().await?;

    info!("Stopping scheduler");
    let mut sched = sched;
    sched.shutdown().await?;
    Ok(())
}
