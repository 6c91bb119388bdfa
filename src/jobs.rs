// Background Jobs - Cron-Driven Wallet Sweeps and Period Close
// Two daily queues; failures are logged per run and never crash the scheduler

use std::sync::Arc;

use chrono::Utc;
use tokio_cron_scheduler::{Job, JobScheduler};

use crate::core::{BillingError, BillingResult, BillingEngine};

pub const WALLET_DEBIT_QUEUE: &str = "wallet-debit-daily";
pub const PERIOD_CLOSE_QUEUE: &str = "period-close";

// seconds-resolution cron: daily at 00:00 and 01:00 UTC
const WALLET_DEBIT_CRON: &str = "0 0 0 * * *";
const PERIOD_CLOSE_CRON: &str = "0 0 1 * * *";

fn scheduler_error(e: tokio_cron_scheduler::JobSchedulerError) -> BillingError {
    BillingError::Internal(format!("job scheduler error: {e}"))
}

/// Register and start both billing queues. The returned handle is stopped
/// before the database pool closes during shutdown.
pub async fn start_scheduler(engine: Arc<BillingEngine>) -> BillingResult<JobScheduler> {
    let scheduler = JobScheduler::new().await.map_err(scheduler_error)?;

    let wallet = engine.wallet.clone();
    let wallet_job = Job::new_async(WALLET_DEBIT_CRON, move |_job_id, _scheduler| {
        let wallet = wallet.clone();
        Box::pin(async move {
            tracing::info!(queue = WALLET_DEBIT_QUEUE, "🔄 Scheduled run starting");
            match wallet.debit_batch().await {
                Ok(summary) => tracing::info!(
                    queue = WALLET_DEBIT_QUEUE,
                    groups = summary.groups,
                    debited_items = summary.debited_items,
                    skipped_groups = summary.skipped_groups,
                    "✅ Scheduled run complete"
                ),
                Err(e) => tracing::error!(
                    queue = WALLET_DEBIT_QUEUE,
                    error = %e,
                    "❌ Scheduled run failed"
                ),
            }
        })
    })
    .map_err(scheduler_error)?;
    scheduler.add(wallet_job).await.map_err(scheduler_error)?;

    let invoices = engine.invoices.clone();
    let close_job = Job::new_async(PERIOD_CLOSE_CRON, move |_job_id, _scheduler| {
        let invoices = invoices.clone();
        Box::pin(async move {
            tracing::info!(queue = PERIOD_CLOSE_QUEUE, "🔄 Scheduled run starting");
            match invoices.run_period_close(Utc::now()).await {
                Ok(summary) => tracing::info!(
                    queue = PERIOD_CLOSE_QUEUE,
                    processed = summary.processed,
                    skipped = summary.skipped,
                    failed = summary.failed,
                    "✅ Scheduled run complete"
                ),
                Err(e) => tracing::error!(
                    queue = PERIOD_CLOSE_QUEUE,
                    error = %e,
                    "❌ Scheduled run failed"
                ),
            }
        })
    })
    .map_err(scheduler_error)?;
    scheduler.add(close_job).await.map_err(scheduler_error)?;

    scheduler.start().await.map_err(scheduler_error)?;
    tracing::info!("⏰ Job scheduler started with wallet-debit-daily and period-close queues");

    Ok(scheduler)
}

pub async fn stop_scheduler(mut scheduler: JobScheduler) {
    if let Err(e) = scheduler.shutdown().await {
        tracing::error!(error = %e, "Scheduler shutdown reported an error");
    } else {
        tracing::info!("⏰ Job scheduler stopped");
    }
}
