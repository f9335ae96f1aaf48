//! OrderFlow Background Worker
//!
//! Handles scheduled jobs including:
//! - Replay of failed and stuck payment events (every 15 minutes)
//! - Pruning of terminal event rows past retention (daily at 3:00 AM UTC)
//! - Health check heartbeat (every 5 minutes)

use std::sync::Arc;
use std::time::Duration;

use orderflow_fulfillment::FulfillmentService;
use orderflow_shared::create_pool;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

/// Events re-run per replay pass. Anything beyond this waits for the next
/// pass rather than monopolizing the worker.
const REPLAY_BATCH_SIZE: i64 = 50;

/// Terminal event rows older than this are deleted.
const EVENT_RETENTION_DAYS: i64 = 90;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    // Load environment
    dotenvy::dotenv().ok();

    info!("Starting OrderFlow Worker");

    let database_url = std::env::var("DATABASE_URL")
        .map_err(|_| anyhow::anyhow!("DATABASE_URL must be set"))?;
    let pool = create_pool(&database_url).await?;
    info!("Database pool created");

    let fulfillment = match FulfillmentService::from_env(pool.clone()) {
        Ok(service) => Arc::new(service),
        Err(e) => {
            // Without processor credentials there is nothing to replay.
            warn!(error = %e, "Failed to create fulfillment service - running in minimal mode");

            loop {
                tokio::time::sleep(Duration::from_secs(60)).await;
                info!("Worker heartbeat (minimal mode)");
            }
        }
    };

    let scheduler = JobScheduler::new().await?;

    // Job 1: Replay failed and stuck events (every 15 minutes)
    let replay_handler = fulfillment.webhooks.clone();
    scheduler
        .add(Job::new_async("0 */15 * * * *", move |_uuid, _l| {
            let handler = replay_handler.clone();
            Box::pin(async move {
                info!("Running payment event replay pass");
                match handler.replay_pending(REPLAY_BATCH_SIZE).await {
                    Ok(summary) => {
                        if summary.replayed > 0 {
                            info!(
                                replayed = summary.replayed,
                                succeeded = summary.succeeded,
                                failed = summary.failed,
                                "Event replay pass complete"
                            );
                        }
                    }
                    Err(e) => error!(error = %e, "Event replay pass failed"),
                }
            })
        })?)
        .await?;
    info!("Scheduled: Payment event replay (every 15 minutes)");

    // Job 2: Prune terminal event rows past retention (daily at 3:00 AM UTC)
    let prune_handler = fulfillment.webhooks.clone();
    scheduler
        .add(Job::new_async("0 0 3 * * *", move |_uuid, _l| {
            let handler = prune_handler.clone();
            Box::pin(async move {
                info!("Running payment event pruning");
                match handler.prune_events(EVENT_RETENTION_DAYS).await {
                    Ok(deleted) => info!(deleted = deleted, "Payment event pruning complete"),
                    Err(e) => error!(error = %e, "Payment event pruning failed"),
                }
            })
        })?)
        .await?;
    info!("Scheduled: Payment event pruning (daily at 3:00 AM UTC)");

    // Job 3: Health check heartbeat (every 5 minutes)
    scheduler
        .add(Job::new_async("0 */5 * * * *", |_uuid, _l| {
            Box::pin(async move {
                info!("Worker heartbeat - all systems operational");
            })
        })?)
        .await?;
    info!("Scheduled: Health check heartbeat (every 5 minutes)");

    info!("Starting job scheduler");
    scheduler.start().await?;

    info!("OrderFlow Worker started successfully with {} scheduled jobs", 3);

    // Keep the main task running
    // The scheduler runs jobs in background tasks
    loop {
        tokio::time::sleep(Duration::from_secs(3600)).await;
    }
}
