#![cfg_attr(test, allow(clippy::expect_used))]
#![cfg_attr(test, allow(clippy::unwrap_used))]

//! Docket Background Worker
//!
//! Handles scheduled jobs including:
//! - Webhook retry sweep, due retries plus stranded events (every minute)
//! - Exhausted webhook report for alerting (every 15 minutes)
//! - Heartbeat (every 5 minutes)

use std::sync::Arc;

use docket_billing::{
    build_dispatcher, EventFilter, EventStore, HandlerRegistry, PgEventStore, RetrySweeper,
    WebhookConfig,
};
use docket_shared::{create_pool, env_required, PgDomainEventPublisher};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

/// Upper bound on events named in one exhausted report
const EXHAUSTED_REPORT_LIMIT: i64 = 200;

async fn report_exhausted(store: &dyn EventStore) {
    let exhausted = match store.list(EventFilter::Exhausted, EXHAUSTED_REPORT_LIMIT, 0).await {
        Ok(events) => events,
        Err(e) => {
            error!(error = %e, "Failed to list exhausted webhook events");
            return;
        }
    };

    if exhausted.is_empty() {
        info!("No exhausted webhook events");
        return;
    }

    for event in &exhausted {
        error!(
            event_id = %event.id,
            provider_event_id = %event.provider_event_id,
            event_type = %event.event_type,
            retry_count = event.retry_count,
            error = event.error.as_deref().unwrap_or("unknown"),
            "Webhook event exhausted automatic retries - operator replay required"
        );
    }

    warn!(
        count = exhausted.len(),
        "Exhausted webhook events awaiting replay"
    );
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment
    dotenvy::dotenv().ok();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!("Starting Docket Worker");

    let config = WebhookConfig::from_env()?;
    config.validate()?;

    let pool = create_pool(&env_required("DATABASE_URL")?).await?;
    info!("Database pool created");

    let store: Arc<dyn EventStore> = Arc::new(PgEventStore::new(pool.clone()));
    let publisher = Arc::new(PgDomainEventPublisher::new(pool.clone()));
    let registry = HandlerRegistry::standard(pool.clone(), publisher);

    let dispatcher = build_dispatcher(&config, Arc::clone(&store), registry);
    let sweeper = Arc::new(RetrySweeper::new(
        dispatcher,
        config.stranded_after,
        config.sweep_batch,
    ));

    let mut scheduler = JobScheduler::new().await?;

    // Job 1: Retry sweep (every minute)
    let sweep_job = Arc::clone(&sweeper);
    scheduler
        .add(Job::new_async("0 * * * * *", move |_uuid, _l| {
            let sweeper = Arc::clone(&sweep_job);
            Box::pin(async move {
                if let Err(e) = sweeper.run_once().await {
                    error!(error = %e, "Webhook retry sweep failed");
                }
            })
        })?)
        .await?;
    info!("Scheduled: Webhook retry sweep (every minute)");

    // Job 2: Exhausted event report (every 15 minutes)
    let report_store = Arc::clone(&store);
    scheduler
        .add(Job::new_async("0 */15 * * * *", move |_uuid, _l| {
            let store = Arc::clone(&report_store);
            Box::pin(async move {
                report_exhausted(store.as_ref()).await;
            })
        })?)
        .await?;
    info!("Scheduled: Exhausted webhook report (every 15 minutes)");

    // Job 3: Heartbeat (every 5 minutes)
    scheduler
        .add(Job::new_async("0 */5 * * * *", |_uuid, _l| {
            Box::pin(async move {
                info!("Worker heartbeat - all systems operational");
            })
        })?)
        .await?;
    info!("Scheduled: Heartbeat (every 5 minutes)");

    // Catch up on anything left over from before a restart
    if let Err(e) = sweeper.run_once().await {
        error!(error = %e, "Startup webhook sweep failed");
    }

    info!("Starting job scheduler");
    scheduler.start().await?;
    info!("Docket Worker started with 3 scheduled jobs");

    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested, stopping scheduler");

    if let Err(e) = scheduler.shutdown().await {
        warn!(error = %e, "Scheduler did not shut down cleanly");
    }
    pool.close().await;

    info!("Docket Worker stopped");
    Ok(())
}
