// Test code patterns:
#![cfg_attr(test, allow(clippy::unwrap_used))]

//! Registry Background Worker
//!
//! Scheduled jobs:
//! - Catalog sync to the payment provider (hourly)
//! - Billing invariant checks (daily at 4:00 AM UTC)
//! - Heartbeat (every 5 minutes)

use registry_billing::{
    BillingService, CatalogSyncSummary, InvariantCheckSummary, ViolationSeverity,
};
use registry_shared::create_pool;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

const CATALOG_SYNC_SCHEDULE: &str = "0 0 * * * *";
const INVARIANT_CHECK_SCHEDULE: &str = "0 0 4 * * *";
const HEARTBEAT_SCHEDULE: &str = "0 */5 * * * *";

fn log_catalog_summary(summary: &CatalogSyncSummary) {
    info!(
        products_synced = summary.products_synced,
        prices_synced = summary.prices_synced,
        prices_skipped = summary.prices_skipped,
        "Catalog sync complete"
    );
}

/// Log each violation at a level matching its severity
fn log_invariant_summary(summary: &InvariantCheckSummary) {
    info!(
        checks_run = summary.checks_run,
        checks_passed = summary.checks_passed,
        checks_failed = summary.checks_failed,
        healthy = summary.healthy,
        "Invariant checks complete"
    );

    for violation in &summary.violations {
        match violation.severity {
            ViolationSeverity::Critical | ViolationSeverity::High => error!(
                invariant = %violation.invariant,
                severity = %violation.severity,
                org_ids = ?violation.org_ids,
                context = %violation.context,
                "{}",
                violation.description
            ),
            ViolationSeverity::Medium | ViolationSeverity::Low => warn!(
                invariant = %violation.invariant,
                severity = %violation.severity,
                org_ids = ?violation.org_ids,
                "{}",
                violation.description
            ),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!("Starting Registry Worker");

    let database_url = std::env::var("DATABASE_URL")
        .map_err(|_| anyhow::anyhow!("DATABASE_URL must be set"))?;
    let pool = create_pool(&database_url).await?;
    info!("Database pool created");

    let billing = BillingService::from_env(pool)?;

    let scheduler = JobScheduler::new().await?;

    let catalog = billing.catalog.clone();
    scheduler
        .add(Job::new_async(CATALOG_SYNC_SCHEDULE, move |_uuid, _l| {
            let catalog = catalog.clone();
            Box::pin(async move {
                info!("Running scheduled catalog sync");
                match catalog.sync_all(false).await {
                    Ok(summary) => log_catalog_summary(&summary),
                    Err(e) => error!(error = %e, "Catalog sync failed"),
                }
            })
        })?)
        .await?;
    info!("Scheduled: Catalog sync (hourly)");

    let invariants = billing.invariants.clone();
    scheduler
        .add(Job::new_async(INVARIANT_CHECK_SCHEDULE, move |_uuid, _l| {
            let invariants = invariants.clone();
            Box::pin(async move {
                info!("Running billing invariant checks");
                match invariants.run_all_checks().await {
                    Ok(summary) => log_invariant_summary(&summary),
                    Err(e) => error!(error = %e, "Invariant checks failed"),
                }
            })
        })?)
        .await?;
    info!("Scheduled: Invariant checks (daily at 4:00 AM UTC)");

    scheduler
        .add(Job::new_async(HEARTBEAT_SCHEDULE, |_uuid, _l| {
            Box::pin(async move {
                info!("Worker heartbeat");
            })
        })?)
        .await?;

    info!("Starting job scheduler");
    scheduler.start().await?;
    info!(backend = %billing.backend, "Registry Worker started with 3 scheduled jobs");

    tokio::signal::ctrl_c().await?;
    info!("Shutting down worker");

    Ok(())
}
