//! # Pitchside Worker
//!
//! Runs the periodic jobs that the API otherwise exposes under `/v1/cron/*`:
//! - Pushes pending ledger entries to Xero
//! - Retries queued emails
//! - Charges due payment-plan installments
//! - Expires lapsed reservations
//!
//! ## Usage
//!
//! ```bash
//! cargo run -p pitchside-worker
//! ```
//!
//! Set `LOG_FORMAT=json` for structured logs.

use pitchside_shared::{
    db::{migrations::run_migrations, pool::create_pool},
    integrations::Integrations,
};
use pitchside_worker::{
    config::WorkerConfig,
    jobs::{default_jobs, JobContext},
    scheduler::Scheduler,
};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    tracing::info!("Pitchside Worker v{} starting...", env!("CARGO_PKG_VERSION"));

    let config = WorkerConfig::from_env()?;

    let pool = create_pool(config.database.clone()).await?;
    run_migrations(&pool).await?;

    let integrations = Integrations::from_config(&config.integrations)?;
    if integrations.ledger.is_none() {
        tracing::warn!("Xero is not configured; ledger sync will be skipped");
    }
    if integrations.email.is_none() {
        tracing::warn!("Email is not configured; queued emails will stay queued");
    }

    let context = JobContext::new(pool.clone(), integrations, config.jobs.batch_size);
    let mut scheduler = Scheduler::new(context);
    for job in default_jobs(&config.jobs) {
        scheduler.register(job);
    }

    tokio::spawn(shutdown_signal(scheduler.shutdown_token()));

    tracing::info!("Worker ready");
    scheduler.run().await?;

    pool.close().await;
    tracing::info!("Worker stopped");

    Ok(())
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "pitchside_worker=debug,pitchside_shared=debug".into());

    let json = std::env::var("LOG_FORMAT").map_or(false, |v| v.eq_ignore_ascii_case("json"));

    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

async fn shutdown_signal(token: CancellationToken) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        return;
    }
    tracing::info!("Shutdown signal received, finishing in-flight passes...");
    token.cancel();
}
