//! # Pitchside API Server
//!
//! Membership and registration API for a sports association, with Stripe payments
//! and a one-way sync of every charge to the Xero ledger.
//!
//! ## Usage
//!
//! ```bash
//! cargo run -p pitchside-api
//! ```
//!
//! Set `LOG_FORMAT=json` for structured logs.

use pitchside_api::{
    app::{build_router, AppState},
    config::Config,
};
use pitchside_shared::{
    db::{
        migrations::run_migrations,
        pool::{create_pool, DatabaseConfig},
    },
    integrations::Integrations,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    tracing::info!("Pitchside API Server v{} starting...", env!("CARGO_PKG_VERSION"));

    let config = Config::from_env()?;

    let pool = create_pool(DatabaseConfig {
        url: config.database.url.clone(),
        max_connections: config.database.max_connections,
        ..Default::default()
    })
    .await?;
    run_migrations(&pool).await?;

    let integrations = Integrations::from_config(&config.integrations)?;

    let bind_address = config.bind_address();
    let app = build_router(AppState::new(pool.clone(), config, integrations));

    let listener = tokio::net::TcpListener::bind(&bind_address).await?;
    tracing::info!("Server listening on http://{}", bind_address);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    pool.close().await;
    tracing::info!("Server stopped");

    Ok(())
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "pitchside_api=debug,pitchside_shared=debug,tower_http=debug".into());

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

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        return;
    }
    tracing::info!("Shutdown signal received, draining connections...");
}
