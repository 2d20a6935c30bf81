/// Externally triggered background passes
///
/// For deployments without the worker, a scheduler (e.g. a platform cron) calls these
/// with the `x-cron-secret` header. Each call runs one pass over at most
/// [`CRON_BATCH_SIZE`] rows and returns its report.
///
/// # Endpoints
///
/// - `POST /v1/cron/ledger-sync`
/// - `POST /v1/cron/email-retry`
/// - `POST /v1/cron/payment-plans`
/// - `POST /v1/cron/expire-reservations`

use crate::{app::AppState, error::ApiResult};
use axum::{extract::State, Json};
use chrono::Utc;
use pitchside_shared::{
    checkout::{self, ExpiryReport},
    ledger::{self, SyncReport},
    notifications::{self, OutboxReport},
    payment_plans::{self, PlanReport},
};
use serde::Serialize;

pub const CRON_BATCH_SIZE: i64 = 50;

/// Report of one pass
#[derive(Debug, Serialize)]
pub struct CronResponse<T: Serialize> {
    pub job: &'static str,

    /// The vendor this pass needs is not configured; nothing was attempted
    pub skipped: bool,

    pub report: T,
}

impl<T: Serialize> CronResponse<T> {
    fn ran(job: &'static str, report: T) -> Json<Self> {
        Json(Self {
            job,
            skipped: false,
            report,
        })
    }
}

impl<T: Serialize + Default> CronResponse<T> {
    fn skipped(job: &'static str) -> Json<Self> {
        tracing::debug!(job, "Cron pass skipped; vendor not configured");
        Json(Self {
            job,
            skipped: true,
            report: T::default(),
        })
    }
}

pub async fn ledger_sync(State(state): State<AppState>) -> ApiResult<Json<CronResponse<SyncReport>>> {
    let Some(client) = state.integrations.ledger.as_deref() else {
        return Ok(CronResponse::skipped("ledger_sync"));
    };

    let report = ledger::sync_due(
        &state.db,
        client,
        state.integrations.alerts.as_ref(),
        CRON_BATCH_SIZE,
        Utc::now(),
    )
    .await?;

    Ok(CronResponse::ran("ledger_sync", report))
}

pub async fn email_retry(State(state): State<AppState>) -> ApiResult<Json<CronResponse<OutboxReport>>> {
    let Some(sender) = state.integrations.email.as_deref() else {
        return Ok(CronResponse::skipped("email_retry"));
    };

    let report = notifications::process_outbox(&state.db, sender, CRON_BATCH_SIZE, Utc::now()).await?;

    Ok(CronResponse::ran("email_retry", report))
}

pub async fn payment_plans(State(state): State<AppState>) -> ApiResult<Json<CronResponse<PlanReport>>> {
    let report = payment_plans::process_due(&state.db, &state.integrations, Utc::now(), CRON_BATCH_SIZE).await?;

    Ok(CronResponse::ran("payment_plans", report))
}

pub async fn expire_reservations(State(state): State<AppState>) -> ApiResult<Json<CronResponse<ExpiryReport>>> {
    let report = checkout::expire_reservations(&state.db, &state.integrations, Utc::now()).await?;

    Ok(CronResponse::ran("expire_reservations", report))
}
