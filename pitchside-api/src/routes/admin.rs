/// Ledger sync monitoring
///
/// - `GET /v1/admin/ledger?status=failed&limit=50&offset=0`
/// - `POST /v1/admin/ledger/:id/retry` - re-queue a failed entry with a fresh
///   attempt budget and try it once straight away

use crate::{
    app::AppState,
    error::{ApiError, ApiResult},
};
use axum::{
    extract::{Path, Query, State},
    Extension, Json,
};
use chrono::Utc;
use pitchside_shared::{
    auth::middleware::AuthContext,
    ledger,
    models::ledger::{LedgerEntry, LedgerEntryStatus},
};
use serde::Deserialize;
use uuid::Uuid;

const DEFAULT_PAGE_SIZE: i64 = 50;
const MAX_PAGE_SIZE: i64 = 200;

#[derive(Debug, Default, Deserialize)]
pub struct LedgerQuery {
    pub status: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

pub async fn list_ledger_entries(
    State(state): State<AppState>,
    Query(query): Query<LedgerQuery>,
) -> ApiResult<Json<Vec<LedgerEntry>>> {
    let status = query
        .status
        .as_deref()
        .filter(|s| !s.is_empty())
        .map(str::parse::<LedgerEntryStatus>)
        .transpose()
        .map_err(|e| ApiError::invalid_field("status", e))?;

    let limit = query.limit.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE);
    let offset = query.offset.unwrap_or(0).max(0);

    let entries = LedgerEntry::list_by_status(&state.db, status, limit, offset).await?;

    Ok(Json(entries))
}

/// # Errors
///
/// - `404`: Unknown entry
/// - `409`: The entry is not in `failed`
pub async fn retry_ledger_entry(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<LedgerEntry>> {
    let now = Utc::now();

    let Some(entry) = ledger::retry_failed(&state.db, id, now).await? else {
        return Err(match LedgerEntry::find_by_id(&state.db, id).await? {
            Some(existing) => ApiError::Conflict(format!(
                "Only failed entries can be retried (status: {})",
                format!("{:?}", existing.status).to_lowercase()
            )),
            None => ApiError::NotFound("Ledger entry not found".to_string()),
        });
    };

    tracing::info!(ledger_entry_id = %entry.id, requested_by = %auth.user_id, "Manual ledger retry");

    let Some(client) = state.integrations.ledger.as_deref() else {
        return Ok(Json(entry));
    };

    ledger::sync_one_best_effort(&state.db, client, state.integrations.alerts.as_ref(), entry.id, now).await;

    let refreshed = LedgerEntry::find_by_id(&state.db, entry.id).await?.unwrap_or(entry);
    Ok(Json(refreshed))
}
