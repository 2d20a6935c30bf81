/// Waitlist endpoints
///
/// A member can only join once the registration is full. Admins offer spots in queue
/// order; an offer is a reservation held for `WAITLIST_HOLD_HOURS` that bypasses the
/// capacity check.
///
/// # Endpoints
///
/// - `POST /v1/registrations/:id/waitlist` - join (idempotent)
/// - `DELETE /v1/registrations/:id/waitlist` - leave
/// - `GET /v1/registrations/:id/waitlist/position`
/// - `GET /v1/registrations/:id/waitlist` - admin
/// - `POST /v1/waitlist/:entry_id/offer` - admin

use crate::{
    app::AppState,
    error::{ApiError, ApiResult},
};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    Extension, Json,
};
use chrono::Utc;
use pitchside_shared::{
    auth::middleware::AuthContext,
    models::{
        registration::Registration,
        waitlist::{WaitlistEntry, WaitlistListing},
    },
    waitlist::{self, WaitlistOffer, WaitlistPosition},
};
use uuid::Uuid;

/// # Errors
///
/// - `404`: Registration unknown or inactive
/// - `409`: Registration still has spots, or the member already holds one
pub async fn join_waitlist(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<WaitlistPosition>> {
    let position = waitlist::join(&state.db, auth.user_id, id, Utc::now()).await?;

    Ok(Json(position))
}

pub async fn leave_waitlist(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    waitlist::leave(&state.db, &state.integrations, auth.user_id, id).await?;

    Ok(StatusCode::NO_CONTENT)
}

pub async fn waitlist_position(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<WaitlistPosition>> {
    Ok(Json(waitlist::position(&state.db, auth.user_id, id).await?))
}

pub async fn list_waitlist(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Vec<WaitlistListing>>> {
    if Registration::find_by_id(&state.db, id).await?.is_none() {
        return Err(ApiError::NotFound("Registration not found".to_string()));
    }

    Ok(Json(WaitlistEntry::list_by_registration(&state.db, id).await?))
}

pub async fn offer_spot(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(entry_id): Path<Uuid>,
) -> ApiResult<Json<WaitlistOffer>> {
    let offer = waitlist::offer_spot(&state.db, &state.config.checkout, entry_id, Utc::now()).await?;

    tracing::info!(
        waitlist_entry_id = %entry_id,
        offered_by = %auth.user_id,
        expires_at = ?offer.reservation.reservation_expires_at,
        "Waitlist spot offered"
    );

    Ok(Json(offer))
}
