/// Registration endpoints
///
/// Listing, admin management, and the member side of checkout.
///
/// # Endpoints
///
/// - `GET /v1/seasons/:id/registrations` - with spots remaining
/// - `GET /v1/registrations/:id`
/// - `GET /v1/registrations/me`
/// - `POST /v1/registrations/:id/checkout` - reserve a slot and start paying
/// - `DELETE /v1/registrations/:id/reservation` - release an unpaid slot
/// - `POST /v1/registrations` - admin
/// - `PUT /v1/registrations/:id` - admin
/// - `DELETE /v1/registrations/:id` - admin
/// - `GET /v1/registrations/:id/roster` - admin

use crate::{
    app::AppState,
    error::{ApiError, ApiResult},
    routes::{current_user, InactiveFilter},
};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Extension, Json,
};
use chrono::{DateTime, Utc};
use pitchside_shared::{
    auth::middleware::AuthContext,
    checkout::{self, CheckoutSession},
    models::{
        registration::{
            CreateRegistration, Registration, RegistrationAvailability, RegistrationKind, RosterEntry,
            UpdateRegistration, UserRegistration, UserRegistrationSummary,
        },
        season::Season,
    },
};
use serde::Deserialize;
use uuid::Uuid;
use validator::Validate;

#[derive(Debug, Deserialize, Validate)]
pub struct CreateRegistrationRequest {
    pub season_id: Uuid,

    #[validate(length(min = 1, max = 100, message = "Name must be 1-100 characters"))]
    pub name: String,

    pub kind: RegistrationKind,

    #[validate(range(min = 1, message = "Capacity must be at least 1"))]
    pub capacity: i32,

    #[validate(range(min = 0, message = "Price must not be negative"))]
    pub price_cents: i64,

    /// Per-game price for alternates; `None` disables alternates
    #[validate(range(min = 0, message = "Alternate price must not be negative"))]
    pub alternate_price_cents: Option<i64>,

    #[serde(default)]
    pub requires_membership: bool,

    pub opens_at: DateTime<Utc>,
    pub closes_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize, Validate)]
pub struct UpdateRegistrationRequest {
    #[validate(length(min = 1, max = 100, message = "Name must be 1-100 characters"))]
    pub name: Option<String>,

    pub kind: Option<RegistrationKind>,

    #[validate(range(min = 1, message = "Capacity must be at least 1"))]
    pub capacity: Option<i32>,

    #[validate(range(min = 0, message = "Price must not be negative"))]
    pub price_cents: Option<i64>,

    #[validate(range(min = 0, message = "Alternate price must not be negative"))]
    pub alternate_price_cents: Option<i64>,

    pub requires_membership: Option<bool>,
    pub opens_at: Option<DateTime<Utc>>,
    pub closes_at: Option<DateTime<Utc>>,
    pub is_active: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
pub struct RegistrationCheckoutRequest {
    pub discount_code: Option<String>,
}

fn check_window(opens_at: DateTime<Utc>, closes_at: DateTime<Utc>) -> ApiResult<()> {
    if closes_at <= opens_at {
        return Err(ApiError::invalid_field("closes_at", "Registration must close after it opens"));
    }
    Ok(())
}

pub async fn list_registrations(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(season_id): Path<Uuid>,
    Query(filter): Query<InactiveFilter>,
) -> ApiResult<Json<Vec<RegistrationAvailability>>> {
    let include_inactive = filter.include_inactive && auth.is_admin();
    let registrations = Registration::list_by_season(&state.db, season_id, Utc::now(), include_inactive).await?;

    Ok(Json(registrations))
}

pub async fn get_registration(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<RegistrationAvailability>> {
    let registration = Registration::find_with_availability(&state.db, id, Utc::now())
        .await?
        .filter(|r| r.registration.is_active || auth.is_admin())
        .ok_or_else(|| ApiError::NotFound("Registration not found".to_string()))?;

    Ok(Json(registration))
}

pub async fn my_registrations(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
) -> ApiResult<Json<Vec<UserRegistrationSummary>>> {
    Ok(Json(UserRegistration::list_by_user(&state.db, auth.user_id).await?))
}

/// Reserves a slot and returns what the client needs to pay for it
///
/// Calling again while the reservation holds returns the same payment.
///
/// # Errors
///
/// - `400`: Registration closed or discount unusable
/// - `403`: A membership for the season is required
/// - `409`: Registration full, or already registered
pub async fn checkout_registration(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(id): Path<Uuid>,
    body: Option<Json<RegistrationCheckoutRequest>>,
) -> ApiResult<Json<CheckoutSession>> {
    let user = current_user(&state, &auth).await?;
    let req = body.map(|Json(req)| req).unwrap_or_default();

    let session = checkout::checkout_registration(
        &state.db,
        &state.integrations,
        &state.config.checkout,
        &user,
        id,
        req.discount_code.as_deref(),
        Utc::now(),
    )
    .await?;

    Ok(Json(session))
}

pub async fn cancel_reservation(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    let reservation = checkout::cancel_reservation(&state.db, &state.integrations, auth.user_id, id).await?;

    tracing::info!(
        user_registration_id = %reservation.id,
        user_id = %auth.user_id,
        "Reservation cancelled by member"
    );

    Ok(StatusCode::NO_CONTENT)
}

pub async fn create_registration(
    State(state): State<AppState>,
    Json(req): Json<CreateRegistrationRequest>,
) -> ApiResult<(StatusCode, Json<Registration>)> {
    req.validate()?;
    check_window(req.opens_at, req.closes_at)?;

    if Season::find_by_id(&state.db, req.season_id).await?.is_none() {
        return Err(ApiError::invalid_field("season_id", "Season does not exist"));
    }

    let registration = Registration::create(
        &state.db,
        CreateRegistration {
            season_id: req.season_id,
            name: req.name.trim().to_string(),
            kind: req.kind,
            capacity: req.capacity,
            price_cents: req.price_cents,
            alternate_price_cents: req.alternate_price_cents,
            requires_membership: req.requires_membership,
            opens_at: req.opens_at,
            closes_at: req.closes_at,
        },
    )
    .await?;

    tracing::info!(
        registration_id = %registration.id,
        season_id = %registration.season_id,
        capacity = registration.capacity,
        "Registration created"
    );

    Ok((StatusCode::CREATED, Json(registration)))
}

/// Lowering capacity below the slots already taken is allowed; nobody is removed,
/// new checkouts are refused until slots free up
pub async fn update_registration(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<UpdateRegistrationRequest>,
) -> ApiResult<Json<Registration>> {
    req.validate()?;

    let existing = Registration::find_by_id(&state.db, id)
        .await?
        .ok_or_else(|| ApiError::NotFound("Registration not found".to_string()))?;
    check_window(
        req.opens_at.unwrap_or(existing.opens_at),
        req.closes_at.unwrap_or(existing.closes_at),
    )?;

    let registration = Registration::update(
        &state.db,
        id,
        UpdateRegistration {
            name: req.name.map(|n| n.trim().to_string()),
            kind: req.kind,
            capacity: req.capacity,
            price_cents: req.price_cents,
            alternate_price_cents: req.alternate_price_cents,
            requires_membership: req.requires_membership,
            opens_at: req.opens_at,
            closes_at: req.closes_at,
            is_active: req.is_active,
        },
    )
    .await?
    .ok_or_else(|| ApiError::NotFound("Registration not found".to_string()))?;

    Ok(Json(registration))
}

pub async fn delete_registration(State(state): State<AppState>, Path(id): Path<Uuid>) -> ApiResult<StatusCode> {
    if !Registration::delete(&state.db, id).await? {
        return Err(ApiError::NotFound("Registration not found".to_string()));
    }

    tracing::info!(registration_id = %id, "Registration deleted");
    Ok(StatusCode::NO_CONTENT)
}

pub async fn roster(State(state): State<AppState>, Path(id): Path<Uuid>) -> ApiResult<Json<Vec<RosterEntry>>> {
    if Registration::find_by_id(&state.db, id).await?.is_none() {
        return Err(ApiError::NotFound("Registration not found".to_string()));
    }

    Ok(Json(UserRegistration::roster(&state.db, id).await?))
}
