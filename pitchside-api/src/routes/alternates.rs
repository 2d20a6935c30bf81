/// Alternate player endpoints
///
/// Members opt in as alternates for a registration and save a card through a
/// SetupIntent. When an admin picks alternates for a game, each pick is charged the
/// registration's alternate price off-session.
///
/// # Endpoints
///
/// - `POST /v1/registrations/:id/alternates` - opt in (idempotent)
/// - `GET /v1/registrations/:id/alternates` - admin
/// - `GET/POST /v1/registrations/:id/games` - admin
/// - `POST /v1/games/:id/alternates` - admin; pick and charge

use crate::{
    app::AppState,
    error::{ApiError, ApiResult},
    routes::current_user,
};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    Extension, Json,
};
use chrono::{DateTime, Utc};
use pitchside_shared::{
    alternates::{self, AlternateChargeOutcome, AlternateSignup},
    auth::middleware::AuthContext,
    models::{
        alternate::{AlternateListing, AlternateRegistration, Game},
        registration::Registration,
    },
};
use serde::Deserialize;
use uuid::Uuid;
use validator::Validate;

#[derive(Debug, Deserialize, Validate)]
pub struct CreateGameRequest {
    pub starts_at: DateTime<Utc>,

    #[validate(length(max = 200, message = "Location must be at most 200 characters"))]
    pub location: Option<String>,
}

#[derive(Debug, Deserialize, Validate)]
pub struct SelectAlternatesRequest {
    #[validate(length(min = 1, max = 50, message = "Select between 1 and 50 players"))]
    pub user_ids: Vec<Uuid>,
}

/// # Errors
///
/// - `400`: The registration does not take alternates
/// - `404`: Registration unknown or inactive
pub async fn register_alternate(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<AlternateSignup>> {
    let user = current_user(&state, &auth).await?;
    let signup = alternates::register(&state.db, &state.integrations, &user, id).await?;

    Ok(Json(signup))
}

pub async fn list_alternates(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Vec<AlternateListing>>> {
    if Registration::find_by_id(&state.db, id).await?.is_none() {
        return Err(ApiError::NotFound("Registration not found".to_string()));
    }

    Ok(Json(AlternateRegistration::list_by_registration(&state.db, id).await?))
}

pub async fn list_games(State(state): State<AppState>, Path(id): Path<Uuid>) -> ApiResult<Json<Vec<Game>>> {
    Ok(Json(Game::list_by_registration(&state.db, id).await?))
}

pub async fn create_game(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<CreateGameRequest>,
) -> ApiResult<(StatusCode, Json<Game>)> {
    req.validate()?;

    let registration = Registration::find_by_id(&state.db, id)
        .await?
        .ok_or_else(|| ApiError::NotFound("Registration not found".to_string()))?;
    if !registration.accepts_alternates() {
        return Err(ApiError::BadRequest("Registration does not offer alternates".to_string()));
    }

    let location = req.location.map(|l| l.trim().to_string()).filter(|l| !l.is_empty());
    let game = Game::create(&state.db, registration.id, req.starts_at, location).await?;

    Ok((StatusCode::CREATED, Json(game)))
}

/// Charges each selected player and reports one outcome per player
///
/// Declines and players without a saved card do not fail the request; they show up
/// in the outcome list. Duplicate ids in the request are charged once.
pub async fn select_alternates(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(game_id): Path<Uuid>,
    Json(req): Json<SelectAlternatesRequest>,
) -> ApiResult<Json<Vec<AlternateChargeOutcome>>> {
    req.validate()?;

    let mut user_ids = req.user_ids;
    let mut seen = std::collections::HashSet::new();
    user_ids.retain(|id| seen.insert(*id));

    let outcomes = alternates::select_for_game(&state.db, &state.integrations, auth.user_id, game_id, &user_ids).await?;

    Ok(Json(outcomes))
}
