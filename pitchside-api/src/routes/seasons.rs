/// Season endpoints
///
/// - `GET /v1/seasons` - Seasons (inactive ones only for admins)
/// - `GET /v1/seasons/:id`
/// - `POST /v1/seasons` - admin
/// - `PUT /v1/seasons/:id` - admin
/// - `DELETE /v1/seasons/:id` - admin; refused once memberships reference it

use crate::{
    app::AppState,
    error::{ApiError, ApiResult},
};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    Extension, Json,
};
use chrono::NaiveDate;
use pitchside_shared::{
    auth::middleware::AuthContext,
    models::season::{CreateSeason, Season, UpdateSeason},
};
use serde::Deserialize;
use uuid::Uuid;
use validator::Validate;

#[derive(Debug, Deserialize, Validate)]
pub struct CreateSeasonRequest {
    #[validate(length(min = 1, max = 100, message = "Name must be 1-100 characters"))]
    pub name: String,

    pub start_date: NaiveDate,
    pub end_date: NaiveDate,

    #[serde(default = "default_true")]
    pub is_active: bool,
}

#[derive(Debug, Deserialize, Validate)]
pub struct UpdateSeasonRequest {
    #[validate(length(min = 1, max = 100, message = "Name must be 1-100 characters"))]
    pub name: Option<String>,

    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
    pub is_active: Option<bool>,
}

fn default_true() -> bool {
    true
}

fn check_dates(start: NaiveDate, end: NaiveDate) -> ApiResult<()> {
    if end < start {
        return Err(ApiError::invalid_field("end_date", "End date must not be before the start date"));
    }
    Ok(())
}

pub async fn list_seasons(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
) -> ApiResult<Json<Vec<Season>>> {
    let mut seasons = Season::list(&state.db).await?;
    if !auth.is_admin() {
        seasons.retain(|s| s.is_active);
    }

    Ok(Json(seasons))
}

pub async fn get_season(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Season>> {
    let season = Season::find_by_id(&state.db, id)
        .await?
        .filter(|s| s.is_active || auth.is_admin())
        .ok_or_else(|| ApiError::NotFound("Season not found".to_string()))?;

    Ok(Json(season))
}

pub async fn create_season(
    State(state): State<AppState>,
    Json(req): Json<CreateSeasonRequest>,
) -> ApiResult<(StatusCode, Json<Season>)> {
    req.validate()?;
    check_dates(req.start_date, req.end_date)?;

    let season = Season::create(
        &state.db,
        CreateSeason {
            name: req.name.trim().to_string(),
            start_date: req.start_date,
            end_date: req.end_date,
            is_active: req.is_active,
        },
    )
    .await?;

    tracing::info!(season_id = %season.id, name = %season.name, "Season created");

    Ok((StatusCode::CREATED, Json(season)))
}

pub async fn update_season(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<UpdateSeasonRequest>,
) -> ApiResult<Json<Season>> {
    req.validate()?;

    let existing = Season::find_by_id(&state.db, id)
        .await?
        .ok_or_else(|| ApiError::NotFound("Season not found".to_string()))?;
    check_dates(
        req.start_date.unwrap_or(existing.start_date),
        req.end_date.unwrap_or(existing.end_date),
    )?;

    let season = Season::update(
        &state.db,
        id,
        UpdateSeason {
            name: req.name.map(|n| n.trim().to_string()),
            start_date: req.start_date,
            end_date: req.end_date,
            is_active: req.is_active,
        },
    )
    .await?
    .ok_or_else(|| ApiError::NotFound("Season not found".to_string()))?;

    Ok(Json(season))
}

pub async fn delete_season(State(state): State<AppState>, Path(id): Path<Uuid>) -> ApiResult<StatusCode> {
    if !Season::delete(&state.db, id).await? {
        return Err(ApiError::NotFound("Season not found".to_string()));
    }

    tracing::info!(season_id = %id, "Season deleted");
    Ok(StatusCode::NO_CONTENT)
}
