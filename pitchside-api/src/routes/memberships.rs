/// Membership endpoints
///
/// - `GET /v1/seasons/:id/membership-types`
/// - `POST /v1/membership-types` - admin
/// - `PUT /v1/membership-types/:id` - admin
/// - `DELETE /v1/membership-types/:id` - admin
/// - `GET /v1/memberships/me`
/// - `POST /v1/memberships/checkout`

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
use chrono::Utc;
use pitchside_shared::{
    auth::middleware::AuthContext,
    checkout::{self, CheckoutSession},
    models::{
        membership::{CreateMembershipType, Membership, MembershipSummary, MembershipType, UpdateMembershipType},
        season::Season,
    },
};
use serde::Deserialize;
use uuid::Uuid;
use validator::Validate;

#[derive(Debug, Deserialize, Validate)]
pub struct CreateMembershipTypeRequest {
    pub season_id: Uuid,

    #[validate(length(min = 1, max = 100, message = "Name must be 1-100 characters"))]
    pub name: String,

    #[validate(length(max = 1000, message = "Description must be at most 1000 characters"))]
    pub description: Option<String>,

    #[validate(range(min = 0, message = "Price must not be negative"))]
    pub price_cents: i64,

    /// 1 means paid in full only
    #[serde(default = "default_installments")]
    #[validate(range(min = 1, max = 12, message = "Installments must be between 1 and 12"))]
    pub installment_count: i32,
}

#[derive(Debug, Deserialize, Validate)]
pub struct UpdateMembershipTypeRequest {
    #[validate(length(min = 1, max = 100, message = "Name must be 1-100 characters"))]
    pub name: Option<String>,

    #[validate(length(max = 1000, message = "Description must be at most 1000 characters"))]
    pub description: Option<String>,

    #[validate(range(min = 0, message = "Price must not be negative"))]
    pub price_cents: Option<i64>,

    #[validate(range(min = 1, max = 12, message = "Installments must be between 1 and 12"))]
    pub installment_count: Option<i32>,

    pub is_active: Option<bool>,
}

#[derive(Debug, Deserialize)]
pub struct MembershipCheckoutRequest {
    pub membership_type_id: Uuid,

    pub discount_code: Option<String>,

    #[serde(default)]
    pub use_payment_plan: bool,
}

fn default_installments() -> i32 {
    1
}

pub async fn list_membership_types(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(season_id): Path<Uuid>,
    Query(filter): Query<InactiveFilter>,
) -> ApiResult<Json<Vec<MembershipType>>> {
    let include_inactive = filter.include_inactive && auth.is_admin();
    let types = MembershipType::list_by_season(&state.db, season_id, include_inactive).await?;

    Ok(Json(types))
}

pub async fn create_membership_type(
    State(state): State<AppState>,
    Json(req): Json<CreateMembershipTypeRequest>,
) -> ApiResult<(StatusCode, Json<MembershipType>)> {
    req.validate()?;

    if Season::find_by_id(&state.db, req.season_id).await?.is_none() {
        return Err(ApiError::invalid_field("season_id", "Season does not exist"));
    }

    let membership_type = MembershipType::create(
        &state.db,
        CreateMembershipType {
            season_id: req.season_id,
            name: req.name.trim().to_string(),
            description: req.description,
            price_cents: req.price_cents,
            installment_count: req.installment_count,
        },
    )
    .await?;

    tracing::info!(
        membership_type_id = %membership_type.id,
        season_id = %membership_type.season_id,
        "Membership type created"
    );

    Ok((StatusCode::CREATED, Json(membership_type)))
}

pub async fn update_membership_type(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<UpdateMembershipTypeRequest>,
) -> ApiResult<Json<MembershipType>> {
    req.validate()?;

    let membership_type = MembershipType::update(
        &state.db,
        id,
        UpdateMembershipType {
            name: req.name.map(|n| n.trim().to_string()),
            description: req.description,
            price_cents: req.price_cents,
            installment_count: req.installment_count,
            is_active: req.is_active,
        },
    )
    .await?
    .ok_or_else(|| ApiError::NotFound("Membership type not found".to_string()))?;

    Ok(Json(membership_type))
}

/// Types that have been bought cannot be deleted (409); deactivate them instead
pub async fn delete_membership_type(State(state): State<AppState>, Path(id): Path<Uuid>) -> ApiResult<StatusCode> {
    if !MembershipType::delete(&state.db, id).await? {
        return Err(ApiError::NotFound("Membership type not found".to_string()));
    }

    Ok(StatusCode::NO_CONTENT)
}

pub async fn my_memberships(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
) -> ApiResult<Json<Vec<MembershipSummary>>> {
    Ok(Json(Membership::list_by_user(&state.db, auth.user_id).await?))
}

/// Starts or resumes a membership purchase
///
/// # Errors
///
/// - `400`: Discount code unusable, or the type has no payment plan
/// - `402`: Card declined while creating the charge
/// - `404`: Unknown or inactive membership type, or unknown discount code
/// - `409`: Member already holds this membership
pub async fn checkout_membership(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Json(req): Json<MembershipCheckoutRequest>,
) -> ApiResult<Json<CheckoutSession>> {
    let user = current_user(&state, &auth).await?;

    let session = checkout::checkout_membership(
        &state.db,
        &state.integrations,
        &user,
        req.membership_type_id,
        req.discount_code.as_deref(),
        req.use_payment_plan,
        Utc::now(),
    )
    .await?;

    Ok(Json(session))
}
