/// Discount endpoints
///
/// - `POST /v1/discount-codes/validate` - price a code against one purchase
/// - `GET/POST /v1/discount-categories` - admin
/// - `GET/POST /v1/discount-codes` - admin
/// - `PUT /v1/discount-codes/:id` - admin
///
/// Codes are stored upper-cased; lookups ignore case and surrounding whitespace.

use crate::{
    app::AppState,
    error::{ApiError, ApiResult},
};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    Extension, Json,
};
use chrono::{DateTime, Utc};
use pitchside_shared::{
    auth::middleware::AuthContext,
    checkout::{quote_discount, DiscountQuote},
    models::{
        discount::{
            normalize_code, CreateDiscountCategory, CreateDiscountCode, DiscountCategory, DiscountCode,
            UpdateDiscountCode,
        },
        membership::MembershipType,
        registration::Registration,
    },
};
use serde::Deserialize;
use uuid::Uuid;
use validator::Validate;

/// Exactly one of `registration_id` or `membership_type_id` names the purchase
#[derive(Debug, Deserialize, Validate)]
pub struct ValidateCodeRequest {
    #[validate(length(min = 1, max = 50, message = "Code must be 1-50 characters"))]
    pub code: String,

    pub registration_id: Option<Uuid>,
    pub membership_type_id: Option<Uuid>,
}

#[derive(Debug, Deserialize, Validate)]
pub struct CreateCategoryRequest {
    #[validate(length(min = 1, max = 100, message = "Name must be 1-100 characters"))]
    pub name: String,

    #[validate(length(min = 1, max = 20, message = "Accounting code must be 1-20 characters"))]
    pub accounting_code: String,

    #[validate(range(min = 0, message = "Limit must not be negative"))]
    pub max_discount_per_user_per_season_cents: Option<i64>,
}

#[derive(Debug, Deserialize, Validate)]
pub struct CreateCodeRequest {
    #[validate(length(min = 1, max = 50, message = "Code must be 1-50 characters"))]
    pub code: String,

    pub category_id: Uuid,

    #[validate(range(min = 1, max = 100, message = "Percent off must be between 1 and 100"))]
    pub percent_off: i32,

    pub valid_from: Option<DateTime<Utc>>,
    pub valid_until: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize, Validate)]
pub struct UpdateCodeRequest {
    #[validate(range(min = 1, max = 100, message = "Percent off must be between 1 and 100"))]
    pub percent_off: Option<i32>,

    pub is_active: Option<bool>,
    pub valid_from: Option<DateTime<Utc>>,
    pub valid_until: Option<DateTime<Utc>>,
}

fn check_validity_window(from: Option<DateTime<Utc>>, until: Option<DateTime<Utc>>) -> ApiResult<()> {
    if let (Some(from), Some(until)) = (from, until) {
        if until <= from {
            return Err(ApiError::invalid_field("valid_until", "Must be after valid_from"));
        }
    }
    Ok(())
}

/// Prices a discount code for the caller
///
/// The quote is a preview; checkout re-validates the code and recomputes the amount.
///
/// # Errors
///
/// - `400`: Code inactive, expired, or the member's seasonal limit is used up
/// - `404`: Unknown code or purchase
/// - `422`: Neither or both purchase ids given
pub async fn validate_code(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Json(req): Json<ValidateCodeRequest>,
) -> ApiResult<Json<DiscountQuote>> {
    req.validate()?;

    let (season_id, price_cents) = match (req.registration_id, req.membership_type_id) {
        (Some(registration_id), None) => {
            let registration = Registration::find_by_id(&state.db, registration_id)
                .await?
                .filter(|r| r.is_active)
                .ok_or_else(|| ApiError::NotFound("Registration not found".to_string()))?;
            (registration.season_id, registration.price_cents)
        }
        (None, Some(membership_type_id)) => {
            let membership_type = MembershipType::find_by_id(&state.db, membership_type_id)
                .await?
                .filter(|t| t.is_active)
                .ok_or_else(|| ApiError::NotFound("Membership type not found".to_string()))?;
            (membership_type.season_id, membership_type.price_cents)
        }
        _ => {
            return Err(ApiError::invalid_field(
                "registration_id",
                "Provide exactly one of registration_id or membership_type_id",
            ))
        }
    };

    let quote = quote_discount(&state.db, auth.user_id, &req.code, season_id, price_cents, Utc::now()).await?;

    Ok(Json(quote))
}

pub async fn list_categories(State(state): State<AppState>) -> ApiResult<Json<Vec<DiscountCategory>>> {
    Ok(Json(DiscountCategory::list(&state.db).await?))
}

pub async fn create_category(
    State(state): State<AppState>,
    Json(req): Json<CreateCategoryRequest>,
) -> ApiResult<(StatusCode, Json<DiscountCategory>)> {
    req.validate()?;

    let category = DiscountCategory::create(
        &state.db,
        CreateDiscountCategory {
            name: req.name.trim().to_string(),
            accounting_code: req.accounting_code.trim().to_string(),
            max_discount_per_user_per_season_cents: req.max_discount_per_user_per_season_cents,
        },
    )
    .await?;

    Ok((StatusCode::CREATED, Json(category)))
}

pub async fn list_codes(State(state): State<AppState>) -> ApiResult<Json<Vec<DiscountCode>>> {
    Ok(Json(DiscountCode::list(&state.db).await?))
}

/// # Errors
///
/// - `409`: The code already exists (compared upper-cased)
/// - `422`: Unknown category or bad validity window
pub async fn create_code(
    State(state): State<AppState>,
    Json(req): Json<CreateCodeRequest>,
) -> ApiResult<(StatusCode, Json<DiscountCode>)> {
    req.validate()?;
    check_validity_window(req.valid_from, req.valid_until)?;

    let code = normalize_code(&req.code);
    if code.is_empty() {
        return Err(ApiError::invalid_field("code", "Code must not be blank"));
    }

    if DiscountCategory::find_by_id(&state.db, req.category_id).await?.is_none() {
        return Err(ApiError::invalid_field("category_id", "Discount category does not exist"));
    }

    let discount = DiscountCode::create(
        &state.db,
        CreateDiscountCode {
            code,
            category_id: req.category_id,
            percent_off: req.percent_off,
            valid_from: req.valid_from,
            valid_until: req.valid_until,
        },
    )
    .await?;

    tracing::info!(discount_code_id = %discount.id, code = %discount.code, "Discount code created");

    Ok((StatusCode::CREATED, Json(discount)))
}

pub async fn update_code(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<UpdateCodeRequest>,
) -> ApiResult<Json<DiscountCode>> {
    req.validate()?;

    let existing = DiscountCode::find_by_id(&state.db, id)
        .await?
        .ok_or_else(|| ApiError::NotFound("Discount code not found".to_string()))?;
    check_validity_window(
        req.valid_from.or(existing.valid_from),
        req.valid_until.or(existing.valid_until),
    )?;

    let discount = DiscountCode::update(
        &state.db,
        id,
        UpdateDiscountCode {
            percent_off: req.percent_off,
            is_active: req.is_active,
            valid_from: req.valid_from,
            valid_until: req.valid_until,
        },
    )
    .await?
    .ok_or_else(|| ApiError::NotFound("Discount code not found".to_string()))?;

    Ok(Json(discount))
}
