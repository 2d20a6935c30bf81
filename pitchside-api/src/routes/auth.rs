/// Authentication endpoints
///
/// This module provides member authentication endpoints:
/// - Registration
/// - Login
/// - Token refresh
/// - The caller's own profile
///
/// # Endpoints
///
/// - `POST /v1/auth/register` - Create a member account
/// - `POST /v1/auth/login` - Login and get tokens
/// - `POST /v1/auth/refresh` - Refresh access token
/// - `GET /v1/me` - Current profile
/// - `PUT /v1/me` - Update name or phone

use crate::{
    app::AppState,
    error::{ApiError, ApiResult},
    routes::current_user,
};
use axum::{extract::State, http::StatusCode, Extension, Json};
use pitchside_shared::{
    auth::{jwt, middleware::AuthContext, password},
    models::user::{CreateUser, UpdateProfile, User},
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

/// Register request
#[derive(Debug, Deserialize, Validate)]
pub struct RegisterRequest {
    #[validate(email(message = "Invalid email format"))]
    pub email: String,

    /// Checked for strength after the length check
    #[validate(length(min = 8, message = "Password must be at least 8 characters"))]
    pub password: String,

    #[validate(length(min = 1, max = 100, message = "First name must be 1-100 characters"))]
    pub first_name: String,

    #[validate(length(min = 1, max = 100, message = "Last name must be 1-100 characters"))]
    pub last_name: String,

    #[validate(length(max = 30, message = "Phone must be at most 30 characters"))]
    pub phone: Option<String>,
}

/// Login request
#[derive(Debug, Deserialize, Validate)]
pub struct LoginRequest {
    #[validate(email(message = "Invalid email format"))]
    pub email: String,

    pub password: String,
}

/// Tokens issued on register and login
#[derive(Debug, Serialize)]
pub struct AuthResponse {
    pub user_id: Uuid,

    /// Access token (24h)
    pub access_token: String,

    /// Refresh token (30d)
    pub refresh_token: String,

    pub user: User,
}

/// Refresh token request
#[derive(Debug, Deserialize)]
pub struct RefreshRequest {
    pub refresh_token: String,
}

/// Refresh token response
#[derive(Debug, Serialize)]
pub struct RefreshResponse {
    /// New access token (24h)
    pub access_token: String,
}

/// Profile update request
#[derive(Debug, Deserialize, Validate)]
pub struct UpdateProfileRequest {
    #[validate(length(min = 1, max = 100, message = "First name must be 1-100 characters"))]
    pub first_name: Option<String>,

    #[validate(length(min = 1, max = 100, message = "Last name must be 1-100 characters"))]
    pub last_name: Option<String>,

    #[validate(length(max = 30, message = "Phone must be at most 30 characters"))]
    pub phone: Option<String>,
}

fn issue_tokens(state: &AppState, user: User) -> ApiResult<AuthResponse> {
    let access_claims = jwt::Claims::new(user.id, user.role, jwt::TokenType::Access);
    let refresh_claims = jwt::Claims::new(user.id, user.role, jwt::TokenType::Refresh);

    Ok(AuthResponse {
        user_id: user.id,
        access_token: jwt::create_token(&access_claims, state.jwt_secret())?,
        refresh_token: jwt::create_token(&refresh_claims, state.jwt_secret())?,
        user,
    })
}

/// Register a new member
///
/// # Endpoint
///
/// ```text
/// POST /v1/auth/register
/// Content-Type: application/json
///
/// {
///   "email": "winger@example.com",
///   "password": "SecureP@ss123",
///   "first_name": "Alex",
///   "last_name": "Morgan"
/// }
/// ```
///
/// # Errors
///
/// - `409 Conflict`: Email already exists (any casing)
/// - `422 Unprocessable Entity`: Validation failed or weak password
pub async fn register(
    State(state): State<AppState>,
    Json(req): Json<RegisterRequest>,
) -> ApiResult<(StatusCode, Json<AuthResponse>)> {
    req.validate()?;

    password::validate_password_strength(&req.password)
        .map_err(|e| ApiError::invalid_field("password", e))?;

    let password_hash = password::hash_password(&req.password)?;

    let user = User::create(
        &state.db,
        CreateUser {
            email: req.email,
            password_hash,
            first_name: req.first_name.trim().to_string(),
            last_name: req.last_name.trim().to_string(),
            phone: req.phone.filter(|p| !p.trim().is_empty()),
        },
    )
    .await?;

    tracing::info!(user_id = %user.id, "Member registered");

    Ok((StatusCode::CREATED, Json(issue_tokens(&state, user)?)))
}

/// Login endpoint
///
/// # Errors
///
/// - `401 Unauthorized`: Unknown email or wrong password (same message for both)
pub async fn login(
    State(state): State<AppState>,
    Json(req): Json<LoginRequest>,
) -> ApiResult<Json<AuthResponse>> {
    req.validate()?;

    let user = User::find_by_email(&state.db, &req.email)
        .await?
        .ok_or_else(|| ApiError::Unauthorized("Invalid email or password".to_string()))?;

    if !password::verify_password(&req.password, &user.password_hash)? {
        return Err(ApiError::Unauthorized("Invalid email or password".to_string()));
    }

    Ok(Json(issue_tokens(&state, user)?))
}

/// Token refresh endpoint
///
/// The new access token carries the account's current role, so a promotion or
/// demotion applies on the next refresh.
pub async fn refresh(
    State(state): State<AppState>,
    Json(req): Json<RefreshRequest>,
) -> ApiResult<Json<RefreshResponse>> {
    let refresh_claims = jwt::validate_refresh_token(&req.refresh_token, state.jwt_secret())?;

    let user = User::find_by_id(&state.db, refresh_claims.sub)
        .await?
        .ok_or_else(|| ApiError::Unauthorized("Account no longer exists".to_string()))?;

    let access_claims = jwt::Claims::new(user.id, user.role, jwt::TokenType::Access);
    let access_token = jwt::create_token(&access_claims, state.jwt_secret())?;

    Ok(Json(RefreshResponse { access_token }))
}

pub async fn me(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
) -> ApiResult<Json<User>> {
    Ok(Json(current_user(&state, &auth).await?))
}

pub async fn update_me(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Json(req): Json<UpdateProfileRequest>,
) -> ApiResult<Json<User>> {
    req.validate()?;

    let user = User::update_profile(
        &state.db,
        auth.user_id,
        UpdateProfile {
            first_name: req.first_name.map(|n| n.trim().to_string()),
            last_name: req.last_name.map(|n| n.trim().to_string()),
            phone: req.phone,
        },
    )
    .await?
    .ok_or_else(|| ApiError::Unauthorized("Account no longer exists".to_string()))?;

    Ok(Json(user))
}
