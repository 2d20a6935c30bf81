/// Authentication middleware for Axum
///
/// [`jwt_auth_middleware`] validates `Authorization: Bearer <token>` and inserts an
/// [`AuthContext`] into the request extensions. [`require_admin_middleware`] runs after
/// it on admin-only routers and rejects members with 403.
///
/// # Example
///
/// ```no_run
/// use axum::{middleware, routing::get, Extension, Router};
/// use pitchside_shared::auth::middleware::{create_jwt_middleware, require_admin_middleware, AuthContext};
///
/// async fn roster(Extension(auth): Extension<AuthContext>) -> String {
///     format!("Hello, admin {}!", auth.user_id)
/// }
///
/// let app: Router = Router::new()
///     .route("/roster", get(roster))
///     .layer(middleware::from_fn(require_admin_middleware))
///     .layer(middleware::from_fn(create_jwt_middleware("your-jwt-secret")));
/// ```

use axum::{
    extract::Request,
    http::{header, HeaderMap, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::jwt::{validate_access_token, Claims, JwtError};
use crate::models::user::UserRole;

/// Authenticated caller, available to handlers via `Extension<AuthContext>`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthContext {
    pub user_id: Uuid,
    pub role: UserRole,
}

impl AuthContext {
    pub fn from_claims(claims: &Claims) -> Self {
        Self {
            user_id: claims.sub,
            role: claims.role,
        }
    }

    pub fn is_admin(&self) -> bool {
        self.role == UserRole::Admin
    }

    /// Errors with [`AuthError::Forbidden`] unless the caller is an admin
    pub fn require_admin(&self) -> Result<(), AuthError> {
        if self.is_admin() {
            Ok(())
        } else {
            Err(AuthError::Forbidden)
        }
    }
}

/// Error type for authentication middleware
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    #[error("Missing authorization header")]
    MissingCredentials,

    #[error("{0}")]
    InvalidFormat(String),

    #[error("{0}")]
    InvalidToken(String),

    #[error("Admin access required")]
    Forbidden,
}

impl AuthError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            AuthError::MissingCredentials | AuthError::InvalidToken(_) => StatusCode::UNAUTHORIZED,
            AuthError::InvalidFormat(_) => StatusCode::BAD_REQUEST,
            AuthError::Forbidden => StatusCode::FORBIDDEN,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            AuthError::MissingCredentials | AuthError::InvalidToken(_) => "unauthorized",
            AuthError::InvalidFormat(_) => "bad_request",
            AuthError::Forbidden => "forbidden",
        }
    }
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "error": self.code(),
            "message": self.to_string(),
        });

        (self.status_code(), Json(body)).into_response()
    }
}

/// Validates the bearer token in `headers` and builds the caller's context
pub fn authenticate_bearer(headers: &HeaderMap, secret: &str) -> Result<AuthContext, AuthError> {
    let auth_header = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .ok_or(AuthError::MissingCredentials)?;

    let token = auth_header
        .strip_prefix("Bearer ")
        .ok_or_else(|| AuthError::InvalidFormat("Expected Bearer token".to_string()))?;

    let claims = validate_access_token(token, secret).map_err(|e| match e {
        JwtError::Expired => AuthError::InvalidToken("Token expired".to_string()),
        JwtError::InvalidIssuer => AuthError::InvalidToken("Invalid issuer".to_string()),
        _ => AuthError::InvalidToken(format!("Invalid token: {}", e)),
    })?;

    Ok(AuthContext::from_claims(&claims))
}

/// JWT authentication middleware
pub async fn jwt_auth_middleware(
    secret: String,
    mut req: Request,
    next: Next,
) -> Result<Response, AuthError> {
    let auth_context = authenticate_bearer(req.headers(), &secret)?;
    req.extensions_mut().insert(auth_context);

    Ok(next.run(req).await)
}

/// Admin guard; must be layered inside the JWT middleware
pub async fn require_admin_middleware(req: Request, next: Next) -> Result<Response, AuthError> {
    let auth = req
        .extensions()
        .get::<AuthContext>()
        .copied()
        .ok_or(AuthError::MissingCredentials)?;

    auth.require_admin()?;

    Ok(next.run(req).await)
}

/// Captures the JWT secret and returns a closure for `axum::middleware::from_fn`
pub fn create_jwt_middleware(
    secret: impl Into<String>,
) -> impl Fn(Request, Next) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<Response, AuthError>> + Send>> + Clone {
    let secret = secret.into();
    move |req, next| {
        let secret = secret.clone();
        Box::pin(jwt_auth_middleware(secret, req, next))
    }
}
