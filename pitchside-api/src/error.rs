/// Error handling for the API server
///
/// This module provides a unified error type that maps to HTTP responses.
/// All handlers return `Result<T, ApiError>`; the `From` conversions below turn
/// checkout, auth and database errors into the right status code.
///
/// Every error body has the same shape:
///
/// ```json
/// { "error": "conflict", "message": "Registration is full" }
/// ```
///
/// with a `details` array of per-field messages for validation failures.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use pitchside_shared::auth::{jwt::JwtError, middleware::AuthError, password::PasswordError};
use pitchside_shared::checkout::{CheckoutError, DiscountError};
use pitchside_shared::integrations::stripe::StripeError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// API result type alias
pub type ApiResult<T> = Result<T, ApiError>;

/// Unified API error type
#[derive(Debug)]
pub enum ApiError {
    /// Bad request (400)
    BadRequest(String),

    /// Unauthorized (401)
    Unauthorized(String),

    /// Card declined (402)
    PaymentRequired(String),

    /// Forbidden (403)
    Forbidden(String),

    /// Not found (404)
    NotFound(String),

    /// Conflict (409), e.g. duplicate email or full registration
    Conflict(String),

    /// Unprocessable entity (422) - validation errors
    ValidationError(Vec<ValidationErrorDetail>),

    /// Internal server error (500)
    InternalError(String),

    /// Service unavailable (503), e.g. Stripe unreachable
    ServiceUnavailable(String),
}

/// Validation error detail
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationErrorDetail {
    /// Field that failed validation
    pub field: String,

    /// Error message
    pub message: String,
}

impl ValidationErrorDetail {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

/// Error response format
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Error code (e.g., "bad_request", "unauthorized")
    pub error: String,

    /// Human-readable error message
    pub message: String,

    /// Optional validation errors
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Vec<ValidationErrorDetail>>,
}

impl ApiError {
    /// Single-field validation failure
    pub fn invalid_field(field: &str, message: impl Into<String>) -> Self {
        ApiError::ValidationError(vec![ValidationErrorDetail::new(field, message)])
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ApiError::BadRequest(msg) => write!(f, "Bad request: {}", msg),
            ApiError::Unauthorized(msg) => write!(f, "Unauthorized: {}", msg),
            ApiError::PaymentRequired(msg) => write!(f, "Payment declined: {}", msg),
            ApiError::Forbidden(msg) => write!(f, "Forbidden: {}", msg),
            ApiError::NotFound(msg) => write!(f, "Not found: {}", msg),
            ApiError::Conflict(msg) => write!(f, "Conflict: {}", msg),
            ApiError::ValidationError(errors) => {
                write!(f, "Validation failed: {} errors", errors.len())
            }
            ApiError::InternalError(msg) => write!(f, "Internal error: {}", msg),
            ApiError::ServiceUnavailable(msg) => write!(f, "Service unavailable: {}", msg),
        }
    }
}

impl std::error::Error for ApiError {}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_code, message, details) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "bad_request", msg, None),
            ApiError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, "unauthorized", msg, None),
            ApiError::PaymentRequired(msg) => (StatusCode::PAYMENT_REQUIRED, "payment_declined", msg, None),
            ApiError::Forbidden(msg) => (StatusCode::FORBIDDEN, "forbidden", msg, None),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, "not_found", msg, None),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, "conflict", msg, None),
            ApiError::ValidationError(errors) => (
                StatusCode::UNPROCESSABLE_ENTITY,
                "validation_error",
                "Request validation failed".to_string(),
                Some(errors),
            ),
            ApiError::InternalError(msg) => {
                // Log internal errors but don't expose details to clients
                tracing::error!(error = %msg, "Internal error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal_error",
                    "An internal error occurred".to_string(),
                    None,
                )
            }
            ApiError::ServiceUnavailable(msg) => {
                tracing::warn!(error = %msg, "Dependency unavailable");
                (StatusCode::SERVICE_UNAVAILABLE, "service_unavailable", msg, None)
            }
        };

        let body = Json(ErrorResponse {
            error: error_code.to_string(),
            message,
            details,
        });

        (status, body).into_response()
    }
}

/// Convert sqlx errors to API errors
impl From<sqlx::Error> for ApiError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => ApiError::NotFound("Resource not found".to_string()),
            sqlx::Error::Database(db_err) => {
                if db_err.is_unique_violation() {
                    if db_err.constraint().map_or(false, |c| c.contains("email")) {
                        return ApiError::Conflict("Email already exists".to_string());
                    }
                    return ApiError::Conflict("Resource already exists".to_string());
                }
                if db_err.is_foreign_key_violation() {
                    return ApiError::Conflict("Resource is still referenced".to_string());
                }
                if db_err.is_check_violation() {
                    return ApiError::BadRequest("Value out of range".to_string());
                }

                ApiError::InternalError(format!("Database error: {}", db_err))
            }
            _ => ApiError::InternalError(format!("Database error: {}", err)),
        }
    }
}

/// Convert body validation failures to a 422 with per-field details
impl From<validator::ValidationErrors> for ApiError {
    fn from(err: validator::ValidationErrors) -> Self {
        let mut errors: Vec<ValidationErrorDetail> = err
            .field_errors()
            .iter()
            .flat_map(|(field, errors)| {
                errors.iter().map(move |error| {
                    ValidationErrorDetail::new(
                        field.to_string(),
                        error
                            .message
                            .as_ref()
                            .map(|m| m.to_string())
                            .unwrap_or_else(|| "Validation failed".to_string()),
                    )
                })
            })
            .collect();
        errors.sort_by(|a, b| a.field.cmp(&b.field));
        ApiError::ValidationError(errors)
    }
}

impl From<AuthError> for ApiError {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::MissingCredentials => ApiError::Unauthorized(err.to_string()),
            AuthError::InvalidFormat(msg) => ApiError::BadRequest(msg),
            AuthError::InvalidToken(msg) => ApiError::Unauthorized(msg),
            AuthError::Forbidden => ApiError::Forbidden(err.to_string()),
        }
    }
}

/// Convert password errors to API errors
impl From<PasswordError> for ApiError {
    fn from(err: PasswordError) -> Self {
        ApiError::InternalError(format!("Password operation failed: {}", err))
    }
}

/// Convert JWT errors to API errors
impl From<JwtError> for ApiError {
    fn from(err: JwtError) -> Self {
        match err {
            JwtError::Expired => ApiError::Unauthorized("Token expired".to_string()),
            JwtError::InvalidIssuer => ApiError::Unauthorized("Invalid token issuer".to_string()),
            _ => ApiError::Unauthorized(format!("Invalid token: {}", err)),
        }
    }
}

impl From<StripeError> for ApiError {
    fn from(err: StripeError) -> Self {
        if err.is_card_error() {
            ApiError::PaymentRequired(err.failure_reason())
        } else {
            ApiError::ServiceUnavailable("Payment provider unavailable".to_string())
        }
    }
}

impl From<DiscountError> for ApiError {
    fn from(err: DiscountError) -> Self {
        match err {
            DiscountError::NotFound => ApiError::NotFound(err.to_string()),
            DiscountError::Inactive | DiscountError::Expired | DiscountError::LimitReached => {
                ApiError::BadRequest(err.to_string())
            }
            DiscountError::Database(e) => e.into(),
        }
    }
}

impl From<CheckoutError> for ApiError {
    fn from(err: CheckoutError) -> Self {
        match err {
            CheckoutError::NotFound(_) | CheckoutError::NotOnWaitlist => ApiError::NotFound(err.to_string()),
            CheckoutError::RegistrationClosed
            | CheckoutError::PaymentPlanNotAllowed
            | CheckoutError::AlternatesNotOffered => ApiError::BadRequest(err.to_string()),
            CheckoutError::MembershipRequired => ApiError::Forbidden(err.to_string()),
            CheckoutError::RegistrationFull
            | CheckoutError::RegistrationNotFull
            | CheckoutError::AlreadyRegistered
            | CheckoutError::AlreadyMember
            | CheckoutError::AlreadyCompleted
            | CheckoutError::InvalidState(_) => ApiError::Conflict(err.to_string()),
            CheckoutError::Discount(e) => e.into(),
            CheckoutError::Stripe(e) => e.into(),
            CheckoutError::Database(e) => e.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status_of(err: impl Into<ApiError>) -> StatusCode {
        err.into().into_response().status()
    }

    #[test]
    fn test_error_display() {
        let err = ApiError::BadRequest("Invalid input".to_string());
        assert_eq!(err.to_string(), "Bad request: Invalid input");

        let err = ApiError::NotFound("User not found".to_string());
        assert_eq!(err.to_string(), "Not found: User not found");
    }

    #[test]
    fn test_validation_error() {
        let errors = vec![
            ValidationErrorDetail::new("email", "Invalid email format"),
            ValidationErrorDetail::new("password", "Password too short"),
        ];

        let err = ApiError::ValidationError(errors);
        assert_eq!(err.to_string(), "Validation failed: 2 errors");
        assert_eq!(err.into_response().status(), StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[test]
    fn test_checkout_error_statuses() {
        assert_eq!(status_of(CheckoutError::NotFound("Registration")), StatusCode::NOT_FOUND);
        assert_eq!(status_of(CheckoutError::RegistrationFull), StatusCode::CONFLICT);
        assert_eq!(status_of(CheckoutError::AlreadyRegistered), StatusCode::CONFLICT);
        assert_eq!(status_of(CheckoutError::RegistrationClosed), StatusCode::BAD_REQUEST);
        assert_eq!(status_of(CheckoutError::MembershipRequired), StatusCode::FORBIDDEN);
        assert_eq!(status_of(CheckoutError::NotOnWaitlist), StatusCode::NOT_FOUND);
        assert_eq!(
            status_of(CheckoutError::Discount(DiscountError::LimitReached)),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status_of(CheckoutError::Discount(DiscountError::NotFound)),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            status_of(CheckoutError::Database(sqlx::Error::RowNotFound)),
            StatusCode::NOT_FOUND
        );
    }

    #[test]
    fn test_auth_error_statuses() {
        assert_eq!(status_of(AuthError::MissingCredentials), StatusCode::UNAUTHORIZED);
        assert_eq!(status_of(AuthError::Forbidden), StatusCode::FORBIDDEN);
        assert_eq!(status_of(JwtError::Expired), StatusCode::UNAUTHORIZED);
    }

    #[test]
    fn test_internal_error_hides_details() {
        let response = ApiError::InternalError("connection refused on 10.0.0.3".to_string()).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
