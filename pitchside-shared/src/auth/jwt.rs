/// JWT token generation and validation
///
/// Tokens are signed with HS256 and carry the member's id and role, so route guards
/// can decide admin access without a database round trip.
///
/// # Token Types
///
/// - **Access Token**: 24 hours, sent as `Authorization: Bearer <token>`
/// - **Refresh Token**: 30 days, exchanged at `/v1/auth/refresh` for a new access token
///
/// # Example
///
/// ```
/// use pitchside_shared::auth::jwt::{create_token, validate_token, Claims, TokenType};
/// use pitchside_shared::models::user::UserRole;
/// use uuid::Uuid;
///
/// # fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let user_id = Uuid::new_v4();
///
/// let claims = Claims::new(user_id, UserRole::Member, TokenType::Access);
/// let token = create_token(&claims, "your-secret-key")?;
///
/// let validated = validate_token(&token, "your-secret-key")?;
/// assert_eq!(validated.sub, user_id);
/// # Ok(())
/// # }
/// ```

use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::user::UserRole;

/// Issuer stamped on every token
pub const ISSUER: &str = "pitchside";

/// Error type for JWT operations
#[derive(Debug, thiserror::Error)]
pub enum JwtError {
    #[error("Failed to create token: {0}")]
    CreateError(String),

    #[error("Failed to validate token: {0}")]
    ValidationError(String),

    #[error("Token has expired")]
    Expired,

    #[error("Invalid issuer")]
    InvalidIssuer,

    /// Right signature, wrong kind of token (refresh used as access or vice versa)
    #[error("Expected {expected} token")]
    WrongTokenType { expected: &'static str },
}

/// Token type identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenType {
    Access,
    Refresh,
}

impl TokenType {
    pub fn default_expiration(&self) -> Duration {
        match self {
            TokenType::Access => Duration::hours(24),
            TokenType::Refresh => Duration::days(30),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TokenType::Access => "access",
            TokenType::Refresh => "refresh",
        }
    }
}

/// JWT claims
///
/// Standard `sub`/`iss`/`iat`/`exp`/`nbf` plus the member's `role` and the
/// `token_type`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// User ID
    pub sub: Uuid,

    /// Always [`ISSUER`]
    pub iss: String,

    pub iat: i64,
    pub exp: i64,
    pub nbf: i64,

    /// Role at the time the token was issued
    pub role: UserRole,

    pub token_type: TokenType,
}

impl Claims {
    /// Creates claims with the default lifetime for the token type
    pub fn new(user_id: Uuid, role: UserRole, token_type: TokenType) -> Self {
        Self::with_expiration(user_id, role, token_type, token_type.default_expiration())
    }

    /// Creates claims with a custom lifetime
    pub fn with_expiration(
        user_id: Uuid,
        role: UserRole,
        token_type: TokenType,
        expires_in: Duration,
    ) -> Self {
        let now = Utc::now();

        Self {
            sub: user_id,
            iss: ISSUER.to_string(),
            iat: now.timestamp(),
            exp: (now + expires_in).timestamp(),
            nbf: now.timestamp(),
            role,
            token_type,
        }
    }

    pub fn is_expired(&self) -> bool {
        Utc::now().timestamp() >= self.exp
    }

    /// Remaining lifetime, or `None` once expired
    pub fn time_until_expiration(&self) -> Option<Duration> {
        let now = Utc::now().timestamp();
        if self.exp > now {
            Some(Duration::seconds(self.exp - now))
        } else {
            None
        }
    }
}

/// Signs claims with HS256
///
/// The secret should be at least 32 bytes; the API refuses to start with a shorter one.
pub fn create_token(claims: &Claims, secret: &str) -> Result<String, JwtError> {
    let header = Header::new(Algorithm::HS256);
    let key = EncodingKey::from_secret(secret.as_bytes());

    encode(&header, claims, &key)
        .map_err(|e| JwtError::CreateError(format!("Token encoding failed: {}", e)))
}

/// Verifies signature, expiry, not-before and issuer, then returns the claims
pub fn validate_token(token: &str, secret: &str) -> Result<Claims, JwtError> {
    let key = DecodingKey::from_secret(secret.as_bytes());

    let mut validation = Validation::new(Algorithm::HS256);
    validation.set_issuer(&[ISSUER]);
    validation.validate_exp = true;
    validation.validate_nbf = true;
    validation.leeway = 0;

    let token_data = decode::<Claims>(token, &key, &validation).map_err(|e| match e.kind() {
        jsonwebtoken::errors::ErrorKind::ExpiredSignature => JwtError::Expired,
        jsonwebtoken::errors::ErrorKind::InvalidIssuer => JwtError::InvalidIssuer,
        _ => JwtError::ValidationError(format!("Token validation failed: {}", e)),
    })?;

    Ok(token_data.claims)
}

/// [`validate_token`] that also insists on an access token
pub fn validate_access_token(token: &str, secret: &str) -> Result<Claims, JwtError> {
    let claims = validate_token(token, secret)?;

    if claims.token_type != TokenType::Access {
        return Err(JwtError::WrongTokenType {
            expected: TokenType::Access.as_str(),
        });
    }

    Ok(claims)
}

/// [`validate_token`] that also insists on a refresh token
pub fn validate_refresh_token(token: &str, secret: &str) -> Result<Claims, JwtError> {
    let claims = validate_token(token, secret)?;

    if claims.token_type != TokenType::Refresh {
        return Err(JwtError::WrongTokenType {
            expected: TokenType::Refresh.as_str(),
        });
    }

    Ok(claims)
}

/// Exchanges a refresh token for a new access token
///
/// The role is taken from the refresh token. Callers that want role changes to apply
/// immediately re-read the user and issue fresh claims instead.
pub fn refresh_access_token(refresh_token: &str, secret: &str) -> Result<String, JwtError> {
    let refresh_claims = validate_refresh_token(refresh_token, secret)?;
    let access_claims = Claims::new(refresh_claims.sub, refresh_claims.role, TokenType::Access);

    create_token(&access_claims, secret)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "test-secret-key-at-least-32-bytes-long";

    #[test]
    fn test_token_type_expiration() {
        assert_eq!(TokenType::Access.default_expiration(), Duration::hours(24));
        assert_eq!(TokenType::Refresh.default_expiration(), Duration::days(30));
    }

    #[test]
    fn test_create_and_validate_token() {
        let user_id = Uuid::new_v4();

        let claims = Claims::new(user_id, UserRole::Admin, TokenType::Access);
        let token = create_token(&claims, SECRET).expect("Should create token");

        let validated = validate_token(&token, SECRET).expect("Should validate token");
        assert_eq!(validated.sub, user_id);
        assert_eq!(validated.role, UserRole::Admin);
        assert_eq!(validated.token_type, TokenType::Access);
        assert_eq!(validated.iss, "pitchside");
    }

    #[test]
    fn test_validate_with_wrong_secret() {
        let claims = Claims::new(Uuid::new_v4(), UserRole::Member, TokenType::Access);
        let token = create_token(&claims, "secret1").unwrap();

        assert!(validate_token(&token, "wrong-secret").is_err());
    }

    #[test]
    fn test_validate_expired_token() {
        let claims = Claims::with_expiration(
            Uuid::new_v4(),
            UserRole::Member,
            TokenType::Access,
            Duration::seconds(-3600),
        );
        assert!(claims.is_expired());
        assert!(claims.time_until_expiration().is_none());

        let token = create_token(&claims, SECRET).unwrap();
        assert!(matches!(validate_token(&token, SECRET), Err(JwtError::Expired)));
    }

    #[test]
    fn test_token_types_are_not_interchangeable() {
        let access = create_token(
            &Claims::new(Uuid::new_v4(), UserRole::Member, TokenType::Access),
            SECRET,
        )
        .unwrap();
        let refresh = create_token(
            &Claims::new(Uuid::new_v4(), UserRole::Member, TokenType::Refresh),
            SECRET,
        )
        .unwrap();

        assert!(validate_access_token(&access, SECRET).is_ok());
        assert!(matches!(
            validate_access_token(&refresh, SECRET),
            Err(JwtError::WrongTokenType { expected: "access" })
        ));
        assert!(validate_refresh_token(&refresh, SECRET).is_ok());
        assert!(validate_refresh_token(&access, SECRET).is_err());
    }

    #[test]
    fn test_refresh_access_token_keeps_subject_and_role() {
        let user_id = Uuid::new_v4();
        let refresh = create_token(
            &Claims::new(user_id, UserRole::Admin, TokenType::Refresh),
            SECRET,
        )
        .unwrap();

        let access = refresh_access_token(&refresh, SECRET).unwrap();
        let validated = validate_access_token(&access, SECRET).unwrap();

        assert_eq!(validated.sub, user_id);
        assert_eq!(validated.role, UserRole::Admin);
    }

    #[test]
    fn test_refresh_with_access_token_fails() {
        let access = create_token(
            &Claims::new(Uuid::new_v4(), UserRole::Member, TokenType::Access),
            SECRET,
        )
        .unwrap();

        assert!(refresh_access_token(&access, SECRET).is_err());
    }
}
