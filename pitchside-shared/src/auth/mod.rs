/// Authentication primitives
///
/// # Modules
///
/// - [`password`]: Argon2id password hashing and strength checks
/// - [`jwt`]: access/refresh token generation and validation
/// - [`middleware`]: Axum bearer-token and admin guards
///
/// # Example
///
/// ```no_run
/// use pitchside_shared::auth::password::{hash_password, verify_password};
/// use pitchside_shared::auth::jwt::{create_token, Claims, TokenType};
/// use pitchside_shared::models::user::UserRole;
/// use uuid::Uuid;
///
/// # fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let hash = hash_password("Goalkeeper1")?;
/// assert!(verify_password("Goalkeeper1", &hash)?);
///
/// let claims = Claims::new(Uuid::new_v4(), UserRole::Member, TokenType::Access);
/// let token = create_token(&claims, "secret-key")?;
/// # Ok(())
/// # }
/// ```

pub mod jwt;
pub mod middleware;
pub mod password;
