/// User model and database operations
///
/// Members and administrators share one table; `role` decides which routes a token
/// can reach. Vendor ids (`stripe_customer_id`, `xero_contact_id`) are cached here the
/// first time the member pays or is synced to the ledger.
///
/// # Schema
///
/// ```sql
/// CREATE TYPE user_role AS ENUM ('member', 'admin');
///
/// CREATE TABLE users (
///     id UUID PRIMARY KEY DEFAULT gen_random_uuid(),
///     email VARCHAR(255) NOT NULL,
///     password_hash TEXT NOT NULL,
///     first_name VARCHAR(100) NOT NULL,
///     last_name VARCHAR(100) NOT NULL,
///     phone VARCHAR(32),
///     role user_role NOT NULL DEFAULT 'member',
///     stripe_customer_id VARCHAR(255),
///     xero_contact_id VARCHAR(255),
///     created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
///     updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
/// );
///
/// CREATE UNIQUE INDEX users_email_unique ON users (LOWER(email));
/// ```
///
/// # Example
///
/// ```no_run
/// use pitchside_shared::models::user::{CreateUser, User};
/// use pitchside_shared::db::pool::{create_pool, DatabaseConfig};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let pool = create_pool(DatabaseConfig::from_env()?).await?;
///
/// let user = User::create(&pool, CreateUser {
///     email: "keeper@example.com".to_string(),
///     password_hash: "$argon2id$...".to_string(),
///     first_name: "Sam".to_string(),
///     last_name: "Keeper".to_string(),
///     phone: None,
/// }).await?;
///
/// let found = User::find_by_email(&pool, "KEEPER@example.com").await?;
/// assert_eq!(found.map(|u| u.id), Some(user.id));
/// # Ok(())
/// # }
/// ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{PgExecutor, PgPool};
use uuid::Uuid;

/// Account role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "user_role", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum UserRole {
    Member,
    Admin,
}

impl UserRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            UserRole::Member => "member",
            UserRole::Admin => "admin",
        }
    }
}

/// User model
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct User {
    pub id: Uuid,

    /// Stored as entered; uniqueness and lookups are case-insensitive
    pub email: String,

    /// Argon2id PHC string (never serialized)
    #[serde(skip_serializing)]
    pub password_hash: String,

    pub first_name: String,
    pub last_name: String,
    pub phone: Option<String>,
    pub role: UserRole,

    #[serde(skip_serializing)]
    pub stripe_customer_id: Option<String>,

    #[serde(skip_serializing)]
    pub xero_contact_id: Option<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Input for creating a user
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateUser {
    pub email: String,
    pub password_hash: String,
    pub first_name: String,
    pub last_name: String,
    pub phone: Option<String>,
}

/// Profile fields a member may change; `None` leaves the column untouched
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateProfile {
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub phone: Option<String>,
}

const USER_COLUMNS: &str = "id, email, password_hash, first_name, last_name, phone, role, \
    stripe_customer_id, xero_contact_id, created_at, updated_at";

impl User {
    /// Creates a member account
    ///
    /// # Errors
    ///
    /// Unique violation on `users_email_unique` when the email (any casing) is taken.
    pub async fn create(pool: &PgPool, data: CreateUser) -> Result<Self, sqlx::Error> {
        let query = format!(
            "INSERT INTO users (email, password_hash, first_name, last_name, phone) \
             VALUES ($1, $2, $3, $4, $5) RETURNING {}",
            USER_COLUMNS
        );

        sqlx::query_as::<_, User>(&query)
            .bind(data.email.trim())
            .bind(data.password_hash)
            .bind(data.first_name)
            .bind(data.last_name)
            .bind(data.phone)
            .fetch_one(pool)
            .await
    }

    pub async fn find_by_id<'e, E>(executor: E, id: Uuid) -> Result<Option<Self>, sqlx::Error>
    where
        E: PgExecutor<'e>,
    {
        let query = format!("SELECT {} FROM users WHERE id = $1", USER_COLUMNS);

        sqlx::query_as::<_, User>(&query)
            .bind(id)
            .fetch_optional(executor)
            .await
    }

    /// Case-insensitive lookup
    pub async fn find_by_email(pool: &PgPool, email: &str) -> Result<Option<Self>, sqlx::Error> {
        let query = format!(
            "SELECT {} FROM users WHERE LOWER(email) = LOWER($1)",
            USER_COLUMNS
        );

        sqlx::query_as::<_, User>(&query)
            .bind(email.trim())
            .fetch_optional(pool)
            .await
    }

    pub async fn update_profile(
        pool: &PgPool,
        id: Uuid,
        data: UpdateProfile,
    ) -> Result<Option<Self>, sqlx::Error> {
        let query = format!(
            r#"
            UPDATE users
            SET first_name = COALESCE($2, first_name),
                last_name = COALESCE($3, last_name),
                phone = COALESCE($4, phone),
                updated_at = NOW()
            WHERE id = $1
            RETURNING {}
            "#,
            USER_COLUMNS
        );

        sqlx::query_as::<_, User>(&query)
            .bind(id)
            .bind(data.first_name)
            .bind(data.last_name)
            .bind(data.phone)
            .fetch_optional(pool)
            .await
    }

    pub async fn set_role(pool: &PgPool, id: Uuid, role: UserRole) -> Result<bool, sqlx::Error> {
        let result = sqlx::query("UPDATE users SET role = $2, updated_at = NOW() WHERE id = $1")
            .bind(id)
            .bind(role)
            .execute(pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn set_stripe_customer_id(
        pool: &PgPool,
        id: Uuid,
        customer_id: &str,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE users SET stripe_customer_id = $2, updated_at = NOW() WHERE id = $1",
        )
        .bind(id)
        .bind(customer_id)
        .execute(pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn set_xero_contact_id(
        pool: &PgPool,
        id: Uuid,
        contact_id: &str,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE users SET xero_contact_id = $2, updated_at = NOW() WHERE id = $1",
        )
        .bind(id)
        .bind(contact_id)
        .execute(pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// "First Last", used on invoices and emails
    pub fn display_name(&self) -> String {
        format!("{} {}", self.first_name.trim(), self.last_name.trim())
            .trim()
            .to_string()
    }

    pub fn is_admin(&self) -> bool {
        self.role == UserRole::Admin
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_user() -> User {
        User {
            id: Uuid::new_v4(),
            email: "winger@example.com".to_string(),
            password_hash: "$argon2id$v=19$...".to_string(),
            first_name: "Alex".to_string(),
            last_name: "Winger".to_string(),
            phone: None,
            role: UserRole::Member,
            stripe_customer_id: Some("cus_123".to_string()),
            xero_contact_id: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_display_name() {
        let mut user = sample_user();
        assert_eq!(user.display_name(), "Alex Winger");

        user.last_name = "  ".to_string();
        assert_eq!(user.display_name(), "Alex");
    }

    #[test]
    fn test_sensitive_fields_not_serialized() {
        let json = serde_json::to_value(sample_user()).unwrap();
        assert!(json.get("password_hash").is_none());
        assert!(json.get("stripe_customer_id").is_none());
        assert_eq!(json["role"], "member");
    }
}
