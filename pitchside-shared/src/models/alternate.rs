/// Alternates: substitute players charged per game they are picked for
///
/// A member opts in with an [`AlternateRegistration`] and saves a card through a
/// Stripe SetupIntent. Admins create [`Game`]s and pick alternates for them; each pick
/// is an [`AlternateSelection`], unique per game and player so nobody is charged twice
/// for the same game.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{PgExecutor, PgPool};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct AlternateRegistration {
    pub id: Uuid,
    pub user_id: Uuid,
    pub registration_id: Uuid,

    #[serde(skip_serializing)]
    pub stripe_setup_intent_id: Option<String>,
    #[serde(skip_serializing)]
    pub stripe_payment_method_id: Option<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Admin listing of a registration's alternates
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct AlternateListing {
    pub id: Uuid,
    pub user_id: Uuid,
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    pub has_payment_method: bool,
    pub created_at: DateTime<Utc>,
}

impl AlternateRegistration {
    /// Opts the member in; returns the existing row when already registered
    pub async fn create(pool: &PgPool, user_id: Uuid, registration_id: Uuid) -> Result<Self, sqlx::Error> {
        sqlx::query_as::<_, AlternateRegistration>(
            r#"
            INSERT INTO alternate_registrations (user_id, registration_id)
            VALUES ($1, $2)
            ON CONFLICT (user_id, registration_id) DO UPDATE SET updated_at = alternate_registrations.updated_at
            RETURNING *
            "#,
        )
        .bind(user_id)
        .bind(registration_id)
        .fetch_one(pool)
        .await
    }

    pub async fn find_for_user(
        pool: &PgPool,
        user_id: Uuid,
        registration_id: Uuid,
    ) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as::<_, AlternateRegistration>(
            "SELECT * FROM alternate_registrations WHERE user_id = $1 AND registration_id = $2",
        )
        .bind(user_id)
        .bind(registration_id)
        .fetch_optional(pool)
        .await
    }

    pub async fn set_setup_intent(pool: &PgPool, id: Uuid, setup_intent_id: &str) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE alternate_registrations SET stripe_setup_intent_id = $2, updated_at = NOW() WHERE id = $1",
        )
        .bind(id)
        .bind(setup_intent_id)
        .execute(pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Stores the card saved by a completed SetupIntent
    pub async fn set_payment_method(
        pool: &PgPool,
        setup_intent_id: &str,
        payment_method_id: &str,
    ) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as::<_, AlternateRegistration>(
            r#"
            UPDATE alternate_registrations
            SET stripe_payment_method_id = $2, updated_at = NOW()
            WHERE stripe_setup_intent_id = $1
            RETURNING *
            "#,
        )
        .bind(setup_intent_id)
        .bind(payment_method_id)
        .fetch_optional(pool)
        .await
    }

    pub async fn list_by_registration(
        pool: &PgPool,
        registration_id: Uuid,
    ) -> Result<Vec<AlternateListing>, sqlx::Error> {
        sqlx::query_as::<_, AlternateListing>(
            r#"
            SELECT a.id, a.user_id, u.first_name, u.last_name, u.email,
                   (a.stripe_payment_method_id IS NOT NULL) AS has_payment_method,
                   a.created_at
            FROM alternate_registrations a
            JOIN users u ON u.id = a.user_id
            WHERE a.registration_id = $1
            ORDER BY u.last_name ASC, u.first_name ASC
            "#,
        )
        .bind(registration_id)
        .fetch_all(pool)
        .await
    }

    pub fn can_be_charged(&self) -> bool {
        self.stripe_payment_method_id.is_some()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Game {
    pub id: Uuid,
    pub registration_id: Uuid,
    pub starts_at: DateTime<Utc>,
    pub location: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Game {
    pub async fn create(
        pool: &PgPool,
        registration_id: Uuid,
        starts_at: DateTime<Utc>,
        location: Option<String>,
    ) -> Result<Self, sqlx::Error> {
        sqlx::query_as::<_, Game>(
            r#"
            INSERT INTO games (registration_id, starts_at, location)
            VALUES ($1, $2, $3)
            RETURNING *
            "#,
        )
        .bind(registration_id)
        .bind(starts_at)
        .bind(location)
        .fetch_one(pool)
        .await
    }

    pub async fn find_by_id(pool: &PgPool, id: Uuid) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as::<_, Game>("SELECT * FROM games WHERE id = $1")
            .bind(id)
            .fetch_optional(pool)
            .await
    }

    pub async fn list_by_registration(pool: &PgPool, registration_id: Uuid) -> Result<Vec<Self>, sqlx::Error> {
        sqlx::query_as::<_, Game>(
            "SELECT * FROM games WHERE registration_id = $1 ORDER BY starts_at ASC",
        )
        .bind(registration_id)
        .fetch_all(pool)
        .await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "alternate_selection_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum AlternateSelectionStatus {
    Pending,
    Charged,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct AlternateSelection {
    pub id: Uuid,
    pub game_id: Uuid,
    pub user_id: Uuid,
    pub alternate_registration_id: Uuid,
    pub status: AlternateSelectionStatus,
    pub payment_id: Option<Uuid>,
    pub selected_by: Option<Uuid>,
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl AlternateSelection {
    /// Records the pick
    ///
    /// A `failed` selection, or a `pending` one left without a payment for more than
    /// five minutes, is reopened for the new pick. Returns `None` when the player was
    /// already picked for this game otherwise.
    pub async fn create(
        pool: &PgPool,
        game_id: Uuid,
        user_id: Uuid,
        alternate_registration_id: Uuid,
        selected_by: Uuid,
    ) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as::<_, AlternateSelection>(
            r#"
            INSERT INTO alternate_selections (game_id, user_id, alternate_registration_id, selected_by)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (game_id, user_id) DO UPDATE
            SET status = 'pending',
                payment_id = NULL,
                failure_reason = NULL,
                alternate_registration_id = EXCLUDED.alternate_registration_id,
                selected_by = EXCLUDED.selected_by,
                updated_at = NOW()
            WHERE alternate_selections.status = 'failed'
               OR (alternate_selections.status = 'pending'
                   AND alternate_selections.payment_id IS NULL
                   AND alternate_selections.updated_at < NOW() - INTERVAL '5 minutes')
            RETURNING *
            "#,
        )
        .bind(game_id)
        .bind(user_id)
        .bind(alternate_registration_id)
        .bind(selected_by)
        .fetch_optional(pool)
        .await
    }

    pub async fn find_by_id<'e, E>(executor: E, id: Uuid) -> Result<Option<Self>, sqlx::Error>
    where
        E: PgExecutor<'e>,
    {
        sqlx::query_as::<_, AlternateSelection>("SELECT * FROM alternate_selections WHERE id = $1")
            .bind(id)
            .fetch_optional(executor)
            .await
    }

    pub async fn attach_payment(pool: &PgPool, id: Uuid, payment_id: Uuid) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE alternate_selections SET payment_id = $2, updated_at = NOW() WHERE id = $1",
        )
        .bind(id)
        .bind(payment_id)
        .execute(pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn mark_charged<'e, E>(executor: E, id: Uuid, payment_id: Uuid) -> Result<bool, sqlx::Error>
    where
        E: PgExecutor<'e>,
    {
        let result = sqlx::query(
            r#"
            UPDATE alternate_selections
            SET status = 'charged', payment_id = $2, failure_reason = NULL, updated_at = NOW()
            WHERE id = $1 AND status = 'pending'
            "#,
        )
        .bind(id)
        .bind(payment_id)
        .execute(executor)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn mark_failed<'e, E>(executor: E, id: Uuid, reason: &str) -> Result<bool, sqlx::Error>
    where
        E: PgExecutor<'e>,
    {
        let result = sqlx::query(
            r#"
            UPDATE alternate_selections
            SET status = 'failed', failure_reason = $2, updated_at = NOW()
            WHERE id = $1 AND status = 'pending'
            "#,
        )
        .bind(id)
        .bind(reason)
        .execute(executor)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn list_by_game(pool: &PgPool, game_id: Uuid) -> Result<Vec<Self>, sqlx::Error> {
        sqlx::query_as::<_, AlternateSelection>(
            "SELECT * FROM alternate_selections WHERE game_id = $1 ORDER BY created_at ASC",
        )
        .bind(game_id)
        .fetch_all(pool)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_can_be_charged_requires_saved_card() {
        let now = Utc::now();
        let mut alternate = AlternateRegistration {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            registration_id: Uuid::new_v4(),
            stripe_setup_intent_id: Some("seti_1".to_string()),
            stripe_payment_method_id: None,
            created_at: now,
            updated_at: now,
        };
        assert!(!alternate.can_be_charged());

        alternate.stripe_payment_method_id = Some("pm_1".to_string());
        assert!(alternate.can_be_charged());
    }
}
