/// Waitlist entries for full registrations
///
/// Entries are served first-in, first-out by `created_at`. A position counts only
/// entries still `waiting`; offered, converted or removed entries drop out of the queue.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{PgExecutor, PgPool};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "waitlist_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum WaitlistStatus {
    Waiting,
    Offered,
    Converted,
    Removed,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct WaitlistEntry {
    pub id: Uuid,
    pub user_id: Uuid,
    pub registration_id: Uuid,
    pub status: WaitlistStatus,
    pub offered_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Admin view of the queue
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct WaitlistListing {
    pub id: Uuid,
    pub user_id: Uuid,
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    pub status: WaitlistStatus,

    /// 1-based position among waiting entries; `None` once no longer waiting
    pub position: Option<i64>,

    pub offered_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl WaitlistEntry {
    /// Adds the member to the queue
    ///
    /// Joining again after leaving puts the member at the back; joining while already
    /// waiting or offered returns the existing entry unchanged.
    pub async fn join(pool: &PgPool, user_id: Uuid, registration_id: Uuid) -> Result<Self, sqlx::Error> {
        sqlx::query_as::<_, WaitlistEntry>(
            r#"
            INSERT INTO waitlist_entries (user_id, registration_id)
            VALUES ($1, $2)
            ON CONFLICT (user_id, registration_id) DO UPDATE
            SET status = CASE WHEN waitlist_entries.status IN ('removed', 'converted')
                              THEN 'waiting'::waitlist_status ELSE waitlist_entries.status END,
                created_at = CASE WHEN waitlist_entries.status IN ('removed', 'converted')
                                  THEN NOW() ELSE waitlist_entries.created_at END,
                offered_at = CASE WHEN waitlist_entries.status IN ('removed', 'converted')
                                  THEN NULL ELSE waitlist_entries.offered_at END,
                updated_at = NOW()
            RETURNING *
            "#,
        )
        .bind(user_id)
        .bind(registration_id)
        .fetch_one(pool)
        .await
    }

    pub async fn find_by_id(pool: &PgPool, id: Uuid) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as::<_, WaitlistEntry>("SELECT * FROM waitlist_entries WHERE id = $1")
            .bind(id)
            .fetch_optional(pool)
            .await
    }

    pub async fn find_for_user(
        pool: &PgPool,
        user_id: Uuid,
        registration_id: Uuid,
    ) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as::<_, WaitlistEntry>(
            "SELECT * FROM waitlist_entries WHERE user_id = $1 AND registration_id = $2",
        )
        .bind(user_id)
        .bind(registration_id)
        .fetch_optional(pool)
        .await
    }

    /// Removes a waiting or offered member
    ///
    /// Returns the status the entry had before, or `None` when it was not queued.
    pub async fn leave<'e, E>(
        executor: E,
        user_id: Uuid,
        registration_id: Uuid,
    ) -> Result<Option<WaitlistStatus>, sqlx::Error>
    where
        E: PgExecutor<'e>,
    {
        let previous: Option<(WaitlistStatus,)> = sqlx::query_as(
            r#"
            UPDATE waitlist_entries w
            SET status = 'removed', updated_at = NOW()
            FROM waitlist_entries old
            WHERE old.id = w.id
              AND w.user_id = $1 AND w.registration_id = $2
              AND w.status IN ('waiting', 'offered')
            RETURNING old.status
            "#,
        )
        .bind(user_id)
        .bind(registration_id)
        .fetch_optional(executor)
        .await?;

        Ok(previous.map(|(status,)| status))
    }

    /// The registration's queue in FIFO order, waiting entries numbered from 1
    pub async fn list_by_registration(
        pool: &PgPool,
        registration_id: Uuid,
    ) -> Result<Vec<WaitlistListing>, sqlx::Error> {
        sqlx::query_as::<_, WaitlistListing>(
            r#"
            SELECT w.id, w.user_id, u.first_name, u.last_name, u.email, w.status,
                   CASE WHEN w.status = 'waiting'
                        THEN ROW_NUMBER() OVER (PARTITION BY w.status = 'waiting' ORDER BY w.created_at, w.id)
                   END AS position,
                   w.offered_at, w.created_at
            FROM waitlist_entries w
            JOIN users u ON u.id = w.user_id
            WHERE w.registration_id = $1 AND w.status IN ('waiting', 'offered')
            ORDER BY w.created_at ASC, w.id ASC
            "#,
        )
        .bind(registration_id)
        .fetch_all(pool)
        .await
    }

    /// 1-based position of the member among waiting entries
    pub async fn position_of(
        pool: &PgPool,
        user_id: Uuid,
        registration_id: Uuid,
    ) -> Result<Option<i64>, sqlx::Error> {
        let Some(entry) = Self::find_for_user(pool, user_id, registration_id).await? else {
            return Ok(None);
        };

        if entry.status != WaitlistStatus::Waiting {
            return Ok(None);
        }

        let (ahead,): (i64,) = sqlx::query_as(
            r#"
            SELECT COUNT(*) FROM waitlist_entries
            WHERE registration_id = $1 AND status = 'waiting'
              AND (created_at, id) < ($2, $3)
            "#,
        )
        .bind(registration_id)
        .bind(entry.created_at)
        .bind(entry.id)
        .fetch_one(pool)
        .await?;

        Ok(Some(ahead + 1))
    }

    pub async fn mark_offered<'e, E>(
        executor: E,
        id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<Self>, sqlx::Error>
    where
        E: PgExecutor<'e>,
    {
        sqlx::query_as::<_, WaitlistEntry>(
            r#"
            UPDATE waitlist_entries
            SET status = 'offered', offered_at = $2, updated_at = NOW()
            WHERE id = $1 AND status IN ('waiting', 'offered')
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(now)
        .fetch_optional(executor)
        .await
    }

    /// Marks the member's entry converted once they have paid for the slot
    pub async fn mark_converted<'e, E>(
        executor: E,
        user_id: Uuid,
        registration_id: Uuid,
    ) -> Result<bool, sqlx::Error>
    where
        E: PgExecutor<'e>,
    {
        let result = sqlx::query(
            r#"
            UPDATE waitlist_entries
            SET status = 'converted', updated_at = NOW()
            WHERE user_id = $1 AND registration_id = $2 AND status IN ('waiting', 'offered')
            "#,
        )
        .bind(user_id)
        .bind(registration_id)
        .execute(executor)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    pub fn is_queued(&self) -> bool {
        matches!(self.status, WaitlistStatus::Waiting | WaitlistStatus::Offered)
    }
}
