/// Registrations (teams, leagues, events) and members' slots in them
///
/// A [`UserRegistration`] starts as `reserved` with an expiry, becomes `paid` when
/// its payment completes, or `expired`/`cancelled` when the hold lapses or is released.
/// The partial unique index keeps one live (`reserved` or `paid`) row per member and
/// registration:
///
/// ```sql
/// CREATE UNIQUE INDEX user_registrations_active_unique
///     ON user_registrations (user_id, registration_id)
///     WHERE status IN ('reserved', 'paid');
/// ```
///
/// Capacity counts paid rows plus reservations that have not expired yet.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{PgExecutor, PgPool};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "registration_kind", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum RegistrationKind {
    Team,
    League,
    Event,
    Tournament,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "user_registration_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum UserRegistrationStatus {
    Reserved,
    Paid,
    Expired,
    Cancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Registration {
    pub id: Uuid,
    pub season_id: Uuid,
    pub name: String,
    pub kind: RegistrationKind,
    pub capacity: i32,
    pub price_cents: i64,

    /// Per-game charge for alternates; `None` disables the alternate list
    pub alternate_price_cents: Option<i64>,

    pub requires_membership: bool,
    pub opens_at: DateTime<Utc>,
    pub closes_at: DateTime<Utc>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Registration with the number of free slots right now
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct RegistrationAvailability {
    #[sqlx(flatten)]
    #[serde(flatten)]
    pub registration: Registration,

    pub spots_remaining: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateRegistration {
    pub season_id: Uuid,
    pub name: String,
    pub kind: RegistrationKind,
    pub capacity: i32,
    pub price_cents: i64,
    pub alternate_price_cents: Option<i64>,
    pub requires_membership: bool,
    pub opens_at: DateTime<Utc>,
    pub closes_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateRegistration {
    pub name: Option<String>,
    pub kind: Option<RegistrationKind>,
    pub capacity: Option<i32>,
    pub price_cents: Option<i64>,
    pub alternate_price_cents: Option<i64>,
    pub requires_membership: Option<bool>,
    pub opens_at: Option<DateTime<Utc>>,
    pub closes_at: Option<DateTime<Utc>>,
    pub is_active: Option<bool>,
}

const AVAILABILITY_SELECT: &str = r#"
    SELECT r.*,
           GREATEST(r.capacity - (
               SELECT COUNT(*) FROM user_registrations ur
               WHERE ur.registration_id = r.id
                 AND (ur.status = 'paid'
                      OR (ur.status = 'reserved' AND ur.reservation_expires_at > $2))
           ), 0)::BIGINT AS spots_remaining
    FROM registrations r
"#;

impl Registration {
    pub async fn create(pool: &PgPool, data: CreateRegistration) -> Result<Self, sqlx::Error> {
        sqlx::query_as::<_, Registration>(
            r#"
            INSERT INTO registrations (
                season_id, name, kind, capacity, price_cents, alternate_price_cents,
                requires_membership, opens_at, closes_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            RETURNING *
            "#,
        )
        .bind(data.season_id)
        .bind(data.name)
        .bind(data.kind)
        .bind(data.capacity)
        .bind(data.price_cents)
        .bind(data.alternate_price_cents)
        .bind(data.requires_membership)
        .bind(data.opens_at)
        .bind(data.closes_at)
        .fetch_one(pool)
        .await
    }

    pub async fn find_by_id<'e, E>(executor: E, id: Uuid) -> Result<Option<Self>, sqlx::Error>
    where
        E: PgExecutor<'e>,
    {
        sqlx::query_as::<_, Registration>("SELECT * FROM registrations WHERE id = $1")
            .bind(id)
            .fetch_optional(executor)
            .await
    }

    /// Locks the registration row for the rest of the transaction
    ///
    /// Reservations take this lock before counting slots so two members cannot both
    /// claim the last one.
    pub async fn lock_for_update<'e, E>(executor: E, id: Uuid) -> Result<Option<Self>, sqlx::Error>
    where
        E: PgExecutor<'e>,
    {
        sqlx::query_as::<_, Registration>("SELECT * FROM registrations WHERE id = $1 FOR UPDATE")
            .bind(id)
            .fetch_optional(executor)
            .await
    }

    pub async fn find_with_availability(
        pool: &PgPool,
        id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<RegistrationAvailability>, sqlx::Error> {
        let query = format!("{} WHERE r.id = $1", AVAILABILITY_SELECT);

        sqlx::query_as::<_, RegistrationAvailability>(&query)
            .bind(id)
            .bind(now)
            .fetch_optional(pool)
            .await
    }

    pub async fn list_by_season(
        pool: &PgPool,
        season_id: Uuid,
        now: DateTime<Utc>,
        include_inactive: bool,
    ) -> Result<Vec<RegistrationAvailability>, sqlx::Error> {
        let query = format!(
            "{} WHERE r.season_id = $1 AND (r.is_active OR $3) ORDER BY r.opens_at ASC, r.name ASC",
            AVAILABILITY_SELECT
        );

        sqlx::query_as::<_, RegistrationAvailability>(&query)
            .bind(season_id)
            .bind(now)
            .bind(include_inactive)
            .fetch_all(pool)
            .await
    }

    pub async fn update(
        pool: &PgPool,
        id: Uuid,
        data: UpdateRegistration,
    ) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as::<_, Registration>(
            r#"
            UPDATE registrations
            SET name = COALESCE($2, name),
                kind = COALESCE($3, kind),
                capacity = COALESCE($4, capacity),
                price_cents = COALESCE($5, price_cents),
                alternate_price_cents = COALESCE($6, alternate_price_cents),
                requires_membership = COALESCE($7, requires_membership),
                opens_at = COALESCE($8, opens_at),
                closes_at = COALESCE($9, closes_at),
                is_active = COALESCE($10, is_active),
                updated_at = NOW()
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(data.name)
        .bind(data.kind)
        .bind(data.capacity)
        .bind(data.price_cents)
        .bind(data.alternate_price_cents)
        .bind(data.requires_membership)
        .bind(data.opens_at)
        .bind(data.closes_at)
        .bind(data.is_active)
        .fetch_optional(pool)
        .await
    }

    pub async fn delete(pool: &PgPool, id: Uuid) -> Result<bool, sqlx::Error> {
        let result = sqlx::query("DELETE FROM registrations WHERE id = $1")
            .bind(id)
            .execute(pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Paid slots plus reservations still inside their hold
    pub async fn count_active_slots<'e, E>(
        executor: E,
        id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<i64, sqlx::Error>
    where
        E: PgExecutor<'e>,
    {
        let (count,): (i64,) = sqlx::query_as(
            r#"
            SELECT COUNT(*) FROM user_registrations
            WHERE registration_id = $1
              AND (status = 'paid' OR (status = 'reserved' AND reservation_expires_at > $2))
            "#,
        )
        .bind(id)
        .bind(now)
        .fetch_one(executor)
        .await?;

        Ok(count)
    }

    /// Active and inside its sign-up window (`opens_at <= now < closes_at`)
    pub fn is_open(&self, now: DateTime<Utc>) -> bool {
        self.is_active && self.opens_at <= now && now < self.closes_at
    }

    pub fn accepts_alternates(&self) -> bool {
        self.alternate_price_cents.is_some()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct UserRegistration {
    pub id: Uuid,
    pub user_id: Uuid,
    pub registration_id: Uuid,
    pub status: UserRegistrationStatus,
    pub reservation_expires_at: Option<DateTime<Utc>>,
    pub payment_id: Option<Uuid>,
    pub via_waitlist: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A member's registration with the registration's name, for "my registrations"
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct UserRegistrationSummary {
    pub id: Uuid,
    pub registration_id: Uuid,
    pub registration_name: String,
    pub status: UserRegistrationStatus,
    pub reservation_expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Paid player on a registration's roster
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct RosterEntry {
    pub user_registration_id: Uuid,
    pub user_id: Uuid,
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    pub via_waitlist: bool,
    pub registered_at: DateTime<Utc>,
}

impl UserRegistration {
    /// Inserts a `reserved` row that lapses at `expires_at`
    ///
    /// # Errors
    ///
    /// Unique violation on `user_registrations_active_unique` if the member already
    /// holds a live slot.
    pub async fn reserve<'e, E>(
        executor: E,
        user_id: Uuid,
        registration_id: Uuid,
        expires_at: DateTime<Utc>,
        via_waitlist: bool,
    ) -> Result<Self, sqlx::Error>
    where
        E: PgExecutor<'e>,
    {
        sqlx::query_as::<_, UserRegistration>(
            r#"
            INSERT INTO user_registrations (user_id, registration_id, status, reservation_expires_at, via_waitlist)
            VALUES ($1, $2, 'reserved', $3, $4)
            RETURNING *
            "#,
        )
        .bind(user_id)
        .bind(registration_id)
        .bind(expires_at)
        .bind(via_waitlist)
        .fetch_one(executor)
        .await
    }

    pub async fn find_by_id<'e, E>(executor: E, id: Uuid) -> Result<Option<Self>, sqlx::Error>
    where
        E: PgExecutor<'e>,
    {
        sqlx::query_as::<_, UserRegistration>("SELECT * FROM user_registrations WHERE id = $1")
            .bind(id)
            .fetch_optional(executor)
            .await
    }

    /// The member's live (`reserved` or `paid`) row, if any
    pub async fn find_active<'e, E>(
        executor: E,
        user_id: Uuid,
        registration_id: Uuid,
    ) -> Result<Option<Self>, sqlx::Error>
    where
        E: PgExecutor<'e>,
    {
        sqlx::query_as::<_, UserRegistration>(
            r#"
            SELECT * FROM user_registrations
            WHERE user_id = $1 AND registration_id = $2 AND status IN ('reserved', 'paid')
            "#,
        )
        .bind(user_id)
        .bind(registration_id)
        .fetch_optional(executor)
        .await
    }

    /// Extends a live reservation, e.g. when a waitlist offer reuses an existing hold
    pub async fn extend_hold<'e, E>(
        executor: E,
        id: Uuid,
        expires_at: DateTime<Utc>,
    ) -> Result<Option<Self>, sqlx::Error>
    where
        E: PgExecutor<'e>,
    {
        sqlx::query_as::<_, UserRegistration>(
            r#"
            UPDATE user_registrations
            SET reservation_expires_at = GREATEST(reservation_expires_at, $2), updated_at = NOW()
            WHERE id = $1 AND status = 'reserved'
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(expires_at)
        .fetch_optional(executor)
        .await
    }

    /// Marks the slot paid
    ///
    /// Accepts `expired` too: a charge that succeeds just after the hold lapsed still
    /// gets its slot. Returns `None` when the row was cancelled or already paid.
    pub async fn mark_paid<'e, E>(
        executor: E,
        id: Uuid,
        payment_id: Uuid,
    ) -> Result<Option<Self>, sqlx::Error>
    where
        E: PgExecutor<'e>,
    {
        sqlx::query_as::<_, UserRegistration>(
            r#"
            UPDATE user_registrations
            SET status = 'paid', payment_id = $2, reservation_expires_at = NULL, updated_at = NOW()
            WHERE id = $1 AND status IN ('reserved', 'expired')
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(payment_id)
        .fetch_optional(executor)
        .await
    }

    /// Member-initiated release of an unpaid reservation
    pub async fn cancel_reservation<'e, E>(
        executor: E,
        user_id: Uuid,
        registration_id: Uuid,
    ) -> Result<Option<Self>, sqlx::Error>
    where
        E: PgExecutor<'e>,
    {
        sqlx::query_as::<_, UserRegistration>(
            r#"
            UPDATE user_registrations
            SET status = 'cancelled', updated_at = NOW()
            WHERE user_id = $1 AND registration_id = $2 AND status = 'reserved'
            RETURNING *
            "#,
        )
        .bind(user_id)
        .bind(registration_id)
        .fetch_optional(executor)
        .await
    }

    /// Releases a reservation by id (failed payment)
    pub async fn release<'e, E>(executor: E, id: Uuid) -> Result<bool, sqlx::Error>
    where
        E: PgExecutor<'e>,
    {
        let result = sqlx::query(
            r#"
            UPDATE user_registrations
            SET status = 'cancelled', updated_at = NOW()
            WHERE id = $1 AND status = 'reserved'
            "#,
        )
        .bind(id)
        .execute(executor)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Expires every reservation whose hold ended at or before `now`
    pub async fn expire_due<'e, E>(executor: E, now: DateTime<Utc>) -> Result<Vec<Self>, sqlx::Error>
    where
        E: PgExecutor<'e>,
    {
        sqlx::query_as::<_, UserRegistration>(
            r#"
            UPDATE user_registrations
            SET status = 'expired', updated_at = NOW()
            WHERE status = 'reserved' AND reservation_expires_at <= $1
            RETURNING *
            "#,
        )
        .bind(now)
        .fetch_all(executor)
        .await
    }

    pub async fn list_by_user(
        pool: &PgPool,
        user_id: Uuid,
    ) -> Result<Vec<UserRegistrationSummary>, sqlx::Error> {
        sqlx::query_as::<_, UserRegistrationSummary>(
            r#"
            SELECT ur.id, ur.registration_id, r.name AS registration_name, ur.status,
                   ur.reservation_expires_at, ur.created_at
            FROM user_registrations ur
            JOIN registrations r ON r.id = ur.registration_id
            WHERE ur.user_id = $1
            ORDER BY ur.created_at DESC
            "#,
        )
        .bind(user_id)
        .fetch_all(pool)
        .await
    }

    /// Paid players, by last name
    pub async fn roster(pool: &PgPool, registration_id: Uuid) -> Result<Vec<RosterEntry>, sqlx::Error> {
        sqlx::query_as::<_, RosterEntry>(
            r#"
            SELECT ur.id AS user_registration_id, u.id AS user_id, u.first_name, u.last_name,
                   u.email, ur.via_waitlist, ur.updated_at AS registered_at
            FROM user_registrations ur
            JOIN users u ON u.id = ur.user_id
            WHERE ur.registration_id = $1 AND ur.status = 'paid'
            ORDER BY u.last_name ASC, u.first_name ASC
            "#,
        )
        .bind(registration_id)
        .fetch_all(pool)
        .await
    }

    /// Unexpired reservation as of `now`
    pub fn is_live_reservation(&self, now: DateTime<Utc>) -> bool {
        self.status == UserRegistrationStatus::Reserved
            && self.reservation_expires_at.map_or(false, |expires| expires > now)
    }
}
