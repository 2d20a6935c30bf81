/// Membership types and members' memberships
///
/// A [`MembershipType`] is something a member can buy for a season ("Adult",
/// "Junior"). Buying one creates a [`Membership`] row once the payment completes.
/// Types with `installment_count > 1` may be paid through a payment plan.
///
/// # Schema
///
/// ```sql
/// CREATE TYPE membership_status AS ENUM ('active', 'cancelled');
///
/// CREATE TABLE memberships (
///     id UUID PRIMARY KEY DEFAULT gen_random_uuid(),
///     user_id UUID NOT NULL REFERENCES users(id),
///     membership_type_id UUID NOT NULL REFERENCES membership_types(id),
///     season_id UUID NOT NULL REFERENCES seasons(id),
///     payment_id UUID,
///     status membership_status NOT NULL DEFAULT 'active',
///     created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
///     CONSTRAINT memberships_user_type_unique UNIQUE (user_id, membership_type_id)
/// );
/// ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{PgExecutor, PgPool};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "membership_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum MembershipStatus {
    Active,
    Cancelled,
}

/// A purchasable membership for one season
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct MembershipType {
    pub id: Uuid,
    pub season_id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub price_cents: i64,

    /// 1 means pay in full only
    pub installment_count: i32,

    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateMembershipType {
    pub season_id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub price_cents: i64,
    pub installment_count: i32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateMembershipType {
    pub name: Option<String>,
    pub description: Option<String>,
    pub price_cents: Option<i64>,
    pub installment_count: Option<i32>,
    pub is_active: Option<bool>,
}

impl MembershipType {
    pub async fn create(pool: &PgPool, data: CreateMembershipType) -> Result<Self, sqlx::Error> {
        sqlx::query_as::<_, MembershipType>(
            r#"
            INSERT INTO membership_types (season_id, name, description, price_cents, installment_count)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING *
            "#,
        )
        .bind(data.season_id)
        .bind(data.name)
        .bind(data.description)
        .bind(data.price_cents)
        .bind(data.installment_count)
        .fetch_one(pool)
        .await
    }

    pub async fn find_by_id<'e, E>(executor: E, id: Uuid) -> Result<Option<Self>, sqlx::Error>
    where
        E: PgExecutor<'e>,
    {
        sqlx::query_as::<_, MembershipType>("SELECT * FROM membership_types WHERE id = $1")
            .bind(id)
            .fetch_optional(executor)
            .await
    }

    pub async fn list_by_season(
        pool: &PgPool,
        season_id: Uuid,
        include_inactive: bool,
    ) -> Result<Vec<Self>, sqlx::Error> {
        sqlx::query_as::<_, MembershipType>(
            r#"
            SELECT * FROM membership_types
            WHERE season_id = $1 AND (is_active OR $2)
            ORDER BY price_cents DESC, name ASC
            "#,
        )
        .bind(season_id)
        .bind(include_inactive)
        .fetch_all(pool)
        .await
    }

    pub async fn update(
        pool: &PgPool,
        id: Uuid,
        data: UpdateMembershipType,
    ) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as::<_, MembershipType>(
            r#"
            UPDATE membership_types
            SET name = COALESCE($2, name),
                description = COALESCE($3, description),
                price_cents = COALESCE($4, price_cents),
                installment_count = COALESCE($5, installment_count),
                is_active = COALESCE($6, is_active),
                updated_at = NOW()
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(data.name)
        .bind(data.description)
        .bind(data.price_cents)
        .bind(data.installment_count)
        .bind(data.is_active)
        .fetch_optional(pool)
        .await
    }

    /// Deletes a type nobody has bought yet
    pub async fn delete(pool: &PgPool, id: Uuid) -> Result<bool, sqlx::Error> {
        let result = sqlx::query("DELETE FROM membership_types WHERE id = $1")
            .bind(id)
            .execute(pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    pub fn allows_payment_plan(&self) -> bool {
        self.installment_count > 1
    }
}

/// A member's paid membership
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Membership {
    pub id: Uuid,
    pub user_id: Uuid,
    pub membership_type_id: Uuid,
    pub season_id: Uuid,
    pub payment_id: Option<Uuid>,
    pub status: MembershipStatus,
    pub created_at: DateTime<Utc>,
}

/// Membership joined with its type name, for "my memberships"
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct MembershipSummary {
    pub id: Uuid,
    pub membership_type_id: Uuid,
    pub membership_type_name: String,
    pub season_id: Uuid,
    pub season_name: String,
    pub status: MembershipStatus,
    pub created_at: DateTime<Utc>,
}

impl Membership {
    /// Creates the membership, or returns the existing one for the same type
    ///
    /// Replaying a completed payment therefore never fails on the unique constraint.
    pub async fn create<'e, E>(
        executor: E,
        user_id: Uuid,
        membership_type_id: Uuid,
        season_id: Uuid,
        payment_id: Uuid,
    ) -> Result<Self, sqlx::Error>
    where
        E: PgExecutor<'e>,
    {
        // The no-op DO UPDATE makes RETURNING yield the existing row as well
        sqlx::query_as::<_, Membership>(
            r#"
            INSERT INTO memberships (user_id, membership_type_id, season_id, payment_id)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (user_id, membership_type_id)
            DO UPDATE SET payment_id = COALESCE(memberships.payment_id, EXCLUDED.payment_id)
            RETURNING *
            "#,
        )
        .bind(user_id)
        .bind(membership_type_id)
        .bind(season_id)
        .bind(payment_id)
        .fetch_one(executor)
        .await
    }

    pub async fn find_by_user_and_type(
        pool: &PgPool,
        user_id: Uuid,
        membership_type_id: Uuid,
    ) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as::<_, Membership>(
            "SELECT * FROM memberships WHERE user_id = $1 AND membership_type_id = $2",
        )
        .bind(user_id)
        .bind(membership_type_id)
        .fetch_optional(pool)
        .await
    }

    pub async fn list_by_user(pool: &PgPool, user_id: Uuid) -> Result<Vec<MembershipSummary>, sqlx::Error> {
        sqlx::query_as::<_, MembershipSummary>(
            r#"
            SELECT m.id, m.membership_type_id, t.name AS membership_type_name,
                   m.season_id, s.name AS season_name, m.status, m.created_at
            FROM memberships m
            JOIN membership_types t ON t.id = m.membership_type_id
            JOIN seasons s ON s.id = m.season_id
            WHERE m.user_id = $1
            ORDER BY m.created_at DESC
            "#,
        )
        .bind(user_id)
        .fetch_all(pool)
        .await
    }

    pub async fn has_active_for_season(
        pool: &PgPool,
        user_id: Uuid,
        season_id: Uuid,
    ) -> Result<bool, sqlx::Error> {
        let (exists,): (bool,) = sqlx::query_as(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM memberships
                WHERE user_id = $1 AND season_id = $2 AND status = 'active'
            )
            "#,
        )
        .bind(user_id)
        .bind(season_id)
        .fetch_one(pool)
        .await?;

        Ok(exists)
    }
}
