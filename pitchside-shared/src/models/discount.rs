/// Discount categories, codes and recorded usage
///
/// A category is an accounting bucket: every discount line on an invoice is coded to
/// its category's `accounting_code`. A category may cap how much discount one member
/// receives per season; [`DiscountUsage::total_for_user_in_category_season`] feeds that
/// cap.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{PgExecutor, PgPool};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct DiscountCategory {
    pub id: Uuid,
    pub name: String,
    pub accounting_code: String,

    /// Per-member, per-season ceiling on granted discount; `None` = uncapped
    pub max_discount_per_user_per_season_cents: Option<i64>,

    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateDiscountCategory {
    pub name: String,
    pub accounting_code: String,
    pub max_discount_per_user_per_season_cents: Option<i64>,
}

impl DiscountCategory {
    pub async fn create(pool: &PgPool, data: CreateDiscountCategory) -> Result<Self, sqlx::Error> {
        sqlx::query_as::<_, DiscountCategory>(
            r#"
            INSERT INTO discount_categories (name, accounting_code, max_discount_per_user_per_season_cents)
            VALUES ($1, $2, $3)
            RETURNING *
            "#,
        )
        .bind(data.name)
        .bind(data.accounting_code)
        .bind(data.max_discount_per_user_per_season_cents)
        .fetch_one(pool)
        .await
    }

    pub async fn find_by_id<'e, E>(executor: E, id: Uuid) -> Result<Option<Self>, sqlx::Error>
    where
        E: PgExecutor<'e>,
    {
        sqlx::query_as::<_, DiscountCategory>("SELECT * FROM discount_categories WHERE id = $1")
            .bind(id)
            .fetch_optional(executor)
            .await
    }

    pub async fn list(pool: &PgPool) -> Result<Vec<Self>, sqlx::Error> {
        sqlx::query_as::<_, DiscountCategory>("SELECT * FROM discount_categories ORDER BY name ASC")
            .fetch_all(pool)
            .await
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct DiscountCode {
    pub id: Uuid,

    /// Always uppercase
    pub code: String,

    pub category_id: Uuid,
    pub percent_off: i32,
    pub is_active: bool,
    pub valid_from: Option<DateTime<Utc>>,
    pub valid_until: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateDiscountCode {
    pub code: String,
    pub category_id: Uuid,
    pub percent_off: i32,
    pub valid_from: Option<DateTime<Utc>>,
    pub valid_until: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateDiscountCode {
    pub percent_off: Option<i32>,
    pub is_active: Option<bool>,
    pub valid_from: Option<DateTime<Utc>>,
    pub valid_until: Option<DateTime<Utc>>,
}

/// Canonical form of a code as typed by a member
pub fn normalize_code(code: &str) -> String {
    code.trim().to_uppercase()
}

impl DiscountCode {
    pub async fn create(pool: &PgPool, data: CreateDiscountCode) -> Result<Self, sqlx::Error> {
        sqlx::query_as::<_, DiscountCode>(
            r#"
            INSERT INTO discount_codes (code, category_id, percent_off, valid_from, valid_until)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING *
            "#,
        )
        .bind(normalize_code(&data.code))
        .bind(data.category_id)
        .bind(data.percent_off)
        .bind(data.valid_from)
        .bind(data.valid_until)
        .fetch_one(pool)
        .await
    }

    pub async fn find_by_id<'e, E>(executor: E, id: Uuid) -> Result<Option<Self>, sqlx::Error>
    where
        E: PgExecutor<'e>,
    {
        sqlx::query_as::<_, DiscountCode>("SELECT * FROM discount_codes WHERE id = $1")
            .bind(id)
            .fetch_optional(executor)
            .await
    }

    /// Case-insensitive lookup
    pub async fn find_by_code(pool: &PgPool, code: &str) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as::<_, DiscountCode>("SELECT * FROM discount_codes WHERE code = $1")
            .bind(normalize_code(code))
            .fetch_optional(pool)
            .await
    }

    pub async fn list(pool: &PgPool) -> Result<Vec<Self>, sqlx::Error> {
        sqlx::query_as::<_, DiscountCode>("SELECT * FROM discount_codes ORDER BY code ASC")
            .fetch_all(pool)
            .await
    }

    pub async fn update(
        pool: &PgPool,
        id: Uuid,
        data: UpdateDiscountCode,
    ) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as::<_, DiscountCode>(
            r#"
            UPDATE discount_codes
            SET percent_off = COALESCE($2, percent_off),
                is_active = COALESCE($3, is_active),
                valid_from = COALESCE($4, valid_from),
                valid_until = COALESCE($5, valid_until),
                updated_at = NOW()
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(data.percent_off)
        .bind(data.is_active)
        .bind(data.valid_from)
        .bind(data.valid_until)
        .fetch_optional(pool)
        .await
    }

    /// Inside its validity window at `now` (open-ended bounds allowed)
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        self.valid_from.map_or(true, |from| from <= now)
            && self.valid_until.map_or(true, |until| now < until)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct DiscountUsage {
    pub id: Uuid,
    pub user_id: Uuid,
    pub discount_code_id: Uuid,
    pub season_id: Uuid,
    pub payment_id: Uuid,
    pub amount_cents: i64,
    pub used_at: DateTime<Utc>,
}

impl DiscountUsage {
    /// Records the discount granted on a completed payment
    ///
    /// One row per payment; recording twice is a no-op and returns `false`.
    pub async fn record<'e, E>(
        executor: E,
        user_id: Uuid,
        discount_code_id: Uuid,
        season_id: Uuid,
        payment_id: Uuid,
        amount_cents: i64,
    ) -> Result<bool, sqlx::Error>
    where
        E: PgExecutor<'e>,
    {
        let result = sqlx::query(
            r#"
            INSERT INTO discount_usages (user_id, discount_code_id, season_id, payment_id, amount_cents)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (payment_id) DO NOTHING
            "#,
        )
        .bind(user_id)
        .bind(discount_code_id)
        .bind(season_id)
        .bind(payment_id)
        .bind(amount_cents)
        .execute(executor)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Discount already granted to the member in this category and season
    pub async fn total_for_user_in_category_season(
        pool: &PgPool,
        user_id: Uuid,
        category_id: Uuid,
        season_id: Uuid,
    ) -> Result<i64, sqlx::Error> {
        let (total,): (i64,) = sqlx::query_as(
            r#"
            SELECT COALESCE(SUM(du.amount_cents), 0)::BIGINT
            FROM discount_usages du
            JOIN discount_codes dc ON dc.id = du.discount_code_id
            WHERE du.user_id = $1 AND dc.category_id = $2 AND du.season_id = $3
            "#,
        )
        .bind(user_id)
        .bind(category_id)
        .bind(season_id)
        .fetch_one(pool)
        .await?;

        Ok(total)
    }
}
