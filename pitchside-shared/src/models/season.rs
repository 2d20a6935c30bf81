/// Season model
///
/// A season groups membership types and registrations. Discount caps are counted per
/// season.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Season {
    pub id: Uuid,
    pub name: String,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateSeason {
    pub name: String,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub is_active: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateSeason {
    pub name: Option<String>,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
    pub is_active: Option<bool>,
}

impl Season {
    pub async fn create(pool: &PgPool, data: CreateSeason) -> Result<Self, sqlx::Error> {
        sqlx::query_as::<_, Season>(
            r#"
            INSERT INTO seasons (name, start_date, end_date, is_active)
            VALUES ($1, $2, $3, $4)
            RETURNING *
            "#,
        )
        .bind(data.name)
        .bind(data.start_date)
        .bind(data.end_date)
        .bind(data.is_active)
        .fetch_one(pool)
        .await
    }

    pub async fn find_by_id(pool: &PgPool, id: Uuid) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as::<_, Season>("SELECT * FROM seasons WHERE id = $1")
            .bind(id)
            .fetch_optional(pool)
            .await
    }

    /// Active seasons first, then newest start date first
    pub async fn list(pool: &PgPool) -> Result<Vec<Self>, sqlx::Error> {
        sqlx::query_as::<_, Season>(
            "SELECT * FROM seasons ORDER BY is_active DESC, start_date DESC, name ASC",
        )
        .fetch_all(pool)
        .await
    }

    pub async fn update(
        pool: &PgPool,
        id: Uuid,
        data: UpdateSeason,
    ) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as::<_, Season>(
            r#"
            UPDATE seasons
            SET name = COALESCE($2, name),
                start_date = COALESCE($3, start_date),
                end_date = COALESCE($4, end_date),
                is_active = COALESCE($5, is_active),
                updated_at = NOW()
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(data.name)
        .bind(data.start_date)
        .bind(data.end_date)
        .bind(data.is_active)
        .fetch_optional(pool)
        .await
    }

    /// Deletes a season and, through cascades, its types and registrations
    ///
    /// Fails with a foreign-key violation once memberships reference it.
    pub async fn delete(pool: &PgPool, id: Uuid) -> Result<bool, sqlx::Error> {
        let result = sqlx::query("DELETE FROM seasons WHERE id = $1")
            .bind(id)
            .execute(pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Whether `date` falls inside the season
    pub fn contains(&self, date: NaiveDate) -> bool {
        self.start_date <= date && date <= self.end_date
    }
}
