/// Processed Stripe webhook events
///
/// Stripe delivers events at least once; recording the event id first lets the
/// webhook handler acknowledge duplicates without acting on them again.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct StripeEventRecord {
    pub id: String,
    pub event_type: String,
    pub received_at: DateTime<Utc>,
}

impl StripeEventRecord {
    /// Records the event; `false` when it was already seen
    pub async fn record_once(pool: &PgPool, id: &str, event_type: &str) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            r#"
            INSERT INTO stripe_events (id, event_type)
            VALUES ($1, $2)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(id)
        .bind(event_type)
        .execute(pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Forgets an event so Stripe's redelivery is processed again
    pub async fn forget(pool: &PgPool, id: &str) -> Result<bool, sqlx::Error> {
        let result = sqlx::query("DELETE FROM stripe_events WHERE id = $1")
            .bind(id)
            .execute(pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }
}
