/// Transactional email outbox
///
/// Emails are rendered when enqueued and sent by the email retry job, so a provider
/// outage never fails the request that triggered the email.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{PgExecutor, PgPool};
use uuid::Uuid;

/// Sends attempted before an email is marked `failed`
pub const MAX_EMAIL_ATTEMPTS: i32 = 5;

const BASE_RETRY_MINUTES: i64 = 5;
const MAX_RETRY_HOURS: i64 = 6;
const CLAIM_LEASE_SECS: i64 = 300;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "email_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum EmailStatus {
    Pending,
    Sent,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct EmailOutbox {
    pub id: Uuid,
    pub user_id: Option<Uuid>,
    pub to_email: String,

    /// Template name, for reporting
    pub template: String,

    pub subject: String,
    pub html_body: String,
    pub status: EmailStatus,
    pub attempts: i32,
    pub last_error: Option<String>,
    pub next_attempt_at: DateTime<Utc>,
    pub provider_message_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
}

/// Delay after the `attempt`th failed send: 5 min doubling, capped at 6 h
pub fn email_retry_delay(attempt: i32) -> Duration {
    let exponent = (attempt - 1).clamp(0, 16) as u32;
    let minutes = BASE_RETRY_MINUTES.saturating_mul(2_i64.pow(exponent));
    Duration::minutes(minutes).min(Duration::hours(MAX_RETRY_HOURS))
}

impl EmailOutbox {
    pub async fn enqueue<'e, E>(
        executor: E,
        user_id: Option<Uuid>,
        to_email: &str,
        template: &str,
        subject: &str,
        html_body: &str,
    ) -> Result<Self, sqlx::Error>
    where
        E: PgExecutor<'e>,
    {
        sqlx::query_as::<_, EmailOutbox>(
            r#"
            INSERT INTO email_outbox (user_id, to_email, template, subject, html_body)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING *
            "#,
        )
        .bind(user_id)
        .bind(to_email)
        .bind(template)
        .bind(subject)
        .bind(html_body)
        .fetch_one(executor)
        .await
    }

    /// Claims pending emails due at `now`
    pub async fn claim_due(pool: &PgPool, now: DateTime<Utc>, limit: i64) -> Result<Vec<Self>, sqlx::Error> {
        sqlx::query_as::<_, EmailOutbox>(
            r#"
            UPDATE email_outbox
            SET next_attempt_at = $3
            WHERE id IN (
                SELECT id FROM email_outbox
                WHERE status = 'pending' AND next_attempt_at <= $1
                ORDER BY next_attempt_at ASC
                FOR UPDATE SKIP LOCKED
                LIMIT $2
            )
            RETURNING *
            "#,
        )
        .bind(now)
        .bind(limit)
        .bind(now + Duration::seconds(CLAIM_LEASE_SECS))
        .fetch_all(pool)
        .await
    }

    pub async fn mark_sent(
        pool: &PgPool,
        id: Uuid,
        provider_message_id: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            r#"
            UPDATE email_outbox
            SET status = 'sent', provider_message_id = $2, sent_at = $3, attempts = attempts + 1,
                last_error = NULL
            WHERE id = $1 AND status = 'pending'
            "#,
        )
        .bind(id)
        .bind(provider_message_id)
        .bind(now)
        .execute(pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Counts a failed send; returns the new status
    pub async fn record_failure(
        pool: &PgPool,
        email: &EmailOutbox,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<EmailStatus, sqlx::Error> {
        let attempts = email.attempts + 1;
        let status = if attempts >= MAX_EMAIL_ATTEMPTS {
            EmailStatus::Failed
        } else {
            EmailStatus::Pending
        };

        sqlx::query(
            r#"
            UPDATE email_outbox
            SET attempts = $2, status = $3, last_error = $4, next_attempt_at = $5
            WHERE id = $1 AND status = 'pending'
            "#,
        )
        .bind(email.id)
        .bind(attempts)
        .bind(status)
        .bind(error)
        .bind(now + email_retry_delay(attempts))
        .execute(pool)
        .await?;

        Ok(status)
    }
}
