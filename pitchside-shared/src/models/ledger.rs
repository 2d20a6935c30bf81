/// Staged accounting entries for the external ledger
///
/// Every charge stages one entry in the same transaction that creates its `pending`
/// payment. Entries move through:
///
/// ```text
/// staged ──(charge succeeded)──▶ pending ──(synced)──▶ synced
///    │                              │
///    └─(charge failed)─▶ abandoned  └─(6th failure)─▶ failed ──(admin retry)─▶ pending
/// ```
///
/// `invoice` entries become an invoice (plus a payment when money was taken).
/// `payment` entries are later installments applied to their parent invoice.
///
/// Staging is idempotent per payment (`payment_id` is unique), and due entries are
/// claimed with `FOR UPDATE SKIP LOCKED` plus a short lease so concurrent workers never
/// push the same entry twice.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use sqlx::{PgExecutor, PgPool};
use uuid::Uuid;

/// Retry delays after the 1st..5th failure
pub const BACKOFF_SCHEDULE_SECS: [i64; 5] = [60, 300, 1_800, 7_200, 43_200];

/// Failures before an entry is marked `failed`
pub const MAX_SYNC_ATTEMPTS: i32 = 6;

/// How long a claimed entry stays invisible to other workers
pub const CLAIM_LEASE_SECS: i64 = 300;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "ledger_entry_kind", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum LedgerEntryKind {
    Invoice,
    Payment,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "ledger_entry_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum LedgerEntryStatus {
    Staged,
    Pending,
    Synced,
    Failed,
    Abandoned,
}

impl std::str::FromStr for LedgerEntryStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "staged" => Ok(Self::Staged),
            "pending" => Ok(Self::Pending),
            "synced" => Ok(Self::Synced),
            "failed" => Ok(Self::Failed),
            "abandoned" => Ok(Self::Abandoned),
            other => Err(format!("Unknown ledger entry status: {}", other)),
        }
    }
}

/// One invoice line
///
/// Discounts are separate lines with a negative amount coded to the discount
/// category's account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerLineItem {
    pub description: String,
    pub quantity: i32,
    pub unit_amount_cents: i64,
    pub account_code: String,
}

impl LedgerLineItem {
    pub fn new(description: impl Into<String>, unit_amount_cents: i64, account_code: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            quantity: 1,
            unit_amount_cents,
            account_code: account_code.into(),
        }
    }

    pub fn line_total_cents(&self) -> i64 {
        self.unit_amount_cents * i64::from(self.quantity)
    }
}

/// Sum of all line totals
pub fn line_items_total(items: &[LedgerLineItem]) -> i64 {
    items.iter().map(LedgerLineItem::line_total_cents).sum()
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct LedgerEntry {
    pub id: Uuid,
    pub kind: LedgerEntryKind,

    /// Invoice entry a `payment` entry applies to
    pub parent_id: Option<Uuid>,

    pub payment_id: Option<Uuid>,
    pub user_id: Uuid,
    pub status: LedgerEntryStatus,
    pub contact_name: String,
    pub contact_email: String,
    pub description: String,
    pub line_items: Json<Vec<LedgerLineItem>>,
    pub total_cents: i64,
    pub amount_paid_cents: i64,

    /// Stripe charge or intent id, used as the payment reference in the ledger
    pub payment_reference: Option<String>,

    pub external_invoice_id: Option<String>,
    pub external_payment_id: Option<String>,
    pub attempts: i32,
    pub last_error: Option<String>,
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub synced_at: Option<DateTime<Utc>>,
}

/// Input for [`LedgerEntry::stage`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewLedgerEntry {
    pub kind: LedgerEntryKind,
    pub parent_id: Option<Uuid>,
    pub payment_id: Uuid,
    pub user_id: Uuid,
    pub contact_name: String,
    pub contact_email: String,
    pub description: String,
    pub line_items: Vec<LedgerLineItem>,
    pub total_cents: i64,
}

/// When to try again after the `attempt`th failure (1-based)
///
/// `None` once [`MAX_SYNC_ATTEMPTS`] failures have been recorded.
pub fn calculate_next_attempt_at(attempt: i32, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    if attempt >= MAX_SYNC_ATTEMPTS {
        return None;
    }

    let idx = (attempt - 1).max(0) as usize;
    let delay_secs = BACKOFF_SCHEDULE_SECS
        .get(idx)
        .copied()
        .unwrap_or(BACKOFF_SCHEDULE_SECS[BACKOFF_SCHEDULE_SECS.len() - 1]);

    Some(now + Duration::seconds(delay_secs))
}

impl LedgerEntry {
    /// Stages an entry for a payment
    ///
    /// A second call for the same payment returns the existing entry.
    pub async fn stage<'e, E>(executor: E, data: NewLedgerEntry) -> Result<Self, sqlx::Error>
    where
        E: PgExecutor<'e>,
    {
        sqlx::query_as::<_, LedgerEntry>(
            r#"
            INSERT INTO ledger_entries (
                kind, parent_id, payment_id, user_id, status, contact_name, contact_email,
                description, line_items, total_cents
            )
            VALUES ($1, $2, $3, $4, 'staged', $5, $6, $7, $8, $9)
            ON CONFLICT (payment_id) DO UPDATE SET updated_at = ledger_entries.updated_at
            RETURNING *
            "#,
        )
        .bind(data.kind)
        .bind(data.parent_id)
        .bind(data.payment_id)
        .bind(data.user_id)
        .bind(data.contact_name)
        .bind(data.contact_email)
        .bind(data.description)
        .bind(Json(data.line_items))
        .bind(data.total_cents)
        .fetch_one(executor)
        .await
    }

    /// Stages a `payment` entry for one installment of a plan
    pub async fn stage_installment<'e, E>(
        executor: E,
        parent: &LedgerEntry,
        payment_id: Uuid,
        installment_number: i32,
        amount_cents: i64,
    ) -> Result<Self, sqlx::Error>
    where
        E: PgExecutor<'e>,
    {
        Self::stage(
            executor,
            NewLedgerEntry {
                kind: LedgerEntryKind::Payment,
                parent_id: Some(parent.id),
                payment_id,
                user_id: parent.user_id,
                contact_name: parent.contact_name.clone(),
                contact_email: parent.contact_email.clone(),
                description: format!("{} (installment {})", parent.description, installment_number),
                line_items: Vec::new(),
                total_cents: amount_cents,
            },
        )
        .await
    }

    pub async fn find_by_id<'e, E>(executor: E, id: Uuid) -> Result<Option<Self>, sqlx::Error>
    where
        E: PgExecutor<'e>,
    {
        sqlx::query_as::<_, LedgerEntry>("SELECT * FROM ledger_entries WHERE id = $1")
            .bind(id)
            .fetch_optional(executor)
            .await
    }

    pub async fn find_by_payment_id<'e, E>(executor: E, payment_id: Uuid) -> Result<Option<Self>, sqlx::Error>
    where
        E: PgExecutor<'e>,
    {
        sqlx::query_as::<_, LedgerEntry>("SELECT * FROM ledger_entries WHERE payment_id = $1")
            .bind(payment_id)
            .fetch_optional(executor)
            .await
    }

    /// staged → pending once the charge has succeeded
    ///
    /// Returns `None` when the entry was not staged (already promoted or abandoned).
    pub async fn promote_to_pending<'e, E>(
        executor: E,
        payment_id: Uuid,
        payment_reference: &str,
        amount_paid_cents: i64,
        now: DateTime<Utc>,
    ) -> Result<Option<Self>, sqlx::Error>
    where
        E: PgExecutor<'e>,
    {
        sqlx::query_as::<_, LedgerEntry>(
            r#"
            UPDATE ledger_entries
            SET status = 'pending', payment_reference = $2, amount_paid_cents = $3,
                next_attempt_at = $4, updated_at = NOW()
            WHERE payment_id = $1 AND status = 'staged'
            RETURNING *
            "#,
        )
        .bind(payment_id)
        .bind(payment_reference)
        .bind(amount_paid_cents)
        .bind(now)
        .fetch_optional(executor)
        .await
    }

    /// staged → abandoned when the charge never happened
    pub async fn abandon<'e, E>(executor: E, payment_id: Uuid) -> Result<bool, sqlx::Error>
    where
        E: PgExecutor<'e>,
    {
        let result = sqlx::query(
            r#"
            UPDATE ledger_entries
            SET status = 'abandoned', next_attempt_at = NULL, updated_at = NOW()
            WHERE payment_id = $1 AND status = 'staged'
            "#,
        )
        .bind(payment_id)
        .execute(executor)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Claims pending entries due at `now`, oldest first
    pub async fn claim_due(pool: &PgPool, now: DateTime<Utc>, limit: i64) -> Result<Vec<Self>, sqlx::Error> {
        sqlx::query_as::<_, LedgerEntry>(
            r#"
            UPDATE ledger_entries
            SET next_attempt_at = $3, updated_at = NOW()
            WHERE id IN (
                SELECT id FROM ledger_entries
                WHERE status = 'pending' AND next_attempt_at <= $1
                ORDER BY next_attempt_at ASC, created_at ASC
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

    /// Claims one specific pending entry, if no worker holds it
    pub async fn claim_one(pool: &PgPool, id: Uuid, now: DateTime<Utc>) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as::<_, LedgerEntry>(
            r#"
            UPDATE ledger_entries
            SET next_attempt_at = $3, updated_at = NOW()
            WHERE id IN (
                SELECT id FROM ledger_entries
                WHERE id = $1 AND status = 'pending' AND next_attempt_at <= $2
                FOR UPDATE SKIP LOCKED
            )
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(now)
        .bind(now + Duration::seconds(CLAIM_LEASE_SECS))
        .fetch_optional(pool)
        .await
    }

    pub async fn set_external_invoice_id(pool: &PgPool, id: Uuid, invoice_id: &str) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE ledger_entries SET external_invoice_id = $2, updated_at = NOW() WHERE id = $1",
        )
        .bind(id)
        .bind(invoice_id)
        .execute(pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn set_external_payment_id(pool: &PgPool, id: Uuid, payment_id: &str) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE ledger_entries SET external_payment_id = $2, updated_at = NOW() WHERE id = $1",
        )
        .bind(id)
        .bind(payment_id)
        .execute(pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn mark_synced(pool: &PgPool, id: Uuid, now: DateTime<Utc>) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as::<_, LedgerEntry>(
            r#"
            UPDATE ledger_entries
            SET status = 'synced', synced_at = $2, next_attempt_at = NULL, last_error = NULL,
                updated_at = NOW()
            WHERE id = $1 AND status = 'pending'
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(now)
        .fetch_optional(pool)
        .await
    }

    /// Counts a failed attempt and schedules the next one
    ///
    /// The entry moves to `failed` when the backoff schedule is exhausted.
    pub async fn record_failure(
        pool: &PgPool,
        entry: &LedgerEntry,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Self>, sqlx::Error> {
        let attempts = entry.attempts + 1;
        let next_attempt_at = calculate_next_attempt_at(attempts, now);
        let status = if next_attempt_at.is_some() {
            LedgerEntryStatus::Pending
        } else {
            LedgerEntryStatus::Failed
        };

        sqlx::query_as::<_, LedgerEntry>(
            r#"
            UPDATE ledger_entries
            SET attempts = $2, status = $3, last_error = $4, next_attempt_at = $5, updated_at = NOW()
            WHERE id = $1 AND status = 'pending'
            RETURNING *
            "#,
        )
        .bind(entry.id)
        .bind(attempts)
        .bind(status)
        .bind(error)
        .bind(next_attempt_at)
        .fetch_optional(pool)
        .await
    }

    /// Pushes the next attempt out without counting a failure
    pub async fn defer(pool: &PgPool, id: Uuid, until: DateTime<Utc>, reason: &str) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            r#"
            UPDATE ledger_entries
            SET next_attempt_at = $2, last_error = $3, updated_at = NOW()
            WHERE id = $1 AND status = 'pending'
            "#,
        )
        .bind(id)
        .bind(until)
        .bind(reason)
        .execute(pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// failed → pending with a fresh attempt budget
    pub async fn retry(pool: &PgPool, id: Uuid, now: DateTime<Utc>) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as::<_, LedgerEntry>(
            r#"
            UPDATE ledger_entries
            SET status = 'pending', attempts = 0, last_error = NULL, next_attempt_at = $2,
                updated_at = NOW()
            WHERE id = $1 AND status = 'failed'
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(now)
        .fetch_optional(pool)
        .await
    }

    pub async fn list_by_status(
        pool: &PgPool,
        status: Option<LedgerEntryStatus>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Self>, sqlx::Error> {
        sqlx::query_as::<_, LedgerEntry>(
            r#"
            SELECT * FROM ledger_entries
            WHERE ($1::ledger_entry_status IS NULL OR status = $1)
            ORDER BY created_at DESC
            LIMIT $2 OFFSET $3
            "#,
        )
        .bind(status)
        .bind(limit)
        .bind(offset)
        .fetch_all(pool)
        .await
    }

    /// Payment-step idempotency key, distinct from the invoice's
    pub fn payment_idempotency_key(&self) -> String {
        format!("{}-payment", self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_schedule() {
        let now = Utc::now();

        let expected = [
            (1, Duration::seconds(60)),
            (2, Duration::minutes(5)),
            (3, Duration::minutes(30)),
            (4, Duration::hours(2)),
            (5, Duration::hours(12)),
        ];

        for (attempt, delay) in expected {
            assert_eq!(calculate_next_attempt_at(attempt, now), Some(now + delay));
        }
    }

    #[test]
    fn test_sixth_failure_gives_up() {
        let now = Utc::now();
        assert_eq!(calculate_next_attempt_at(6, now), None);
        assert_eq!(calculate_next_attempt_at(9, now), None);
    }

    #[test]
    fn test_line_items_total_includes_discount_lines() {
        let items = vec![
            LedgerLineItem::new("Tuesday Coed League", 9_500, "201"),
            LedgerLineItem::new("Discount VOLUNTEER", -2_375, "410"),
        ];
        assert_eq!(line_items_total(&items), 7_125);
    }

    #[test]
    fn test_status_from_str() {
        assert_eq!("FAILED".parse::<LedgerEntryStatus>(), Ok(LedgerEntryStatus::Failed));
        assert!("unknown".parse::<LedgerEntryStatus>().is_err());
    }
}
