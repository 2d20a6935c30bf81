/// Membership payment plans
///
/// The first installment is charged at checkout. The remaining installments are
/// charged off-session every [`INSTALLMENT_INTERVAL_DAYS`] days with the card saved
/// on that first charge. A plan fails after [`MAX_CONSECUTIVE_FAILURES`] declines in
/// a row.
///
/// Due plans are claimed with `FOR UPDATE SKIP LOCKED` and leased by pushing
/// `next_due_at` forward, so two workers never charge the same installment and a
/// crashed worker's claim lapses on its own.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{PgExecutor, PgPool};
use uuid::Uuid;

pub const INSTALLMENT_INTERVAL_DAYS: i64 = 30;
pub const MAX_CONSECUTIVE_FAILURES: i32 = 3;

/// Delay before a declined installment is tried again
pub const FAILURE_RETRY_HOURS: i64 = 24;

/// How long a claimed plan stays invisible to other workers
pub const CLAIM_LEASE_MINUTES: i64 = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "payment_plan_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum PaymentPlanStatus {
    Active,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct PaymentPlan {
    pub id: Uuid,
    pub user_id: Uuid,
    pub membership_id: Uuid,
    pub origin_payment_id: Uuid,
    pub total_cents: i64,

    /// Regular installment; the first one also carried any rounding remainder
    pub installment_cents: i64,

    pub installments_total: i32,
    pub installments_paid: i32,
    pub next_due_at: Option<DateTime<Utc>>,

    #[serde(skip_serializing)]
    pub stripe_customer_id: String,
    #[serde(skip_serializing)]
    pub stripe_payment_method_id: Option<String>,

    pub status: PaymentPlanStatus,
    pub failure_count: i32,

    /// Invoice entry the installments are applied against
    pub ledger_entry_id: Option<Uuid>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewPaymentPlan {
    pub user_id: Uuid,
    pub membership_id: Uuid,
    pub origin_payment_id: Uuid,
    pub total_cents: i64,
    pub installment_cents: i64,
    pub installments_total: i32,
    pub first_due_at: DateTime<Utc>,
    pub stripe_customer_id: String,
    pub stripe_payment_method_id: Option<String>,
    pub ledger_entry_id: Option<Uuid>,
}

impl PaymentPlan {
    /// Creates the plan for a completed first installment
    ///
    /// Keyed on the origin payment, so replaying the completion returns the existing plan.
    pub async fn create<'e, E>(executor: E, data: NewPaymentPlan) -> Result<Self, sqlx::Error>
    where
        E: PgExecutor<'e>,
    {
        sqlx::query_as::<_, PaymentPlan>(
            r#"
            INSERT INTO payment_plans (
                user_id, membership_id, origin_payment_id, total_cents, installment_cents,
                installments_total, installments_paid, next_due_at, stripe_customer_id,
                stripe_payment_method_id, ledger_entry_id
            )
            VALUES ($1, $2, $3, $4, $5, $6, 1, $7, $8, $9, $10)
            ON CONFLICT (origin_payment_id) DO UPDATE SET updated_at = payment_plans.updated_at
            RETURNING *
            "#,
        )
        .bind(data.user_id)
        .bind(data.membership_id)
        .bind(data.origin_payment_id)
        .bind(data.total_cents)
        .bind(data.installment_cents)
        .bind(data.installments_total)
        .bind(data.first_due_at)
        .bind(data.stripe_customer_id)
        .bind(data.stripe_payment_method_id)
        .bind(data.ledger_entry_id)
        .fetch_one(executor)
        .await
    }

    pub async fn find_by_id<'e, E>(executor: E, id: Uuid) -> Result<Option<Self>, sqlx::Error>
    where
        E: PgExecutor<'e>,
    {
        sqlx::query_as::<_, PaymentPlan>("SELECT * FROM payment_plans WHERE id = $1")
            .bind(id)
            .fetch_optional(executor)
            .await
    }

    /// Claims active plans due at `now`
    pub async fn find_due(pool: &PgPool, now: DateTime<Utc>, limit: i64) -> Result<Vec<Self>, sqlx::Error> {
        sqlx::query_as::<_, PaymentPlan>(
            r#"
            UPDATE payment_plans
            SET next_due_at = $3, updated_at = NOW()
            WHERE id IN (
                SELECT id FROM payment_plans
                WHERE status = 'active' AND next_due_at <= $1
                ORDER BY next_due_at ASC
                FOR UPDATE SKIP LOCKED
                LIMIT $2
            )
            RETURNING *
            "#,
        )
        .bind(now)
        .bind(limit)
        .bind(now + Duration::minutes(CLAIM_LEASE_MINUTES))
        .fetch_all(pool)
        .await
    }

    /// Counts one more installment as paid
    ///
    /// Resets the failure streak. The next due date follows the plan's original
    /// schedule; the plan completes once every installment is in.
    pub async fn record_installment_paid<'e, E>(executor: E, id: Uuid) -> Result<Option<Self>, sqlx::Error>
    where
        E: PgExecutor<'e>,
    {
        sqlx::query_as::<_, PaymentPlan>(
            r#"
            UPDATE payment_plans
            SET installments_paid = installments_paid + 1,
                failure_count = 0,
                status = CASE WHEN installments_paid + 1 >= installments_total
                              THEN 'completed'::payment_plan_status ELSE status END,
                next_due_at = CASE WHEN installments_paid + 1 >= installments_total THEN NULL
                                   ELSE created_at + make_interval(days => $2 * (installments_paid + 1)) END,
                updated_at = NOW()
            WHERE id = $1 AND status = 'active'
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(INSTALLMENT_INTERVAL_DAYS as i32)
        .fetch_optional(executor)
        .await
    }

    /// Records a declined installment
    ///
    /// The plan moves to `failed` on the [`MAX_CONSECUTIVE_FAILURES`]th decline in a
    /// row; otherwise it is retried after [`FAILURE_RETRY_HOURS`].
    pub async fn record_failure<'e, E>(
        executor: E,
        id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<Self>, sqlx::Error>
    where
        E: PgExecutor<'e>,
    {
        sqlx::query_as::<_, PaymentPlan>(
            r#"
            UPDATE payment_plans
            SET failure_count = failure_count + 1,
                status = CASE WHEN failure_count + 1 >= $2
                              THEN 'failed'::payment_plan_status ELSE status END,
                next_due_at = CASE WHEN failure_count + 1 >= $2 THEN NULL ELSE $3 END,
                updated_at = NOW()
            WHERE id = $1 AND status = 'active'
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(MAX_CONSECUTIVE_FAILURES)
        .bind(now + Duration::hours(FAILURE_RETRY_HOURS))
        .fetch_optional(executor)
        .await
    }

    pub async fn list_by_user(pool: &PgPool, user_id: Uuid) -> Result<Vec<Self>, sqlx::Error> {
        sqlx::query_as::<_, PaymentPlan>(
            "SELECT * FROM payment_plans WHERE user_id = $1 ORDER BY created_at DESC",
        )
        .bind(user_id)
        .fetch_all(pool)
        .await
    }

    /// 1-based number of the installment to charge next
    pub fn next_installment_number(&self) -> i32 {
        self.installments_paid + 1
    }

    pub fn remaining_installments(&self) -> i32 {
        (self.installments_total - self.installments_paid).max(0)
    }

    /// Stripe idempotency key for one installment charge
    pub fn installment_idempotency_key(&self, installment_number: i32) -> String {
        format!("plan-{}-installment-{}", self.id, installment_number)
    }

    /// Due date of the second installment for a plan starting at `start`
    pub fn first_due_date(start: DateTime<Utc>) -> DateTime<Utc> {
        start + Duration::days(INSTALLMENT_INTERVAL_DAYS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plan() -> PaymentPlan {
        let now = Utc::now();
        PaymentPlan {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            membership_id: Uuid::new_v4(),
            origin_payment_id: Uuid::new_v4(),
            total_cents: 30_000,
            installment_cents: 10_000,
            installments_total: 3,
            installments_paid: 1,
            next_due_at: Some(PaymentPlan::first_due_date(now)),
            stripe_customer_id: "cus_1".to_string(),
            stripe_payment_method_id: Some("pm_1".to_string()),
            status: PaymentPlanStatus::Active,
            failure_count: 0,
            ledger_entry_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_installment_numbers() {
        let mut plan = plan();
        assert_eq!(plan.next_installment_number(), 2);
        assert_eq!(plan.remaining_installments(), 2);

        plan.installments_paid = 3;
        assert_eq!(plan.remaining_installments(), 0);
    }

    #[test]
    fn test_idempotency_key_is_per_installment() {
        let plan = plan();
        assert_ne!(
            plan.installment_idempotency_key(2),
            plan.installment_idempotency_key(3)
        );
        assert!(plan.installment_idempotency_key(2).ends_with("-installment-2"));
    }

    #[test]
    fn test_first_due_date() {
        let start = Utc::now();
        assert_eq!(PaymentPlan::first_due_date(start) - start, Duration::days(30));
    }
}
