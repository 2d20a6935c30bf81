/// Payment model
///
/// One row per charge attempt. The row is written `pending` before Stripe is called
/// and moves to `completed`, `failed` or `cancelled` exactly once; every transition is
/// a conditional `UPDATE ... WHERE status = 'pending'`, so a webhook and a client
/// confirmation racing each other cannot both complete the same payment.
///
/// # Schema (abridged)
///
/// ```sql
/// CREATE TABLE payments (
///     id UUID PRIMARY KEY,
///     user_id UUID NOT NULL,
///     payment_type payment_type NOT NULL,
///     status payment_status NOT NULL DEFAULT 'pending',
///     amount_cents BIGINT NOT NULL,
///     discount_cents BIGINT NOT NULL DEFAULT 0,
///     final_amount_cents BIGINT NOT NULL,
///     stripe_payment_intent_id VARCHAR(255) UNIQUE,
///     user_registration_id UUID,
///     ...
/// );
///
/// CREATE UNIQUE INDEX payments_reservation_unique
///     ON payments (user_registration_id)
///     WHERE status IN ('pending', 'completed');
/// ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{PgExecutor, PgPool};
use uuid::Uuid;

/// What the payment pays for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "payment_type", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum PaymentType {
    Membership,
    Registration,
    Alternate,
    Installment,
}

impl PaymentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentType::Membership => "membership",
            PaymentType::Registration => "registration",
            PaymentType::Alternate => "alternate",
            PaymentType::Installment => "installment",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "payment_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum PaymentStatus {
    Pending,
    Completed,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Payment {
    pub id: Uuid,
    pub user_id: Uuid,
    pub payment_type: PaymentType,
    pub status: PaymentStatus,

    /// List price before discount
    pub amount_cents: i64,
    pub discount_cents: i64,

    /// What the member is charged
    pub final_amount_cents: i64,

    pub discount_code_id: Option<Uuid>,
    pub season_id: Option<Uuid>,

    #[serde(skip_serializing)]
    pub stripe_payment_intent_id: Option<String>,
    #[serde(skip_serializing)]
    pub stripe_charge_id: Option<String>,

    pub membership_type_id: Option<Uuid>,
    pub user_registration_id: Option<Uuid>,
    pub alternate_selection_id: Option<Uuid>,
    pub payment_plan_id: Option<Uuid>,

    /// Membership bought on installments; the charge is the first installment
    pub use_payment_plan: bool,

    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Input for [`Payment::create_pending`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewPayment {
    pub user_id: Uuid,
    pub payment_type: PaymentType,
    pub amount_cents: i64,
    pub discount_cents: i64,
    pub final_amount_cents: i64,
    pub discount_code_id: Option<Uuid>,
    pub season_id: Option<Uuid>,
    pub membership_type_id: Option<Uuid>,
    pub user_registration_id: Option<Uuid>,
    pub alternate_selection_id: Option<Uuid>,
    pub payment_plan_id: Option<Uuid>,
    pub use_payment_plan: bool,
}

impl NewPayment {
    /// Undiscounted payment of `amount_cents`
    pub fn new(user_id: Uuid, payment_type: PaymentType, amount_cents: i64) -> Self {
        Self {
            user_id,
            payment_type,
            amount_cents,
            discount_cents: 0,
            final_amount_cents: amount_cents,
            discount_code_id: None,
            season_id: None,
            membership_type_id: None,
            user_registration_id: None,
            alternate_selection_id: None,
            payment_plan_id: None,
            use_payment_plan: false,
        }
    }
}

impl Payment {
    /// Inserts a `pending` payment
    ///
    /// # Errors
    ///
    /// Unique violation on `payments_reservation_unique` if the reservation already
    /// has an open or completed payment.
    pub async fn create_pending<'e, E>(executor: E, data: NewPayment) -> Result<Self, sqlx::Error>
    where
        E: PgExecutor<'e>,
    {
        sqlx::query_as::<_, Payment>(
            r#"
            INSERT INTO payments (
                user_id, payment_type, status, amount_cents, discount_cents, final_amount_cents,
                discount_code_id, season_id, membership_type_id, user_registration_id,
                alternate_selection_id, payment_plan_id, use_payment_plan
            )
            VALUES ($1, $2, 'pending', $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            RETURNING *
            "#,
        )
        .bind(data.user_id)
        .bind(data.payment_type)
        .bind(data.amount_cents)
        .bind(data.discount_cents)
        .bind(data.final_amount_cents)
        .bind(data.discount_code_id)
        .bind(data.season_id)
        .bind(data.membership_type_id)
        .bind(data.user_registration_id)
        .bind(data.alternate_selection_id)
        .bind(data.payment_plan_id)
        .bind(data.use_payment_plan)
        .fetch_one(executor)
        .await
    }

    pub async fn find_by_id<'e, E>(executor: E, id: Uuid) -> Result<Option<Self>, sqlx::Error>
    where
        E: PgExecutor<'e>,
    {
        sqlx::query_as::<_, Payment>("SELECT * FROM payments WHERE id = $1")
            .bind(id)
            .fetch_optional(executor)
            .await
    }

    /// Row lock held until the surrounding transaction ends
    pub async fn lock_for_update<'e, E>(executor: E, id: Uuid) -> Result<Option<Self>, sqlx::Error>
    where
        E: PgExecutor<'e>,
    {
        sqlx::query_as::<_, Payment>("SELECT * FROM payments WHERE id = $1 FOR UPDATE")
            .bind(id)
            .fetch_optional(executor)
            .await
    }

    pub async fn find_by_intent_id(
        pool: &PgPool,
        intent_id: &str,
    ) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as::<_, Payment>("SELECT * FROM payments WHERE stripe_payment_intent_id = $1")
            .bind(intent_id)
            .fetch_optional(pool)
            .await
    }

    /// The reservation's pending or completed payment
    pub async fn find_open_for_registration<'e, E>(
        executor: E,
        user_registration_id: Uuid,
    ) -> Result<Option<Self>, sqlx::Error>
    where
        E: PgExecutor<'e>,
    {
        sqlx::query_as::<_, Payment>(
            r#"
            SELECT * FROM payments
            WHERE user_registration_id = $1 AND status IN ('pending', 'completed')
            "#,
        )
        .bind(user_registration_id)
        .fetch_optional(executor)
        .await
    }

    /// Most recent pending membership payment for this member and type
    pub async fn find_pending_for_membership(
        pool: &PgPool,
        user_id: Uuid,
        membership_type_id: Uuid,
    ) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as::<_, Payment>(
            r#"
            SELECT * FROM payments
            WHERE user_id = $1 AND membership_type_id = $2
              AND payment_type = 'membership' AND status = 'pending'
            ORDER BY created_at DESC
            LIMIT 1
            "#,
        )
        .bind(user_id)
        .bind(membership_type_id)
        .fetch_optional(pool)
        .await
    }

    pub async fn attach_intent<'e, E>(executor: E, id: Uuid, intent_id: &str) -> Result<bool, sqlx::Error>
    where
        E: PgExecutor<'e>,
    {
        let result = sqlx::query(
            r#"
            UPDATE payments
            SET stripe_payment_intent_id = $2, updated_at = NOW()
            WHERE id = $1 AND status = 'pending'
            "#,
        )
        .bind(id)
        .bind(intent_id)
        .execute(executor)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// pending → completed
    ///
    /// Returns `None` when the payment was not pending, so only one caller ever
    /// performs the completion side effects.
    pub async fn mark_completed<'e, E>(
        executor: E,
        id: Uuid,
        charge_id: Option<&str>,
    ) -> Result<Option<Self>, sqlx::Error>
    where
        E: PgExecutor<'e>,
    {
        sqlx::query_as::<_, Payment>(
            r#"
            UPDATE payments
            SET status = 'completed', stripe_charge_id = COALESCE($2, stripe_charge_id),
                completed_at = NOW(), updated_at = NOW()
            WHERE id = $1 AND status = 'pending'
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(charge_id)
        .fetch_optional(executor)
        .await
    }

    /// pending → failed
    pub async fn mark_failed<'e, E>(
        executor: E,
        id: Uuid,
        reason: &str,
    ) -> Result<Option<Self>, sqlx::Error>
    where
        E: PgExecutor<'e>,
    {
        sqlx::query_as::<_, Payment>(
            r#"
            UPDATE payments
            SET status = 'failed', failure_reason = $2, updated_at = NOW()
            WHERE id = $1 AND status = 'pending'
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(reason)
        .fetch_optional(executor)
        .await
    }

    /// pending → cancelled
    pub async fn mark_cancelled<'e, E>(executor: E, id: Uuid) -> Result<Option<Self>, sqlx::Error>
    where
        E: PgExecutor<'e>,
    {
        sqlx::query_as::<_, Payment>(
            r#"
            UPDATE payments
            SET status = 'cancelled', updated_at = NOW()
            WHERE id = $1 AND status = 'pending'
            RETURNING *
            "#,
        )
        .bind(id)
        .fetch_optional(executor)
        .await
    }

    /// Cancels the pending payments of the given reservations
    pub async fn cancel_pending_for_reservations<'e, E>(
        executor: E,
        user_registration_ids: &[Uuid],
    ) -> Result<Vec<Self>, sqlx::Error>
    where
        E: PgExecutor<'e>,
    {
        sqlx::query_as::<_, Payment>(
            r#"
            UPDATE payments
            SET status = 'cancelled', failure_reason = 'reservation expired', updated_at = NOW()
            WHERE user_registration_id = ANY($1) AND status = 'pending'
            RETURNING *
            "#,
        )
        .bind(user_registration_ids)
        .fetch_all(executor)
        .await
    }

    pub async fn set_payment_plan_id<'e, E>(executor: E, id: Uuid, plan_id: Uuid) -> Result<bool, sqlx::Error>
    where
        E: PgExecutor<'e>,
    {
        let result = sqlx::query("UPDATE payments SET payment_plan_id = $2, updated_at = NOW() WHERE id = $1")
            .bind(id)
            .bind(plan_id)
            .execute(executor)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn list_by_user(pool: &PgPool, user_id: Uuid) -> Result<Vec<Self>, sqlx::Error> {
        sqlx::query_as::<_, Payment>(
            "SELECT * FROM payments WHERE user_id = $1 ORDER BY created_at DESC",
        )
        .bind(user_id)
        .fetch_all(pool)
        .await
    }

    pub fn is_pending(&self) -> bool {
        self.status == PaymentStatus::Pending
    }

    /// Stripe idempotency key for this payment's charge
    pub fn idempotency_key(&self) -> String {
        format!("payment-{}", self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_payment_defaults() {
        let user_id = Uuid::new_v4();
        let payment = NewPayment::new(user_id, PaymentType::Alternate, 1_500);

        assert_eq!(payment.final_amount_cents, 1_500);
        assert_eq!(payment.discount_cents, 0);
        assert!(!payment.use_payment_plan);
        assert!(payment.discount_code_id.is_none());
    }

    #[test]
    fn test_payment_type_strings() {
        assert_eq!(PaymentType::Installment.as_str(), "installment");
        assert_eq!(
            serde_json::to_string(&PaymentStatus::Cancelled).unwrap(),
            "\"cancelled\""
        );
    }
}
