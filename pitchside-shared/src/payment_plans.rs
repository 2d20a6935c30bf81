/// Off-session installment charges
///
/// Each due plan gets a fresh `installment` payment and a ledger entry staged against
/// the plan's original invoice, then the saved card is charged. Completion and failure
/// go through the same pipeline as every other payment, which moves the plan forward
/// or grows its failure streak.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::PgPool;
use uuid::Uuid;

use crate::checkout::{self, ChargeOutcome, CheckoutError};
use crate::integrations::Integrations;
use crate::models::ledger::LedgerEntry;
use crate::models::payment::{NewPayment, Payment, PaymentType};
use crate::models::payment_plan::PaymentPlan;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PlanReport {
    pub charged: usize,
    pub declined: usize,
    pub processing: usize,
    pub errors: usize,
}

impl PlanReport {
    pub fn total(&self) -> usize {
        self.charged + self.declined + self.processing + self.errors
    }
}

/// Charges every installment due at `now`, up to `batch` plans
pub async fn process_due(
    pool: &PgPool,
    integrations: &Integrations,
    now: DateTime<Utc>,
    batch: i64,
) -> Result<PlanReport, sqlx::Error> {
    let plans = PaymentPlan::find_due(pool, now, batch).await?;
    let mut report = PlanReport::default();

    for plan in plans {
        match charge_installment(pool, integrations, &plan).await {
            Ok(ChargeOutcome::Charged(_)) => report.charged += 1,
            Ok(ChargeOutcome::Declined { .. }) => report.declined += 1,
            Ok(ChargeOutcome::Processing) => report.processing += 1,
            Ok(ChargeOutcome::Unavailable(reason)) => {
                tracing::warn!(payment_plan_id = %plan.id, reason = %reason, "Installment charge postponed");
                report.errors += 1;
            }
            Err(e) => {
                tracing::error!(payment_plan_id = %plan.id, error = %e, "Installment charge failed");
                report.errors += 1;
            }
        }
    }

    if report.total() > 0 {
        tracing::info!(
            charged = report.charged,
            declined = report.declined,
            processing = report.processing,
            errors = report.errors,
            "Payment plan pass finished"
        );
    }

    Ok(report)
}

/// Charges the plan's next installment
pub async fn charge_installment(
    pool: &PgPool,
    integrations: &Integrations,
    plan: &PaymentPlan,
) -> Result<ChargeOutcome, CheckoutError> {
    let installment_number = plan.next_installment_number();
    let amount_cents = installment_amount(plan);

    let mut tx = pool.begin().await?;

    let mut new_payment = NewPayment::new(plan.user_id, PaymentType::Installment, amount_cents);
    new_payment.payment_plan_id = Some(plan.id);
    let payment = Payment::create_pending(&mut *tx, new_payment).await?;

    let parent = match plan.ledger_entry_id {
        Some(id) => LedgerEntry::find_by_id(&mut *tx, id).await?,
        None => None,
    };
    let description = match &parent {
        Some(parent) => {
            let entry =
                LedgerEntry::stage_installment(&mut *tx, parent, payment.id, installment_number, amount_cents).await?;
            entry.description
        }
        None => {
            tracing::warn!(payment_plan_id = %plan.id, "Payment plan has no ledger invoice to pay against");
            format!("Membership installment {}", installment_number)
        }
    };

    tx.commit().await?;

    tracing::info!(
        payment_plan_id = %plan.id,
        payment_id = %payment.id,
        installment_number,
        amount_cents,
        "Charging installment"
    );

    let Some(payment_method_id) = plan.stripe_payment_method_id.as_deref() else {
        let reason = "no saved payment method";
        let failed = checkout::fail_payment(pool, integrations, payment.id, reason).await?;
        return Ok(ChargeOutcome::Declined {
            payment: failed,
            reason: reason.to_string(),
        });
    };

    checkout::charge_saved_card(
        pool,
        integrations,
        &payment,
        &plan.stripe_customer_id,
        payment_method_id,
        attempt_idempotency_key(plan, installment_number, payment.id),
        description,
    )
    .await
}

/// Stripe key for one charge attempt
///
/// Every attempt has its own payment row, so the key follows the payment. A pass
/// that was withdrawn without a decline never reuses a key with new parameters.
fn attempt_idempotency_key(plan: &PaymentPlan, installment_number: i32, payment_id: Uuid) -> String {
    format!(
        "{}-payment-{}",
        plan.installment_idempotency_key(installment_number),
        payment_id.simple()
    )
}

/// The last installment takes whatever is left so the plan sums to its total
fn installment_amount(plan: &PaymentPlan) -> i64 {
    if plan.remaining_installments() <= 1 {
        let paid_after_first = plan.installment_cents * i64::from((plan.installments_paid - 1).max(0));
        let first = plan.total_cents - plan.installment_cents * i64::from((plan.installments_total - 1).max(0));
        (plan.total_cents - first - paid_after_first).max(0)
    } else {
        plan.installment_cents
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::payment_plan::PaymentPlanStatus;
    use crate::pricing::split_installments;

    fn plan(total: i64, count: i32, paid: i32) -> PaymentPlan {
        let now = Utc::now();
        let installments = split_installments(total, count);
        PaymentPlan {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            membership_id: Uuid::new_v4(),
            origin_payment_id: Uuid::new_v4(),
            total_cents: total,
            installment_cents: installments.get(1).copied().unwrap_or(total),
            installments_total: count,
            installments_paid: paid,
            next_due_at: Some(now),
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
    fn test_middle_installment_is_regular_amount() {
        assert_eq!(installment_amount(&plan(10_000, 3, 1)), 3_333);
    }

    #[test]
    fn test_installments_sum_to_total() {
        let total = 10_000;
        let installments = split_installments(total, 3);
        let second = installment_amount(&plan(total, 3, 1));
        let third = installment_amount(&plan(total, 3, 2));

        assert_eq!(installments[0] + second + third, total);
    }

    #[test]
    fn test_each_attempt_gets_its_own_key() {
        let plan = plan(12_000, 4, 1);
        let first = attempt_idempotency_key(&plan, 2, Uuid::new_v4());
        let retry = attempt_idempotency_key(&plan, 2, Uuid::new_v4());

        assert_ne!(first, retry);
        assert!(first.starts_with(&plan.installment_idempotency_key(2)));
    }

    #[test]
    fn test_even_split_last_installment() {
        assert_eq!(installment_amount(&plan(12_000, 4, 3)), 3_000);
    }
}
