/// Checkout and payment completion
///
/// Every charge follows the same pipeline:
///
/// 1. Create a `pending` payment and stage its ledger entry in one transaction
/// 2. Charge through Stripe with the payment's idempotency key
/// 3. [`complete_payment`]: in one transaction mark the payment completed, create the
///    business record, record the discount, promote the ledger entry to `pending`
/// 4. After commit: enqueue the confirmation email and try a best-effort ledger sync
///
/// Completion is driven by whichever of the Stripe webhook, the client-side
/// confirmation call or the off-session charge result arrives first; the conditional
/// `pending → completed` update makes every later caller a no-op.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sqlx::{PgConnection, PgPool};
use thiserror::Error;
use uuid::Uuid;

use crate::config::CheckoutConfig;
use crate::integrations::alerts::{AlertKind, CriticalAlert};
use crate::integrations::stripe::{CreateCustomer, CreatePaymentIntent, PaymentIntent, PaymentIntentStatus, StripeError};
use crate::integrations::Integrations;
use crate::ledger;
use crate::models::alternate::{AlternateSelection, Game};
use crate::models::discount::{DiscountCategory, DiscountCode, DiscountUsage};
use crate::models::ledger::{line_items_total, LedgerEntry, LedgerEntryKind, LedgerLineItem, NewLedgerEntry};
use crate::models::membership::{Membership, MembershipType};
use crate::models::payment::{NewPayment, Payment, PaymentStatus, PaymentType};
use crate::models::payment_plan::{NewPaymentPlan, PaymentPlan, PaymentPlanStatus};
use crate::models::registration::{Registration, UserRegistration, UserRegistrationStatus};
use crate::models::user::User;
use crate::models::waitlist::WaitlistEntry;
use crate::notifications::{self, EmailTemplate};
use crate::pricing::{apply_percent_discount, cap_discount, split_installments};

#[derive(Debug, Error)]
pub enum DiscountError {
    #[error("Discount code not found")]
    NotFound,

    #[error("Discount code is not active")]
    Inactive,

    #[error("Discount code has expired")]
    Expired,

    #[error("Discount limit reached for this season")]
    LimitReached,

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

#[derive(Debug, Error)]
pub enum CheckoutError {
    #[error("{0} not found")]
    NotFound(&'static str),

    #[error("Registration is not open")]
    RegistrationClosed,

    #[error("Registration is full")]
    RegistrationFull,

    #[error("Registration still has open spots")]
    RegistrationNotFull,

    #[error("Already registered")]
    AlreadyRegistered,

    #[error("An active membership for this season is required")]
    MembershipRequired,

    #[error("Already a member")]
    AlreadyMember,

    #[error("This membership type cannot be paid in installments")]
    PaymentPlanNotAllowed,

    #[error("Payment already completed")]
    AlreadyCompleted,

    #[error("Not on the waitlist")]
    NotOnWaitlist,

    #[error("This registration does not take alternates")]
    AlternatesNotOffered,

    #[error("{0}")]
    InvalidState(String),

    #[error(transparent)]
    Discount(#[from] DiscountError),

    #[error("Payment provider error: {0}")]
    Stripe(#[from] StripeError),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
    err.as_database_error()
        .map_or(false, |db| db.is_unique_violation())
}

/// A validated discount, priced for one purchase
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscountQuote {
    pub discount_code_id: Uuid,
    pub code: String,
    pub percent_off: i32,
    pub category_name: String,
    pub accounting_code: String,
    pub discount_cents: i64,
    pub final_cents: i64,

    /// The seasonal cap reduced the discount
    pub partially_applied: bool,
}

/// What the client needs to finish paying
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckoutSession {
    pub payment_id: Uuid,

    /// For Stripe.js; `None` when nothing is left to pay
    pub client_secret: Option<String>,

    pub amount_cents: i64,
    pub discount_cents: i64,

    /// Charged now (the first installment on a payment plan)
    pub final_amount_cents: i64,

    pub status: PaymentStatus,
}

impl CheckoutSession {
    fn from_payment(payment: &Payment, client_secret: Option<String>) -> Self {
        Self {
            payment_id: payment.id,
            client_secret,
            amount_cents: payment.amount_cents,
            discount_cents: payment.discount_cents,
            final_amount_cents: payment.final_amount_cents,
            status: payment.status,
        }
    }
}

/// Everything [`begin_payment`] needs to create and stage a charge
#[derive(Debug, Clone)]
pub struct PaymentOrder {
    pub payment_type: PaymentType,
    pub season_id: Option<Uuid>,

    /// Invoice line description
    pub description: String,

    /// List price before discount
    pub amount_cents: i64,

    /// Revenue account for the item line
    pub account_code: String,

    pub discount: Option<DiscountQuote>,

    /// Charged now; less than price minus discount only for payment plans
    pub charge_cents: i64,

    pub membership_type_id: Option<Uuid>,
    pub user_registration_id: Option<Uuid>,
    pub alternate_selection_id: Option<Uuid>,
    pub use_payment_plan: bool,
}

impl PaymentOrder {
    pub fn new(payment_type: PaymentType, description: impl Into<String>, amount_cents: i64, account_code: impl Into<String>) -> Self {
        Self {
            payment_type,
            season_id: None,
            description: description.into(),
            amount_cents,
            account_code: account_code.into(),
            discount: None,
            charge_cents: amount_cents,
            membership_type_id: None,
            user_registration_id: None,
            alternate_selection_id: None,
            use_payment_plan: false,
        }
    }

    pub fn discount_cents(&self) -> i64 {
        self.discount.as_ref().map_or(0, |d| d.discount_cents)
    }

    /// Invoice lines: the item, then the discount as a negative line
    pub fn line_items(&self) -> Vec<LedgerLineItem> {
        let mut items = vec![LedgerLineItem::new(
            self.description.clone(),
            self.amount_cents,
            self.account_code.clone(),
        )];

        if let Some(discount) = self.discount.as_ref().filter(|d| d.discount_cents > 0) {
            items.push(LedgerLineItem::new(
                format!("Discount {}", discount.code),
                -discount.discount_cents,
                discount.accounting_code.clone(),
            ));
        }

        items
    }
}

/// Validates a discount code and prices it against the member's seasonal cap
pub async fn quote_discount(
    pool: &PgPool,
    user_id: Uuid,
    code: &str,
    season_id: Uuid,
    price_cents: i64,
    now: DateTime<Utc>,
) -> Result<DiscountQuote, DiscountError> {
    let discount = DiscountCode::find_by_code(pool, code)
        .await?
        .ok_or(DiscountError::NotFound)?;

    if !discount.is_active || discount.valid_from.map_or(false, |from| now < from) {
        return Err(DiscountError::Inactive);
    }
    if discount.valid_until.map_or(false, |until| now >= until) {
        return Err(DiscountError::Expired);
    }

    let category = DiscountCategory::find_by_id(pool, discount.category_id)
        .await?
        .ok_or(DiscountError::NotFound)?;

    let face_value = apply_percent_discount(price_cents, discount.percent_off);
    let already_used =
        DiscountUsage::total_for_user_in_category_season(pool, user_id, category.id, season_id).await?;
    let cap = cap_discount(face_value, category.max_discount_per_user_per_season_cents, already_used);

    if cap.limit_reached {
        return Err(DiscountError::LimitReached);
    }

    Ok(DiscountQuote {
        discount_code_id: discount.id,
        code: discount.code,
        percent_off: discount.percent_off,
        category_name: category.name,
        accounting_code: category.accounting_code,
        discount_cents: cap.applied_cents,
        final_cents: price_cents - cap.applied_cents,
        partially_applied: cap.partially_applied,
    })
}

/// Holds a slot for the member
///
/// Returns the member's live reservation unchanged when there is one. The
/// registration row is locked while capacity is checked so two members can't take
/// the last slot together.
pub async fn reserve_registration(
    pool: &PgPool,
    config: &CheckoutConfig,
    user_id: Uuid,
    registration_id: Uuid,
    now: DateTime<Utc>,
) -> Result<UserRegistration, CheckoutError> {
    let mut tx = pool.begin().await?;

    let registration = Registration::lock_for_update(&mut *tx, registration_id)
        .await?
        .ok_or(CheckoutError::NotFound("Registration"))?;

    if !registration.is_open(now) {
        return Err(CheckoutError::RegistrationClosed);
    }

    if registration.requires_membership
        && !Membership::has_active_for_season(pool, user_id, registration.season_id).await?
    {
        return Err(CheckoutError::MembershipRequired);
    }

    let existing = UserRegistration::find_active(&mut *tx, user_id, registration_id).await?;
    if let Some(existing) = &existing {
        if existing.status == UserRegistrationStatus::Paid {
            return Err(CheckoutError::AlreadyRegistered);
        }
        if existing.is_live_reservation(now) {
            tx.commit().await?;
            return Ok(existing.clone());
        }
    }

    let taken = Registration::count_active_slots(&mut *tx, registration_id, now).await?;
    if taken >= i64::from(registration.capacity) {
        return Err(CheckoutError::RegistrationFull);
    }

    let expires_at = now + config.reservation_hold();
    let reservation = match existing {
        // Lapsed but not yet swept by the expiry job; it still owns the unique slot
        Some(stale) => UserRegistration::extend_hold(&mut *tx, stale.id, expires_at)
            .await?
            .ok_or_else(|| CheckoutError::InvalidState("reservation changed concurrently".to_string()))?,
        None => UserRegistration::reserve(&mut *tx, user_id, registration_id, expires_at, false).await?,
    };

    tx.commit().await?;

    tracing::info!(
        user_id = %user_id,
        registration_id = %registration_id,
        expires_at = %expires_at,
        "Reserved registration slot"
    );

    Ok(reservation)
}

/// Returns the member's Stripe customer, creating it on first use
pub async fn ensure_stripe_customer(
    pool: &PgPool,
    integrations: &Integrations,
    user: &User,
) -> Result<String, CheckoutError> {
    if let Some(customer_id) = &user.stripe_customer_id {
        return Ok(customer_id.clone());
    }

    let customer_id = integrations
        .payments
        .create_customer(CreateCustomer {
            email: user.email.clone(),
            name: user.display_name(),
            metadata: vec![("user_id".to_string(), user.id.to_string())],
        })
        .await?;

    User::set_stripe_customer_id(pool, user.id, &customer_id).await?;
    Ok(customer_id)
}

/// Creates the `pending` payment and its staged ledger entry together
pub async fn create_staged_payment(
    pool: &PgPool,
    user: &User,
    order: &PaymentOrder,
) -> Result<(Payment, LedgerEntry), CheckoutError> {
    let line_items = order.line_items();
    let discount_cents = order.discount_cents();

    let mut tx = pool.begin().await?;

    let payment = Payment::create_pending(
        &mut *tx,
        NewPayment {
            user_id: user.id,
            payment_type: order.payment_type,
            amount_cents: order.amount_cents,
            discount_cents,
            final_amount_cents: order.charge_cents,
            discount_code_id: order.discount.as_ref().map(|d| d.discount_code_id),
            season_id: order.season_id,
            membership_type_id: order.membership_type_id,
            user_registration_id: order.user_registration_id,
            alternate_selection_id: order.alternate_selection_id,
            payment_plan_id: None,
            use_payment_plan: order.use_payment_plan,
        },
    )
    .await?;

    let entry = LedgerEntry::stage(
        &mut *tx,
        NewLedgerEntry {
            kind: LedgerEntryKind::Invoice,
            parent_id: None,
            payment_id: payment.id,
            user_id: user.id,
            contact_name: user.display_name(),
            contact_email: user.email.clone(),
            description: order.description.clone(),
            total_cents: line_items_total(&line_items),
            line_items,
        },
    )
    .await?;

    tx.commit().await?;

    Ok((payment, entry))
}

/// Creates the payment and starts the charge
///
/// Nothing to pay completes immediately without calling Stripe. Otherwise a
/// PaymentIntent is created for the client to confirm.
pub async fn begin_payment(
    pool: &PgPool,
    integrations: &Integrations,
    user: &User,
    order: PaymentOrder,
) -> Result<CheckoutSession, CheckoutError> {
    let (payment, _entry) = create_staged_payment(pool, user, &order).await?;

    tracing::info!(
        payment_id = %payment.id,
        user_id = %user.id,
        payment_type = payment.payment_type.as_str(),
        amount_cents = payment.final_amount_cents,
        "Created pending payment"
    );

    if payment.final_amount_cents == 0 {
        let completed = complete_payment(pool, integrations, payment.id, None).await?;
        return Ok(CheckoutSession::from_payment(&completed, None));
    }

    create_intent_for(pool, integrations, user, &payment).await
}

async fn create_intent_for(
    pool: &PgPool,
    integrations: &Integrations,
    user: &User,
    payment: &Payment,
) -> Result<CheckoutSession, CheckoutError> {
    let intent = async {
        let customer_id = ensure_stripe_customer(pool, integrations, user).await?;

        let mut request = CreatePaymentIntent::new(
            payment.final_amount_cents,
            integrations.currency.clone(),
            payment.idempotency_key(),
        );
        request.customer = Some(customer_id);
        request.save_card = payment.use_payment_plan;
        request.metadata = vec![
            ("payment_id".to_string(), payment.id.to_string()),
            ("user_id".to_string(), user.id.to_string()),
            ("payment_type".to_string(), payment.payment_type.as_str().to_string()),
        ];

        Ok::<_, CheckoutError>(integrations.payments.create_payment_intent(request).await?)
    }
    .await;

    let intent = match intent {
        Ok(intent) => intent,
        Err(e) => {
            // No charge exists; withdraw the payment so the member can try again
            tracing::warn!(payment_id = %payment.id, error = %e, "Could not create payment intent");
            let mut tx = pool.begin().await?;
            Payment::mark_cancelled(&mut *tx, payment.id).await?;
            LedgerEntry::abandon(&mut *tx, payment.id).await?;
            tx.commit().await?;
            return Err(e);
        }
    };

    Payment::attach_intent(pool, payment.id, &intent.id).await?;

    Ok(CheckoutSession::from_payment(payment, intent.client_secret))
}

/// Picks an existing pending payment back up instead of charging again
async fn resume_payment(
    pool: &PgPool,
    integrations: &Integrations,
    user: &User,
    payment: Payment,
) -> Result<CheckoutSession, CheckoutError> {
    match payment.status {
        PaymentStatus::Pending => {}
        PaymentStatus::Completed => return Err(CheckoutError::AlreadyCompleted),
        other => {
            return Err(CheckoutError::InvalidState(format!("payment is {:?}", other).to_lowercase()));
        }
    }

    let Some(intent_id) = payment.stripe_payment_intent_id.clone() else {
        return create_intent_for(pool, integrations, user, &payment).await;
    };

    let intent = integrations.payments.retrieve_payment_intent(&intent_id).await?;
    if intent.status == PaymentIntentStatus::Succeeded {
        let completed = complete_payment(pool, integrations, payment.id, Some(&intent)).await?;
        return Ok(CheckoutSession::from_payment(&completed, None));
    }

    tracing::debug!(payment_id = %payment.id, "Reusing pending payment");
    Ok(CheckoutSession::from_payment(&payment, intent.client_secret))
}

/// Reserves a slot (or reuses the reservation) and starts paying for it
///
/// A reservation has at most one open payment; checking out again returns the same
/// payment and client secret.
pub async fn checkout_registration(
    pool: &PgPool,
    integrations: &Integrations,
    config: &CheckoutConfig,
    user: &User,
    registration_id: Uuid,
    discount_code: Option<&str>,
    now: DateTime<Utc>,
) -> Result<CheckoutSession, CheckoutError> {
    let reservation = reserve_registration(pool, config, user.id, registration_id, now).await?;

    if let Some(open) = Payment::find_open_for_registration(pool, reservation.id).await? {
        return resume_payment(pool, integrations, user, open).await;
    }

    let registration = Registration::find_by_id(pool, registration_id)
        .await?
        .ok_or(CheckoutError::NotFound("Registration"))?;

    let discount = match discount_code.map(str::trim).filter(|c| !c.is_empty()) {
        Some(code) => Some(
            quote_discount(pool, user.id, code, registration.season_id, registration.price_cents, now).await?,
        ),
        None => None,
    };

    let mut order = PaymentOrder::new(
        PaymentType::Registration,
        registration.name.clone(),
        registration.price_cents,
        integrations.accounts.registration.clone(),
    );
    order.season_id = Some(registration.season_id);
    order.user_registration_id = Some(reservation.id);
    order.charge_cents = registration.price_cents - discount.as_ref().map_or(0, |d| d.discount_cents);
    order.discount = discount;

    match begin_payment(pool, integrations, user, order).await {
        Err(CheckoutError::Database(e)) if is_unique_violation(&e) => {
            // A concurrent checkout created the reservation's payment first
            let open = Payment::find_open_for_registration(pool, reservation.id)
                .await?
                .ok_or(CheckoutError::Database(e))?;
            resume_payment(pool, integrations, user, open).await
        }
        other => other,
    }
}

/// Starts paying for a membership, optionally in installments
pub async fn checkout_membership(
    pool: &PgPool,
    integrations: &Integrations,
    user: &User,
    membership_type_id: Uuid,
    discount_code: Option<&str>,
    use_payment_plan: bool,
    now: DateTime<Utc>,
) -> Result<CheckoutSession, CheckoutError> {
    let membership_type = MembershipType::find_by_id(pool, membership_type_id)
        .await?
        .filter(|t| t.is_active)
        .ok_or(CheckoutError::NotFound("Membership type"))?;

    if Membership::find_by_user_and_type(pool, user.id, membership_type.id).await?.is_some() {
        return Err(CheckoutError::AlreadyMember);
    }
    if use_payment_plan && !membership_type.allows_payment_plan() {
        return Err(CheckoutError::PaymentPlanNotAllowed);
    }

    if let Some(pending) = Payment::find_pending_for_membership(pool, user.id, membership_type.id).await? {
        return resume_payment(pool, integrations, user, pending).await;
    }

    let discount = match discount_code.map(str::trim).filter(|c| !c.is_empty()) {
        Some(code) => Some(
            quote_discount(pool, user.id, code, membership_type.season_id, membership_type.price_cents, now).await?,
        ),
        None => None,
    };

    let total = membership_type.price_cents - discount.as_ref().map_or(0, |d| d.discount_cents);
    let use_payment_plan = use_payment_plan && total > 0;
    let charge_cents = if use_payment_plan {
        split_installments(total, membership_type.installment_count)
            .first()
            .copied()
            .unwrap_or(total)
    } else {
        total
    };

    let mut order = PaymentOrder::new(
        PaymentType::Membership,
        format!("{} membership", membership_type.name),
        membership_type.price_cents,
        integrations.accounts.membership.clone(),
    );
    order.season_id = Some(membership_type.season_id);
    order.membership_type_id = Some(membership_type.id);
    order.use_payment_plan = use_payment_plan;
    order.charge_cents = charge_cents;
    order.discount = discount;

    begin_payment(pool, integrations, user, order).await
}

/// Rows written by a completion, for the after-commit steps
struct Completion {
    payment: Payment,
    ledger_entry: Option<LedgerEntry>,
    plan: Option<PaymentPlan>,
}

async fn complete_in_tx(
    conn: &mut PgConnection,
    payment_id: Uuid,
    intent: Option<&PaymentIntent>,
    now: DateTime<Utc>,
) -> Result<Completion, CheckoutError> {
    let charge_reference = intent.map(|i| i.payment_reference().to_string());

    let Some(payment) = Payment::mark_completed(&mut *conn, payment_id, charge_reference.as_deref()).await? else {
        let existing = Payment::find_by_id(&mut *conn, payment_id)
            .await?
            .ok_or(CheckoutError::NotFound("Payment"))?;
        return Err(match existing.status {
            PaymentStatus::Completed => CheckoutError::AlreadyCompleted,
            other => CheckoutError::InvalidState(format!("payment is {:?}", other).to_lowercase()),
        });
    };

    let mut plan = None;

    match payment.payment_type {
        PaymentType::Membership => {
            let membership_type_id = payment
                .membership_type_id
                .ok_or_else(|| CheckoutError::InvalidState("membership payment without a type".to_string()))?;
            let membership_type = MembershipType::find_by_id(&mut *conn, membership_type_id)
                .await?
                .ok_or(CheckoutError::NotFound("Membership type"))?;

            let membership = Membership::create(
                &mut *conn,
                payment.user_id,
                membership_type.id,
                membership_type.season_id,
                payment.id,
            )
            .await?;

            if payment.use_payment_plan && membership_type.allows_payment_plan() {
                let user = User::find_by_id(&mut *conn, payment.user_id)
                    .await?
                    .ok_or(CheckoutError::NotFound("User"))?;
                let entry = LedgerEntry::find_by_payment_id(&mut *conn, payment.id).await?;
                let total = payment.amount_cents - payment.discount_cents;
                let installments = split_installments(total, membership_type.installment_count);

                let created = PaymentPlan::create(
                    &mut *conn,
                    NewPaymentPlan {
                        user_id: payment.user_id,
                        membership_id: membership.id,
                        origin_payment_id: payment.id,
                        total_cents: total,
                        installment_cents: installments.get(1).copied().unwrap_or(total),
                        installments_total: membership_type.installment_count,
                        first_due_at: PaymentPlan::first_due_date(now),
                        stripe_customer_id: intent
                            .and_then(|i| i.customer.clone())
                            .or(user.stripe_customer_id)
                            .unwrap_or_default(),
                        stripe_payment_method_id: intent.and_then(|i| i.payment_method.clone()),
                        ledger_entry_id: entry.map(|e| e.id),
                    },
                )
                .await?;
                Payment::set_payment_plan_id(&mut *conn, payment.id, created.id).await?;
                plan = Some(created);
            }
        }
        PaymentType::Registration => {
            let reservation_id = payment
                .user_registration_id
                .ok_or_else(|| CheckoutError::InvalidState("registration payment without a reservation".to_string()))?;
            UserRegistration::mark_paid(&mut *conn, reservation_id, payment.id)
                .await?
                .ok_or_else(|| CheckoutError::InvalidState("reservation was released before payment".to_string()))?;
        }
        PaymentType::Alternate => {
            let selection_id = payment
                .alternate_selection_id
                .ok_or_else(|| CheckoutError::InvalidState("alternate payment without a selection".to_string()))?;
            AlternateSelection::mark_charged(&mut *conn, selection_id, payment.id).await?;
        }
        PaymentType::Installment => {
            let plan_id = payment
                .payment_plan_id
                .ok_or_else(|| CheckoutError::InvalidState("installment without a plan".to_string()))?;
            plan = PaymentPlan::record_installment_paid(&mut *conn, plan_id).await?;
        }
    }

    if let (Some(code_id), Some(season_id)) = (payment.discount_code_id, payment.season_id) {
        if payment.discount_cents > 0 {
            DiscountUsage::record(
                &mut *conn,
                payment.user_id,
                code_id,
                season_id,
                payment.id,
                payment.discount_cents,
            )
            .await?;
        }
    }

    let reference = charge_reference.unwrap_or_else(|| format!("pitchside-{}", payment.id));
    let ledger_entry =
        LedgerEntry::promote_to_pending(&mut *conn, payment.id, &reference, payment.final_amount_cents, now).await?;
    if ledger_entry.is_none() {
        tracing::warn!(payment_id = %payment.id, "No staged ledger entry to promote");
    }

    Ok(Completion {
        payment,
        ledger_entry,
        plan,
    })
}

/// Records a successful charge
///
/// Safe to call any number of times: only the call that moves the payment out of
/// `pending` performs the side effects; the others get [`CheckoutError::AlreadyCompleted`].
pub async fn complete_payment(
    pool: &PgPool,
    integrations: &Integrations,
    payment_id: Uuid,
    intent: Option<&PaymentIntent>,
) -> Result<Payment, CheckoutError> {
    let now = Utc::now();

    let result = async {
        let mut tx = pool.begin().await?;
        let completion = complete_in_tx(&mut *tx, payment_id, intent, now).await?;
        tx.commit().await?;
        Ok::<_, CheckoutError>(completion)
    }
    .await;

    let completion = match result {
        Ok(completion) => completion,
        Err(CheckoutError::AlreadyCompleted) => return Err(CheckoutError::AlreadyCompleted),
        Err(e) => {
            let charged = intent.map_or(false, |i| i.status == PaymentIntentStatus::Succeeded);
            if charged {
                integrations
                    .alerts
                    .critical(&CriticalAlert::new(
                        AlertKind::PaymentRecordFailed,
                        "Charge succeeded but recording it failed",
                        json!({
                            "payment_id": payment_id,
                            "payment_intent_id": intent.map(|i| i.id.clone()),
                            "error": e.to_string(),
                        }),
                    ))
                    .await;
            }
            return Err(e);
        }
    };

    let payment = completion.payment;
    tracing::info!(
        payment_id = %payment.id,
        payment_type = payment.payment_type.as_str(),
        amount_cents = payment.final_amount_cents,
        "Payment completed"
    );

    after_completion(pool, &payment, completion.plan.as_ref()).await;

    if let (Some(entry), Some(ledger_client)) = (completion.ledger_entry, integrations.ledger.as_deref()) {
        ledger::sync_one_best_effort(pool, ledger_client, integrations.alerts.as_ref(), entry.id, now).await;
    }

    Ok(payment)
}

/// Confirmation email and waitlist bookkeeping; failures are logged only
async fn after_completion(pool: &PgPool, payment: &Payment, plan: Option<&PaymentPlan>) {
    let result = async {
        let Some(user) = User::find_by_id(pool, payment.user_id).await? else {
            return Ok(());
        };

        let template = match payment.payment_type {
            PaymentType::Registration => {
                let Some(reservation_id) = payment.user_registration_id else {
                    return Ok(());
                };
                let Some(reservation) = UserRegistration::find_by_id(pool, reservation_id).await? else {
                    return Ok(());
                };
                WaitlistEntry::mark_converted(pool, user.id, reservation.registration_id).await?;

                let Some(registration) = Registration::find_by_id(pool, reservation.registration_id).await? else {
                    return Ok(());
                };
                EmailTemplate::RegistrationConfirmed {
                    registration_name: registration.name,
                    amount_cents: payment.final_amount_cents,
                }
            }
            PaymentType::Membership => {
                let Some(type_id) = payment.membership_type_id else {
                    return Ok(());
                };
                let Some(membership_type) = MembershipType::find_by_id(pool, type_id).await? else {
                    return Ok(());
                };
                EmailTemplate::MembershipConfirmed {
                    membership_name: membership_type.name,
                    amount_cents: payment.final_amount_cents,
                    remaining_installments: plan.map(PaymentPlan::remaining_installments),
                }
            }
            PaymentType::Alternate => {
                let Some(selection_id) = payment.alternate_selection_id else {
                    return Ok(());
                };
                let Some(selection) = AlternateSelection::find_by_id(pool, selection_id).await? else {
                    return Ok(());
                };
                let Some(game) = Game::find_by_id(pool, selection.game_id).await? else {
                    return Ok(());
                };
                let Some(registration) = Registration::find_by_id(pool, game.registration_id).await? else {
                    return Ok(());
                };
                EmailTemplate::AlternateCharged {
                    registration_name: registration.name,
                    game_starts_at: game.starts_at,
                    location: game.location,
                    amount_cents: payment.final_amount_cents,
                }
            }
            PaymentType::Installment => {
                let Some(plan) = plan else {
                    return Ok(());
                };
                let name = membership_name_for_plan(pool, plan).await?;
                EmailTemplate::InstallmentCharged {
                    membership_name: name,
                    installment_number: plan.installments_paid,
                    installments_total: plan.installments_total,
                    amount_cents: payment.final_amount_cents,
                }
            }
        };

        notifications::enqueue(pool, &user, &template).await?;
        Ok::<_, sqlx::Error>(())
    }
    .await;

    if let Err(e) = result {
        tracing::warn!(payment_id = %payment.id, error = %e, "Post-payment steps failed");
    }
}

async fn membership_name_for_plan(pool: &PgPool, plan: &PaymentPlan) -> Result<String, sqlx::Error> {
    let name: Option<(String,)> = sqlx::query_as(
        r#"
        SELECT t.name FROM memberships m
        JOIN membership_types t ON t.id = m.membership_type_id
        WHERE m.id = $1
        "#,
    )
    .bind(plan.membership_id)
    .fetch_optional(pool)
    .await?;

    Ok(name.map(|(n,)| n).unwrap_or_else(|| "membership".to_string()))
}

/// Records a failed charge
///
/// The reservation is released, the staged ledger entry abandoned, and the member
/// told. For installments the plan's failure streak grows; the third failure in a row
/// fails the plan and raises an alert. Failing an already failed payment is a no-op.
pub async fn fail_payment(
    pool: &PgPool,
    integrations: &Integrations,
    payment_id: Uuid,
    reason: &str,
) -> Result<Payment, CheckoutError> {
    let now = Utc::now();
    let mut tx = pool.begin().await?;

    let Some(payment) = Payment::mark_failed(&mut *tx, payment_id, reason).await? else {
        let existing = Payment::find_by_id(&mut *tx, payment_id)
            .await?
            .ok_or(CheckoutError::NotFound("Payment"))?;
        return match existing.status {
            PaymentStatus::Failed | PaymentStatus::Cancelled => Ok(existing),
            PaymentStatus::Completed => Err(CheckoutError::AlreadyCompleted),
            PaymentStatus::Pending => Err(CheckoutError::InvalidState("payment changed concurrently".to_string())),
        };
    };

    if let Some(reservation_id) = payment.user_registration_id {
        UserRegistration::release(&mut *tx, reservation_id).await?;
    }
    if let Some(selection_id) = payment.alternate_selection_id {
        AlternateSelection::mark_failed(&mut *tx, selection_id, reason).await?;
    }
    LedgerEntry::abandon(&mut *tx, payment.id).await?;

    let plan = match (payment.payment_type, payment.payment_plan_id) {
        (PaymentType::Installment, Some(plan_id)) => PaymentPlan::record_failure(&mut *tx, plan_id, now).await?,
        _ => None,
    };

    tx.commit().await?;

    tracing::warn!(
        payment_id = %payment.id,
        payment_type = payment.payment_type.as_str(),
        reason = %reason,
        "Payment failed"
    );

    // A declined intent goes back to requires_payment_method and could still be paid
    if let Some(intent_id) = payment.stripe_payment_intent_id.as_deref() {
        cancel_intent_logged(integrations, intent_id).await;
    }

    let plan_failed = plan.as_ref().filter(|p| p.status == PaymentPlanStatus::Failed);
    if let Some(plan) = plan_failed {
        integrations
            .alerts
            .critical(&CriticalAlert::new(
                AlertKind::PaymentPlanFailed,
                "Payment plan failed after repeated declines",
                json!({
                    "payment_plan_id": plan.id,
                    "user_id": plan.user_id,
                    "installments_paid": plan.installments_paid,
                    "installments_total": plan.installments_total,
                    "last_error": reason,
                }),
            ))
            .await;
    }

    if let Ok(Some(user)) = User::find_by_id(pool, payment.user_id).await {
        let template = match plan_failed {
            Some(plan) => EmailTemplate::PaymentPlanFailed {
                membership_name: membership_name_for_plan(pool, plan)
                    .await
                    .unwrap_or_else(|_| "membership".to_string()),
            },
            None => EmailTemplate::PaymentFailed {
                description: payment_description(pool, &payment).await,
                reason: reason.to_string(),
            },
        };
        notifications::enqueue_logged(pool, &user, &template).await;
    }

    Ok(payment)
}

async fn payment_description(pool: &PgPool, payment: &Payment) -> String {
    match LedgerEntry::find_by_payment_id(pool, payment.id).await {
        Ok(Some(entry)) => entry.description,
        _ => payment.payment_type.as_str().to_string(),
    }
}

/// Result of charging a saved card
#[derive(Debug)]
pub enum ChargeOutcome {
    Charged(Payment),
    Declined { payment: Payment, reason: String },

    /// Stripe has not settled the charge yet; the webhook finishes it
    Processing,

    /// Stripe could not be reached; the payment was withdrawn and can be retried
    Unavailable(String),
}

/// Charges a saved card off-session for a `pending` payment
pub async fn charge_saved_card(
    pool: &PgPool,
    integrations: &Integrations,
    payment: &Payment,
    customer_id: &str,
    payment_method_id: &str,
    idempotency_key: String,
    description: String,
) -> Result<ChargeOutcome, CheckoutError> {
    let mut request = CreatePaymentIntent::new(
        payment.final_amount_cents,
        integrations.currency.clone(),
        idempotency_key,
    );
    request.customer = Some(customer_id.to_string());
    request.payment_method = Some(payment_method_id.to_string());
    request.description = Some(description);
    request.off_session = true;
    request.confirm = true;
    request.metadata = vec![
        ("payment_id".to_string(), payment.id.to_string()),
        ("user_id".to_string(), payment.user_id.to_string()),
        ("payment_type".to_string(), payment.payment_type.as_str().to_string()),
    ];

    let intent = match integrations.payments.create_payment_intent(request).await {
        Ok(intent) => intent,
        Err(e) if e.is_card_error() => {
            let reason = e.failure_reason();
            let failed = fail_payment(pool, integrations, payment.id, &reason).await?;
            return Ok(ChargeOutcome::Declined { payment: failed, reason });
        }
        Err(e) => {
            tracing::warn!(payment_id = %payment.id, error = %e, "Off-session charge could not be attempted");
            let mut tx = pool.begin().await?;
            Payment::mark_cancelled(&mut *tx, payment.id).await?;
            LedgerEntry::abandon(&mut *tx, payment.id).await?;
            tx.commit().await?;
            return Ok(ChargeOutcome::Unavailable(e.to_string()));
        }
    };

    Payment::attach_intent(pool, payment.id, &intent.id).await?;

    match intent.status {
        PaymentIntentStatus::Succeeded => {
            match complete_payment(pool, integrations, payment.id, Some(&intent)).await {
                Ok(completed) => Ok(ChargeOutcome::Charged(completed)),
                // The webhook got there first
                Err(CheckoutError::AlreadyCompleted) => {
                    let completed = Payment::find_by_id(pool, payment.id)
                        .await?
                        .ok_or(CheckoutError::NotFound("Payment"))?;
                    Ok(ChargeOutcome::Charged(completed))
                }
                Err(e) => Err(e),
            }
        }
        PaymentIntentStatus::RequiresPaymentMethod
        | PaymentIntentStatus::RequiresAction
        | PaymentIntentStatus::Canceled => {
            let reason = intent
                .failure_reason()
                .unwrap_or_else(|| intent.status.as_str().to_string());
            let failed = fail_payment(pool, integrations, payment.id, &reason).await?;
            Ok(ChargeOutcome::Declined { payment: failed, reason })
        }
        _ => Ok(ChargeOutcome::Processing),
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ExpiryReport {
    pub reservations_expired: usize,
    pub payments_cancelled: usize,
    pub intents_cancelled: usize,
}

/// Expires lapsed reservations and withdraws their unpaid charges
pub async fn expire_reservations(
    pool: &PgPool,
    integrations: &Integrations,
    now: DateTime<Utc>,
) -> Result<ExpiryReport, CheckoutError> {
    let mut tx = pool.begin().await?;

    let expired = UserRegistration::expire_due(&mut *tx, now).await?;
    let ids: Vec<Uuid> = expired.iter().map(|r| r.id).collect();
    let cancelled = if ids.is_empty() {
        Vec::new()
    } else {
        Payment::cancel_pending_for_reservations(&mut *tx, &ids).await?
    };
    for payment in &cancelled {
        LedgerEntry::abandon(&mut *tx, payment.id).await?;
    }

    tx.commit().await?;

    let mut report = ExpiryReport {
        reservations_expired: expired.len(),
        payments_cancelled: cancelled.len(),
        intents_cancelled: 0,
    };

    for payment in &cancelled {
        let Some(intent_id) = &payment.stripe_payment_intent_id else {
            continue;
        };
        match integrations.payments.cancel_payment_intent(intent_id).await {
            Ok(_) => report.intents_cancelled += 1,
            Err(e) => tracing::warn!(
                payment_id = %payment.id,
                payment_intent_id = %intent_id,
                error = %e,
                "Failed to cancel payment intent"
            ),
        }
    }

    if report.reservations_expired > 0 {
        tracing::info!(
            expired = report.reservations_expired,
            payments_cancelled = report.payments_cancelled,
            "Expired reservations"
        );
    }

    Ok(report)
}

/// Member-initiated release of an unpaid reservation
pub async fn cancel_reservation(
    pool: &PgPool,
    integrations: &Integrations,
    user_id: Uuid,
    registration_id: Uuid,
) -> Result<UserRegistration, CheckoutError> {
    let mut tx = pool.begin().await?;

    let reservation = UserRegistration::cancel_reservation(&mut *tx, user_id, registration_id)
        .await?
        .ok_or(CheckoutError::NotFound("Reservation"))?;
    let cancelled = Payment::cancel_pending_for_reservations(&mut *tx, &[reservation.id]).await?;
    for payment in &cancelled {
        LedgerEntry::abandon(&mut *tx, payment.id).await?;
    }

    tx.commit().await?;

    for intent_id in cancelled.iter().filter_map(|p| p.stripe_payment_intent_id.as_deref()) {
        cancel_intent_logged(integrations, intent_id).await;
    }

    Ok(reservation)
}

pub(crate) async fn cancel_intent_logged(integrations: &Integrations, intent_id: &str) {
    if let Err(e) = integrations.payments.cancel_payment_intent(intent_id).await {
        tracing::warn!(payment_intent_id = %intent_id, error = %e, "Failed to cancel payment intent");
    }
}

/// Payment status after a confirmation check
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentConfirmation {
    pub payment_id: Uuid,
    pub status: PaymentStatus,
    pub intent_status: Option<PaymentIntentStatus>,
}

/// Client-side fallback for a missed webhook
///
/// Re-reads the intent from Stripe and completes or fails the payment to match.
pub async fn confirm_payment(
    pool: &PgPool,
    integrations: &Integrations,
    payment_id: Uuid,
    user_id: Uuid,
) -> Result<PaymentConfirmation, CheckoutError> {
    let payment = Payment::find_by_id(pool, payment_id)
        .await?
        .filter(|p| p.user_id == user_id)
        .ok_or(CheckoutError::NotFound("Payment"))?;

    let (PaymentStatus::Pending, Some(intent_id)) = (payment.status, payment.stripe_payment_intent_id.clone()) else {
        return Ok(PaymentConfirmation {
            payment_id,
            status: payment.status,
            intent_status: None,
        });
    };

    let intent = integrations.payments.retrieve_payment_intent(&intent_id).await?;

    let status = match intent.status {
        PaymentIntentStatus::Succeeded => match complete_payment(pool, integrations, payment_id, Some(&intent)).await {
            Ok(completed) => completed.status,
            Err(CheckoutError::AlreadyCompleted) => PaymentStatus::Completed,
            Err(e) => return Err(e),
        },
        PaymentIntentStatus::Canceled => {
            fail_payment(pool, integrations, payment_id, "canceled").await?.status
        }
        PaymentIntentStatus::RequiresPaymentMethod if intent.last_payment_error.is_some() => {
            let reason = intent.failure_reason().unwrap_or_else(|| "card_declined".to_string());
            fail_payment(pool, integrations, payment_id, &reason).await?.status
        }
        _ => payment.status,
    };

    Ok(PaymentConfirmation {
        payment_id,
        status,
        intent_status: Some(intent.status),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quote(code: &str, discount_cents: i64) -> DiscountQuote {
        DiscountQuote {
            discount_code_id: Uuid::new_v4(),
            code: code.to_string(),
            percent_off: 25,
            category_name: "Volunteers".to_string(),
            accounting_code: "410".to_string(),
            discount_cents,
            final_cents: 10_000 - discount_cents,
            partially_applied: false,
        }
    }

    #[test]
    fn test_line_items_without_discount() {
        let order = PaymentOrder::new(PaymentType::Registration, "Spring League", 10_000, "201");

        let items = order.line_items();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].account_code, "201");
        assert_eq!(line_items_total(&items), 10_000);
    }

    #[test]
    fn test_discount_is_a_negative_line_on_its_category_account() {
        let mut order = PaymentOrder::new(PaymentType::Registration, "Spring League", 10_000, "201");
        order.discount = Some(quote("VOLUNTEER", 2_500));

        let items = order.line_items();
        assert_eq!(items.len(), 2);
        assert_eq!(items[1].description, "Discount VOLUNTEER");
        assert_eq!(items[1].unit_amount_cents, -2_500);
        assert_eq!(items[1].account_code, "410");
        assert_eq!(line_items_total(&items), 7_500);
        assert_eq!(order.discount_cents(), 2_500);
    }

    #[test]
    fn test_zero_discount_adds_no_line() {
        let mut order = PaymentOrder::new(PaymentType::Membership, "Adult membership", 10_000, "200");
        order.discount = Some(quote("CAPPED", 0));

        assert_eq!(order.line_items().len(), 1);
    }

    #[test]
    fn test_session_from_payment() {
        let now = Utc::now();
        let payment = Payment {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            payment_type: PaymentType::Membership,
            status: PaymentStatus::Pending,
            amount_cents: 15_000,
            discount_cents: 0,
            final_amount_cents: 5_000,
            discount_code_id: None,
            season_id: None,
            stripe_payment_intent_id: Some("pi_1".to_string()),
            stripe_charge_id: None,
            membership_type_id: None,
            user_registration_id: None,
            alternate_selection_id: None,
            payment_plan_id: None,
            use_payment_plan: true,
            failure_reason: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        };

        let session = CheckoutSession::from_payment(&payment, Some("pi_1_secret".to_string()));
        assert_eq!(session.final_amount_cents, 5_000);
        assert_eq!(session.amount_cents, 15_000);
        assert_eq!(session.client_secret.as_deref(), Some("pi_1_secret"));
        assert_eq!(session.status, PaymentStatus::Pending);
    }

    #[test]
    fn test_error_messages() {
        assert_eq!(CheckoutError::NotFound("Registration").to_string(), "Registration not found");
        assert_eq!(
            CheckoutError::Discount(DiscountError::LimitReached).to_string(),
            "Discount limit reached for this season"
        );
    }
}
