/// Alternate players
///
/// A member opts in to a registration as an alternate and saves a card through a
/// SetupIntent. When an admin picks alternates for a game each pick is charged the
/// registration's alternate price off-session, through the regular payment pipeline.

use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use uuid::Uuid;

use crate::checkout::{self, ChargeOutcome, CheckoutError, PaymentOrder};
use crate::integrations::stripe::CreateSetupIntent;
use crate::integrations::Integrations;
use crate::models::alternate::{AlternateRegistration, AlternateSelection, Game};
use crate::models::payment::PaymentType;
use crate::models::registration::Registration;
use crate::models::user::User;

/// What the client needs to save a card
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlternateSignup {
    pub alternate_registration: AlternateRegistration,

    /// For Stripe.js; `None` once a card is saved
    pub client_secret: Option<String>,

    pub has_payment_method: bool,
}

/// Opts the member in as an alternate and starts saving a card
///
/// Signing up again returns the same SetupIntent.
pub async fn register(
    pool: &PgPool,
    integrations: &Integrations,
    user: &User,
    registration_id: Uuid,
) -> Result<AlternateSignup, CheckoutError> {
    let registration = Registration::find_by_id(pool, registration_id)
        .await?
        .filter(|r| r.is_active)
        .ok_or(CheckoutError::NotFound("Registration"))?;

    if !registration.accepts_alternates() {
        return Err(CheckoutError::AlternatesNotOffered);
    }

    let mut alternate = AlternateRegistration::create(pool, user.id, registration.id).await?;

    if alternate.can_be_charged() {
        return Ok(AlternateSignup {
            alternate_registration: alternate,
            client_secret: None,
            has_payment_method: true,
        });
    }

    let setup_intent = match alternate.stripe_setup_intent_id.clone() {
        Some(id) => integrations.payments.retrieve_setup_intent(&id).await?,
        None => {
            let customer_id = checkout::ensure_stripe_customer(pool, integrations, user).await?;
            let setup_intent = integrations
                .payments
                .create_setup_intent(CreateSetupIntent {
                    customer: customer_id,
                    metadata: vec![
                        ("alternate_registration_id".to_string(), alternate.id.to_string()),
                        ("user_id".to_string(), user.id.to_string()),
                    ],
                    idempotency_key: format!("alternate-{}", alternate.id),
                })
                .await?;
            AlternateRegistration::set_setup_intent(pool, alternate.id, &setup_intent.id).await?;
            alternate.stripe_setup_intent_id = Some(setup_intent.id.clone());
            setup_intent
        }
    };

    tracing::info!(
        user_id = %user.id,
        registration_id = %registration.id,
        setup_intent_id = %setup_intent.id,
        "Alternate signup started"
    );

    // The webhook may have been missed for a card saved earlier
    if setup_intent.status == "succeeded" {
        if let Some(payment_method) = &setup_intent.payment_method {
            if let Some(updated) =
                AlternateRegistration::set_payment_method(pool, &setup_intent.id, payment_method).await?
            {
                return Ok(AlternateSignup {
                    alternate_registration: updated,
                    client_secret: None,
                    has_payment_method: true,
                });
            }
        }
    }

    Ok(AlternateSignup {
        alternate_registration: alternate,
        client_secret: setup_intent.client_secret,
        has_payment_method: false,
    })
}

/// Stores the card from a completed SetupIntent
///
/// Returns `None` when the SetupIntent belongs to no alternate registration.
pub async fn attach_payment_method(
    pool: &PgPool,
    integrations: &Integrations,
    setup_intent_id: &str,
) -> Result<Option<AlternateRegistration>, CheckoutError> {
    let setup_intent = integrations.payments.retrieve_setup_intent(setup_intent_id).await?;

    let Some(payment_method) = setup_intent.payment_method else {
        tracing::warn!(setup_intent_id = %setup_intent_id, "SetupIntent has no payment method");
        return Ok(None);
    };

    let updated = AlternateRegistration::set_payment_method(pool, setup_intent_id, &payment_method).await?;
    if let Some(alternate) = &updated {
        tracing::info!(
            alternate_registration_id = %alternate.id,
            user_id = %alternate.user_id,
            "Alternate card saved"
        );
    }

    Ok(updated)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlternateChargeStatus {
    Charged,
    Declined,

    /// Stripe has not settled the charge yet
    Processing,

    AlreadySelected,
    NotRegistered,
    NoSavedCard,
    Error,
}

/// Result of picking one player
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlternateChargeOutcome {
    pub user_id: Uuid,
    pub status: AlternateChargeStatus,
    pub selection_id: Option<Uuid>,
    pub payment_id: Option<Uuid>,
    pub message: Option<String>,
}

impl AlternateChargeOutcome {
    fn new(user_id: Uuid, status: AlternateChargeStatus) -> Self {
        Self {
            user_id,
            status,
            selection_id: None,
            payment_id: None,
            message: None,
        }
    }

    fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

/// Picks alternates for a game and charges each of them
///
/// Every player gets an outcome; one player's failure never stops the others.
pub async fn select_for_game(
    pool: &PgPool,
    integrations: &Integrations,
    admin_id: Uuid,
    game_id: Uuid,
    user_ids: &[Uuid],
) -> Result<Vec<AlternateChargeOutcome>, CheckoutError> {
    let game = Game::find_by_id(pool, game_id)
        .await?
        .ok_or(CheckoutError::NotFound("Game"))?;
    let registration = Registration::find_by_id(pool, game.registration_id)
        .await?
        .ok_or(CheckoutError::NotFound("Registration"))?;
    let price_cents = registration
        .alternate_price_cents
        .ok_or(CheckoutError::AlternatesNotOffered)?;

    let mut outcomes = Vec::with_capacity(user_ids.len());

    for &user_id in user_ids {
        let outcome = match charge_alternate(pool, integrations, admin_id, &game, &registration, price_cents, user_id).await {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::error!(game_id = %game.id, user_id = %user_id, error = %e, "Alternate charge failed");
                AlternateChargeOutcome::new(user_id, AlternateChargeStatus::Error).with_message(e.to_string())
            }
        };
        outcomes.push(outcome);
    }

    let charged = outcomes
        .iter()
        .filter(|o| o.status == AlternateChargeStatus::Charged)
        .count();
    tracing::info!(
        game_id = %game.id,
        selected = outcomes.len(),
        charged,
        "Alternates selected"
    );

    Ok(outcomes)
}

async fn charge_alternate(
    pool: &PgPool,
    integrations: &Integrations,
    admin_id: Uuid,
    game: &Game,
    registration: &Registration,
    price_cents: i64,
    user_id: Uuid,
) -> Result<AlternateChargeOutcome, CheckoutError> {
    let Some(alternate) = AlternateRegistration::find_for_user(pool, user_id, registration.id).await? else {
        return Ok(AlternateChargeOutcome::new(user_id, AlternateChargeStatus::NotRegistered));
    };
    let Some(payment_method) = alternate.stripe_payment_method_id.clone() else {
        return Ok(AlternateChargeOutcome::new(user_id, AlternateChargeStatus::NoSavedCard));
    };
    let user = User::find_by_id(pool, user_id)
        .await?
        .ok_or(CheckoutError::NotFound("User"))?;
    let Some(customer_id) = user.stripe_customer_id.clone() else {
        return Ok(AlternateChargeOutcome::new(user_id, AlternateChargeStatus::NoSavedCard));
    };

    let Some(selection) = AlternateSelection::create(pool, game.id, user_id, alternate.id, admin_id).await? else {
        return Ok(AlternateChargeOutcome::new(user_id, AlternateChargeStatus::AlreadySelected));
    };

    let description = format!(
        "{} alternate {}",
        registration.name,
        game.starts_at.format("%Y-%m-%d")
    );

    let mut order = PaymentOrder::new(
        PaymentType::Alternate,
        description.clone(),
        price_cents,
        integrations.accounts.alternate.clone(),
    );
    order.season_id = Some(registration.season_id);
    order.alternate_selection_id = Some(selection.id);

    let (payment, _entry) = match checkout::create_staged_payment(pool, &user, &order).await {
        Ok(staged) => staged,
        Err(e) => {
            AlternateSelection::mark_failed(pool, selection.id, &e.to_string()).await?;
            return Err(e);
        }
    };
    AlternateSelection::attach_payment(pool, selection.id, payment.id).await?;

    let mut outcome = AlternateChargeOutcome::new(user_id, AlternateChargeStatus::Error);
    outcome.selection_id = Some(selection.id);
    outcome.payment_id = Some(payment.id);

    if payment.final_amount_cents == 0 {
        checkout::complete_payment(pool, integrations, payment.id, None).await?;
        outcome.status = AlternateChargeStatus::Charged;
        return Ok(outcome);
    }

    let charge = checkout::charge_saved_card(
        pool,
        integrations,
        &payment,
        &customer_id,
        &payment_method,
        payment.idempotency_key(),
        description,
    )
    .await?;

    match charge {
        ChargeOutcome::Charged(_) => outcome.status = AlternateChargeStatus::Charged,
        ChargeOutcome::Declined { reason, .. } => {
            outcome.status = AlternateChargeStatus::Declined;
            outcome.message = Some(reason);
        }
        ChargeOutcome::Processing => outcome.status = AlternateChargeStatus::Processing,
        ChargeOutcome::Unavailable(reason) => {
            AlternateSelection::mark_failed(pool, selection.id, &reason).await?;
            outcome.message = Some(reason);
        }
    }

    tracing::debug!(
        game_id = %game.id,
        user_id = %user_id,
        status = ?outcome.status,
        "Alternate charge attempted"
    );

    Ok(outcome)
}
