/// Waitlists for full registrations
///
/// Members queue first-in, first-out. An admin offers a freed spot to an entry, which
/// reserves a slot for that member with the longer waitlist hold; the member then pays
/// through the regular registration checkout.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use uuid::Uuid;

use crate::checkout::{self, CheckoutError};
use crate::config::CheckoutConfig;
use crate::integrations::Integrations;
use crate::models::ledger::LedgerEntry;
use crate::models::payment::Payment;
use crate::models::registration::{Registration, UserRegistration, UserRegistrationStatus};
use crate::models::user::User;
use crate::models::waitlist::{WaitlistEntry, WaitlistStatus};
use crate::notifications::{self, EmailTemplate};

/// A member's place in the queue
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WaitlistPosition {
    pub entry: WaitlistEntry,

    /// 1-based; `None` once the entry has been offered a spot
    pub position: Option<i64>,
}

/// Puts the member in the queue for a full registration
///
/// Joining twice returns the existing place.
pub async fn join(
    pool: &PgPool,
    user_id: Uuid,
    registration_id: Uuid,
    now: DateTime<Utc>,
) -> Result<WaitlistPosition, CheckoutError> {
    let registration = Registration::find_by_id(pool, registration_id)
        .await?
        .filter(|r| r.is_active)
        .ok_or(CheckoutError::NotFound("Registration"))?;

    if let Some(existing) = WaitlistEntry::find_for_user(pool, user_id, registration_id).await? {
        if existing.is_queued() {
            let position = WaitlistEntry::position_of(pool, user_id, registration_id).await?;
            return Ok(WaitlistPosition {
                entry: existing,
                position,
            });
        }
    }

    if let Some(active) = UserRegistration::find_active(pool, user_id, registration_id).await? {
        if active.status == UserRegistrationStatus::Paid || active.is_live_reservation(now) {
            return Err(CheckoutError::AlreadyRegistered);
        }
    }

    let taken = Registration::count_active_slots(pool, registration_id, now).await?;
    if taken < i64::from(registration.capacity) {
        return Err(CheckoutError::RegistrationNotFull);
    }

    let entry = WaitlistEntry::join(pool, user_id, registration_id).await?;
    let position = WaitlistEntry::position_of(pool, user_id, registration_id).await?;

    tracing::info!(
        user_id = %user_id,
        registration_id = %registration_id,
        position = ?position,
        "Joined waitlist"
    );

    Ok(WaitlistPosition { entry, position })
}

/// Takes the member out of the queue
///
/// Leaving after an offer also gives back the reserved slot and withdraws any
/// pending payment for it.
pub async fn leave(
    pool: &PgPool,
    integrations: &Integrations,
    user_id: Uuid,
    registration_id: Uuid,
) -> Result<(), CheckoutError> {
    let mut tx = pool.begin().await?;

    let previous = WaitlistEntry::leave(&mut *tx, user_id, registration_id)
        .await?
        .ok_or(CheckoutError::NotOnWaitlist)?;

    let mut cancelled = Vec::new();
    if previous == WaitlistStatus::Offered {
        let held = UserRegistration::find_active(&mut *tx, user_id, registration_id)
            .await?
            .filter(|r| r.via_waitlist && r.status == UserRegistrationStatus::Reserved);
        if let Some(reservation) = held {
            UserRegistration::release(&mut *tx, reservation.id).await?;
            cancelled = Payment::cancel_pending_for_reservations(&mut *tx, &[reservation.id]).await?;
            for payment in &cancelled {
                LedgerEntry::abandon(&mut *tx, payment.id).await?;
            }
        }
    }

    tx.commit().await?;

    for intent_id in cancelled.iter().filter_map(|p| p.stripe_payment_intent_id.as_deref()) {
        checkout::cancel_intent_logged(integrations, intent_id).await;
    }

    tracing::info!(
        user_id = %user_id,
        registration_id = %registration_id,
        released_offer = previous == WaitlistStatus::Offered,
        "Left waitlist"
    );
    Ok(())
}

pub async fn position(pool: &PgPool, user_id: Uuid, registration_id: Uuid) -> Result<WaitlistPosition, CheckoutError> {
    let entry = WaitlistEntry::find_for_user(pool, user_id, registration_id)
        .await?
        .filter(WaitlistEntry::is_queued)
        .ok_or(CheckoutError::NotOnWaitlist)?;
    let position = WaitlistEntry::position_of(pool, user_id, registration_id).await?;

    Ok(WaitlistPosition { entry, position })
}

/// Result of offering a spot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WaitlistOffer {
    pub entry: WaitlistEntry,
    pub reservation: UserRegistration,
}

/// Reserves a spot for a queued member, outside the registration's capacity
///
/// Offering again extends the same reservation.
pub async fn offer_spot(
    pool: &PgPool,
    config: &CheckoutConfig,
    entry_id: Uuid,
    now: DateTime<Utc>,
) -> Result<WaitlistOffer, CheckoutError> {
    let entry = WaitlistEntry::find_by_id(pool, entry_id)
        .await?
        .filter(WaitlistEntry::is_queued)
        .ok_or(CheckoutError::NotOnWaitlist)?;

    let expires_at = now + config.waitlist_hold();

    let mut tx = pool.begin().await?;

    let registration = Registration::lock_for_update(&mut *tx, entry.registration_id)
        .await?
        .ok_or(CheckoutError::NotFound("Registration"))?;

    let reservation = match UserRegistration::find_active(&mut *tx, entry.user_id, entry.registration_id).await? {
        Some(existing) if existing.status == UserRegistrationStatus::Paid => {
            return Err(CheckoutError::AlreadyRegistered);
        }
        Some(existing) => UserRegistration::extend_hold(&mut *tx, existing.id, expires_at)
            .await?
            .ok_or_else(|| CheckoutError::InvalidState("reservation changed concurrently".to_string()))?,
        None => UserRegistration::reserve(&mut *tx, entry.user_id, entry.registration_id, expires_at, true).await?,
    };

    let entry = WaitlistEntry::mark_offered(&mut *tx, entry.id, now)
        .await?
        .ok_or(CheckoutError::NotOnWaitlist)?;

    tx.commit().await?;

    tracing::info!(
        waitlist_entry_id = %entry.id,
        user_id = %entry.user_id,
        registration_id = %registration.id,
        expires_at = %expires_at,
        "Offered waitlist spot"
    );

    if let Ok(Some(user)) = User::find_by_id(pool, entry.user_id).await {
        let template = EmailTemplate::WaitlistOffer {
            registration_name: registration.name,
            expires_at: reservation.reservation_expires_at.unwrap_or(expires_at),
        };
        notifications::enqueue_logged(pool, &user, &template).await;
    }

    Ok(WaitlistOffer { entry, reservation })
}
