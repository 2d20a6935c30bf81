/// Stripe webhook intake
///
/// # Endpoint
///
/// ```text
/// POST /v1/webhooks/stripe
/// Stripe-Signature: t=1700000000,v1=5257a869...
/// ```
///
/// The raw body is verified against `STRIPE_WEBHOOK_SECRET` before it is parsed.
/// Each event id is recorded before it is acted on, so redeliveries are acknowledged
/// without side effects. When processing fails the record is removed again and a
/// non-2xx status makes Stripe redeliver.
///
/// Handled events:
///
/// - `payment_intent.succeeded` - completes the payment
/// - `payment_intent.payment_failed` - fails the payment and releases its slot
/// - `setup_intent.succeeded` - saves an alternate's card
///
/// Anything else is acknowledged and ignored.

use crate::{
    app::AppState,
    error::{ApiError, ApiResult},
};
use axum::{body::Bytes, extract::State, http::HeaderMap, Json};
use chrono::Utc;
use pitchside_shared::{
    alternates,
    checkout::{self, CheckoutError},
    integrations::stripe::{parse_event, verify_webhook_signature, PaymentIntent, SetupIntent, StripeEvent, WEBHOOK_TOLERANCE_SECS},
    models::{payment::Payment, stripe_event::StripeEventRecord},
};
use serde::Serialize;
use uuid::Uuid;

pub const SIGNATURE_HEADER: &str = "stripe-signature";

#[derive(Debug, Serialize)]
pub struct WebhookAck {
    pub received: bool,

    /// The event id was seen before
    pub duplicate: bool,
}

pub async fn stripe_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Json<WebhookAck>> {
    let webhook_secret = &state.config.integrations.stripe.webhook_secret;
    if webhook_secret.is_empty() {
        return Err(ApiError::ServiceUnavailable("Stripe webhooks are not configured".to_string()));
    }

    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ApiError::BadRequest("Missing Stripe-Signature header".to_string()))?;

    verify_webhook_signature(
        &body,
        signature,
        webhook_secret,
        WEBHOOK_TOLERANCE_SECS,
        Utc::now().timestamp(),
    )
    .map_err(|e| {
        tracing::warn!(error = %e, "Rejected Stripe webhook");
        ApiError::BadRequest("Invalid webhook signature".to_string())
    })?;

    let event = parse_event(&body).map_err(|e| ApiError::BadRequest(format!("Malformed event: {}", e)))?;

    if !StripeEventRecord::record_once(&state.db, &event.id, &event.event_type).await? {
        tracing::debug!(event_id = %event.id, event_type = %event.event_type, "Duplicate Stripe event");
        return Ok(Json(WebhookAck {
            received: true,
            duplicate: true,
        }));
    }

    if let Err(e) = dispatch(&state, &event).await {
        tracing::error!(event_id = %event.id, event_type = %event.event_type, error = %e, "Stripe event processing failed");
        if let Err(forget_err) = StripeEventRecord::forget(&state.db, &event.id).await {
            tracing::error!(event_id = %event.id, error = %forget_err, "Could not un-record Stripe event");
        }
        return Err(ApiError::InternalError(e.to_string()));
    }

    Ok(Json(WebhookAck {
        received: true,
        duplicate: false,
    }))
}

async fn dispatch(state: &AppState, event: &StripeEvent) -> ApiResult<()> {
    match event.event_type.as_str() {
        "payment_intent.succeeded" => {
            let intent: PaymentIntent = event.object_as()?;
            let Some(payment_id) = resolve_payment(state, &intent).await? else {
                return Ok(());
            };

            match checkout::complete_payment(&state.db, &state.integrations, payment_id, Some(&intent)).await {
                Ok(_) | Err(CheckoutError::AlreadyCompleted) => Ok(()),
                Err(e) => Err(e.into()),
            }
        }
        "payment_intent.payment_failed" => {
            let intent: PaymentIntent = event.object_as()?;
            let Some(payment_id) = resolve_payment(state, &intent).await? else {
                return Ok(());
            };
            let reason = intent.failure_reason().unwrap_or_else(|| "payment_failed".to_string());

            match checkout::fail_payment(&state.db, &state.integrations, payment_id, &reason).await {
                Ok(_) => Ok(()),
                Err(CheckoutError::AlreadyCompleted) => {
                    tracing::warn!(payment_id = %payment_id, "Failure event for a completed payment ignored");
                    Ok(())
                }
                Err(e) => Err(e.into()),
            }
        }
        "setup_intent.succeeded" => {
            let setup_intent: SetupIntent = event.object_as()?;
            if alternates::attach_payment_method(&state.db, &state.integrations, &setup_intent.id)
                .await?
                .is_none()
            {
                tracing::debug!(setup_intent_id = %setup_intent.id, "SetupIntent matched no alternate registration");
            }
            Ok(())
        }
        other => {
            tracing::debug!(event_id = %event.id, event_type = %other, "Ignoring Stripe event");
            Ok(())
        }
    }
}

/// Finds our payment for an intent: metadata first, then the stored intent id
///
/// `None` for intents this system did not create.
async fn resolve_payment(state: &AppState, intent: &PaymentIntent) -> ApiResult<Option<Uuid>> {
    if let Some(id) = intent.metadata.get("payment_id").and_then(|v| v.parse::<Uuid>().ok()) {
        if Payment::find_by_id(&state.db, id).await?.is_some() {
            return Ok(Some(id));
        }
    }

    let payment = Payment::find_by_intent_id(&state.db, &intent.id).await?;
    if payment.is_none() {
        tracing::warn!(payment_intent_id = %intent.id, "Webhook for unknown payment intent");
    }

    Ok(payment.map(|p| p.id))
}
