/// Payment endpoints
///
/// - `GET /v1/payments/me` - the caller's payments, newest first
/// - `POST /v1/payments/:id/confirm` - re-check a pending payment with Stripe
/// - `GET /v1/payment-plans/me`

use crate::{app::AppState, error::ApiResult};
use axum::{
    extract::{Path, State},
    Extension, Json,
};
use pitchside_shared::{
    auth::middleware::AuthContext,
    checkout::{self, PaymentConfirmation},
    models::{payment::Payment, payment_plan::PaymentPlan},
};
use uuid::Uuid;

pub async fn my_payments(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
) -> ApiResult<Json<Vec<Payment>>> {
    Ok(Json(Payment::list_by_user(&state.db, auth.user_id).await?))
}

/// Client-side fallback for a webhook that has not arrived yet
///
/// Called after Stripe.js reports success. Completing here and in the webhook is
/// safe; whichever runs second is a no-op.
pub async fn confirm_payment(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<PaymentConfirmation>> {
    let confirmation = checkout::confirm_payment(&state.db, &state.integrations, id, auth.user_id).await?;

    Ok(Json(confirmation))
}

pub async fn my_payment_plans(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
) -> ApiResult<Json<Vec<PaymentPlan>>> {
    Ok(Json(PaymentPlan::list_by_user(&state.db, auth.user_id).await?))
}
