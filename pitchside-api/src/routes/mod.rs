/// API route handlers
///
/// This module contains all route handlers organized by resource:
///
/// - `health`: Health check endpoint
/// - `auth`: Registration, login, token refresh and the caller's profile
/// - `seasons`, `memberships`, `registrations`: catalogue and checkout
/// - `payments`, `discounts`: payment history, confirmation and discount codes
/// - `waitlists`, `alternates`: overflow handling for full registrations
/// - `admin`: ledger sync monitoring
/// - `webhooks`: Stripe event intake
/// - `cron`: externally triggered background passes

pub mod admin;
pub mod alternates;
pub mod auth;
pub mod cron;
pub mod discounts;
pub mod health;
pub mod memberships;
pub mod payments;
pub mod registrations;
pub mod seasons;
pub mod waitlists;
pub mod webhooks;

use crate::{
    app::AppState,
    error::{ApiError, ApiResult},
};
use pitchside_shared::{auth::middleware::AuthContext, models::user::User};
use serde::Deserialize;

/// Loads the authenticated caller
///
/// A valid token for a deleted account is treated as unauthenticated.
pub(crate) async fn current_user(state: &AppState, auth: &AuthContext) -> ApiResult<User> {
    User::find_by_id(&state.db, auth.user_id)
        .await?
        .ok_or_else(|| ApiError::Unauthorized("Account no longer exists".to_string()))
}

/// `?include_inactive=true` on admin listings
#[derive(Debug, Default, Deserialize)]
pub struct InactiveFilter {
    #[serde(default)]
    pub include_inactive: bool,
}
