//! # Pitchside Shared Library
//!
//! Models, vendor clients and the payment-to-accounting pipeline used by both the
//! Pitchside API server and the worker.
//!
//! ## Module Organization
//!
//! - `config`: Vendor and checkout settings
//! - `db`: Connection pool and migrations
//! - `models`: Database models
//! - `auth`: Passwords, JWTs and the auth middleware
//! - `pricing`: Money arithmetic
//! - `integrations`: Stripe, Xero, email and alert clients
//! - `checkout`: Reservations, charges and payment completion
//! - `waitlist`: Waitlist queue and offers
//! - `alternates`: Alternate opt-in and per-game charges
//! - `ledger`: Ledger sync with retry bookkeeping
//! - `notifications`: Email templates and the outbox
//! - `payment_plans`: Off-session installment charges

pub mod alternates;
pub mod auth;
pub mod checkout;
pub mod config;
pub mod db;
pub mod integrations;
pub mod ledger;
pub mod models;
pub mod notifications;
pub mod payment_plans;
pub mod pricing;
pub mod waitlist;

/// Current version of the Pitchside shared library
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_is_set() {
        assert!(!VERSION.is_empty());
    }
}
