/// Vendor integrations
///
/// Each vendor sits behind an `async_trait` so the checkout pipeline, the API and the
/// worker never depend on a concrete client:
///
/// - [`stripe::PaymentGateway`]: charges, saved cards, webhook verification
/// - [`xero::LedgerClient`]: contacts, invoices and payments in the ledger
/// - [`email::EmailSender`]: transactional email
/// - [`alerts::AlertSink`]: critical alerts
///
/// In-memory doubles live in `mock`, compiled for tests and under the `test-util`
/// feature.

pub mod alerts;
pub mod email;
pub mod stripe;
pub mod xero;

#[cfg(any(test, feature = "test-util"))]
pub mod mock;

use std::sync::Arc;

use crate::config::{AccountCodes, IntegrationsConfig};
use alerts::{AlertSink, LogAlertSink, WebhookAlertSink};
use email::{EmailSender, HttpEmailClient};
use stripe::{PaymentGateway, StripeClient};
use xero::{LedgerClient, XeroClient};

#[cfg(any(test, feature = "test-util"))]
pub use mock::MockIntegrations;

/// The vendor clients one process talks to
///
/// `ledger` and `email` are optional: without them entries stay pending and emails
/// stay queued until the vendor is configured.
#[derive(Clone)]
pub struct Integrations {
    pub payments: Arc<dyn PaymentGateway>,
    pub ledger: Option<Arc<dyn LedgerClient>>,
    pub email: Option<Arc<dyn EmailSender>>,
    pub alerts: Arc<dyn AlertSink>,

    /// Currency every charge is made in
    pub currency: String,

    pub accounts: AccountCodes,
}

impl Integrations {
    pub fn from_config(config: &IntegrationsConfig) -> anyhow::Result<Self> {
        let payments: Arc<dyn PaymentGateway> = Arc::new(StripeClient::new(&config.stripe)?);

        let ledger = match &config.xero {
            Some(xero) => Some(Arc::new(XeroClient::new(xero.clone())?) as Arc<dyn LedgerClient>),
            None => {
                tracing::warn!("Xero not configured; ledger entries will queue until it is");
                None
            }
        };

        let email = match &config.email {
            Some(email) => Some(Arc::new(HttpEmailClient::new(email)?) as Arc<dyn EmailSender>),
            None => {
                tracing::warn!("Email provider not configured; emails will queue until it is");
                None
            }
        };

        let alerts: Arc<dyn AlertSink> = match &config.alerts.webhook_url {
            Some(url) => Arc::new(WebhookAlertSink::new(url.clone())?),
            None => Arc::new(LogAlertSink),
        };

        Ok(Self {
            payments,
            ledger,
            email,
            alerts,
            currency: config.stripe.currency.clone(),
            accounts: config.accounts.clone(),
        })
    }
}
