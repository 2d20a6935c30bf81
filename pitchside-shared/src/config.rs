/// Vendor and checkout settings shared by the API server and the worker
///
/// # Environment Variables
///
/// - `STRIPE_SECRET_KEY` (required), `STRIPE_WEBHOOK_SECRET`, `STRIPE_API_BASE`, `CURRENCY`
/// - `XERO_CLIENT_ID`, `XERO_CLIENT_SECRET`, `XERO_TENANT_ID` (all three or none),
///   `XERO_API_BASE`, `XERO_IDENTITY_URL`, `XERO_CLEARING_ACCOUNT_CODE`,
///   `XERO_MEMBERSHIP_ACCOUNT_CODE`, `XERO_REGISTRATION_ACCOUNT_CODE`,
///   `XERO_ALTERNATE_ACCOUNT_CODE`
/// - `EMAIL_API_KEY`, `EMAIL_FROM` (both or none), `EMAIL_API_BASE`
/// - `ALERT_WEBHOOK_URL`
/// - `RESERVATION_HOLD_MINUTES` (default 15), `WAITLIST_HOLD_HOURS` (default 48)

use serde::{Deserialize, Serialize};
use std::env;
use std::str::FromStr;

pub const DEFAULT_STRIPE_API_BASE: &str = "https://api.stripe.com";
pub const DEFAULT_XERO_API_BASE: &str = "https://api.xero.com/api.xro/2.0";
pub const DEFAULT_XERO_IDENTITY_URL: &str = "https://identity.xero.com/connect/token";
pub const DEFAULT_EMAIL_API_BASE: &str = "https://api.resend.com";

/// Stripe credentials
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StripeConfig {
    #[serde(skip_serializing)]
    pub secret_key: String,

    /// Signing secret for `/webhooks/stripe` (`whsec_...`)
    #[serde(skip_serializing)]
    pub webhook_secret: String,

    pub api_base: String,

    /// ISO currency, lowercase as Stripe expects
    pub currency: String,
}

/// Xero custom-connection credentials
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct XeroConfig {
    pub client_id: String,
    #[serde(skip_serializing)]
    pub client_secret: String,
    pub tenant_id: String,
    pub api_base: String,
    pub identity_url: String,

    /// Bank/clearing account Stripe payouts land in
    pub clearing_account_code: String,
}

/// Revenue accounts invoice lines are coded to
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountCodes {
    pub membership: String,
    pub registration: String,
    pub alternate: String,
}

impl Default for AccountCodes {
    fn default() -> Self {
        Self {
            membership: "200".to_string(),
            registration: "201".to_string(),
            alternate: "202".to_string(),
        }
    }
}

impl AccountCodes {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            membership: or_default("XERO_MEMBERSHIP_ACCOUNT_CODE", &defaults.membership),
            registration: or_default("XERO_REGISTRATION_ACCOUNT_CODE", &defaults.registration),
            alternate: or_default("XERO_ALTERNATE_ACCOUNT_CODE", &defaults.alternate),
        }
    }
}

/// Transactional email provider
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailConfig {
    #[serde(skip_serializing)]
    pub api_key: String,
    pub from_address: String,
    pub api_base: String,
}

/// Where critical alerts go besides the log
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AlertConfig {
    pub webhook_url: Option<String>,
}

/// Hold windows for reservations
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckoutConfig {
    pub reservation_hold_minutes: i64,
    pub waitlist_hold_hours: i64,
}

impl Default for CheckoutConfig {
    fn default() -> Self {
        Self {
            reservation_hold_minutes: 15,
            waitlist_hold_hours: 48,
        }
    }
}

/// Everything needed to build [`crate::integrations::Integrations`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntegrationsConfig {
    pub stripe: StripeConfig,
    pub xero: Option<XeroConfig>,
    pub email: Option<EmailConfig>,
    pub alerts: AlertConfig,
    pub accounts: AccountCodes,
}

impl IntegrationsConfig {
    /// Loads vendor settings from the environment
    ///
    /// Xero and email are optional; a partially configured vendor is an error so a
    /// typo doesn't silently disable the ledger sync.
    pub fn from_env() -> anyhow::Result<Self> {
        let stripe = StripeConfig {
            secret_key: required("STRIPE_SECRET_KEY")?,
            webhook_secret: env::var("STRIPE_WEBHOOK_SECRET").unwrap_or_default(),
            api_base: or_default("STRIPE_API_BASE", DEFAULT_STRIPE_API_BASE),
            currency: or_default("CURRENCY", "usd").to_lowercase(),
        };

        let xero = match (
            optional("XERO_CLIENT_ID"),
            optional("XERO_CLIENT_SECRET"),
            optional("XERO_TENANT_ID"),
        ) {
            (Some(client_id), Some(client_secret), Some(tenant_id)) => Some(XeroConfig {
                client_id,
                client_secret,
                tenant_id,
                api_base: or_default("XERO_API_BASE", DEFAULT_XERO_API_BASE),
                identity_url: or_default("XERO_IDENTITY_URL", DEFAULT_XERO_IDENTITY_URL),
                clearing_account_code: or_default("XERO_CLEARING_ACCOUNT_CODE", "090"),
            }),
            (None, None, None) => None,
            _ => anyhow::bail!(
                "XERO_CLIENT_ID, XERO_CLIENT_SECRET and XERO_TENANT_ID must be set together"
            ),
        };

        let email = match (optional("EMAIL_API_KEY"), optional("EMAIL_FROM")) {
            (Some(api_key), Some(from_address)) => Some(EmailConfig {
                api_key,
                from_address,
                api_base: or_default("EMAIL_API_BASE", DEFAULT_EMAIL_API_BASE),
            }),
            (None, None) => None,
            _ => anyhow::bail!("EMAIL_API_KEY and EMAIL_FROM must be set together"),
        };

        Ok(Self {
            stripe,
            xero,
            email,
            alerts: AlertConfig {
                webhook_url: optional("ALERT_WEBHOOK_URL"),
            },
            accounts: AccountCodes::from_env(),
        })
    }
}

impl CheckoutConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let defaults = Self::default();
        let config = Self {
            reservation_hold_minutes: parse_or("RESERVATION_HOLD_MINUTES", defaults.reservation_hold_minutes)?,
            waitlist_hold_hours: parse_or("WAITLIST_HOLD_HOURS", defaults.waitlist_hold_hours)?,
        };

        if config.reservation_hold_minutes <= 0 || config.waitlist_hold_hours <= 0 {
            anyhow::bail!("Reservation hold windows must be positive");
        }

        Ok(config)
    }

    pub fn reservation_hold(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.reservation_hold_minutes)
    }

    pub fn waitlist_hold(&self) -> chrono::Duration {
        chrono::Duration::hours(self.waitlist_hold_hours)
    }
}

fn required(name: &str) -> anyhow::Result<String> {
    optional(name).ok_or_else(|| anyhow::anyhow!("{} environment variable is required", name))
}

fn optional(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn or_default(name: &str, default: &str) -> String {
    optional(name).unwrap_or_else(|| default.to_string())
}

/// Parses an optional variable, falling back to `default` when unset
pub fn parse_or<T>(name: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match optional(name) {
        Some(raw) => raw
            .parse::<T>()
            .map_err(|e| anyhow::anyhow!("Invalid value for {}: {}", name, e)),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checkout_defaults() {
        let config = CheckoutConfig::default();
        assert_eq!(config.reservation_hold(), chrono::Duration::minutes(15));
        assert_eq!(config.waitlist_hold(), chrono::Duration::hours(48));
    }

    #[test]
    fn test_account_code_defaults() {
        let codes = AccountCodes::default();
        assert_eq!(codes.membership, "200");
        assert_eq!(codes.registration, "201");
        assert_eq!(codes.alternate, "202");
    }

    #[test]
    fn test_parse_or_uses_default_when_unset() {
        let value: u64 = parse_or("PITCHSIDE_TEST_SURELY_UNSET_VARIABLE", 42).unwrap();
        assert_eq!(value, 42);
    }
}
