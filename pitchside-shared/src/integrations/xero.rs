/// Xero accounting client
///
/// Uses a custom connection: an app-level client-credentials token from the identity
/// endpoint, cached until shortly before it expires, plus the `xero-tenant-id` header on
/// every API call.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::NaiveDate;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tokio::sync::RwLock;

use crate::config::XeroConfig;
use crate::models::ledger::LedgerLineItem;
use crate::pricing::cents_to_decimal;

/// Refresh the token when it has less than this left
const TOKEN_REFRESH_MARGIN_SECS: u64 = 60;

const REQUEST_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("Ledger request failed: {0}")]
    Http(String),

    #[error("Ledger authentication failed: {0}")]
    Auth(String),

    /// The ledger refused the document (validation error)
    #[error("Ledger rejected the request: {0}")]
    Rejected(String),

    #[error("Ledger rate limit hit")]
    RateLimited,

    #[error("Ledger API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("Unexpected ledger response: {0}")]
    Decode(String),
}

impl From<reqwest::Error> for LedgerError {
    fn from(err: reqwest::Error) -> Self {
        LedgerError::Http(err.to_string())
    }
}

/// Sales invoice to create
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerInvoice {
    pub contact_id: String,
    pub reference: String,
    pub date: NaiveDate,
    pub due_date: NaiveDate,
    pub line_items: Vec<LedgerLineItem>,
}

/// Payment applied to an existing invoice
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerPayment {
    pub invoice_id: String,
    pub amount_cents: i64,
    pub date: NaiveDate,
    pub reference: String,
}

#[async_trait]
pub trait LedgerClient: Send + Sync {
    /// Returns the contact id for `email`, creating the contact when missing
    async fn find_or_create_contact(&self, name: &str, email: &str) -> Result<String, LedgerError>;

    /// Creates an authorised invoice and returns its id
    async fn create_invoice(&self, invoice: &LedgerInvoice, idempotency_key: &str) -> Result<String, LedgerError>;

    /// Applies a payment and returns its id
    async fn create_payment(&self, payment: &LedgerPayment, idempotency_key: &str) -> Result<String, LedgerError>;
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: u64,
}

struct CachedToken {
    access_token: String,
    refresh_after: Instant,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ContactsEnvelope {
    #[serde(default)]
    contacts: Vec<ContactRecord>,
}

#[derive(Debug, Deserialize)]
struct ContactRecord {
    #[serde(rename = "ContactID")]
    contact_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InvoicesEnvelope {
    #[serde(default)]
    invoices: Vec<InvoiceRecord>,
}

#[derive(Debug, Deserialize)]
struct InvoiceRecord {
    #[serde(rename = "InvoiceID")]
    invoice_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct PaymentsEnvelope {
    #[serde(default)]
    payments: Vec<PaymentRecord>,
}

#[derive(Debug, Deserialize)]
struct PaymentRecord {
    #[serde(rename = "PaymentID")]
    payment_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ErrorBody {
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    elements: Vec<ErrorElement>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ErrorElement {
    #[serde(default)]
    validation_errors: Vec<ValidationError>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ValidationError {
    message: String,
}

impl ErrorBody {
    fn describe(self, status: StatusCode) -> String {
        let details: Vec<String> = self
            .elements
            .into_iter()
            .flat_map(|e| e.validation_errors)
            .map(|v| v.message)
            .collect();

        if !details.is_empty() {
            details.join("; ")
        } else {
            self.message.unwrap_or_else(|| format!("HTTP {}", status.as_u16()))
        }
    }
}

/// Live Xero client
pub struct XeroClient {
    http: Client,
    config: XeroConfig,
    token: RwLock<Option<CachedToken>>,
}

impl XeroClient {
    pub fn new(config: XeroConfig) -> Result<Self, LedgerError> {
        let http = Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()?;

        Ok(Self {
            http,
            config,
            token: RwLock::new(None),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.config.api_base.trim_end_matches('/'), path)
    }

    async fn access_token(&self) -> Result<String, LedgerError> {
        {
            let cached = self.token.read().await;
            if let Some(token) = cached.as_ref() {
                if Instant::now() < token.refresh_after {
                    return Ok(token.access_token.clone());
                }
            }
        }

        let mut cached = self.token.write().await;
        // Another task may have refreshed while we waited for the lock
        if let Some(token) = cached.as_ref() {
            if Instant::now() < token.refresh_after {
                return Ok(token.access_token.clone());
            }
        }

        let response = self
            .http
            .post(&self.config.identity_url)
            .basic_auth(&self.config.client_id, Some(&self.config.client_secret))
            .form(&[
                ("grant_type", "client_credentials"),
                ("scope", "accounting.transactions accounting.contacts"),
            ])
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(LedgerError::Auth(format!("HTTP {}: {}", status.as_u16(), body)));
        }

        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| LedgerError::Decode(e.to_string()))?;

        let lifetime = token.expires_in.saturating_sub(TOKEN_REFRESH_MARGIN_SECS);
        tracing::debug!(expires_in = token.expires_in, "Obtained Xero access token");

        *cached = Some(CachedToken {
            access_token: token.access_token.clone(),
            refresh_after: Instant::now() + Duration::from_secs(lifetime),
        });

        Ok(token.access_token)
    }

    async fn send<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T, LedgerError> {
        let token = self.access_token().await?;
        let response = request
            .bearer_auth(token)
            .header("xero-tenant-id", &self.config.tenant_id)
            .header("Accept", "application/json")
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;

        if status.is_success() {
            return serde_json::from_str(&body).map_err(|e| LedgerError::Decode(e.to_string()));
        }

        let message = serde_json::from_str::<ErrorBody>(&body)
            .map(|e| e.describe(status))
            .unwrap_or_else(|_| format!("HTTP {}", status.as_u16()));

        Err(match status {
            StatusCode::BAD_REQUEST => LedgerError::Rejected(message),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                // Force a fresh token next time
                *self.token.write().await = None;
                LedgerError::Auth(message)
            }
            StatusCode::TOO_MANY_REQUESTS => LedgerError::RateLimited,
            _ => LedgerError::Api {
                status: status.as_u16(),
                message,
            },
        })
    }
}

fn line_item_json(item: &LedgerLineItem) -> serde_json::Value {
    json!({
        "Description": item.description,
        "Quantity": item.quantity,
        "UnitAmount": cents_to_decimal(item.unit_amount_cents),
        "AccountCode": item.account_code,
    })
}

#[async_trait]
impl LedgerClient for XeroClient {
    async fn find_or_create_contact(&self, name: &str, email: &str) -> Result<String, LedgerError> {
        let filter = format!("EmailAddress==\"{}\"", email.replace('"', ""));
        let existing: ContactsEnvelope = self
            .send(self.http.get(self.url("Contacts")).query(&[("where", filter.as_str())]))
            .await?;

        if let Some(contact) = existing.contacts.into_iter().next() {
            return Ok(contact.contact_id);
        }

        let created: ContactsEnvelope = self
            .send(self.http.post(self.url("Contacts")).json(&json!({
                "Contacts": [{ "Name": name, "EmailAddress": email }]
            })))
            .await?;

        created
            .contacts
            .into_iter()
            .next()
            .map(|c| c.contact_id)
            .ok_or_else(|| LedgerError::Decode("no contact returned".to_string()))
    }

    async fn create_invoice(&self, invoice: &LedgerInvoice, idempotency_key: &str) -> Result<String, LedgerError> {
        let body = json!({
            "Invoices": [{
                "Type": "ACCREC",
                "Contact": { "ContactID": invoice.contact_id },
                "Date": invoice.date.to_string(),
                "DueDate": invoice.due_date.to_string(),
                "Reference": invoice.reference,
                "Status": "AUTHORISED",
                "LineAmountTypes": "NoTax",
                "LineItems": invoice.line_items.iter().map(line_item_json).collect::<Vec<_>>(),
            }]
        });

        let created: InvoicesEnvelope = self
            .send(
                self.http
                    .put(self.url("Invoices"))
                    .header("Idempotency-Key", idempotency_key)
                    .json(&body),
            )
            .await?;

        created
            .invoices
            .into_iter()
            .next()
            .map(|i| i.invoice_id)
            .ok_or_else(|| LedgerError::Decode("no invoice returned".to_string()))
    }

    async fn create_payment(&self, payment: &LedgerPayment, idempotency_key: &str) -> Result<String, LedgerError> {
        let body = json!({
            "Payments": [{
                "Invoice": { "InvoiceID": payment.invoice_id },
                "Account": { "Code": self.config.clearing_account_code },
                "Amount": cents_to_decimal(payment.amount_cents),
                "Date": payment.date.to_string(),
                "Reference": payment.reference,
            }]
        });

        let created: PaymentsEnvelope = self
            .send(
                self.http
                    .put(self.url("Payments"))
                    .header("Idempotency-Key", idempotency_key)
                    .json(&body),
            )
            .await?;

        created
            .payments
            .into_iter()
            .next()
            .map(|p| p.payment_id)
            .ok_or_else(|| LedgerError::Decode("no payment returned".to_string()))
    }
}
