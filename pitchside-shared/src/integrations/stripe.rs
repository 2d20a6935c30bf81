/// Stripe payment gateway
///
/// [`PaymentGateway`] is the seam checkout talks to. [`StripeClient`] implements it
/// against the Stripe REST API: form-encoded bodies, bearer auth with the secret key,
/// and an `Idempotency-Key` header on every create call so a retried request never
/// charges twice.
///
/// Webhook payloads are authenticated with [`verify_webhook_signature`] before being
/// parsed with [`parse_event`].

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use reqwest::{Client, RequestBuilder};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use thiserror::Error;

use crate::config::StripeConfig;

type HmacSha256 = Hmac<Sha256>;

/// Default webhook timestamp tolerance
pub const WEBHOOK_TOLERANCE_SECS: i64 = 300;

const REQUEST_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Error)]
pub enum StripeError {
    #[error("Stripe request failed: {0}")]
    Http(String),

    #[error("Stripe API error ({status}): {message}")]
    Api {
        status: u16,
        code: Option<String>,
        decline_code: Option<String>,
        message: String,
    },

    #[error("Unexpected Stripe response: {0}")]
    Decode(String),

    #[error("Invalid webhook signature: {0}")]
    InvalidSignature(String),
}

impl StripeError {
    /// The card was declined or needs the customer present
    pub fn is_card_error(&self) -> bool {
        match self {
            StripeError::Api { status, decline_code, code, .. } => {
                *status == 402
                    || decline_code.is_some()
                    || matches!(code.as_deref(), Some("card_declined" | "authentication_required"))
            }
            _ => false,
        }
    }

    /// Short reason stored on failed payments
    pub fn failure_reason(&self) -> String {
        match self {
            StripeError::Api { decline_code: Some(decline), .. } => decline.clone(),
            StripeError::Api { code: Some(code), .. } => code.clone(),
            other => other.to_string(),
        }
    }
}

impl From<reqwest::Error> for StripeError {
    fn from(err: reqwest::Error) -> Self {
        StripeError::Http(err.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentIntentStatus {
    RequiresPaymentMethod,
    RequiresConfirmation,
    RequiresAction,
    Processing,
    RequiresCapture,
    Canceled,
    Succeeded,
    #[serde(other)]
    Unknown,
}

impl PaymentIntentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentIntentStatus::RequiresPaymentMethod => "requires_payment_method",
            PaymentIntentStatus::RequiresConfirmation => "requires_confirmation",
            PaymentIntentStatus::RequiresAction => "requires_action",
            PaymentIntentStatus::Processing => "processing",
            PaymentIntentStatus::RequiresCapture => "requires_capture",
            PaymentIntentStatus::Canceled => "canceled",
            PaymentIntentStatus::Succeeded => "succeeded",
            PaymentIntentStatus::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LastPaymentError {
    pub code: Option<String>,
    pub decline_code: Option<String>,
    pub message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentIntent {
    pub id: String,
    pub status: PaymentIntentStatus,
    pub amount: i64,
    pub currency: String,
    #[serde(default)]
    pub client_secret: Option<String>,
    #[serde(default)]
    pub customer: Option<String>,
    #[serde(default)]
    pub payment_method: Option<String>,
    #[serde(default)]
    pub latest_charge: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    #[serde(default)]
    pub last_payment_error: Option<LastPaymentError>,
}

impl PaymentIntent {
    /// Reference recorded in the ledger: the charge id, else the intent id
    pub fn payment_reference(&self) -> &str {
        self.latest_charge.as_deref().unwrap_or(&self.id)
    }

    pub fn failure_reason(&self) -> Option<String> {
        let error = self.last_payment_error.as_ref()?;
        error
            .decline_code
            .clone()
            .or_else(|| error.code.clone())
            .or_else(|| error.message.clone())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetupIntent {
    pub id: String,
    pub status: String,
    #[serde(default)]
    pub client_secret: Option<String>,
    #[serde(default)]
    pub customer: Option<String>,
    #[serde(default)]
    pub payment_method: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct CreateCustomer {
    pub email: String,
    pub name: String,
    pub metadata: Vec<(String, String)>,
}

#[derive(Debug, Clone)]
pub struct CreatePaymentIntent {
    pub amount_cents: i64,
    pub currency: String,
    pub customer: Option<String>,
    pub payment_method: Option<String>,
    pub description: Option<String>,
    pub metadata: Vec<(String, String)>,

    /// Charge a saved card without the customer present
    pub off_session: bool,
    pub confirm: bool,

    /// Save the card for later off-session charges
    pub save_card: bool,

    pub idempotency_key: String,
}

impl CreatePaymentIntent {
    pub fn new(amount_cents: i64, currency: impl Into<String>, idempotency_key: impl Into<String>) -> Self {
        Self {
            amount_cents,
            currency: currency.into(),
            customer: None,
            payment_method: None,
            description: None,
            metadata: Vec::new(),
            off_session: false,
            confirm: false,
            save_card: false,
            idempotency_key: idempotency_key.into(),
        }
    }

    fn form_params(&self) -> Vec<(String, String)> {
        let mut params = vec![
            ("amount".to_string(), self.amount_cents.to_string()),
            ("currency".to_string(), self.currency.to_lowercase()),
            ("automatic_payment_methods[enabled]".to_string(), "true".to_string()),
        ];

        if let Some(customer) = &self.customer {
            params.push(("customer".to_string(), customer.clone()));
        }
        if let Some(payment_method) = &self.payment_method {
            params.push(("payment_method".to_string(), payment_method.clone()));
        }
        if let Some(description) = &self.description {
            params.push(("description".to_string(), description.clone()));
        }
        if self.off_session {
            params.push(("off_session".to_string(), "true".to_string()));
            params.push(("automatic_payment_methods[allow_redirects]".to_string(), "never".to_string()));
        }
        if self.confirm {
            params.push(("confirm".to_string(), "true".to_string()));
        }
        if self.save_card {
            params.push(("setup_future_usage".to_string(), "off_session".to_string()));
        }
        push_metadata(&mut params, &self.metadata);

        params
    }
}

#[derive(Debug, Clone)]
pub struct CreateSetupIntent {
    pub customer: String,
    pub metadata: Vec<(String, String)>,
    pub idempotency_key: String,
}

fn push_metadata(params: &mut Vec<(String, String)>, metadata: &[(String, String)]) {
    for (key, value) in metadata {
        params.push((format!("metadata[{}]", key), value.clone()));
    }
}

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Creates a customer and returns its id
    async fn create_customer(&self, request: CreateCustomer) -> Result<String, StripeError>;

    async fn create_payment_intent(&self, request: CreatePaymentIntent) -> Result<PaymentIntent, StripeError>;

    async fn retrieve_payment_intent(&self, id: &str) -> Result<PaymentIntent, StripeError>;

    async fn cancel_payment_intent(&self, id: &str) -> Result<PaymentIntent, StripeError>;

    async fn create_setup_intent(&self, request: CreateSetupIntent) -> Result<SetupIntent, StripeError>;

    async fn retrieve_setup_intent(&self, id: &str) -> Result<SetupIntent, StripeError>;
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    decline_code: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CustomerResponse {
    id: String,
}

/// Live Stripe client
#[derive(Clone)]
pub struct StripeClient {
    http: Client,
    secret_key: String,
    api_base: String,
}

impl StripeClient {
    pub fn new(config: &StripeConfig) -> Result<Self, StripeError> {
        let http = Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()?;

        Ok(Self {
            http,
            secret_key: config.secret_key.clone(),
            api_base: config.api_base.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/v1/{}", self.api_base, path)
    }

    async fn send<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T, StripeError> {
        let response = request.bearer_auth(&self.secret_key).send().await?;
        let status = response.status();
        let body = response.text().await?;

        if !status.is_success() {
            let error = serde_json::from_str::<ErrorEnvelope>(&body).ok().map(|e| e.error);
            return Err(StripeError::Api {
                status: status.as_u16(),
                code: error.as_ref().and_then(|e| e.code.clone()),
                decline_code: error.as_ref().and_then(|e| e.decline_code.clone()),
                message: error
                    .and_then(|e| e.message)
                    .unwrap_or_else(|| format!("HTTP {}", status.as_u16())),
            });
        }

        serde_json::from_str(&body).map_err(|e| StripeError::Decode(e.to_string()))
    }
}

#[async_trait]
impl PaymentGateway for StripeClient {
    async fn create_customer(&self, request: CreateCustomer) -> Result<String, StripeError> {
        let mut params = vec![
            ("email".to_string(), request.email),
            ("name".to_string(), request.name),
        ];
        push_metadata(&mut params, &request.metadata);

        let customer: CustomerResponse = self
            .send(self.http.post(self.url("customers")).form(&params))
            .await?;

        Ok(customer.id)
    }

    async fn create_payment_intent(&self, request: CreatePaymentIntent) -> Result<PaymentIntent, StripeError> {
        let params = request.form_params();
        self.send(
            self.http
                .post(self.url("payment_intents"))
                .header("Idempotency-Key", &request.idempotency_key)
                .form(&params),
        )
        .await
    }

    async fn retrieve_payment_intent(&self, id: &str) -> Result<PaymentIntent, StripeError> {
        self.send(self.http.get(self.url(&format!("payment_intents/{}", id)))).await
    }

    async fn cancel_payment_intent(&self, id: &str) -> Result<PaymentIntent, StripeError> {
        self.send(self.http.post(self.url(&format!("payment_intents/{}/cancel", id)))).await
    }

    async fn create_setup_intent(&self, request: CreateSetupIntent) -> Result<SetupIntent, StripeError> {
        let mut params = vec![
            ("customer".to_string(), request.customer),
            ("usage".to_string(), "off_session".to_string()),
            ("automatic_payment_methods[enabled]".to_string(), "true".to_string()),
        ];
        push_metadata(&mut params, &request.metadata);

        self.send(
            self.http
                .post(self.url("setup_intents"))
                .header("Idempotency-Key", &request.idempotency_key)
                .form(&params),
        )
        .await
    }

    async fn retrieve_setup_intent(&self, id: &str) -> Result<SetupIntent, StripeError> {
        self.send(self.http.get(self.url(&format!("setup_intents/{}", id)))).await
    }
}

/// HMAC-SHA256 over `"{timestamp}.{payload}"`, hex encoded
pub fn compute_signature(payload: &[u8], secret: &str, timestamp: i64) -> Result<String, StripeError> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(secret.as_bytes())
        .map_err(|e| StripeError::InvalidSignature(e.to_string()))?;
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(payload);

    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Verifies a `Stripe-Signature` header
///
/// The header looks like `t=1700000000,v1=abc…,v1=def…`. Every `v1` is compared in
/// constant time; one match is enough. Timestamps further than `tolerance_secs` from
/// `now` are rejected.
pub fn verify_webhook_signature(
    payload: &[u8],
    header: &str,
    secret: &str,
    tolerance_secs: i64,
    now: i64,
) -> Result<(), StripeError> {
    let mut timestamp: Option<i64> = None;
    let mut signatures = Vec::new();

    for part in header.split(',') {
        let Some((key, value)) = part.trim().split_once('=') else {
            continue;
        };
        match key {
            "t" => {
                timestamp = Some(
                    value
                        .parse()
                        .map_err(|_| StripeError::InvalidSignature("malformed timestamp".to_string()))?,
                );
            }
            "v1" => {
                if let Ok(bytes) = hex::decode(value) {
                    signatures.push(bytes);
                }
            }
            _ => {}
        }
    }

    let timestamp = timestamp.ok_or_else(|| StripeError::InvalidSignature("missing timestamp".to_string()))?;
    if signatures.is_empty() {
        return Err(StripeError::InvalidSignature("no v1 signature".to_string()));
    }
    if (now - timestamp).abs() > tolerance_secs {
        return Err(StripeError::InvalidSignature("timestamp outside tolerance".to_string()));
    }

    let mut mac = <HmacSha256 as Mac>::new_from_slice(secret.as_bytes())
        .map_err(|e| StripeError::InvalidSignature(e.to_string()))?;
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(payload);

    if signatures.iter().any(|sig| mac.clone().verify_slice(sig).is_ok()) {
        Ok(())
    } else {
        Err(StripeError::InvalidSignature("signature mismatch".to_string()))
    }
}

#[derive(Debug, Clone, Deserialize)]
struct EventEnvelope {
    id: String,
    #[serde(rename = "type")]
    event_type: String,
    data: EventData,
}

#[derive(Debug, Clone, Deserialize)]
struct EventData {
    object: serde_json::Value,
}

/// A webhook event with its raw `data.object`
#[derive(Debug, Clone)]
pub struct StripeEvent {
    pub id: String,
    pub event_type: String,
    pub object: serde_json::Value,
}

impl StripeEvent {
    /// Deserializes `data.object` as a payment or setup intent
    pub fn object_as<T: DeserializeOwned>(&self) -> Result<T, StripeError> {
        serde_json::from_value(self.object.clone()).map_err(|e| StripeError::Decode(e.to_string()))
    }
}

pub fn parse_event(payload: &[u8]) -> Result<StripeEvent, StripeError> {
    let envelope: EventEnvelope =
        serde_json::from_slice(payload).map_err(|e| StripeError::Decode(e.to_string()))?;

    Ok(StripeEvent {
        id: envelope.id,
        event_type: envelope.event_type,
        object: envelope.data.object,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;
    use serde_json::json;

    const SECRET: &str = "whsec_test_secret";

    fn signed_header(payload: &[u8], timestamp: i64) -> String {
        format!("t={},v1={}", timestamp, compute_signature(payload, SECRET, timestamp).unwrap())
    }

    fn client_for(server: &MockServer) -> StripeClient {
        StripeClient::new(&StripeConfig {
            secret_key: "sk_test_123".to_string(),
            webhook_secret: SECRET.to_string(),
            api_base: server.base_url(),
            currency: "usd".to_string(),
        })
        .unwrap()
    }

    #[test]
    fn test_valid_signature_is_accepted() {
        let payload = br#"{"id":"evt_1"}"#;
        let header = signed_header(payload, 1_700_000_000);

        assert!(verify_webhook_signature(payload, &header, SECRET, 300, 1_700_000_100).is_ok());
    }

    #[test]
    fn test_any_matching_v1_is_accepted() {
        let payload = br#"{"id":"evt_1"}"#;
        let good = compute_signature(payload, SECRET, 1_700_000_000).unwrap();
        let header = format!("t=1700000000,v1={},v1={}", "00".repeat(32), good);

        assert!(verify_webhook_signature(payload, &header, SECRET, 300, 1_700_000_000).is_ok());
    }

    #[test]
    fn test_tampered_payload_is_rejected() {
        let header = signed_header(br#"{"id":"evt_1"}"#, 1_700_000_000);

        let result = verify_webhook_signature(br#"{"id":"evt_2"}"#, &header, SECRET, 300, 1_700_000_000);
        assert!(matches!(result, Err(StripeError::InvalidSignature(_))));
    }

    #[test]
    fn test_wrong_secret_is_rejected() {
        let payload = br#"{"id":"evt_1"}"#;
        let header = signed_header(payload, 1_700_000_000);

        assert!(verify_webhook_signature(payload, &header, "whsec_other", 300, 1_700_000_000).is_err());
    }

    #[test]
    fn test_stale_timestamp_is_rejected() {
        let payload = br#"{"id":"evt_1"}"#;
        let header = signed_header(payload, 1_700_000_000);

        assert!(verify_webhook_signature(payload, &header, SECRET, 300, 1_700_000_301).is_err());
        assert!(verify_webhook_signature(payload, &header, SECRET, 300, 1_699_999_600).is_err());
    }

    #[test]
    fn test_malformed_headers_are_rejected() {
        let payload = b"{}";
        assert!(verify_webhook_signature(payload, "", SECRET, 300, 0).is_err());
        assert!(verify_webhook_signature(payload, "v1=abcd", SECRET, 300, 0).is_err());
        assert!(verify_webhook_signature(payload, "t=0", SECRET, 300, 0).is_err());
        assert!(verify_webhook_signature(payload, "t=soon,v1=abcd", SECRET, 300, 0).is_err());
    }

    #[test]
    fn test_parse_event() {
        let payload = json!({
            "id": "evt_123",
            "type": "payment_intent.succeeded",
            "data": {
                "object": {
                    "id": "pi_123",
                    "status": "succeeded",
                    "amount": 9500,
                    "currency": "usd",
                    "latest_charge": "ch_123",
                    "metadata": { "payment_id": "abc" }
                }
            }
        })
        .to_string();

        let event = parse_event(payload.as_bytes()).unwrap();
        assert_eq!(event.id, "evt_123");
        assert_eq!(event.event_type, "payment_intent.succeeded");

        let intent: PaymentIntent = event.object_as().unwrap();
        assert_eq!(intent.status, PaymentIntentStatus::Succeeded);
        assert_eq!(intent.payment_reference(), "ch_123");
        assert_eq!(intent.metadata.get("payment_id").map(String::as_str), Some("abc"));
    }

    #[test]
    fn test_unknown_intent_status_deserializes() {
        let intent: PaymentIntent = serde_json::from_value(json!({
            "id": "pi_1",
            "status": "something_new",
            "amount": 100,
            "currency": "usd"
        }))
        .unwrap();
        assert_eq!(intent.status, PaymentIntentStatus::Unknown);
        assert_eq!(intent.payment_reference(), "pi_1");
    }

    #[test]
    fn test_off_session_form_params() {
        let mut request = CreatePaymentIntent::new(2_500, "USD", "payment-1");
        request.customer = Some("cus_1".to_string());
        request.payment_method = Some("pm_1".to_string());
        request.off_session = true;
        request.confirm = true;
        request.metadata.push(("payment_id".to_string(), "p1".to_string()));

        let params = request.form_params();
        let get = |key: &str| params.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str());

        assert_eq!(get("amount"), Some("2500"));
        assert_eq!(get("currency"), Some("usd"));
        assert_eq!(get("off_session"), Some("true"));
        assert_eq!(get("confirm"), Some("true"));
        assert_eq!(get("automatic_payment_methods[allow_redirects]"), Some("never"));
        assert_eq!(get("metadata[payment_id]"), Some("p1"));
        assert_eq!(get("setup_future_usage"), None);
    }

    #[test]
    fn test_card_error_classification() {
        let declined = StripeError::Api {
            status: 402,
            code: Some("card_declined".to_string()),
            decline_code: Some("insufficient_funds".to_string()),
            message: "Your card has insufficient funds.".to_string(),
        };
        assert!(declined.is_card_error());
        assert_eq!(declined.failure_reason(), "insufficient_funds");

        let outage = StripeError::Http("connection reset".to_string());
        assert!(!outage.is_card_error());
    }

    #[tokio::test]
    async fn test_create_payment_intent_sends_idempotency_key() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/v1/payment_intents")
                    .header("authorization", "Bearer sk_test_123")
                    .header("Idempotency-Key", "payment-42")
                    .x_www_form_urlencoded_tuple("amount", "9500")
                    .x_www_form_urlencoded_tuple("metadata[payment_id]", "42");
                then.status(200).json_body(json!({
                    "id": "pi_42",
                    "status": "requires_payment_method",
                    "amount": 9500,
                    "currency": "usd",
                    "client_secret": "pi_42_secret"
                }));
            })
            .await;

        let mut request = CreatePaymentIntent::new(9_500, "usd", "payment-42");
        request.metadata.push(("payment_id".to_string(), "42".to_string()));

        let intent = client_for(&server).create_payment_intent(request).await.unwrap();

        mock.assert_async().await;
        assert_eq!(intent.id, "pi_42");
        assert_eq!(intent.client_secret.as_deref(), Some("pi_42_secret"));
        assert_eq!(intent.status, PaymentIntentStatus::RequiresPaymentMethod);
    }

    #[tokio::test]
    async fn test_decline_maps_to_api_error() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/v1/payment_intents");
                then.status(402).json_body(json!({
                    "error": {
                        "type": "card_error",
                        "code": "card_declined",
                        "decline_code": "generic_decline",
                        "message": "Your card was declined."
                    }
                }));
            })
            .await;

        let err = client_for(&server)
            .create_payment_intent(CreatePaymentIntent::new(100, "usd", "payment-1"))
            .await
            .unwrap_err();

        match err {
            StripeError::Api { status, code, decline_code, message } => {
                assert_eq!(status, 402);
                assert_eq!(code.as_deref(), Some("card_declined"));
                assert_eq!(decline_code.as_deref(), Some("generic_decline"));
                assert_eq!(message, "Your card was declined.");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_create_customer_returns_id() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/v1/customers")
                    .x_www_form_urlencoded_tuple("email", "sam@example.com");
                then.status(200).json_body(json!({ "id": "cus_9" }));
            })
            .await;

        let id = client_for(&server)
            .create_customer(CreateCustomer {
                email: "sam@example.com".to_string(),
                name: "Sam Keeper".to_string(),
                metadata: vec![],
            })
            .await
            .unwrap();

        assert_eq!(id, "cus_9");
    }

    #[tokio::test]
    async fn test_retrieve_setup_intent() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/v1/setup_intents/seti_1");
                then.status(200).json_body(json!({
                    "id": "seti_1",
                    "status": "succeeded",
                    "payment_method": "pm_7"
                }));
            })
            .await;

        let intent = client_for(&server).retrieve_setup_intent("seti_1").await.unwrap();
        assert_eq!(intent.payment_method.as_deref(), Some("pm_7"));
    }

    #[tokio::test]
    async fn test_non_json_error_body() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/v1/payment_intents/pi_1");
                then.status(503).body("upstream unavailable");
            })
            .await;

        let err = client_for(&server).retrieve_payment_intent("pi_1").await.unwrap_err();
        assert!(matches!(err, StripeError::Api { status: 503, .. }));
    }
}
