/// Critical alerts
///
/// Raised when money and records disagree: a charge succeeded but recording it failed,
/// a ledger entry exhausted its retries, or a payment plan was abandoned.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    /// Charge succeeded but the database transaction did not
    PaymentRecordFailed,
    /// Ledger entry gave up after its last retry
    LedgerSyncFailed,
    /// Third consecutive installment failure
    PaymentPlanFailed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CriticalAlert {
    pub kind: AlertKind,
    pub message: String,
    pub context: serde_json::Value,
}

impl CriticalAlert {
    pub fn new(kind: AlertKind, message: impl Into<String>, context: serde_json::Value) -> Self {
        Self {
            kind,
            message: message.into(),
            context,
        }
    }
}

#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn critical(&self, alert: &CriticalAlert);
}

/// Writes alerts to the log at ERROR
#[derive(Debug, Clone, Default)]
pub struct LogAlertSink;

#[async_trait]
impl AlertSink for LogAlertSink {
    async fn critical(&self, alert: &CriticalAlert) {
        tracing::error!(
            critical = true,
            kind = ?alert.kind,
            context = %alert.context,
            "{}",
            alert.message
        );
    }
}

/// Posts alerts as JSON to a webhook (Slack-compatible `text` field included)
pub struct WebhookAlertSink {
    http: Client,
    url: String,
    fallback: LogAlertSink,
}

impl WebhookAlertSink {
    pub fn new(url: impl Into<String>) -> Result<Self, reqwest::Error> {
        let http = Client::builder().timeout(Duration::from_secs(10)).build()?;

        Ok(Self {
            http,
            url: url.into(),
            fallback: LogAlertSink,
        })
    }
}

#[async_trait]
impl AlertSink for WebhookAlertSink {
    async fn critical(&self, alert: &CriticalAlert) {
        let body = serde_json::json!({
            "text": format!("[pitchside] {}", alert.message),
            "kind": alert.kind,
            "message": alert.message,
            "context": alert.context,
        });

        let result = self
            .http
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .and_then(|response| response.error_for_status());

        if let Err(e) = result {
            tracing::warn!(error = %e, "Alert webhook failed, logging instead");
            self.fallback.critical(alert).await;
        }
    }
}
