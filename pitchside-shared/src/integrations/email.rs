/// Transactional email provider
///
/// [`HttpEmailClient`] posts JSON to the provider's `/emails` endpoint with bearer
/// auth and returns the provider's message id.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;

use crate::config::EmailConfig;

const REQUEST_TIMEOUT_SECS: u64 = 15;

#[derive(Debug, Error)]
pub enum EmailError {
    #[error("Email request failed: {0}")]
    Http(String),

    #[error("Email provider error ({status}): {message}")]
    Provider { status: u16, message: String },

    #[error("Unexpected email provider response: {0}")]
    Decode(String),
}

impl From<reqwest::Error> for EmailError {
    fn from(err: reqwest::Error) -> Self {
        EmailError::Http(err.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmailMessage {
    pub to: String,
    pub subject: String,
    pub html: String,
}

#[async_trait]
pub trait EmailSender: Send + Sync {
    /// Sends the message and returns the provider's message id
    async fn send(&self, message: &EmailMessage) -> Result<String, EmailError>;
}

#[derive(Debug, Deserialize)]
struct SendResponse {
    id: String,
}

pub struct HttpEmailClient {
    http: Client,
    api_key: String,
    from_address: String,
    api_base: String,
}

impl HttpEmailClient {
    pub fn new(config: &EmailConfig) -> Result<Self, EmailError> {
        let http = Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()?;

        Ok(Self {
            http,
            api_key: config.api_key.clone(),
            from_address: config.from_address.clone(),
            api_base: config.api_base.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl EmailSender for HttpEmailClient {
    async fn send(&self, message: &EmailMessage) -> Result<String, EmailError> {
        let response = self
            .http
            .post(format!("{}/emails", self.api_base))
            .bearer_auth(&self.api_key)
            .json(&json!({
                "from": self.from_address,
                "to": [message.to],
                "subject": message.subject,
                "html": message.html,
            }))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(EmailError::Provider {
                status: status.as_u16(),
                message,
            });
        }

        let sent: SendResponse = response
            .json()
            .await
            .map_err(|e| EmailError::Decode(e.to_string()))?;

        Ok(sent.id)
    }
}
