use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;

use courier_common::error::TransportError;
use courier_common::types::{Ack, Channel, DeliveryTask};

use super::{Transport, classify_reqwest, read_success, required};

const RESEND_API_URL: &str = "https://api.resend.com/emails";

#[derive(Deserialize)]
struct ResendResponse {
    id: String,
}

/// Email via the Resend HTTP API.
#[derive(Clone)]
pub struct EmailTransport {
    http: reqwest::Client,
    api_key: String,
    from: String,
    endpoint: String,
}

impl EmailTransport {
    pub fn new(http: reqwest::Client, api_key: &str, from: &str) -> Self {
        Self {
            http,
            api_key: api_key.to_string(),
            from: from.to_string(),
            endpoint: RESEND_API_URL.to_string(),
        }
    }

    /// Point at a different API host (local stub servers).
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }
}

#[async_trait]
impl Transport for EmailTransport {
    fn channel(&self) -> Channel {
        Channel::Email
    }

    async fn send(&self, task: &DeliveryTask) -> Result<Ack, TransportError> {
        let to = required(task.payload.recipient.email.as_deref(), "recipient email")?;
        if !to.contains('@') {
            return Err(TransportError::Permanent(format!("invalid address '{}'", to)));
        }

        let body = json!({
            "from": self.from,
            "to": [to],
            "subject": task.payload.title,
            "text": task.payload.body,
        });

        let response = self
            .http
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            // Resend drops repeated sends carrying the same key
            .header("Idempotency-Key", task.key().to_string())
            .json(&body)
            .send()
            .await
            .map_err(classify_reqwest)?;

        let text = read_success(response).await?;
        let parsed: ResendResponse = serde_json::from_str(&text)
            .map_err(|e| TransportError::Transient(format!("unexpected Resend response: {}", e)))?;

        Ok(Ack {
            provider_message_id: parsed.id,
            delivered_at: Utc::now(),
        })
    }
}
