//! WhatsApp through a WAHA (WhatsApp HTTP API) server.
//!
//! `POST {base}/api/sendText` with `{session, chatId, text}`. WAHA answers
//! with the sent message, whose `id` is either a plain string or an object
//! carrying `_serialized`, depending on the engine behind the session.

use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;

use courier_common::error::TransportError;
use courier_common::types::{Ack, Channel, DeliveryTask};

use super::{Transport, classify_reqwest, read_success, required};

#[derive(Deserialize)]
#[serde(untagged)]
enum WahaMessageId {
    Plain(String),
    Serialized {
        #[serde(rename = "_serialized")]
        serialized: String,
    },
}

#[derive(Deserialize)]
struct WahaSendResponse {
    id: Option<WahaMessageId>,
}

#[derive(Clone)]
pub struct WhatsappTransport {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    default_session: String,
}

impl WhatsappTransport {
    pub fn new(
        http: reqwest::Client,
        base_url: &str,
        api_key: Option<String>,
        default_session: &str,
    ) -> Self {
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            default_session: default_session.to_string(),
        }
    }

    /// `+1 (555) 000-1111` -> `15550001111@c.us`
    pub fn chat_id(phone: &str) -> Option<String> {
        let digits: String = phone.chars().filter(|c| c.is_ascii_digit()).collect();
        (!digits.is_empty()).then(|| format!("{}@c.us", digits))
    }
}

#[async_trait]
impl Transport for WhatsappTransport {
    fn channel(&self) -> Channel {
        Channel::Whatsapp
    }

    async fn send(&self, task: &DeliveryTask) -> Result<Ack, TransportError> {
        let phone = required(task.payload.recipient.phone.as_deref(), "recipient phone")?;
        let chat_id = Self::chat_id(phone)
            .ok_or_else(|| TransportError::Permanent(format!("invalid phone '{}'", phone)))?;
        let session = task
            .payload
            .recipient
            .whatsapp_session
            .as_deref()
            .unwrap_or(&self.default_session);

        let mut request = self
            .http
            .post(format!("{}/api/sendText", self.base_url))
            .json(&json!({
                "session": session,
                "chatId": chat_id,
                "text": task.payload.body,
            }));
        if let Some(key) = &self.api_key {
            request = request.header("X-Api-Key", key);
        }

        let response = request.send().await.map_err(classify_reqwest)?;
        let body = read_success(response).await?;
        let parsed: WahaSendResponse = serde_json::from_str(&body)
            .map_err(|e| TransportError::Transient(format!("unexpected WAHA response: {}", e)))?;

        let provider_message_id = match parsed.id {
            Some(WahaMessageId::Plain(id)) => id,
            Some(WahaMessageId::Serialized { serialized }) => serialized,
            None => {
                tracing::warn!(task_id = %task.id, "WAHA response carried no message id");
                task.id.to_string()
            }
        };

        Ok(Ack {
            provider_message_id,
            delivered_at: Utc::now(),
        })
    }
}
