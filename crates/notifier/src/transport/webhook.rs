use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;

use courier_common::error::TransportError;
use courier_common::types::{Ack, Channel, DeliveryTask};

use super::{Transport, classify_reqwest, read_success, required};

/// POSTs the notification as JSON to the recipient's URL.
#[derive(Clone)]
pub struct WebhookTransport {
    http: reqwest::Client,
}

impl WebhookTransport {
    pub fn new(http: reqwest::Client) -> Self {
        Self { http }
    }
}

#[async_trait]
impl Transport for WebhookTransport {
    fn channel(&self) -> Channel {
        Channel::Webhook
    }

    async fn send(&self, task: &DeliveryTask) -> Result<Ack, TransportError> {
        let url = required(task.payload.recipient.webhook_url.as_deref(), "webhook url")?;
        let url = reqwest::Url::parse(url)
            .map_err(|e| TransportError::Permanent(format!("invalid webhook url: {}", e)))?;

        let body = json!({
            "id": task.id,
            "tenant_id": task.tenant_id,
            "message_id": task.message_id,
            "notification_type": task.notification_type,
            "title": task.payload.title,
            "body": task.payload.body,
            "data": task.payload.data,
            "attempt": task.attempts,
        });

        let response = self
            .http
            .post(url)
            .header("X-Courier-Delivery", task.key().to_string())
            .json(&body)
            .send()
            .await
            .map_err(classify_reqwest)?;
        read_success(response).await?;

        Ok(Ack {
            provider_message_id: task.id.to_string(),
            delivered_at: Utc::now(),
        })
    }
}
