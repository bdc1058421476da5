use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;

use courier_common::error::TransportError;
use courier_common::types::{Ack, Channel, DeliveryTask};

use super::{Transport, classify_reqwest, read_success, required};

#[derive(Deserialize)]
struct GatewayResponse {
    #[serde(alias = "message_id", alias = "sid")]
    id: Option<String>,
}

/// Text messages through a generic HTTP SMS gateway.
#[derive(Clone)]
pub struct SmsTransport {
    http: reqwest::Client,
    url: String,
    api_key: Option<String>,
}

impl SmsTransport {
    pub fn new(http: reqwest::Client, url: &str, api_key: Option<String>) -> Self {
        Self {
            http,
            url: url.to_string(),
            api_key,
        }
    }
}

#[async_trait]
impl Transport for SmsTransport {
    fn channel(&self) -> Channel {
        Channel::Sms
    }

    async fn send(&self, task: &DeliveryTask) -> Result<Ack, TransportError> {
        let to = required(task.payload.recipient.phone.as_deref(), "recipient phone")?;
        let text = if task.payload.title.is_empty() {
            task.payload.body.clone()
        } else {
            format!("{}: {}", task.payload.title, task.payload.body)
        };

        let mut request = self.http.post(&self.url).json(&json!({
            "to": to,
            "text": text,
            "reference": task.key().to_string(),
        }));
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await.map_err(classify_reqwest)?;
        let body = read_success(response).await?;
        let id = serde_json::from_str::<GatewayResponse>(&body)
            .ok()
            .and_then(|r| r.id)
            .unwrap_or_else(|| task.id.to_string());

        Ok(Ack {
            provider_message_id: id,
            delivered_at: Utc::now(),
        })
    }
}

#[cfg(test)]
mod tests {
    use wiremock::matchers::{bearer_token, body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use courier_common::types::Recipient;

    use super::*;
    use crate::transport::sample_task;

    fn phone() -> Recipient {
        Recipient {
            phone: Some("+15550001111".to_string()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_gateway_sid_becomes_provider_id() {
        let server = MockServer::start().await;
        let task = sample_task(Channel::Sms, phone());

        Mock::given(method("POST"))
            .and(path("/sms"))
            .and(bearer_token("sms-key"))
            .and(body_partial_json(json!({
                "to": "+15550001111",
                "text": "Deploy finished: Build 118 is live",
                "reference": task.key().to_string(),
            })))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({ "sid": "SM81f0" })))
            .expect(1)
            .mount(&server)
            .await;

        let url = format!("{}/sms", server.uri());
        let transport = SmsTransport::new(reqwest::Client::new(), &url, Some("sms-key".to_string()));
        let ack = transport.send(&task).await.unwrap();
        assert_eq!(ack.provider_message_id, "SM81f0");
    }

    #[tokio::test]
    async fn test_missing_id_falls_back_to_task_id() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_string("queued"))
            .mount(&server)
            .await;

        let task = sample_task(Channel::Sms, phone());
        let transport = SmsTransport::new(reqwest::Client::new(), &server.uri(), None);
        let ack = transport.send(&task).await.unwrap();
        assert_eq!(ack.provider_message_id, task.id.to_string());
    }

    #[tokio::test]
    async fn test_throttled_is_transient() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429))
            .mount(&server)
            .await;

        let task = sample_task(Channel::Sms, phone());
        let transport = SmsTransport::new(reqwest::Client::new(), &server.uri(), None);
        assert!(!transport.send(&task).await.unwrap_err().is_permanent());
    }
}
