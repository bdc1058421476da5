use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;

use courier_common::error::TransportError;
use courier_common::types::{Ack, Channel, DeliveryTask};

use super::{Transport, classify_reqwest, read_success};

#[derive(Deserialize)]
struct GatewayResponse {
    id: Option<String>,
}

/// Mobile push through an HTTP push gateway. One request covers every device.
#[derive(Clone)]
pub struct PushTransport {
    http: reqwest::Client,
    url: String,
    api_key: Option<String>,
}

impl PushTransport {
    pub fn new(http: reqwest::Client, url: &str, api_key: Option<String>) -> Self {
        Self {
            http,
            url: url.to_string(),
            api_key,
        }
    }
}

#[async_trait]
impl Transport for PushTransport {
    fn channel(&self) -> Channel {
        Channel::Push
    }

    async fn send(&self, task: &DeliveryTask) -> Result<Ack, TransportError> {
        let tokens: Vec<&str> = task
            .payload
            .recipient
            .device_tokens
            .iter()
            .map(|t| t.trim())
            .filter(|t| !t.is_empty())
            .collect();
        if tokens.is_empty() {
            return Err(TransportError::Permanent("no device tokens".to_string()));
        }

        let mut request = self.http.post(&self.url).json(&json!({
            "tokens": tokens,
            "title": task.payload.title,
            "body": task.payload.body,
            "data": task.payload.data,
            "collapse_key": task.key().to_string(),
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
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use courier_common::types::Recipient;

    use super::*;
    use crate::transport::sample_task;

    #[tokio::test]
    async fn test_one_request_for_all_devices() {
        let server = MockServer::start().await;
        let task = sample_task(
            Channel::Push,
            Recipient {
                device_tokens: vec!["tok-a".to_string(), "  ".to_string(), " tok-b ".to_string()],
                ..Default::default()
            },
        );

        Mock::given(method("POST"))
            .and(path("/push"))
            .and(body_partial_json(json!({
                "tokens": ["tok-a", "tok-b"],
                "title": "Deploy finished",
                "collapse_key": task.key().to_string(),
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "id": "push-77" })))
            .expect(1)
            .mount(&server)
            .await;

        let url = format!("{}/push", server.uri());
        let ack = PushTransport::new(reqwest::Client::new(), &url, None)
            .send(&task)
            .await
            .unwrap();
        assert_eq!(ack.provider_message_id, "push-77");
    }

    #[tokio::test]
    async fn test_no_tokens_is_permanent() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let task = sample_task(Channel::Push, Recipient::default());
        let err = PushTransport::new(reqwest::Client::new(), &server.uri(), None)
            .send(&task)
            .await
            .unwrap_err();
        assert!(err.is_permanent());
    }
}
