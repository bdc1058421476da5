//! Channel transports: the side-effecting calls to external providers.
//!
//! Every transport returns either an [`Ack`] with the provider's message id,
//! or a [`TransportError`] saying whether a retry could help.

pub mod email;
pub mod in_app;
pub mod mock;
pub mod push;
pub mod sms;
pub mod webhook;
pub mod whatsapp;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use reqwest::StatusCode;

use courier_common::config::AppConfig;
use courier_common::error::TransportError;
use courier_common::types::{Ack, Channel, DeliveryTask};

pub use email::EmailTransport;
pub use in_app::InAppTransport;
pub use mock::MockTransport;
pub use push::PushTransport;
pub use sms::SmsTransport;
pub use webhook::WebhookTransport;
pub use whatsapp::WhatsappTransport;

#[async_trait]
pub trait Transport: Send + Sync {
    fn channel(&self) -> Channel;

    async fn send(&self, task: &DeliveryTask) -> Result<Ack, TransportError>;
}

/// Transports by channel. A channel without a transport is not delivered.
#[derive(Clone, Default)]
pub struct TransportRegistry {
    transports: HashMap<Channel, Arc<dyn Transport>>,
}

impl TransportRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, transport: Arc<dyn Transport>) {
        self.transports.insert(transport.channel(), transport);
    }

    pub fn with(mut self, transport: Arc<dyn Transport>) -> Self {
        self.register(transport);
        self
    }

    pub fn get(&self, channel: Channel) -> Option<Arc<dyn Transport>> {
        self.transports.get(&channel).cloned()
    }

    pub fn supports(&self, channel: Channel) -> bool {
        self.transports.contains_key(&channel)
    }

    /// Registered channels in canonical order.
    pub fn channels(&self) -> Vec<Channel> {
        Channel::ALL
            .into_iter()
            .filter(|c| self.transports.contains_key(c))
            .collect()
    }

    /// Build every transport the configuration has credentials for. In-app
    /// always registers since it only needs Redis.
    pub fn from_config(config: &AppConfig, redis: ConnectionManager) -> anyhow::Result<Self> {
        let timeout = config.transport_timeout();
        let http = http_client(timeout)?;
        let mut registry = Self::new().with(Arc::new(InAppTransport::new(redis)));

        match (&config.resend_api_key, &config.email_from) {
            (Some(key), Some(from)) => {
                registry.register(Arc::new(EmailTransport::new(http.clone(), key, from)));
            }
            _ => tracing::warn!("RESEND_API_KEY or EMAIL_FROM not set, email channel disabled"),
        }

        registry.register(Arc::new(WebhookTransport::new(http.clone())));

        match &config.sms_gateway_url {
            Some(url) => registry.register(Arc::new(SmsTransport::new(
                http.clone(),
                url,
                config.sms_api_key.clone(),
            ))),
            None => tracing::warn!("SMS_GATEWAY_URL not set, sms channel disabled"),
        }

        match &config.push_gateway_url {
            Some(url) => registry.register(Arc::new(PushTransport::new(
                http.clone(),
                url,
                config.push_api_key.clone(),
            ))),
            None => tracing::warn!("PUSH_GATEWAY_URL not set, push channel disabled"),
        }

        match &config.waha_base_url {
            Some(url) => registry.register(Arc::new(WhatsappTransport::new(
                http,
                url,
                config.waha_api_key.clone(),
                &config.waha_default_session,
            ))),
            None => tracing::warn!("WAHA_BASE_URL not set, whatsapp channel disabled"),
        }

        tracing::info!(channels = ?registry.channels(), "Transports registered");
        Ok(registry)
    }
}

/// Shared HTTP client for provider calls.
pub fn http_client(timeout: Duration) -> anyhow::Result<reqwest::Client> {
    Ok(reqwest::Client::builder()
        .timeout(timeout)
        .user_agent(concat!("courier/", env!("CARGO_PKG_VERSION")))
        .build()?)
}

/// 408, 429 and 5xx are worth retrying; any other 4xx is not.
pub fn classify_status(status: StatusCode, body: &str) -> TransportError {
    let message = format!("status={} body={}", status.as_u16(), truncate(body, 512));
    if status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
        || status.is_server_error()
    {
        TransportError::Transient(message)
    } else if status.is_client_error() {
        TransportError::Permanent(message)
    } else {
        TransportError::Transient(message)
    }
}

/// Network-level failures are transient; request-building errors are not.
pub fn classify_reqwest(err: reqwest::Error) -> TransportError {
    if err.is_builder() {
        TransportError::Permanent(err.to_string())
    } else if let Some(status) = err.status() {
        classify_status(status, &err.to_string())
    } else {
        TransportError::Transient(err.to_string())
    }
}

/// Read the response; non-2xx statuses become classified errors.
pub(crate) async fn read_success(response: reqwest::Response) -> Result<String, TransportError> {
    let status = response.status();
    let body = response.text().await.map_err(classify_reqwest)?;
    if status.is_success() {
        Ok(body)
    } else {
        Err(classify_status(status, &body))
    }
}

/// Recipient field the channel cannot work without.
pub(crate) fn required<'a>(value: Option<&'a str>, what: &str) -> Result<&'a str, TransportError> {
    match value.map(str::trim) {
        Some(v) if !v.is_empty() => Ok(v),
        _ => Err(TransportError::Permanent(format!("missing {}", what))),
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

/// Pending task addressed to `recipient`, for transport tests.
#[cfg(test)]
pub(crate) fn sample_task(
    channel: Channel,
    recipient: courier_common::types::Recipient,
) -> DeliveryTask {
    use courier_common::types::{
        BackoffStrategy, ChannelDispatch, ChannelPolicy, NotificationEvent, NotificationPayload,
        NotificationType, Priority,
    };

    let event = NotificationEvent {
        tenant_id: uuid::Uuid::from_u128(7),
        message_id: "msg-42".to_string(),
        notification_type: NotificationType::OrganizationActivity,
        payload: NotificationPayload {
            recipient,
            title: "Deploy finished".to_string(),
            body: "Build 118 is live".to_string(),
            ..Default::default()
        },
    };
    let policy = ChannelPolicy::default_for(
        event.tenant_id,
        event.notification_type,
        3,
        BackoffStrategy::default(),
    );
    let dispatch = ChannelDispatch {
        channel,
        priority: Priority::Normal,
        queue_name: Priority::Normal.queue_name().to_string(),
        delay_ms: 0,
    };
    DeliveryTask::new(&event, &dispatch, &policy, chrono::Utc::now())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert!(matches!(
            classify_status(StatusCode::REQUEST_TIMEOUT, ""),
            TransportError::Transient(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::TOO_MANY_REQUESTS, ""),
            TransportError::Transient(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::BAD_GATEWAY, ""),
            TransportError::Transient(_)
        ));
        assert!(classify_status(StatusCode::UNPROCESSABLE_ENTITY, "invalid address").is_permanent());
        assert!(classify_status(StatusCode::UNAUTHORIZED, "").is_permanent());
    }

    #[test]
    fn test_required_rejects_blank() {
        assert!(required(Some("  "), "email").unwrap_err().is_permanent());
        assert!(required(None, "email").is_err());
        assert_eq!(required(Some(" a@b.c "), "email").unwrap(), "a@b.c");
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        assert_eq!(truncate("héllo", 2), "hé");
        assert_eq!(truncate("hi", 10), "hi");
    }
}
