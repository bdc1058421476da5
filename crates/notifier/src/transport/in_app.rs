use async_trait::async_trait;
use chrono::Utc;
use redis::aio::ConnectionManager;
use serde_json::json;

use courier_common::error::TransportError;
use courier_common::types::{Ack, Channel, DeliveryTask};

use super::Transport;

/// Publishes to the tenant's Redis channel; connected clients fan it out.
#[derive(Clone)]
pub struct InAppTransport {
    redis: ConnectionManager,
}

impl InAppTransport {
    pub fn new(redis: ConnectionManager) -> Self {
        Self { redis }
    }

    pub fn topic(tenant_id: uuid::Uuid) -> String {
        format!("tenant:{}:notifications", tenant_id)
    }
}

#[async_trait]
impl Transport for InAppTransport {
    fn channel(&self) -> Channel {
        Channel::InApp
    }

    async fn send(&self, task: &DeliveryTask) -> Result<Ack, TransportError> {
        let message = json!({
            "task_id": task.id,
            "message_id": task.message_id,
            "notification_type": task.notification_type,
            "user_id": task.payload.recipient.user_id,
            "title": task.payload.title,
            "body": task.payload.body,
            "data": task.payload.data,
        });

        let mut conn = self.redis.clone();
        let receivers: i64 = redis::cmd("PUBLISH")
            .arg(Self::topic(task.tenant_id))
            .arg(message.to_string())
            .query_async(&mut conn)
            .await
            .map_err(|e| TransportError::Transient(e.to_string()))?;

        tracing::debug!(task_id = %task.id, receivers, "In-app notification published");

        Ok(Ack {
            provider_message_id: task.id.to_string(),
            delivered_at: Utc::now(),
        })
    }
}
