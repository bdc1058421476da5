//! Channel policy lookup.
//!
//! Policies are owned by configuration management and read-only here. A
//! tenant without a stored policy for a notification type gets the default
//! policy (every channel enabled, normal priority, configured retry budget).

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use sqlx::PgPool;
use sqlx::types::Json;
use tokio::sync::RwLock;
use uuid::Uuid;

use courier_common::config::AppConfig;
use courier_common::error::{DeliveryError, StoreError};
use courier_common::types::{
    BackoffStrategy, Channel, ChannelPolicy, NotificationType, Priority, RateLimit,
};

#[async_trait]
pub trait PolicyStore: Send + Sync {
    async fn policy_for(
        &self,
        tenant_id: Uuid,
        notification_type: NotificationType,
    ) -> Result<Option<ChannelPolicy>, StoreError>;
}

/// Static policies held in memory.
#[derive(Default)]
pub struct InMemoryPolicyStore {
    policies: RwLock<HashMap<(Uuid, NotificationType), ChannelPolicy>>,
}

impl InMemoryPolicyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, policy: ChannelPolicy) {
        self.policies
            .write()
            .await
            .insert((policy.tenant_id, policy.notification_type), policy);
    }
}

#[async_trait]
impl PolicyStore for InMemoryPolicyStore {
    async fn policy_for(
        &self,
        tenant_id: Uuid,
        notification_type: NotificationType,
    ) -> Result<Option<ChannelPolicy>, StoreError> {
        Ok(self
            .policies
            .read()
            .await
            .get(&(tenant_id, notification_type))
            .cloned())
    }
}

#[derive(sqlx::FromRow)]
struct PolicyRow {
    enabled_channels: Vec<String>,
    priority: String,
    retry_budget: i32,
    backoff: Json<BackoffStrategy>,
    rate_limit: Option<Json<RateLimit>>,
    warmup_delay_ms: i64,
}

/// Reads the `channel_policies` table.
#[derive(Clone)]
pub struct PgPolicyStore {
    pool: PgPool,
}

impl PgPolicyStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl PolicyStore for PgPolicyStore {
    async fn policy_for(
        &self,
        tenant_id: Uuid,
        notification_type: NotificationType,
    ) -> Result<Option<ChannelPolicy>, StoreError> {
        let row: Option<PolicyRow> = sqlx::query_as(
            r#"
            SELECT enabled_channels, priority, retry_budget, backoff, rate_limit, warmup_delay_ms
            FROM channel_policies
            WHERE tenant_id = $1 AND notification_type = $2
            "#,
        )
        .bind(tenant_id)
        .bind(notification_type.as_str())
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let enabled_channels = row
            .enabled_channels
            .iter()
            .map(|c| c.parse::<Channel>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(StoreError::Corrupt)?;
        let priority = row.priority.parse::<Priority>().map_err(StoreError::Corrupt)?;
        let retry_budget = u32::try_from(row.retry_budget)
            .map_err(|_| StoreError::Corrupt(format!("negative retry budget {}", row.retry_budget)))?;

        Ok(Some(ChannelPolicy {
            tenant_id,
            notification_type,
            enabled_channels,
            priority,
            retry_budget,
            backoff: row.backoff.0,
            rate_limit: row.rate_limit.map(|r| r.0),
            warmup_delay_ms: row.warmup_delay_ms.max(0) as u64,
        }))
    }
}

/// Values used to build the default policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PolicyDefaults {
    pub retry_budget: u32,
    pub backoff: BackoffStrategy,
    pub whatsapp_warmup_delay_ms: u64,
}

impl PolicyDefaults {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            retry_budget: config.default_retry_budget,
            backoff: config.backoff(),
            whatsapp_warmup_delay_ms: config.whatsapp_warmup_delay_ms,
        }
    }
}

impl Default for PolicyDefaults {
    fn default() -> Self {
        Self {
            retry_budget: 3,
            backoff: BackoffStrategy::default(),
            whatsapp_warmup_delay_ms: 0,
        }
    }
}

/// Store lookup with default fallback.
#[derive(Clone)]
pub struct PolicyResolver {
    store: Arc<dyn PolicyStore>,
    defaults: PolicyDefaults,
}

impl PolicyResolver {
    pub fn new(store: Arc<dyn PolicyStore>, defaults: PolicyDefaults) -> Self {
        Self { store, defaults }
    }

    /// Resolve the effective policy.
    ///
    /// A store outage is surfaced as `StoreUnavailable` rather than falling back
    /// to the default, which could enable channels the tenant turned off.
    pub async fn resolve(
        &self,
        tenant_id: Uuid,
        notification_type: NotificationType,
    ) -> Result<ChannelPolicy, DeliveryError> {
        match self.store.policy_for(tenant_id, notification_type).await {
            Ok(Some(policy)) => Ok(policy),
            Ok(None) => Ok(self.default_policy(tenant_id, notification_type)),
            Err(e) => {
                tracing::error!(
                    tenant_id = %tenant_id,
                    notification_type = %notification_type,
                    error = %e,
                    "Policy lookup failed"
                );
                Err(DeliveryError::StoreUnavailable(e.to_string()))
            }
        }
    }

    pub fn default_policy(
        &self,
        tenant_id: Uuid,
        notification_type: NotificationType,
    ) -> ChannelPolicy {
        let mut policy = ChannelPolicy::default_for(
            tenant_id,
            notification_type,
            self.defaults.retry_budget,
            self.defaults.backoff,
        );
        policy.warmup_delay_ms = self.defaults.whatsapp_warmup_delay_ms;
        if notification_type == NotificationType::BillingAlert {
            policy.priority = Priority::High;
        }
        policy
    }
}
