//! Persistent delivery task records.
//!
//! Updates are conditional on the status the writer last saw, so two writers
//! racing on the same task (a worker finishing an attempt, an API cancel) can
//! never both win. `cancel_requested` is sticky: once set it is never cleared
//! by a later write.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use sqlx::types::Json;
use tokio::sync::RwLock;
use uuid::Uuid;

use courier_common::error::StoreError;
use courier_common::types::{
    BackoffStrategy, Channel, DeliveryTask, NotificationPayload, NotificationType, Priority,
    RateLimit, TaskStatus,
};

#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn insert(&self, task: &DeliveryTask) -> Result<(), StoreError>;

    async fn get(&self, id: Uuid) -> Result<DeliveryTask, StoreError>;

    /// Persist `task` if the stored status is still `expected`.
    async fn update(&self, task: &DeliveryTask, expected: TaskStatus) -> Result<(), StoreError>;

    async fn list_for_message(
        &self,
        tenant_id: Uuid,
        message_id: &str,
    ) -> Result<Vec<DeliveryTask>, StoreError>;

    /// Pending tasks eligible to run at `now`, oldest first.
    async fn due_pending(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<DeliveryTask>, StoreError>;

    /// In-flight tasks whose attempt started before `started_before`, oldest first.
    async fn stale_in_flight(
        &self,
        started_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<DeliveryTask>, StoreError>;
}

/// Process-local task store.
#[derive(Default)]
pub struct InMemoryTaskStore {
    tasks: RwLock<HashMap<Uuid, DeliveryTask>>,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn all(&self) -> Vec<DeliveryTask> {
        let mut tasks: Vec<_> = self.tasks.read().await.values().cloned().collect();
        tasks.sort_by_key(|t| (t.created_at, t.channel));
        tasks
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn insert(&self, task: &DeliveryTask) -> Result<(), StoreError> {
        self.tasks.write().await.insert(task.id, task.clone());
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<DeliveryTask, StoreError> {
        self.tasks
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(StoreError::NotFound(id))
    }

    async fn update(&self, task: &DeliveryTask, expected: TaskStatus) -> Result<(), StoreError> {
        let mut tasks = self.tasks.write().await;
        let stored = tasks.get_mut(&task.id).ok_or(StoreError::NotFound(task.id))?;
        if stored.status != expected {
            return Err(StoreError::Conflict {
                task_id: task.id,
                expected,
            });
        }
        let cancel_requested = stored.cancel_requested || task.cancel_requested;
        *stored = task.clone();
        stored.cancel_requested = cancel_requested;
        Ok(())
    }

    async fn list_for_message(
        &self,
        tenant_id: Uuid,
        message_id: &str,
    ) -> Result<Vec<DeliveryTask>, StoreError> {
        let mut tasks: Vec<_> = self
            .tasks
            .read()
            .await
            .values()
            .filter(|t| t.tenant_id == tenant_id && t.message_id == message_id)
            .cloned()
            .collect();
        tasks.sort_by_key(|t| (t.created_at, t.channel));
        Ok(tasks)
    }

    async fn due_pending(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<DeliveryTask>, StoreError> {
        let mut due: Vec<_> = self
            .tasks
            .read()
            .await
            .values()
            .filter(|t| t.is_due(now))
            .cloned()
            .collect();
        due.sort_by_key(|t| t.created_at);
        due.truncate(limit);
        Ok(due)
    }

    async fn stale_in_flight(
        &self,
        started_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<DeliveryTask>, StoreError> {
        let mut stale: Vec<_> = self
            .tasks
            .read()
            .await
            .values()
            .filter(|t| {
                t.status == TaskStatus::InFlight
                    && t.last_attempt_at.is_none_or(|at| at < started_before)
            })
            .cloned()
            .collect();
        stale.sort_by_key(|t| t.last_attempt_at);
        stale.truncate(limit);
        Ok(stale)
    }
}

#[derive(sqlx::FromRow)]
struct TaskRow {
    id: Uuid,
    tenant_id: Uuid,
    message_id: String,
    generation: i32,
    channel: String,
    notification_type: String,
    payload: Json<NotificationPayload>,
    priority: String,
    queue_name: String,
    attempts: i32,
    max_attempts: i32,
    backoff: Json<BackoffStrategy>,
    rate_limit: Option<Json<RateLimit>>,
    status: String,
    last_error: Option<String>,
    provider_message_id: Option<String>,
    cancel_requested: bool,
    created_at: DateTime<Utc>,
    last_attempt_at: Option<DateTime<Utc>>,
    next_retry_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
}

impl TryFrom<TaskRow> for DeliveryTask {
    type Error = StoreError;

    fn try_from(row: TaskRow) -> Result<Self, Self::Error> {
        let non_negative = |name: &str, v: i32| {
            u32::try_from(v).map_err(|_| StoreError::Corrupt(format!("negative {} {}", name, v)))
        };
        let notification_type: NotificationType =
            serde_json::from_value(serde_json::Value::String(row.notification_type))
                .map_err(|e| StoreError::Corrupt(e.to_string()))?;

        Ok(DeliveryTask {
            id: row.id,
            tenant_id: row.tenant_id,
            message_id: row.message_id,
            generation: non_negative("generation", row.generation)?,
            channel: row.channel.parse::<Channel>().map_err(StoreError::Corrupt)?,
            notification_type,
            payload: row.payload.0,
            priority: row.priority.parse::<Priority>().map_err(StoreError::Corrupt)?,
            queue_name: row.queue_name,
            attempts: non_negative("attempts", row.attempts)?,
            max_attempts: non_negative("max_attempts", row.max_attempts)?,
            backoff: row.backoff.0,
            rate_limit: row.rate_limit.map(|r| r.0),
            status: row.status.parse::<TaskStatus>().map_err(StoreError::Corrupt)?,
            last_error: row.last_error,
            provider_message_id: row.provider_message_id,
            cancel_requested: row.cancel_requested,
            created_at: row.created_at,
            last_attempt_at: row.last_attempt_at,
            next_retry_at: row.next_retry_at,
            completed_at: row.completed_at,
        })
    }
}

/// Postgres-backed task store over the `delivery_tasks` table.
#[derive(Clone)]
pub struct PgTaskStore {
    pool: PgPool,
}

impl PgTaskStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TaskStore for PgTaskStore {
    async fn insert(&self, task: &DeliveryTask) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO delivery_tasks (
                id, tenant_id, message_id, generation, channel, notification_type, payload,
                priority, queue_name, attempts, max_attempts, backoff, rate_limit, status,
                last_error, provider_message_id, cancel_requested, created_at,
                last_attempt_at, next_retry_at, completed_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19, $20, $21)
            "#,
        )
        .bind(task.id)
        .bind(task.tenant_id)
        .bind(&task.message_id)
        .bind(task.generation as i32)
        .bind(task.channel.as_str())
        .bind(task.notification_type.as_str())
        .bind(Json(&task.payload))
        .bind(task.priority.as_str())
        .bind(&task.queue_name)
        .bind(task.attempts as i32)
        .bind(task.max_attempts as i32)
        .bind(Json(task.backoff))
        .bind(task.rate_limit.map(Json))
        .bind(task.status.as_str())
        .bind(&task.last_error)
        .bind(&task.provider_message_id)
        .bind(task.cancel_requested)
        .bind(task.created_at)
        .bind(task.last_attempt_at)
        .bind(task.next_retry_at)
        .bind(task.completed_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<DeliveryTask, StoreError> {
        let row: TaskRow = sqlx::query_as("SELECT * FROM delivery_tasks WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(StoreError::NotFound(id))?;
        row.try_into()
    }

    async fn update(&self, task: &DeliveryTask, expected: TaskStatus) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE delivery_tasks
            SET status = $1,
                attempts = $2,
                last_error = $3,
                provider_message_id = $4,
                cancel_requested = cancel_requested OR $5,
                last_attempt_at = $6,
                next_retry_at = $7,
                completed_at = $8
            WHERE id = $9 AND status = $10
            "#,
        )
        .bind(task.status.as_str())
        .bind(task.attempts as i32)
        .bind(&task.last_error)
        .bind(&task.provider_message_id)
        .bind(task.cancel_requested)
        .bind(task.last_attempt_at)
        .bind(task.next_retry_at)
        .bind(task.completed_at)
        .bind(task.id)
        .bind(expected.as_str())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            // Distinguish a missing row from a lost race
            self.get(task.id).await?;
            return Err(StoreError::Conflict {
                task_id: task.id,
                expected,
            });
        }
        Ok(())
    }

    async fn list_for_message(
        &self,
        tenant_id: Uuid,
        message_id: &str,
    ) -> Result<Vec<DeliveryTask>, StoreError> {
        let rows: Vec<TaskRow> = sqlx::query_as(
            r#"
            SELECT * FROM delivery_tasks
            WHERE tenant_id = $1 AND message_id = $2
            ORDER BY created_at, channel
            "#,
        )
        .bind(tenant_id)
        .bind(message_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(DeliveryTask::try_from).collect()
    }

    async fn due_pending(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<DeliveryTask>, StoreError> {
        let rows: Vec<TaskRow> = sqlx::query_as(
            r#"
            SELECT * FROM delivery_tasks
            WHERE status = 'pending'
              AND (next_retry_at IS NULL OR next_retry_at <= $1)
            ORDER BY created_at
            LIMIT $2
            "#,
        )
        .bind(now)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(DeliveryTask::try_from).collect()
    }

    async fn stale_in_flight(
        &self,
        started_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<DeliveryTask>, StoreError> {
        let rows: Vec<TaskRow> = sqlx::query_as(
            r#"
            SELECT * FROM delivery_tasks
            WHERE status = 'in_flight'
              AND (last_attempt_at IS NULL OR last_attempt_at < $1)
            ORDER BY last_attempt_at NULLS FIRST
            LIMIT $2
            "#,
        )
        .bind(started_before)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(DeliveryTask::try_from).collect()
    }
}
