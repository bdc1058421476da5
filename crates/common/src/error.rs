use std::time::Duration;

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use thiserror::Error;
use uuid::Uuid;

use crate::types::TaskStatus;

/// Common error types used across the application.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Delivery error: {0}")]
    Delivery(#[from] DeliveryError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            AppError::Database(_) => (StatusCode::INTERNAL_SERVER_ERROR, self.to_string()),
            AppError::Redis(_) => (StatusCode::INTERNAL_SERVER_ERROR, self.to_string()),
            AppError::Delivery(err) => (err.status_code(), err.to_string()),
            AppError::Config(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg.clone()),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
            AppError::Validation(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            AppError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg.clone()),
        };

        let body = json!({ "error": message });
        (status, Json(body)).into_response()
    }
}

/// Failure reported by a channel transport.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// Worth retrying: network errors, 5xx, throttling.
    #[error("transient transport failure: {0}")]
    Transient(String),

    /// Retrying cannot help: invalid recipient, rejected payload.
    #[error("permanent transport failure: {0}")]
    Permanent(String),

    #[error("transport call exceeded deadline of {0:?}")]
    Timeout(Duration),
}

impl TransportError {
    pub fn is_permanent(&self) -> bool {
        matches!(self, TransportError::Permanent(_))
    }
}

/// Failure of a shared store (lease store, work queue, task store).
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("task {task_id} changed concurrently (expected status {expected})")]
    Conflict { task_id: Uuid, expected: TaskStatus },

    #[error("task {0} not found")]
    NotFound(Uuid),

    #[error("corrupt record: {0}")]
    Corrupt(String),
}

impl From<redis::RedisError> for StoreError {
    fn from(err: redis::RedisError) -> Self {
        StoreError::Unavailable(err.to_string())
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        StoreError::Unavailable(err.to_string())
    }
}

/// Outcome taxonomy of the admission / routing / delivery path.
#[derive(Debug, Error)]
pub enum DeliveryError {
    /// Key already leased. A control-flow signal: the caller no-ops.
    #[error("admission rejected: {key} is already leased")]
    AdmissionRejected { key: String },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("permanent transport error: {0}")]
    TransportPermanent(String),

    #[error("policy error: {0}")]
    Policy(String),

    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    /// A stored record could not be decoded. Retrying will not help.
    #[error("corrupt record: {0}")]
    Corrupt(String),

    #[error("rate limited: retry in {retry_in:?}")]
    RateLimited { retry_in: Duration },

    #[error("task {0} was cancelled")]
    Cancelled(Uuid),

    /// Popped before its retry or warm-up delay elapsed; pushed back.
    #[error("task {task_id} not due for another {retry_in:?}")]
    NotDue { task_id: Uuid, retry_in: Duration },

    #[error("task {0} not found")]
    NotFound(Uuid),

    #[error("task {task_id} cannot move from {from} to {to}")]
    InvalidTransition {
        task_id: Uuid,
        from: TaskStatus,
        to: TaskStatus,
    },
}

impl DeliveryError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            DeliveryError::AdmissionRejected { .. } => StatusCode::CONFLICT,
            DeliveryError::Transport(_) => StatusCode::BAD_GATEWAY,
            DeliveryError::TransportPermanent(_) => StatusCode::BAD_GATEWAY,
            DeliveryError::Policy(_) => StatusCode::UNPROCESSABLE_ENTITY,
            DeliveryError::StoreUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            DeliveryError::Corrupt(_) => StatusCode::INTERNAL_SERVER_ERROR,
            DeliveryError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            DeliveryError::Cancelled(_) => StatusCode::CONFLICT,
            DeliveryError::NotDue { .. } => StatusCode::CONFLICT,
            DeliveryError::NotFound(_) => StatusCode::NOT_FOUND,
            DeliveryError::InvalidTransition { .. } => StatusCode::CONFLICT,
        }
    }
}

impl From<TransportError> for DeliveryError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Permanent(msg) => DeliveryError::TransportPermanent(msg),
            other => DeliveryError::Transport(other.to_string()),
        }
    }
}

impl From<StoreError> for DeliveryError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(id) => DeliveryError::NotFound(id),
            StoreError::Corrupt(msg) => DeliveryError::Corrupt(msg),
            other => DeliveryError::StoreUnavailable(other.to_string()),
        }
    }
}
