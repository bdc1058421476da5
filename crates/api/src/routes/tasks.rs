//! Delivery task inspection and cancellation.

use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use uuid::Uuid;

use courier_common::error::AppError;
use courier_common::types::DeliveryTask;

use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/tasks/{id}", get(get_task))
        .route("/api/tasks/{id}/cancel", post(cancel_task))
        .route(
            "/api/tenants/{tenant_id}/messages/{message_id}/tasks",
            get(list_message_tasks),
        )
}

/// GET /api/tasks/:id
async fn get_task(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<DeliveryTask>, AppError> {
    Ok(Json(state.dispatcher().get(id).await?))
}

/// POST /api/tasks/:id/cancel: cancel now, or at the retry boundary when in flight.
async fn cancel_task(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<DeliveryTask>, AppError> {
    Ok(Json(state.dispatcher().cancel(id).await?))
}

/// GET /api/tenants/:tenant_id/messages/:message_id/tasks
async fn list_message_tasks(
    State(state): State<AppState>,
    Path((tenant_id, message_id)): Path<(Uuid, String)>,
) -> Result<Json<Vec<DeliveryTask>>, AppError> {
    let tasks = state
        .dispatcher()
        .list_for_message(tenant_id, &message_id)
        .await?;
    Ok(Json(tasks))
}
