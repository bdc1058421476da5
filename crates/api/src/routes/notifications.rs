//! Event intake routes.

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};

use courier_common::error::AppError;
use courier_common::types::NotificationEvent;
use courier_engine::translator::DomainEvent;
use courier_notifier::pipeline::IntakeOutcome;

use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/notifications", post(submit_notification))
        .route("/api/events", post(submit_domain_event))
}

/// POST /api/notifications: accept a notification event for delivery.
///
/// 202 when tasks were queued, 200 with `admitted: false` for a duplicate.
async fn submit_notification(
    State(state): State<AppState>,
    Json(event): Json<NotificationEvent>,
) -> Result<(StatusCode, Json<IntakeOutcome>), AppError> {
    validate(&event)?;
    let outcome = state.pipeline.submit(&event).await?;
    Ok((status_for(&outcome), Json(outcome)))
}

/// POST /api/events: accept a typed domain event.
async fn submit_domain_event(
    State(state): State<AppState>,
    Json(event): Json<DomainEvent>,
) -> Result<(StatusCode, Json<IntakeOutcome>), AppError> {
    let translated = event.translate();
    validate(&translated)?;
    let outcome = state.pipeline.submit(&translated).await?;
    Ok((status_for(&outcome), Json(outcome)))
}

fn validate(event: &NotificationEvent) -> Result<(), AppError> {
    if event.message_id.trim().is_empty() {
        return Err(AppError::Validation("message_id must not be empty".to_string()));
    }
    if event.payload.title.trim().is_empty() && event.payload.body.trim().is_empty() {
        return Err(AppError::Validation(
            "notification needs a title or a body".to_string(),
        ));
    }
    Ok(())
}

fn status_for(outcome: &IntakeOutcome) -> StatusCode {
    if outcome.admitted {
        StatusCode::ACCEPTED
    } else {
        StatusCode::OK
    }
}
