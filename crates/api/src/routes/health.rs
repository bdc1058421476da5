//! Health check endpoint.

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;

use courier_common::redis_pool;

use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/health", get(health_check))
}

async fn health_check(State(state): State<AppState>) -> Json<serde_json::Value> {
    let (status, redis) = match state.redis.clone() {
        Some(mut conn) => {
            if redis_pool::ping(&mut conn).await {
                ("ok", "up")
            } else {
                ("degraded", "down")
            }
        }
        None => ("ok", "disabled"),
    };

    Json(json!({
        "status": status,
        "service": "courier-api",
        "version": env!("CARGO_PKG_VERSION"),
        "redis": redis,
        "channels": state.dispatcher().transports().channels(),
    }))
}
