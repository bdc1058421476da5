//! Shared application state for the Axum API server.

use redis::aio::ConnectionManager;

use courier_notifier::dispatcher::DeliveryDispatcher;
use courier_notifier::pipeline::NotificationPipeline;

/// Application state shared across all route handlers via Axum `State`.
#[derive(Clone)]
pub struct AppState {
    pub pipeline: NotificationPipeline,
    /// `None` when running without Redis (in-memory wiring).
    pub redis: Option<ConnectionManager>,
}

impl AppState {
    pub fn new(pipeline: NotificationPipeline, redis: Option<ConnectionManager>) -> Self {
        Self { pipeline, redis }
    }

    pub fn dispatcher(&self) -> &DeliveryDispatcher {
        self.pipeline.dispatcher()
    }
}
