//! Delivery lifecycle hooks.
//!
//! The dispatcher reports every state transition, rejected admission and
//! abandonment here. The default observer turns them into `tracing` events;
//! tests use [`RecordingObserver`] to assert on what was reported.

use std::sync::Mutex;

use courier_common::types::{DeliveryTask, TaskStatus};

pub trait DeliveryObserver: Send + Sync {
    fn on_enqueued(&self, task: &DeliveryTask);

    fn on_transition(&self, task: &DeliveryTask, from: TaskStatus);

    fn on_admission_rejected(&self, task: &DeliveryTask, lease_key: &str);

    /// Terminal failure. Called exactly once per abandoned task.
    fn on_abandoned(&self, task: &DeliveryTask);

    fn on_store_unavailable(&self, task: &DeliveryTask, error: &str);
}

/// Structured log output.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl DeliveryObserver for TracingObserver {
    fn on_enqueued(&self, task: &DeliveryTask) {
        tracing::info!(
            task_id = %task.id,
            tenant_id = %task.tenant_id,
            message_id = %task.message_id,
            channel = %task.channel,
            queue = %task.queue_name,
            "Delivery task enqueued"
        );
    }

    fn on_transition(&self, task: &DeliveryTask, from: TaskStatus) {
        tracing::debug!(
            task_id = %task.id,
            channel = %task.channel,
            from = %from,
            to = %task.status,
            attempts = task.attempts,
            "Delivery task transition"
        );
    }

    fn on_admission_rejected(&self, task: &DeliveryTask, lease_key: &str) {
        tracing::info!(
            task_id = %task.id,
            channel = %task.channel,
            lease_key,
            "Delivery already in progress for key, deferring"
        );
    }

    fn on_abandoned(&self, task: &DeliveryTask) {
        tracing::error!(
            task_id = %task.id,
            tenant_id = %task.tenant_id,
            message_id = %task.message_id,
            channel = %task.channel,
            attempts = task.attempts,
            error = task.last_error.as_deref().unwrap_or(""),
            "Delivery abandoned"
        );
    }

    fn on_store_unavailable(&self, task: &DeliveryTask, error: &str) {
        tracing::error!(
            task_id = %task.id,
            channel = %task.channel,
            error,
            "Lease store unavailable, delivery refused"
        );
    }
}

/// One reported event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ObservedEvent {
    Enqueued { task_id: uuid::Uuid },
    Transition { task_id: uuid::Uuid, from: TaskStatus, to: TaskStatus },
    AdmissionRejected { task_id: uuid::Uuid },
    Abandoned { task_id: uuid::Uuid },
    StoreUnavailable { task_id: uuid::Uuid },
}

/// Keeps every event in memory.
#[derive(Debug, Default)]
pub struct RecordingObserver {
    events: Mutex<Vec<ObservedEvent>>,
}

impl RecordingObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<ObservedEvent> {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn abandoned_count(&self, task_id: uuid::Uuid) -> usize {
        self.events()
            .iter()
            .filter(|e| matches!(e, ObservedEvent::Abandoned { task_id: id } if *id == task_id))
            .count()
    }

    fn push(&self, event: ObservedEvent) {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).push(event);
    }
}

impl DeliveryObserver for RecordingObserver {
    fn on_enqueued(&self, task: &DeliveryTask) {
        self.push(ObservedEvent::Enqueued { task_id: task.id });
    }

    fn on_transition(&self, task: &DeliveryTask, from: TaskStatus) {
        self.push(ObservedEvent::Transition {
            task_id: task.id,
            from,
            to: task.status,
        });
    }

    fn on_admission_rejected(&self, task: &DeliveryTask, _lease_key: &str) {
        self.push(ObservedEvent::AdmissionRejected { task_id: task.id });
    }

    fn on_abandoned(&self, task: &DeliveryTask) {
        self.push(ObservedEvent::Abandoned { task_id: task.id });
    }

    fn on_store_unavailable(&self, task: &DeliveryTask, _error: &str) {
        self.push(ObservedEvent::StoreUnavailable { task_id: task.id });
    }
}
