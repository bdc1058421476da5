//! Event intake: dedup, policy, routing, enqueue.

use std::time::Duration;

use serde::Serialize;
use uuid::Uuid;

use courier_common::error::DeliveryError;
use courier_common::types::{Channel, NotificationEvent};
use courier_engine::dedup::DedupGuard;
use courier_engine::policy::PolicyResolver;
use courier_engine::router::ChannelRouter;
use courier_engine::translator::DomainEvent;

use crate::dispatcher::DeliveryDispatcher;

/// What intake did with an event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IntakeOutcome {
    /// `false` when the event duplicated one seen inside the dedup window.
    pub admitted: bool,
    pub task_ids: Vec<Uuid>,
    pub channels: Vec<Channel>,
}

impl IntakeOutcome {
    fn duplicate() -> Self {
        Self {
            admitted: false,
            task_ids: Vec::new(),
            channels: Vec::new(),
        }
    }
}

#[derive(Clone)]
pub struct NotificationPipeline {
    resolver: PolicyResolver,
    guard: DedupGuard,
    dispatcher: DeliveryDispatcher,
    intake_ttl: Duration,
}

impl NotificationPipeline {
    pub fn new(
        resolver: PolicyResolver,
        guard: DedupGuard,
        dispatcher: DeliveryDispatcher,
        intake_ttl: Duration,
    ) -> Self {
        Self {
            resolver,
            guard,
            dispatcher,
            intake_ttl,
        }
    }

    pub fn dispatcher(&self) -> &DeliveryDispatcher {
        &self.dispatcher
    }

    pub async fn submit_domain(&self, event: &DomainEvent) -> Result<IntakeOutcome, DeliveryError> {
        self.submit(&event.translate()).await
    }

    /// Admit, route and enqueue one event. Returns once tasks are queued.
    ///
    /// The intake lease is kept after a successful enqueue so a redelivered
    /// event is dropped for the rest of the window, and released on failure
    /// so the producer's retry goes through.
    pub async fn submit(&self, event: &NotificationEvent) -> Result<IntakeOutcome, DeliveryError> {
        let admission = self
            .guard
            .admit_event(
                event.tenant_id,
                &event.message_id,
                event.payload.resend_generation,
                self.intake_ttl,
            )
            .await?;

        if !admission.admitted {
            tracing::info!(
                tenant_id = %event.tenant_id,
                message_id = %event.message_id,
                "Duplicate event dropped"
            );
            return Ok(IntakeOutcome::duplicate());
        }

        let result = self.route_and_enqueue(event).await;

        if let Some(lease) = admission.lease {
            match &result {
                Ok(_) => lease.retain(),
                Err(_) => lease.release().await,
            }
        }
        result
    }

    async fn route_and_enqueue(
        &self,
        event: &NotificationEvent,
    ) -> Result<IntakeOutcome, DeliveryError> {
        let policy = self
            .resolver
            .resolve(event.tenant_id, event.notification_type)
            .await?;
        let dispatches = ChannelRouter::route(event, &policy)?;

        let transports = self.dispatcher.transports();
        let mut outcome = IntakeOutcome {
            admitted: true,
            task_ids: Vec::with_capacity(dispatches.len()),
            channels: Vec::with_capacity(dispatches.len()),
        };

        for dispatch in &dispatches {
            if !transports.supports(dispatch.channel) {
                tracing::warn!(
                    tenant_id = %event.tenant_id,
                    message_id = %event.message_id,
                    channel = %dispatch.channel,
                    "No transport for routed channel, skipping"
                );
                continue;
            }
            let task_id = self.dispatcher.enqueue(event, dispatch, &policy).await?;
            outcome.task_ids.push(task_id);
            outcome.channels.push(dispatch.channel);
        }

        tracing::info!(
            tenant_id = %event.tenant_id,
            message_id = %event.message_id,
            notification_type = %event.notification_type,
            channels = ?outcome.channels,
            "Event routed"
        );
        Ok(outcome)
    }
}
