//! Delivery dispatcher: runs one attempt of a task under its delivery lease.
//!
//! Flow for each popped task:
//! 1. Load it; anything but a due `pending` task is skipped
//! 2. Honour a pending cancel request
//! 3. Acquire the lease for (tenant, message, channel, generation)
//! 4. Check the tenant's rate limit for the channel
//! 5. `pending -> in_flight`, call the transport under a deadline
//! 6. Record success, schedule a retry, or abandon
//! 7. Release the lease, whatever happened above
//!
//! Every path that cannot run the task now pushes it back onto its queue, so
//! callers never have to re-queue.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use courier_common::clock::Clock;
use courier_common::config::AppConfig;
use courier_common::error::{DeliveryError, StoreError, TransportError};
use courier_common::types::{
    Ack, ChannelDispatch, ChannelPolicy, DeliveryTask, NotificationEvent, TaskStatus,
};
use courier_engine::dedup::DedupGuard;
use courier_engine::ratelimit::{RateLimiter, rate_limit_key};

use crate::observer::{DeliveryObserver, TracingObserver};
use crate::queue::{QueueEntry, WorkQueue};
use crate::store::TaskStore;
use crate::transport::{Transport, TransportRegistry};

/// Timing knobs for the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatcherConfig {
    pub lease_ttl: Duration,
    pub transport_timeout: Duration,
    /// Wait before retrying a task whose key is leased by another worker.
    pub contention_delay: Duration,
    /// Wait before retrying a task refused because the lease store is down.
    pub store_retry_delay: Duration,
}

impl DispatcherConfig {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            lease_ttl: config.lease_ttl(),
            transport_timeout: config.transport_timeout(),
            ..Self::default()
        }
    }
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            lease_ttl: Duration::from_secs(60),
            transport_timeout: Duration::from_secs(10),
            contention_delay: Duration::from_secs(1),
            store_retry_delay: Duration::from_secs(5),
        }
    }
}

#[derive(Clone)]
pub struct DeliveryDispatcher {
    tasks: Arc<dyn TaskStore>,
    queue: Arc<dyn WorkQueue>,
    guard: DedupGuard,
    limiter: Arc<dyn RateLimiter>,
    transports: TransportRegistry,
    observer: Arc<dyn DeliveryObserver>,
    clock: Arc<dyn Clock>,
    config: DispatcherConfig,
}

impl DeliveryDispatcher {
    pub fn new(
        tasks: Arc<dyn TaskStore>,
        queue: Arc<dyn WorkQueue>,
        guard: DedupGuard,
        limiter: Arc<dyn RateLimiter>,
        transports: TransportRegistry,
        clock: Arc<dyn Clock>,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            tasks,
            queue,
            guard,
            limiter,
            transports,
            observer: Arc::new(TracingObserver),
            clock,
            config,
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn DeliveryObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn transports(&self) -> &TransportRegistry {
        &self.transports
    }

    pub fn queue(&self) -> &Arc<dyn WorkQueue> {
        &self.queue
    }

    /// Persist a pending task for one routed channel and queue it.
    ///
    /// Returns as soon as the task is queued; delivery happens on a worker.
    pub async fn enqueue(
        &self,
        event: &NotificationEvent,
        dispatch: &ChannelDispatch,
        policy: &ChannelPolicy,
    ) -> Result<Uuid, DeliveryError> {
        let now = self.clock.now();
        let task = DeliveryTask::new(event, dispatch, policy, now);

        self.tasks.insert(&task).await?;
        self.push(&task, task.next_retry_at.unwrap_or(now)).await?;
        self.observer.on_enqueued(&task);

        Ok(task.id)
    }

    pub async fn get(&self, task_id: Uuid) -> Result<DeliveryTask, DeliveryError> {
        Ok(self.tasks.get(task_id).await?)
    }

    pub async fn list_for_message(
        &self,
        tenant_id: Uuid,
        message_id: &str,
    ) -> Result<Vec<DeliveryTask>, DeliveryError> {
        Ok(self.tasks.list_for_message(tenant_id, message_id).await?)
    }

    /// Cancel a task.
    ///
    /// Pending and failed tasks are cancelled at once. An in-flight task keeps
    /// running its current attempt and is cancelled at the retry boundary if
    /// that attempt fails. Cancelling an already cancelled task is a no-op.
    pub async fn cancel(&self, task_id: Uuid) -> Result<DeliveryTask, DeliveryError> {
        // A worker may move the task between our read and our write
        for _ in 0..3 {
            let mut task = self.tasks.get(task_id).await?;
            if task.status == TaskStatus::Cancelled {
                return Ok(task);
            }

            let from = task.status;
            let immediate = task.cancel(self.clock.now())?;
            match self.persist(&task, from).await {
                Ok(()) => {
                    if immediate {
                        tracing::info!(task_id = %task_id, "Delivery task cancelled");
                    } else {
                        tracing::info!(
                            task_id = %task_id,
                            "Cancel requested for in-flight task, honoured at retry boundary"
                        );
                    }
                    return Ok(task);
                }
                Err(DeliveryError::InvalidTransition { .. }) => continue,
                Err(e) => return Err(e),
            }
        }

        let task = self.tasks.get(task_id).await?;
        Err(DeliveryError::InvalidTransition {
            task_id,
            from: task.status,
            to: TaskStatus::Cancelled,
        })
    }

    /// Handle a popped queue entry and acknowledge it.
    ///
    /// The entry is left unacknowledged only when a store could not be
    /// reached, so the visibility timeout brings it back.
    pub async fn process(&self, entry: &QueueEntry) -> Result<Ack, DeliveryError> {
        let result = self.execute(entry.task_id).await;

        if !matches!(result, Err(DeliveryError::StoreUnavailable(_))) {
            if let Err(e) = self.queue.ack(entry).await {
                tracing::warn!(task_id = %entry.task_id, error = %e, "Queue ack failed");
            }
        }
        result
    }

    /// Run one delivery attempt of `task_id`.
    pub async fn execute(&self, task_id: Uuid) -> Result<Ack, DeliveryError> {
        let mut task = self.tasks.get(task_id).await?;
        let now = self.clock.now();

        match task.status {
            TaskStatus::Pending => {}
            TaskStatus::Cancelled => return Err(DeliveryError::Cancelled(task_id)),
            status => {
                return Err(DeliveryError::InvalidTransition {
                    task_id,
                    from: status,
                    to: TaskStatus::InFlight,
                });
            }
        }

        if task.cancel_requested {
            task.cancel(now)?;
            self.persist(&task, TaskStatus::Pending).await?;
            return Err(DeliveryError::Cancelled(task_id));
        }

        if !task.is_due(now) {
            let at = task.next_retry_at.unwrap_or(now);
            self.push(&task, at).await?;
            return Err(DeliveryError::NotDue {
                task_id,
                retry_in: (at - now).to_std().unwrap_or_default(),
            });
        }

        let Some(transport) = self.transports.get(task.channel) else {
            let from = task.status;
            task.begin_attempt(now)?;
            task.abandon(format!("no transport registered for {}", task.channel), now)?;
            self.persist(&task, from).await?;
            self.observer.on_abandoned(&task);
            return Err(DeliveryError::TransportPermanent(format!(
                "no transport registered for {}",
                task.channel
            )));
        };

        let key = task.key();
        let admission = match self.guard.admit(&key, self.config.lease_ttl).await {
            Ok(admission) => admission,
            Err(e) => {
                self.observer.on_store_unavailable(&task, &e.to_string());
                self.push_after(&task, self.config.store_retry_delay).await?;
                return Err(e);
            }
        };

        if !admission.admitted {
            let lease_key = DedupGuard::delivery_lease_key(&key);
            self.observer.on_admission_rejected(&task, &lease_key);
            self.push_after(&task, self.config.contention_delay).await?;
            return Err(DeliveryError::AdmissionRejected { key: lease_key });
        }

        let result = self.attempt_leased(task, transport).await;

        if let Some(lease) = admission.lease {
            lease.release().await;
        }
        result
    }

    /// Everything that happens while the lease is held.
    async fn attempt_leased(
        &self,
        mut task: DeliveryTask,
        transport: Arc<dyn Transport>,
    ) -> Result<Ack, DeliveryError> {
        if let Some(limit) = task.rate_limit {
            let limit_key = rate_limit_key(task.tenant_id, task.channel);
            match self.limiter.acquire(&limit_key, limit).await {
                Ok(None) => {}
                Ok(Some(retry_in)) => {
                    tracing::info!(
                        task_id = %task.id,
                        channel = %task.channel,
                        retry_in_ms = retry_in.as_millis() as u64,
                        "Rate limited, deferring"
                    );
                    self.push_after(&task, retry_in).await?;
                    return Err(DeliveryError::RateLimited { retry_in });
                }
                Err(e) => {
                    tracing::warn!(task_id = %task.id, error = %e, "Rate limiter unavailable, sending anyway");
                }
            }
        }

        task.begin_attempt(self.clock.now())?;
        self.persist(&task, TaskStatus::Pending).await?;

        let sent = match tokio::time::timeout(self.config.transport_timeout, transport.send(&task)).await
        {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout(self.config.transport_timeout)),
        };

        match sent {
            Ok(ack) => {
                task.succeed(&ack, self.clock.now())?;
                self.persist(&task, TaskStatus::InFlight).await?;
                tracing::info!(
                    task_id = %task.id,
                    channel = %task.channel,
                    attempts = task.attempts,
                    provider_message_id = %ack.provider_message_id,
                    "Delivered"
                );
                Ok(ack)
            }
            Err(err) if err.is_permanent() => {
                task.abandon(err.to_string(), self.clock.now())?;
                self.persist(&task, TaskStatus::InFlight).await?;
                self.observer.on_abandoned(&task);
                Err(err.into())
            }
            Err(err) => {
                task.fail(err.to_string())?;
                self.persist(&task, TaskStatus::InFlight).await?;
                self.after_failure(task).await?;
                Err(err.into())
            }
        }
    }

    /// Retry boundary: cancel, abandon, or schedule the next attempt.
    async fn after_failure(&self, task: DeliveryTask) -> Result<(), DeliveryError> {
        // A cancel that arrived mid-attempt only exists in the store copy
        let mut task = match self.tasks.get(task.id).await {
            Ok(stored) if stored.status == TaskStatus::Failed => stored,
            Ok(_) | Err(_) => task,
        };
        let now = self.clock.now();

        if task.cancel_requested {
            task.cancel(now)?;
            self.persist(&task, TaskStatus::Failed).await?;
            tracing::info!(task_id = %task.id, "Cancelled at retry boundary");
            return Ok(());
        }

        if task.retries_exhausted() {
            let error = task.last_error.clone().unwrap_or_default();
            task.abandon(format!("retry budget exhausted: {}", error), now)?;
            self.persist(&task, TaskStatus::Failed).await?;
            self.observer.on_abandoned(&task);
            return Ok(());
        }

        let delay = task.backoff.delay_for(task.attempts);
        let at = now + chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::MAX);
        task.schedule_retry(at)?;
        self.persist(&task, TaskStatus::Failed).await?;
        self.push(&task, at).await?;

        tracing::warn!(
            task_id = %task.id,
            channel = %task.channel,
            attempt = task.attempts,
            max_attempts = task.max_attempts,
            retry_in_ms = delay.as_millis() as u64,
            error = task.last_error.as_deref().unwrap_or(""),
            "Delivery failed, retry scheduled"
        );
        Ok(())
    }

    /// Re-queue entries past their visibility timeout, fail attempts whose
    /// worker was lost, and re-push any due pending task the queue lost track of.
    pub async fn reconcile(&self, limit: usize) -> Result<usize, DeliveryError> {
        let expired = self.queue.requeue_expired().await?;
        let recovered = self.recover_stale(limit).await?;
        let due = self.tasks.due_pending(self.clock.now(), limit).await?;
        for task in &due {
            self.push(task, task.next_retry_at.unwrap_or(task.created_at)).await?;
        }
        Ok(expired + recovered + due.len())
    }

    /// In-flight tasks whose attempt started more than one lease TTL ago.
    ///
    /// The attempt's lease has expired by then, so no live worker can still be
    /// inside it. Each one is failed and goes through the normal retry boundary.
    async fn recover_stale(&self, limit: usize) -> Result<usize, DeliveryError> {
        let ttl = chrono::Duration::from_std(self.config.lease_ttl).unwrap_or(chrono::Duration::zero());
        let cutoff = self.clock.now() - ttl;
        let stale = self.tasks.stale_in_flight(cutoff, limit).await?;

        let mut recovered = 0;
        for mut task in stale {
            let key = task.key();
            let admission = match self.guard.admit(&key, self.config.lease_ttl).await {
                Ok(admission) => admission,
                Err(e) => {
                    tracing::warn!(task_id = %task.id, error = %e, "Skipping stale task, lease store unavailable");
                    continue;
                }
            };
            if !admission.admitted {
                continue;
            }

            let outcome = self.fail_lost_attempt(&mut task).await;
            if let Some(lease) = admission.lease {
                lease.release().await;
            }
            match outcome {
                Ok(true) => recovered += 1,
                Ok(false) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(recovered)
    }

    /// `in_flight -> failed` for an abandoned attempt, then the retry boundary.
    ///
    /// Returns `false` when another writer moved the task first.
    async fn fail_lost_attempt(&self, task: &mut DeliveryTask) -> Result<bool, DeliveryError> {
        task.fail("worker lost before the attempt finished")?;
        match self.persist(task, TaskStatus::InFlight).await {
            Ok(()) => {}
            Err(DeliveryError::InvalidTransition { .. }) => return Ok(false),
            Err(e) => return Err(e),
        }
        tracing::warn!(
            task_id = %task.id,
            channel = %task.channel,
            attempt = task.attempts,
            "Recovered in-flight task from a lost worker"
        );
        self.after_failure(task.clone()).await?;
        Ok(true)
    }

    async fn persist(&self, task: &DeliveryTask, expected: TaskStatus) -> Result<(), DeliveryError> {
        match self.tasks.update(task, expected).await {
            Ok(()) => {
                if task.status != expected {
                    self.observer.on_transition(task, expected);
                }
                Ok(())
            }
            Err(StoreError::Conflict { task_id, expected }) => {
                Err(DeliveryError::InvalidTransition {
                    task_id,
                    from: expected,
                    to: task.status,
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn push(&self, task: &DeliveryTask, at: DateTime<Utc>) -> Result<(), DeliveryError> {
        self.queue
            .push(task.channel, &task.queue_name, task.id, at)
            .await?;
        Ok(())
    }

    async fn push_after(&self, task: &DeliveryTask, delay: Duration) -> Result<(), DeliveryError> {
        let at = self.clock.now() + chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::MAX);
        self.push(task, at).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_common::clock::ManualClock;
    use courier_common::types::{
        BackoffStrategy, Channel, NotificationPayload, NotificationType, Priority, Recipient,
    };
    use courier_engine::dedup::InMemoryLeaseStore;
    use courier_engine::ratelimit::InMemoryRateLimiter;

    use crate::queue::InMemoryWorkQueue;
    use crate::store::InMemoryTaskStore;
    use crate::transport::MockTransport;

    struct Harness {
        clock: ManualClock,
        leases: Arc<InMemoryLeaseStore>,
        queue: Arc<InMemoryWorkQueue>,
        dispatcher: DeliveryDispatcher,
    }

    fn harness(transport: MockTransport) -> (Harness, Arc<MockTransport>) {
        let clock = ManualClock::default();
        let shared: Arc<dyn Clock> = Arc::new(clock.clone());
        let leases = Arc::new(InMemoryLeaseStore::new(shared.clone()));
        let queue = Arc::new(InMemoryWorkQueue::new(shared.clone(), Duration::from_secs(60)));
        let transport = Arc::new(transport);
        let dispatcher = DeliveryDispatcher::new(
            Arc::new(InMemoryTaskStore::new()),
            queue.clone(),
            DedupGuard::new(leases.clone(), shared.clone()),
            Arc::new(InMemoryRateLimiter::new(shared.clone())),
            TransportRegistry::new().with(transport.clone()),
            shared,
            DispatcherConfig::default(),
        );
        (
            Harness {
                clock,
                leases,
                queue,
                dispatcher,
            },
            transport,
        )
    }

    fn event() -> NotificationEvent {
        NotificationEvent {
            tenant_id: Uuid::new_v4(),
            message_id: "msg-1".to_string(),
            notification_type: NotificationType::OrganizationAnnouncement,
            payload: NotificationPayload {
                recipient: Recipient {
                    webhook_url: Some("https://hooks.example.com/n".to_string()),
                    ..Default::default()
                },
                title: "Maintenance".to_string(),
                body: "Tonight".to_string(),
                ..Default::default()
            },
        }
    }

    fn dispatch(channel: Channel, delay_ms: u64) -> ChannelDispatch {
        ChannelDispatch {
            channel,
            priority: Priority::Normal,
            queue_name: Priority::Normal.queue_name().to_string(),
            delay_ms,
        }
    }

    fn policy(event: &NotificationEvent) -> ChannelPolicy {
        ChannelPolicy::default_for(
            event.tenant_id,
            event.notification_type,
            3,
            BackoffStrategy::Fixed { delay_ms: 1_000 },
        )
    }

    #[tokio::test]
    async fn test_lease_released_after_success() {
        let (h, transport) = harness(MockTransport::new(Channel::Webhook));
        let ev = event();
        let id = h
            .dispatcher
            .enqueue(&ev, &dispatch(Channel::Webhook, 0), &policy(&ev))
            .await
            .unwrap();

        let ack = h.dispatcher.execute(id).await.unwrap();
        assert_eq!(ack.provider_message_id, format!("mock-{}", id));
        assert_eq!(transport.calls(), 1);
        assert_eq!(h.leases.active_count(), 0);

        let task = h.dispatcher.get(id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Succeeded);
        assert_eq!(task.attempts, 1);
    }

    #[tokio::test]
    async fn test_lease_released_after_failure() {
        let (h, _) = harness(
            MockTransport::new(Channel::Webhook)
                .fail_next(TransportError::Transient("503".to_string())),
        );
        let ev = event();
        let id = h
            .dispatcher
            .enqueue(&ev, &dispatch(Channel::Webhook, 0), &policy(&ev))
            .await
            .unwrap();

        assert!(matches!(
            h.dispatcher.execute(id).await,
            Err(DeliveryError::Transport(_))
        ));
        assert_eq!(h.leases.active_count(), 0);

        let task = h.dispatcher.get(id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(
            task.next_retry_at,
            Some(h.clock.now() + chrono::Duration::seconds(1))
        );
    }

    #[tokio::test]
    async fn test_contended_key_is_requeued() {
        let (h, transport) = harness(MockTransport::new(Channel::Webhook));
        let ev = event();
        let id = h
            .dispatcher
            .enqueue(&ev, &dispatch(Channel::Webhook, 0), &policy(&ev))
            .await
            .unwrap();

        let task = h.dispatcher.get(id).await.unwrap();
        let held = h
            .dispatcher
            .guard
            .admit(&task.key(), Duration::from_secs(30))
            .await
            .unwrap();
        assert!(held.admitted);

        assert!(matches!(
            h.dispatcher.execute(id).await,
            Err(DeliveryError::AdmissionRejected { .. })
        ));
        assert_eq!(transport.calls(), 0);
        assert_eq!(
            h.queue.ready_at(Channel::Webhook, "notifications", id),
            Some(h.clock.now() + chrono::Duration::seconds(1))
        );
        assert_eq!(h.dispatcher.get(id).await.unwrap().attempts, 0);
    }

    #[tokio::test]
    async fn test_early_pop_is_pushed_back() {
        let (h, transport) = harness(MockTransport::new(Channel::Webhook));
        let ev = event();
        let id = h
            .dispatcher
            .enqueue(&ev, &dispatch(Channel::Webhook, 2_000), &policy(&ev))
            .await
            .unwrap();

        let result = h.dispatcher.execute(id).await;
        assert!(matches!(
            result,
            Err(DeliveryError::NotDue { retry_in, .. }) if retry_in == Duration::from_secs(2)
        ));
        assert_eq!(transport.calls(), 0);

        h.clock.advance(Duration::from_secs(2));
        assert!(h.dispatcher.execute(id).await.is_ok());
    }

    #[tokio::test]
    async fn test_missing_transport_abandons() {
        let (h, _) = harness(MockTransport::new(Channel::Webhook));
        let ev = event();
        let id = h
            .dispatcher
            .enqueue(&ev, &dispatch(Channel::Sms, 0), &policy(&ev))
            .await
            .unwrap();

        assert!(matches!(
            h.dispatcher.execute(id).await,
            Err(DeliveryError::TransportPermanent(_))
        ));
        assert_eq!(
            h.dispatcher.get(id).await.unwrap().status,
            TaskStatus::Abandoned
        );
    }

    #[tokio::test]
    async fn test_cancel_is_idempotent() {
        let (h, _) = harness(MockTransport::new(Channel::Webhook));
        let ev = event();
        let id = h
            .dispatcher
            .enqueue(&ev, &dispatch(Channel::Webhook, 0), &policy(&ev))
            .await
            .unwrap();

        assert_eq!(
            h.dispatcher.cancel(id).await.unwrap().status,
            TaskStatus::Cancelled
        );
        assert_eq!(
            h.dispatcher.cancel(id).await.unwrap().status,
            TaskStatus::Cancelled
        );
        assert!(matches!(
            h.dispatcher.execute(id).await,
            Err(DeliveryError::Cancelled(_))
        ));
    }

    #[tokio::test]
    async fn test_cancel_succeeded_task_rejected() {
        let (h, _) = harness(MockTransport::new(Channel::Webhook));
        let ev = event();
        let id = h
            .dispatcher
            .enqueue(&ev, &dispatch(Channel::Webhook, 0), &policy(&ev))
            .await
            .unwrap();
        h.dispatcher.execute(id).await.unwrap();

        assert!(matches!(
            h.dispatcher.cancel(id).await,
            Err(DeliveryError::InvalidTransition { .. })
        ));
    }

    /// Task store whose rows never decode.
    struct UnreadableTaskStore;

    #[async_trait::async_trait]
    impl TaskStore for UnreadableTaskStore {
        async fn insert(&self, _task: &DeliveryTask) -> Result<(), StoreError> {
            Ok(())
        }

        async fn get(&self, id: Uuid) -> Result<DeliveryTask, StoreError> {
            Err(StoreError::Corrupt(format!("task {}: unknown channel 'fax'", id)))
        }

        async fn update(&self, _task: &DeliveryTask, _expected: TaskStatus) -> Result<(), StoreError> {
            Ok(())
        }

        async fn list_for_message(
            &self,
            _tenant_id: Uuid,
            _message_id: &str,
        ) -> Result<Vec<DeliveryTask>, StoreError> {
            Ok(Vec::new())
        }

        async fn due_pending(
            &self,
            _now: DateTime<Utc>,
            _limit: usize,
        ) -> Result<Vec<DeliveryTask>, StoreError> {
            Ok(Vec::new())
        }

        async fn stale_in_flight(
            &self,
            _started_before: DateTime<Utc>,
            _limit: usize,
        ) -> Result<Vec<DeliveryTask>, StoreError> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn test_unreadable_task_is_acked() {
        let clock = ManualClock::default();
        let shared: Arc<dyn Clock> = Arc::new(clock.clone());
        let queue = Arc::new(InMemoryWorkQueue::new(shared.clone(), Duration::from_secs(60)));
        let dispatcher = DeliveryDispatcher::new(
            Arc::new(UnreadableTaskStore),
            queue.clone(),
            DedupGuard::new(Arc::new(InMemoryLeaseStore::new(shared.clone())), shared.clone()),
            Arc::new(InMemoryRateLimiter::new(shared.clone())),
            TransportRegistry::new().with(Arc::new(MockTransport::new(Channel::Webhook))),
            shared,
            DispatcherConfig::default(),
        );

        let ev = event();
        dispatcher
            .enqueue(&ev, &dispatch(Channel::Webhook, 0), &policy(&ev))
            .await
            .unwrap();
        let entry = queue
            .pop(Channel::Webhook, &["notifications"])
            .await
            .unwrap()
            .unwrap();

        let err = dispatcher.process(&entry).await.unwrap_err();
        assert!(matches!(err, DeliveryError::Corrupt(_)));

        // Acked, so it does not come back after the visibility timeout
        clock.advance(Duration::from_secs(120));
        assert_eq!(queue.requeue_expired().await.unwrap(), 0);
        assert_eq!(queue.ready_len(Channel::Webhook, "notifications"), 0);
    }

    #[tokio::test]
    async fn test_process_acks_entry() {
        let (h, _) = harness(MockTransport::new(Channel::Webhook));
        let ev = event();
        h.dispatcher
            .enqueue(&ev, &dispatch(Channel::Webhook, 0), &policy(&ev))
            .await
            .unwrap();

        let entry = h
            .queue
            .pop(Channel::Webhook, &["notifications"])
            .await
            .unwrap()
            .unwrap();
        h.dispatcher.process(&entry).await.unwrap();

        h.clock.advance(Duration::from_secs(120));
        assert_eq!(h.queue.requeue_expired().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_reconcile_recovers_lost_entry() {
        let (h, _) = harness(MockTransport::new(Channel::Webhook));
        let ev = event();
        let id = h
            .dispatcher
            .enqueue(&ev, &dispatch(Channel::Webhook, 0), &policy(&ev))
            .await
            .unwrap();

        // Simulate a lost queue entry
        let entry = h
            .queue
            .pop(Channel::Webhook, &["notifications"])
            .await
            .unwrap()
            .unwrap();
        h.queue.ack(&entry).await.unwrap();
        assert_eq!(h.queue.ready_len(Channel::Webhook, "notifications"), 0);

        assert_eq!(h.dispatcher.reconcile(100).await.unwrap(), 1);
        assert!(h.queue.ready_at(Channel::Webhook, "notifications", id).is_some());
    }
}
