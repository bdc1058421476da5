use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::DeliveryError;

/// Delivery medium for a notification.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, sqlx::Type,
)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "text", rename_all = "snake_case")]
pub enum Channel {
    InApp,
    Email,
    Webhook,
    Sms,
    Push,
    Whatsapp,
}

impl Channel {
    /// Canonical routing order. `InApp` is always first.
    pub const ALL: [Channel; 6] = [
        Channel::InApp,
        Channel::Email,
        Channel::Webhook,
        Channel::Sms,
        Channel::Push,
        Channel::Whatsapp,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::InApp => "in_app",
            Channel::Email => "email",
            Channel::Webhook => "webhook",
            Channel::Sms => "sms",
            Channel::Push => "push",
            Channel::Whatsapp => "whatsapp",
        }
    }

    /// Channels where a duplicate send is worse than a delayed one.
    ///
    /// Admission for these fails closed when the lease store is unreachable;
    /// every other channel fails open.
    pub fn is_idempotency_sensitive(&self) -> bool {
        matches!(self, Channel::Whatsapp | Channel::Sms)
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Channel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Channel::ALL
            .into_iter()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| format!("unknown channel '{}'", s))
    }
}

/// Delivery priority. Each level maps onto a fixed queue name.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    sqlx::Type,
)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "text", rename_all = "lowercase")]
pub enum Priority {
    Urgent,
    High,
    #[default]
    Normal,
    Low,
}

impl Priority {
    /// Dequeue order: workers drain urgent before high before normal before low.
    pub const DEQUEUE_ORDER: [Priority; 4] =
        [Priority::Urgent, Priority::High, Priority::Normal, Priority::Low];

    pub fn queue_name(&self) -> &'static str {
        match self {
            Priority::Urgent => "notifications-urgent",
            Priority::High => "notifications-high",
            Priority::Normal => "notifications",
            Priority::Low => "notifications-low",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Urgent => "urgent",
            Priority::High => "high",
            Priority::Normal => "normal",
            Priority::Low => "low",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Priority::DEQUEUE_ORDER
            .into_iter()
            .find(|p| p.as_str() == s)
            .ok_or_else(|| format!("unknown priority '{}'", s))
    }
}

/// Kind of notification an upstream event produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "text", rename_all = "snake_case")]
pub enum NotificationType {
    AgentReply,
    CustomerMessage,
    OrganizationActivity,
    OrganizationAnnouncement,
    UserInvited,
    BillingAlert,
}

impl NotificationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationType::AgentReply => "agent_reply",
            NotificationType::CustomerMessage => "customer_message",
            NotificationType::OrganizationActivity => "organization_activity",
            NotificationType::OrganizationAnnouncement => "organization_announcement",
            NotificationType::UserInvited => "user_invited",
            NotificationType::BillingAlert => "billing_alert",
        }
    }
}

impl fmt::Display for NotificationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle status of a delivery task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "text", rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InFlight,
    Succeeded,
    Failed,
    Abandoned,
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::InFlight => "in_flight",
            TaskStatus::Succeeded => "succeeded",
            TaskStatus::Failed => "failed",
            TaskStatus::Abandoned => "abandoned",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Succeeded | TaskStatus::Abandoned | TaskStatus::Cancelled
        )
    }

    /// Whether `self -> next` is an allowed edge of the task state machine.
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, next),
            (Pending, InFlight)
                | (Pending, Cancelled)
                | (InFlight, Succeeded)
                | (InFlight, Failed)
                | (InFlight, Abandoned)
                | (Failed, Pending)
                | (Failed, Abandoned)
                | (Failed, Cancelled)
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        use TaskStatus::*;
        [Pending, InFlight, Succeeded, Failed, Abandoned, Cancelled]
            .into_iter()
            .find(|st| st.as_str() == s)
            .ok_or_else(|| format!("unknown task status '{}'", s))
    }
}

/// Identity of one (tenant, message, channel) delivery generation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeliveryKey {
    pub tenant_id: Uuid,
    pub message_id: String,
    pub channel: Channel,
    /// Resend generation of the message; 0 for the first send.
    pub generation: u32,
}

impl DeliveryKey {
    pub fn new(tenant_id: Uuid, message_id: impl Into<String>, channel: Channel) -> Self {
        Self {
            tenant_id,
            message_id: message_id.into(),
            channel,
            generation: 0,
        }
    }

    pub fn with_generation(mut self, generation: u32) -> Self {
        self.generation = generation;
        self
    }
}

impl fmt::Display for DeliveryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}:{}",
            self.tenant_id, self.message_id, self.channel, self.generation
        )
    }
}

/// Who a notification is addressed to. Each channel reads the fields it needs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Recipient {
    #[serde(default)]
    pub user_id: Option<Uuid>,
    #[serde(default)]
    pub email: Option<String>,
    /// E.164 phone number, used by SMS and WhatsApp.
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub webhook_url: Option<String>,
    #[serde(default)]
    pub device_tokens: Vec<String>,
    /// WAHA session name the WhatsApp reply goes out through.
    #[serde(default)]
    pub whatsapp_session: Option<String>,
}

/// Content and routing hints carried by a notification event.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NotificationPayload {
    #[serde(default)]
    pub recipient: Recipient,
    pub title: String,
    pub body: String,
    /// Channels the producer asked for. Empty means "whatever the policy enables".
    #[serde(default)]
    pub channels: Vec<Channel>,
    #[serde(default)]
    pub send_email: bool,
    #[serde(default)]
    pub priority: Option<Priority>,
    #[serde(default)]
    pub resend_generation: u32,
    #[serde(default)]
    pub data: serde_json::Value,
}

/// Notification emitted by upstream domain logic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationEvent {
    pub tenant_id: Uuid,
    pub message_id: String,
    pub notification_type: NotificationType,
    pub payload: NotificationPayload,
}

/// Fixed-window send limit for one tenant on one channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimit {
    pub max: u32,
    pub window_secs: u64,
}

/// Delay schedule between delivery attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackoffStrategy {
    Fixed { delay_ms: u64 },
    Exponential { base_ms: u64, max_ms: u64 },
}

impl BackoffStrategy {
    /// Delay before the retry that follows failed attempt number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        match *self {
            BackoffStrategy::Fixed { delay_ms } => Duration::from_millis(delay_ms),
            BackoffStrategy::Exponential { base_ms, max_ms } => {
                let exp = attempt.saturating_sub(1).min(31);
                let delay = base_ms.saturating_mul(1u64 << exp);
                Duration::from_millis(delay.min(max_ms))
            }
        }
    }

    pub fn is_valid(&self) -> bool {
        match *self {
            BackoffStrategy::Fixed { .. } => true,
            BackoffStrategy::Exponential { base_ms, max_ms } => base_ms > 0 && max_ms >= base_ms,
        }
    }
}

impl Default for BackoffStrategy {
    fn default() -> Self {
        BackoffStrategy::Exponential {
            base_ms: 1_000,
            max_ms: 60_000,
        }
    }
}

/// Per-tenant, per-notification-type channel configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelPolicy {
    pub tenant_id: Uuid,
    pub notification_type: NotificationType,
    pub enabled_channels: Vec<Channel>,
    pub priority: Priority,
    pub retry_budget: u32,
    pub backoff: BackoffStrategy,
    pub rate_limit: Option<RateLimit>,
    /// Delay applied to outbound WhatsApp replies before they are sent.
    pub warmup_delay_ms: u64,
}

impl ChannelPolicy {
    /// Policy used when a tenant has not configured one: every channel enabled.
    pub fn default_for(
        tenant_id: Uuid,
        notification_type: NotificationType,
        retry_budget: u32,
        backoff: BackoffStrategy,
    ) -> Self {
        Self {
            tenant_id,
            notification_type,
            enabled_channels: Channel::ALL.to_vec(),
            priority: Priority::Normal,
            retry_budget,
            backoff,
            rate_limit: None,
            warmup_delay_ms: 0,
        }
    }

    pub fn enables(&self, channel: Channel) -> bool {
        self.enabled_channels.contains(&channel)
    }
}

/// One routed channel for an event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelDispatch {
    pub channel: Channel,
    pub priority: Priority,
    pub queue_name: String,
    /// Delay before the first attempt may run.
    pub delay_ms: u64,
}

/// Successful delivery receipt from a transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ack {
    pub provider_message_id: String,
    pub delivered_at: DateTime<Utc>,
}

/// One channel delivery of one notification.
///
/// Fields are public for reads; status changes go through the transition
/// methods, which reject edges the state machine does not allow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryTask {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub message_id: String,
    pub generation: u32,
    pub channel: Channel,
    pub notification_type: NotificationType,
    pub payload: NotificationPayload,
    pub priority: Priority,
    pub queue_name: String,
    pub attempts: u32,
    pub max_attempts: u32,
    pub backoff: BackoffStrategy,
    pub rate_limit: Option<RateLimit>,
    pub status: TaskStatus,
    pub last_error: Option<String>,
    pub provider_message_id: Option<String>,
    pub cancel_requested: bool,
    pub created_at: DateTime<Utc>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl DeliveryTask {
    /// Build a pending task for one routed channel of an event.
    pub fn new(
        event: &NotificationEvent,
        dispatch: &ChannelDispatch,
        policy: &ChannelPolicy,
        now: DateTime<Utc>,
    ) -> Self {
        let next_retry_at = (dispatch.delay_ms > 0)
            .then(|| now + chrono::Duration::milliseconds(dispatch.delay_ms as i64));

        Self {
            id: Uuid::new_v4(),
            tenant_id: event.tenant_id,
            message_id: event.message_id.clone(),
            generation: event.payload.resend_generation,
            channel: dispatch.channel,
            notification_type: event.notification_type,
            payload: event.payload.clone(),
            priority: dispatch.priority,
            queue_name: dispatch.queue_name.clone(),
            attempts: 0,
            max_attempts: policy.retry_budget,
            backoff: policy.backoff,
            rate_limit: policy.rate_limit,
            status: TaskStatus::Pending,
            last_error: None,
            provider_message_id: None,
            cancel_requested: false,
            created_at: now,
            last_attempt_at: None,
            next_retry_at,
            completed_at: None,
        }
    }

    pub fn key(&self) -> DeliveryKey {
        DeliveryKey::new(self.tenant_id, self.message_id.clone(), self.channel)
            .with_generation(self.generation)
    }

    pub fn retries_exhausted(&self) -> bool {
        self.attempts >= self.max_attempts
    }

    fn transition(&mut self, next: TaskStatus) -> Result<TaskStatus, DeliveryError> {
        if !self.status.can_transition_to(next) {
            return Err(DeliveryError::InvalidTransition {
                task_id: self.id,
                from: self.status,
                to: next,
            });
        }
        let previous = self.status;
        self.status = next;
        Ok(previous)
    }

    /// pending -> in_flight. Counts the attempt.
    pub fn begin_attempt(&mut self, now: DateTime<Utc>) -> Result<(), DeliveryError> {
        self.transition(TaskStatus::InFlight)?;
        self.attempts += 1;
        self.last_attempt_at = Some(now);
        self.next_retry_at = None;
        Ok(())
    }

    /// in_flight -> succeeded.
    pub fn succeed(&mut self, ack: &Ack, now: DateTime<Utc>) -> Result<(), DeliveryError> {
        self.transition(TaskStatus::Succeeded)?;
        self.provider_message_id = Some(ack.provider_message_id.clone());
        self.last_error = None;
        self.completed_at = Some(now);
        Ok(())
    }

    /// in_flight -> failed.
    pub fn fail(&mut self, error: impl Into<String>) -> Result<(), DeliveryError> {
        self.transition(TaskStatus::Failed)?;
        self.last_error = Some(error.into());
        Ok(())
    }

    /// failed -> pending, eligible again at `at`.
    pub fn schedule_retry(&mut self, at: DateTime<Utc>) -> Result<(), DeliveryError> {
        self.transition(TaskStatus::Pending)?;
        self.next_retry_at = Some(at);
        Ok(())
    }

    /// in_flight | failed -> abandoned. Terminal.
    pub fn abandon(&mut self, error: impl Into<String>, now: DateTime<Utc>) -> Result<(), DeliveryError> {
        self.transition(TaskStatus::Abandoned)?;
        self.last_error = Some(error.into());
        self.completed_at = Some(now);
        Ok(())
    }

    /// Cancel the task.
    ///
    /// Pending and failed tasks become `cancelled` immediately and this returns
    /// `true`. An in-flight task only records the request; the worker honours it
    /// at the next retry boundary and this returns `false`.
    pub fn cancel(&mut self, now: DateTime<Utc>) -> Result<bool, DeliveryError> {
        if self.status == TaskStatus::InFlight {
            self.cancel_requested = true;
            return Ok(false);
        }
        self.transition(TaskStatus::Cancelled)?;
        self.cancel_requested = true;
        self.completed_at = Some(now);
        Ok(true)
    }

    /// Whether the task may run at `now` (pending and past any retry delay).
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == TaskStatus::Pending && self.next_retry_at.is_none_or(|at| at <= now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_task() -> DeliveryTask {
        let event = NotificationEvent {
            tenant_id: Uuid::new_v4(),
            message_id: "msg-1".to_string(),
            notification_type: NotificationType::AgentReply,
            payload: NotificationPayload {
                title: "Reply".to_string(),
                body: "Hello".to_string(),
                ..Default::default()
            },
        };
        let policy = ChannelPolicy::default_for(
            event.tenant_id,
            event.notification_type,
            3,
            BackoffStrategy::default(),
        );
        let dispatch = ChannelDispatch {
            channel: Channel::Email,
            priority: Priority::Normal,
            queue_name: Priority::Normal.queue_name().to_string(),
            delay_ms: 0,
        };
        DeliveryTask::new(&event, &dispatch, &policy, Utc::now())
    }

    #[test]
    fn test_queue_name_table() {
        assert_eq!(Priority::Urgent.queue_name(), "notifications-urgent");
        assert_eq!(Priority::High.queue_name(), "notifications-high");
        assert_eq!(Priority::Normal.queue_name(), "notifications");
        assert_eq!(Priority::Low.queue_name(), "notifications-low");
    }

    #[test]
    fn test_channel_round_trips_through_str() {
        for channel in Channel::ALL {
            assert_eq!(channel.as_str().parse::<Channel>().unwrap(), channel);
        }
        assert!("fax".parse::<Channel>().is_err());
    }

    #[test]
    fn test_channel_serde_names() {
        let json = serde_json::to_string(&Channel::InApp).unwrap();
        assert_eq!(json, "\"in_app\"");
        let parsed: Channel = serde_json::from_str("\"whatsapp\"").unwrap();
        assert_eq!(parsed, Channel::Whatsapp);
    }

    #[test]
    fn test_fail_closed_channels() {
        assert!(Channel::Whatsapp.is_idempotency_sensitive());
        assert!(Channel::Sms.is_idempotency_sensitive());
        assert!(!Channel::InApp.is_idempotency_sensitive());
        assert!(!Channel::Email.is_idempotency_sensitive());
    }

    #[test]
    fn test_exponential_backoff_caps() {
        let backoff = BackoffStrategy::Exponential {
            base_ms: 100,
            max_ms: 1_000,
        };
        assert_eq!(backoff.delay_for(1), Duration::from_millis(100));
        assert_eq!(backoff.delay_for(2), Duration::from_millis(200));
        assert_eq!(backoff.delay_for(3), Duration::from_millis(400));
        assert_eq!(backoff.delay_for(10), Duration::from_millis(1_000));
        assert_eq!(backoff.delay_for(200), Duration::from_millis(1_000));
    }

    #[test]
    fn test_fixed_backoff() {
        let backoff = BackoffStrategy::Fixed { delay_ms: 250 };
        assert_eq!(backoff.delay_for(1), backoff.delay_for(5));
    }

    #[test]
    fn test_delivery_key_display() {
        let tenant = Uuid::nil();
        let key = DeliveryKey::new(tenant, "m-9", Channel::Whatsapp).with_generation(2);
        assert_eq!(
            key.to_string(),
            "00000000-0000-0000-0000-000000000000:m-9:whatsapp:2"
        );
    }

    #[test]
    fn test_happy_path_transitions() {
        let mut task = make_task();
        let now = Utc::now();
        task.begin_attempt(now).unwrap();
        assert_eq!(task.status, TaskStatus::InFlight);
        assert_eq!(task.attempts, 1);

        let ack = Ack {
            provider_message_id: "p-1".to_string(),
            delivered_at: now,
        };
        task.succeed(&ack, now).unwrap();
        assert_eq!(task.status, TaskStatus::Succeeded);
        assert_eq!(task.provider_message_id.as_deref(), Some("p-1"));
    }

    #[test]
    fn test_retry_cycle() {
        let mut task = make_task();
        let now = Utc::now();
        task.begin_attempt(now).unwrap();
        task.fail("timeout").unwrap();
        task.schedule_retry(now + chrono::Duration::seconds(1)).unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert!(!task.is_due(now));
        assert!(task.is_due(now + chrono::Duration::seconds(1)));
    }

    #[test]
    fn test_terminal_states_reject_transitions() {
        let mut task = make_task();
        let now = Utc::now();
        task.begin_attempt(now).unwrap();
        task.abandon("invalid address", now).unwrap();
        assert!(task.begin_attempt(now).is_err());
        assert!(task.cancel(now).is_err());
        assert!(task.status.is_terminal());
    }

    #[test]
    fn test_cancel_pending_is_immediate() {
        let mut task = make_task();
        assert!(task.cancel(Utc::now()).unwrap());
        assert_eq!(task.status, TaskStatus::Cancelled);
    }

    #[test]
    fn test_cancel_in_flight_is_deferred() {
        let mut task = make_task();
        task.begin_attempt(Utc::now()).unwrap();
        assert!(!task.cancel(Utc::now()).unwrap());
        assert_eq!(task.status, TaskStatus::InFlight);
        assert!(task.cancel_requested);
    }

    #[test]
    fn test_warmup_delay_sets_first_eligibility() {
        let event = NotificationEvent {
            tenant_id: Uuid::new_v4(),
            message_id: "m".to_string(),
            notification_type: NotificationType::AgentReply,
            payload: NotificationPayload::default(),
        };
        let policy = ChannelPolicy::default_for(
            event.tenant_id,
            event.notification_type,
            3,
            BackoffStrategy::default(),
        );
        let dispatch = ChannelDispatch {
            channel: Channel::Whatsapp,
            priority: Priority::High,
            queue_name: Priority::High.queue_name().to_string(),
            delay_ms: 1_500,
        };
        let now = Utc::now();
        let task = DeliveryTask::new(&event, &dispatch, &policy, now);
        assert!(!task.is_due(now));
        assert!(task.is_due(now + chrono::Duration::milliseconds(1_500)));
    }
}
