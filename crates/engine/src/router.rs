//! Channel router: decides which channels an event goes out on.
//!
//! Routing is a pure function of the event and the tenant's policy:
//! 1. Validate the policy (misconfiguration rejects the whole event)
//! 2. Always include `in_app`, first
//! 3. Add every other channel, in canonical order, that the policy enables,
//!    the event asks for and the payload can actually be delivered on
//! 4. Pick the priority (payload hint, else policy) and map it to a queue

use courier_common::error::DeliveryError;
use courier_common::types::{
    Channel, ChannelDispatch, ChannelPolicy, NotificationEvent, NotificationPayload,
    NotificationType,
};

/// Upper bound on a policy's retry budget.
pub const MAX_RETRY_BUDGET: u32 = 20;

/// Stateless channel router.
pub struct ChannelRouter;

impl ChannelRouter {
    /// Compute the ordered dispatch list for an event.
    pub fn route(
        event: &NotificationEvent,
        policy: &ChannelPolicy,
    ) -> Result<Vec<ChannelDispatch>, DeliveryError> {
        Self::validate_policy(event, policy)?;

        let priority = event.payload.priority.unwrap_or(policy.priority);
        let queue_name = priority.queue_name().to_string();

        let dispatches = Channel::ALL
            .into_iter()
            .filter(|channel| Self::selects(*channel, event, policy))
            .map(|channel| ChannelDispatch {
                channel,
                priority,
                queue_name: queue_name.clone(),
                delay_ms: Self::initial_delay(channel, event.notification_type, policy),
            })
            .collect();

        Ok(dispatches)
    }

    /// Reject policies that cannot drive a delivery.
    pub fn validate_policy(
        event: &NotificationEvent,
        policy: &ChannelPolicy,
    ) -> Result<(), DeliveryError> {
        if policy.tenant_id != event.tenant_id {
            return Err(DeliveryError::Policy(format!(
                "policy belongs to tenant {}, event to tenant {}",
                policy.tenant_id, event.tenant_id
            )));
        }
        if policy.notification_type != event.notification_type {
            return Err(DeliveryError::Policy(format!(
                "policy is for '{}', event is '{}'",
                policy.notification_type, event.notification_type
            )));
        }
        if policy.retry_budget == 0 || policy.retry_budget > MAX_RETRY_BUDGET {
            return Err(DeliveryError::Policy(format!(
                "retry budget {} outside 1..={}",
                policy.retry_budget, MAX_RETRY_BUDGET
            )));
        }
        if !policy.backoff.is_valid() {
            return Err(DeliveryError::Policy(format!(
                "invalid backoff {:?}",
                policy.backoff
            )));
        }
        if let Some(limit) = policy.rate_limit
            && (limit.max == 0 || limit.window_secs == 0)
        {
            return Err(DeliveryError::Policy(format!(
                "rate limit {}/{}s admits nothing",
                limit.max, limit.window_secs
            )));
        }
        Ok(())
    }

    fn selects(channel: Channel, event: &NotificationEvent, policy: &ChannelPolicy) -> bool {
        if channel == Channel::InApp {
            return true;
        }
        let requested =
            event.payload.channels.is_empty() || event.payload.channels.contains(&channel);
        requested && policy.enables(channel) && Self::is_deliverable(channel, &event.payload)
    }

    /// Whether the payload carries what `channel` needs to reach the recipient.
    pub fn is_deliverable(channel: Channel, payload: &NotificationPayload) -> bool {
        let recipient = &payload.recipient;
        let present = |v: &Option<String>| v.as_deref().is_some_and(|s| !s.trim().is_empty());

        match channel {
            Channel::InApp => true,
            Channel::Email => payload.send_email && present(&recipient.email),
            Channel::Webhook => present(&recipient.webhook_url),
            Channel::Sms => present(&recipient.phone),
            Channel::Push => recipient.device_tokens.iter().any(|t| !t.trim().is_empty()),
            Channel::Whatsapp => present(&recipient.phone),
        }
    }

    /// Outbound WhatsApp replies wait out the policy warm-up delay.
    fn initial_delay(
        channel: Channel,
        notification_type: NotificationType,
        policy: &ChannelPolicy,
    ) -> u64 {
        match (channel, notification_type) {
            (Channel::Whatsapp, NotificationType::AgentReply) => policy.warmup_delay_ms,
            _ => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_common::types::{BackoffStrategy, Priority, RateLimit, Recipient};
    use uuid::Uuid;

    fn make_event(notification_type: NotificationType, payload: NotificationPayload) -> NotificationEvent {
        NotificationEvent {
            tenant_id: Uuid::from_u128(7),
            message_id: "msg-1".to_string(),
            notification_type,
            payload,
        }
    }

    fn default_policy(event: &NotificationEvent) -> ChannelPolicy {
        ChannelPolicy::default_for(
            event.tenant_id,
            event.notification_type,
            3,
            BackoffStrategy::default(),
        )
    }

    fn full_recipient() -> Recipient {
        Recipient {
            user_id: Some(Uuid::from_u128(1)),
            email: Some("ops@example.com".to_string()),
            phone: Some("+15550001111".to_string()),
            webhook_url: Some("https://hooks.example.com/n".to_string()),
            device_tokens: vec!["tok-1".to_string()],
            whatsapp_session: Some("support".to_string()),
        }
    }

    fn channels(dispatches: &[ChannelDispatch]) -> Vec<Channel> {
        dispatches.iter().map(|d| d.channel).collect()
    }

    #[test]
    fn test_in_app_and_email_requested() {
        let event = make_event(
            NotificationType::OrganizationAnnouncement,
            NotificationPayload {
                recipient: full_recipient(),
                channels: vec![Channel::InApp, Channel::Email],
                send_email: true,
                ..Default::default()
            },
        );
        let routed = ChannelRouter::route(&event, &default_policy(&event)).unwrap();
        assert_eq!(channels(&routed), vec![Channel::InApp, Channel::Email]);
    }

    #[test]
    fn test_in_app_always_included() {
        let event = make_event(
            NotificationType::OrganizationActivity,
            NotificationPayload {
                channels: vec![Channel::Email],
                ..Default::default()
            },
        );
        let mut policy = default_policy(&event);
        policy.enabled_channels = vec![Channel::Email];

        let routed = ChannelRouter::route(&event, &policy).unwrap();
        assert_eq!(channels(&routed), vec![Channel::InApp]);
    }

    #[test]
    fn test_email_needs_send_email_flag() {
        let event = make_event(
            NotificationType::OrganizationAnnouncement,
            NotificationPayload {
                recipient: full_recipient(),
                channels: vec![Channel::Email],
                send_email: false,
                ..Default::default()
            },
        );
        let routed = ChannelRouter::route(&event, &default_policy(&event)).unwrap();
        assert_eq!(channels(&routed), vec![Channel::InApp]);
    }

    #[test]
    fn test_push_needs_device_tokens() {
        let mut recipient = full_recipient();
        recipient.device_tokens = vec!["  ".to_string()];
        let event = make_event(
            NotificationType::OrganizationAnnouncement,
            NotificationPayload {
                recipient,
                channels: vec![Channel::Push],
                ..Default::default()
            },
        );
        let routed = ChannelRouter::route(&event, &default_policy(&event)).unwrap();
        assert_eq!(channels(&routed), vec![Channel::InApp]);
    }

    #[test]
    fn test_empty_request_uses_every_enabled_deliverable_channel() {
        let event = make_event(
            NotificationType::BillingAlert,
            NotificationPayload {
                recipient: full_recipient(),
                send_email: true,
                ..Default::default()
            },
        );
        let routed = ChannelRouter::route(&event, &default_policy(&event)).unwrap();
        assert_eq!(channels(&routed), Channel::ALL.to_vec());
    }

    #[test]
    fn test_policy_disables_channel() {
        let event = make_event(
            NotificationType::BillingAlert,
            NotificationPayload {
                recipient: full_recipient(),
                send_email: true,
                ..Default::default()
            },
        );
        let mut policy = default_policy(&event);
        policy.enabled_channels = vec![Channel::InApp, Channel::Webhook];

        let routed = ChannelRouter::route(&event, &policy).unwrap();
        assert_eq!(channels(&routed), vec![Channel::InApp, Channel::Webhook]);
    }

    #[test]
    fn test_priority_hint_overrides_policy() {
        let event = make_event(
            NotificationType::BillingAlert,
            NotificationPayload {
                priority: Some(Priority::Urgent),
                ..Default::default()
            },
        );
        let mut policy = default_policy(&event);
        policy.priority = Priority::Low;

        let routed = ChannelRouter::route(&event, &policy).unwrap();
        assert_eq!(routed[0].priority, Priority::Urgent);
        assert_eq!(routed[0].queue_name, "notifications-urgent");
    }

    #[test]
    fn test_policy_priority_when_no_hint() {
        let event = make_event(NotificationType::UserInvited, NotificationPayload::default());
        let mut policy = default_policy(&event);
        policy.priority = Priority::High;

        let routed = ChannelRouter::route(&event, &policy).unwrap();
        assert_eq!(routed[0].queue_name, "notifications-high");
    }

    #[test]
    fn test_whatsapp_reply_gets_warmup_delay() {
        let event = make_event(
            NotificationType::AgentReply,
            NotificationPayload {
                recipient: full_recipient(),
                channels: vec![Channel::Whatsapp],
                ..Default::default()
            },
        );
        let mut policy = default_policy(&event);
        policy.warmup_delay_ms = 2_000;

        let routed = ChannelRouter::route(&event, &policy).unwrap();
        assert_eq!(channels(&routed), vec![Channel::InApp, Channel::Whatsapp]);
        assert_eq!(routed[0].delay_ms, 0);
        assert_eq!(routed[1].delay_ms, 2_000);
    }

    #[test]
    fn test_routing_is_deterministic() {
        let event = make_event(
            NotificationType::BillingAlert,
            NotificationPayload {
                recipient: full_recipient(),
                send_email: true,
                priority: Some(Priority::High),
                ..Default::default()
            },
        );
        let policy = default_policy(&event);
        let first = ChannelRouter::route(&event, &policy).unwrap();
        for _ in 0..10 {
            assert_eq!(ChannelRouter::route(&event, &policy).unwrap(), first);
        }
    }

    #[test]
    fn test_zero_retry_budget_is_policy_error() {
        let event = make_event(NotificationType::UserInvited, NotificationPayload::default());
        let mut policy = default_policy(&event);
        policy.retry_budget = 0;
        assert!(matches!(
            ChannelRouter::route(&event, &policy),
            Err(DeliveryError::Policy(_))
        ));
    }

    #[test]
    fn test_tenant_mismatch_is_policy_error() {
        let event = make_event(NotificationType::UserInvited, NotificationPayload::default());
        let mut policy = default_policy(&event);
        policy.tenant_id = Uuid::from_u128(99);
        assert!(matches!(
            ChannelRouter::route(&event, &policy),
            Err(DeliveryError::Policy(_))
        ));
    }

    #[test]
    fn test_zero_rate_limit_is_policy_error() {
        let event = make_event(NotificationType::UserInvited, NotificationPayload::default());
        let mut policy = default_policy(&event);
        policy.rate_limit = Some(RateLimit {
            max: 0,
            window_secs: 60,
        });
        assert!(ChannelRouter::route(&event, &policy).is_err());
    }
}
