//! Domain event translation.
//!
//! Upstream domain logic emits typed events. Each variant is bound to exactly
//! one handler that turns it into a `NotificationEvent` with recipient,
//! requested channels and content filled in.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use courier_common::types::{
    Channel, NotificationEvent, NotificationPayload, NotificationType, Priority, Recipient,
};

/// An agent answered a customer conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentReplied {
    pub tenant_id: Uuid,
    pub message_id: String,
    pub conversation_id: Uuid,
    pub agent_name: String,
    pub customer_phone: String,
    #[serde(default)]
    pub whatsapp_session: Option<String>,
    pub text: String,
}

/// A customer wrote into a conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomerMessageReceived {
    pub tenant_id: Uuid,
    pub message_id: String,
    pub conversation_id: Uuid,
    pub customer_name: String,
    #[serde(default)]
    pub assigned_agent_id: Option<Uuid>,
    #[serde(default)]
    pub agent_device_tokens: Vec<String>,
    pub preview: String,
}

/// Something happened inside an organization (member added, role changed...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrganizationActivity {
    pub tenant_id: Uuid,
    pub activity_id: String,
    pub actor_name: String,
    pub action: String,
    pub description: String,
    #[serde(default)]
    pub webhook_url: Option<String>,
}

/// Broadcast from organization admins to members.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrganizationAnnouncement {
    pub tenant_id: Uuid,
    pub announcement_id: String,
    pub title: String,
    pub body: String,
    #[serde(default)]
    pub recipient_user_id: Option<Uuid>,
    #[serde(default)]
    pub recipient_email: Option<String>,
    #[serde(default)]
    pub send_email: bool,
    #[serde(default)]
    pub device_tokens: Vec<String>,
    #[serde(default)]
    pub priority: Option<Priority>,
}

/// A user was invited to join an organization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserInvited {
    pub tenant_id: Uuid,
    pub invitation_id: String,
    pub email: String,
    pub organization_name: String,
    pub inviter_name: String,
    pub accept_url: String,
}

/// Billing threshold crossed or payment failed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BillingAlert {
    pub tenant_id: Uuid,
    pub alert_id: String,
    pub billing_email: String,
    #[serde(default)]
    pub webhook_url: Option<String>,
    pub description: String,
    pub amount_due_cents: i64,
    pub currency: String,
}

/// Every event the intake accepts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DomainEvent {
    AgentReplied(AgentReplied),
    CustomerMessageReceived(CustomerMessageReceived),
    OrganizationActivity(OrganizationActivity),
    OrganizationAnnouncement(OrganizationAnnouncement),
    UserInvited(UserInvited),
    BillingAlert(BillingAlert),
}

impl DomainEvent {
    pub fn notification_type(&self) -> NotificationType {
        match self {
            DomainEvent::AgentReplied(_) => NotificationType::AgentReply,
            DomainEvent::CustomerMessageReceived(_) => NotificationType::CustomerMessage,
            DomainEvent::OrganizationActivity(_) => NotificationType::OrganizationActivity,
            DomainEvent::OrganizationAnnouncement(_) => NotificationType::OrganizationAnnouncement,
            DomainEvent::UserInvited(_) => NotificationType::UserInvited,
            DomainEvent::BillingAlert(_) => NotificationType::BillingAlert,
        }
    }

    /// Translate into a notification event.
    pub fn translate(&self) -> NotificationEvent {
        match self {
            DomainEvent::AgentReplied(e) => agent_replied(e),
            DomainEvent::CustomerMessageReceived(e) => customer_message(e),
            DomainEvent::OrganizationActivity(e) => organization_activity(e),
            DomainEvent::OrganizationAnnouncement(e) => organization_announcement(e),
            DomainEvent::UserInvited(e) => user_invited(e),
            DomainEvent::BillingAlert(e) => billing_alert(e),
        }
    }
}

fn agent_replied(e: &AgentReplied) -> NotificationEvent {
    NotificationEvent {
        tenant_id: e.tenant_id,
        message_id: e.message_id.clone(),
        notification_type: NotificationType::AgentReply,
        payload: NotificationPayload {
            recipient: Recipient {
                phone: Some(e.customer_phone.clone()),
                whatsapp_session: e.whatsapp_session.clone(),
                ..Default::default()
            },
            title: format!("Reply from {}", e.agent_name),
            body: e.text.clone(),
            channels: vec![Channel::InApp, Channel::Whatsapp],
            data: serde_json::json!({ "conversation_id": e.conversation_id }),
            ..Default::default()
        },
    }
}

fn customer_message(e: &CustomerMessageReceived) -> NotificationEvent {
    NotificationEvent {
        tenant_id: e.tenant_id,
        message_id: e.message_id.clone(),
        notification_type: NotificationType::CustomerMessage,
        payload: NotificationPayload {
            recipient: Recipient {
                user_id: e.assigned_agent_id,
                device_tokens: e.agent_device_tokens.clone(),
                ..Default::default()
            },
            title: format!("New message from {}", e.customer_name),
            body: e.preview.clone(),
            channels: vec![Channel::InApp, Channel::Push],
            priority: Some(Priority::High),
            data: serde_json::json!({ "conversation_id": e.conversation_id }),
            ..Default::default()
        },
    }
}

fn organization_activity(e: &OrganizationActivity) -> NotificationEvent {
    NotificationEvent {
        tenant_id: e.tenant_id,
        message_id: e.activity_id.clone(),
        notification_type: NotificationType::OrganizationActivity,
        payload: NotificationPayload {
            recipient: Recipient {
                webhook_url: e.webhook_url.clone(),
                ..Default::default()
            },
            title: format!("{} {}", e.actor_name, e.action),
            body: e.description.clone(),
            channels: vec![Channel::InApp, Channel::Webhook],
            priority: Some(Priority::Low),
            data: serde_json::json!({ "action": e.action, "actor": e.actor_name }),
            ..Default::default()
        },
    }
}

fn organization_announcement(e: &OrganizationAnnouncement) -> NotificationEvent {
    NotificationEvent {
        tenant_id: e.tenant_id,
        message_id: e.announcement_id.clone(),
        notification_type: NotificationType::OrganizationAnnouncement,
        payload: NotificationPayload {
            recipient: Recipient {
                user_id: e.recipient_user_id,
                email: e.recipient_email.clone(),
                device_tokens: e.device_tokens.clone(),
                ..Default::default()
            },
            title: e.title.clone(),
            body: e.body.clone(),
            channels: vec![Channel::InApp, Channel::Email, Channel::Push],
            send_email: e.send_email,
            priority: e.priority,
            ..Default::default()
        },
    }
}

fn user_invited(e: &UserInvited) -> NotificationEvent {
    NotificationEvent {
        tenant_id: e.tenant_id,
        message_id: e.invitation_id.clone(),
        notification_type: NotificationType::UserInvited,
        payload: NotificationPayload {
            recipient: Recipient {
                email: Some(e.email.clone()),
                ..Default::default()
            },
            title: format!("You're invited to join {}", e.organization_name),
            body: format!(
                "{} invited you to {}. Accept the invitation: {}",
                e.inviter_name, e.organization_name, e.accept_url
            ),
            channels: vec![Channel::InApp, Channel::Email],
            send_email: true,
            data: serde_json::json!({ "accept_url": e.accept_url }),
            ..Default::default()
        },
    }
}

fn billing_alert(e: &BillingAlert) -> NotificationEvent {
    let amount = format!(
        "{}.{:02} {}",
        e.amount_due_cents / 100,
        (e.amount_due_cents % 100).abs(),
        e.currency.to_uppercase()
    );
    NotificationEvent {
        tenant_id: e.tenant_id,
        message_id: e.alert_id.clone(),
        notification_type: NotificationType::BillingAlert,
        payload: NotificationPayload {
            recipient: Recipient {
                email: Some(e.billing_email.clone()),
                webhook_url: e.webhook_url.clone(),
                ..Default::default()
            },
            title: "Billing alert".to_string(),
            body: format!("{} (amount due: {})", e.description, amount),
            channels: vec![Channel::InApp, Channel::Email, Channel::Webhook],
            send_email: true,
            data: serde_json::json!({
                "amount_due_cents": e.amount_due_cents,
                "currency": e.currency,
            }),
            ..Default::default()
        },
    }
}
