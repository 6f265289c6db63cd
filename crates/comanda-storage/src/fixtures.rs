//! Sample records for tests and local dry runs

use crate::models::{
    AutomationRule, Channel, ChannelCredentials, Customer, CustomerVisit, DeliveryPreference,
    MessageTemplate, RuleAction, ScheduledMessage, ScheduledMessageStatus, Segment, Tenant,
};
use chrono::{DateTime, Utc};
use comanda_common::types::{CustomerId, TemplateId, TenantId};
use serde_json::json;
use sqlx::types::Json;
use std::collections::BTreeMap;
use uuid::Uuid;

/// Active tenant on UTC
pub fn tenant(name: &str) -> Tenant {
    let now = Utc::now();
    Tenant {
        id: Uuid::now_v7(),
        name: name.to_string(),
        active: true,
        utc_offset_minutes: 0,
        created_at: now,
        updated_at: now,
    }
}

/// Reachable customer: both consents, phone and email, notifications on
pub fn customer(tenant_id: TenantId, first_name: &str) -> Customer {
    let now = Utc::now();
    Customer {
        id: Uuid::now_v7(),
        tenant_id,
        first_name: first_name.to_string(),
        last_name: None,
        phone: Some("+5491155550000".to_string()),
        email: Some(format!("{}@example.com", first_name.to_lowercase())),
        whatsapp_consent: true,
        email_consent: true,
        notifications_enabled: true,
        total_visits: 0,
        total_spent: 0.0,
        last_visit_at: None,
        churn_risk_score: None,
        segment: Segment::New,
        preferred_channel: None,
        created_at: now,
        updated_at: now,
    }
}

pub fn visit(
    tenant_id: TenantId,
    customer_id: CustomerId,
    amount: f64,
    visited_at: DateTime<Utc>,
) -> CustomerVisit {
    CustomerVisit {
        id: Uuid::now_v7(),
        tenant_id,
        customer_id,
        amount,
        visited_at,
    }
}

pub fn template(tenant_id: TenantId, channel: Channel, body: &str) -> MessageTemplate {
    let now = Utc::now();
    MessageTemplate {
        id: Uuid::now_v7(),
        tenant_id,
        name: "sample".to_string(),
        channel,
        subject: None,
        body: body.to_string(),
        send_delay_hours: 0,
        variables: Vec::new(),
        provider_template_id: None,
        created_at: now,
        updated_at: now,
    }
}

/// Periodic action without rule-specific thresholds
pub fn periodic(preferred_channel: Channel) -> RuleAction {
    RuleAction::PeriodicCheck {
        delivery: DeliveryPreference {
            preferred_channel,
            fallback_to_email: false,
        },
        min_days_inactive: None,
        min_visits: None,
    }
}

/// Active rule open all day every day, cooldown 7, one execution per customer
pub fn rule(
    tenant_id: TenantId,
    template_id: TemplateId,
    target_segment: Segment,
    action: RuleAction,
) -> AutomationRule {
    let now = Utc::now();
    AutomationRule {
        id: Uuid::now_v7(),
        tenant_id,
        name: "sample rule".to_string(),
        target_segment,
        action_config: Json(action),
        template_id,
        cooldown_days: 7,
        max_executions_per_customer: 1,
        max_daily_executions: 100,
        execution_hours_start: 0,
        execution_hours_end: 23,
        execution_days_of_week: (1..=7).collect(),
        active: true,
        execution_count: 0,
        last_executed_at: None,
        created_at: now,
        updated_at: now,
    }
}

/// Planned message for the pair, created and due at `at`
pub fn scheduled_message(
    customer: &Customer,
    rule: &AutomationRule,
    at: DateTime<Utc>,
) -> ScheduledMessage {
    ScheduledMessage {
        id: Uuid::now_v7(),
        tenant_id: customer.tenant_id,
        customer_id: customer.id,
        rule_id: rule.id,
        template_id: rule.template_id,
        scheduled_for: at,
        channel_planned: rule.delivery().preferred_channel,
        channel_final: None,
        subject: None,
        body: format!("Hola {}", customer.first_name),
        variables: Json(BTreeMap::new()),
        previous_segment: None,
        status: ScheduledMessageStatus::Planned,
        retry_count: 0,
        last_error: None,
        provider_message_id: None,
        provider_response: None,
        created_at: at,
        updated_at: at,
        last_attempted_at: None,
        sent_at: None,
        delivered_at: None,
        failed_at: None,
    }
}

/// Message already sent at `sent_at`
pub fn sent_message(
    customer: &Customer,
    rule: &AutomationRule,
    sent_at: DateTime<Utc>,
) -> ScheduledMessage {
    let mut message = scheduled_message(customer, rule, sent_at);
    message.status = ScheduledMessageStatus::Sent;
    message.channel_final = Some(message.channel_planned);
    message.provider_message_id = Some(format!("SM{}", message.id.simple()));
    message.sent_at = Some(sent_at);
    message
}

pub fn whatsapp_credentials(tenant_id: TenantId, api_base: &str) -> ChannelCredentials {
    let now = Utc::now();
    ChannelCredentials {
        tenant_id,
        channel: Channel::Whatsapp,
        config: json!({
            "account_sid": "AC0000",
            "auth_token": "token",
            "from_number": "+14155238886",
            "api_base": api_base,
        }),
        active: true,
        created_at: now,
        updated_at: now,
    }
}

pub fn email_credentials(tenant_id: TenantId) -> ChannelCredentials {
    let now = Utc::now();
    ChannelCredentials {
        tenant_id,
        channel: Channel::Email,
        config: json!({
            "host": "smtp.example.com",
            "port": 587,
            "from_address": "hola@example.com",
            "from_name": "Casa Lucía",
        }),
        active: true,
        created_at: now,
        updated_at: now,
    }
}
