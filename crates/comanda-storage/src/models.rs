//! Database models

use chrono::{DateTime, FixedOffset, Offset, Utc};
use comanda_common::types::{
    CustomerId, InteractionLogId, RuleId, ScheduledMessageId, TemplateId, TenantId,
};
use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use sqlx::FromRow;
use std::collections::BTreeMap;

/// Customer lifecycle segment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "text", rename_all = "snake_case")]
pub enum Segment {
    New,
    Regular,
    Vip,
    AtRisk,
    Inactive,
}

impl Segment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Segment::New => "new",
            Segment::Regular => "regular",
            Segment::Vip => "vip",
            Segment::AtRisk => "at_risk",
            Segment::Inactive => "inactive",
        }
    }
}

impl std::fmt::Display for Segment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Segment {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "new" => Ok(Segment::New),
            "regular" => Ok(Segment::Regular),
            "vip" => Ok(Segment::Vip),
            "at_risk" => Ok(Segment::AtRisk),
            "inactive" => Ok(Segment::Inactive),
            _ => Err(format!("Invalid segment: {}", s)),
        }
    }
}

/// Delivery channel
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, sqlx::Type,
)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "text", rename_all = "snake_case")]
pub enum Channel {
    Whatsapp,
    Email,
}

impl Channel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Whatsapp => "whatsapp",
            Channel::Email => "email",
        }
    }
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Channel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "whatsapp" => Ok(Channel::Whatsapp),
            "email" => Ok(Channel::Email),
            _ => Err(format!("Invalid channel: {}", s)),
        }
    }
}

/// Tenant model (one restaurant account)
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Tenant {
    pub id: TenantId,
    pub name: String,
    pub active: bool,
    pub utc_offset_minutes: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Tenant {
    /// Fixed offset used for local hours, weekdays and calendar days.
    /// Out-of-range offsets fall back to UTC.
    pub fn offset(&self) -> FixedOffset {
        FixedOffset::east_opt(self.utc_offset_minutes * 60).unwrap_or_else(|| Utc.fix())
    }
}

/// Customer model
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Customer {
    pub id: CustomerId,
    pub tenant_id: TenantId,
    pub first_name: String,
    pub last_name: Option<String>,
    pub phone: Option<String>,
    pub email: Option<String>,
    pub whatsapp_consent: bool,
    pub email_consent: bool,
    pub notifications_enabled: bool,
    pub total_visits: i32,
    pub total_spent: f64,
    pub last_visit_at: Option<DateTime<Utc>>,
    pub churn_risk_score: Option<f64>,
    pub segment: Segment,
    pub preferred_channel: Option<Channel>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Customer {
    /// First and last name joined
    pub fn full_name(&self) -> String {
        match self.last_name.as_deref().map(str::trim) {
            Some(last) if !last.is_empty() => format!("{} {}", self.first_name, last),
            _ => self.first_name.clone(),
        }
    }

    pub fn has_phone(&self) -> bool {
        self.phone.as_deref().is_some_and(|p| !p.trim().is_empty())
    }

    pub fn has_email(&self) -> bool {
        self.email.as_deref().is_some_and(|e| !e.trim().is_empty())
    }

    /// Consent flag for a channel
    pub fn has_consent(&self, channel: Channel) -> bool {
        match channel {
            Channel::Whatsapp => self.whatsapp_consent,
            Channel::Email => self.email_consent,
        }
    }

    /// Contact data for a channel
    pub fn has_contact(&self, channel: Channel) -> bool {
        match channel {
            Channel::Whatsapp => self.has_phone(),
            Channel::Email => self.has_email(),
        }
    }

    /// Destination address for a channel, if present
    pub fn address_for(&self, channel: Channel) -> Option<&str> {
        let value = match channel {
            Channel::Whatsapp => self.phone.as_deref(),
            Channel::Email => self.email.as_deref(),
        };
        value.map(str::trim).filter(|v| !v.is_empty())
    }
}

/// Historical visit/order record
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct CustomerVisit {
    pub id: uuid::Uuid,
    pub tenant_id: TenantId,
    pub customer_id: CustomerId,
    pub amount: f64,
    pub visited_at: DateTime<Utc>,
}

/// Aggregated visit statistics for one customer
#[derive(Debug, Clone, Default, PartialEq, FromRow, Serialize, Deserialize)]
pub struct VisitAggregate {
    pub total_visits: i64,
    pub total_spent: f64,
    pub last_visit_at: Option<DateTime<Utc>>,
}

/// Filter for rule candidates
#[derive(Debug, Clone)]
pub struct CandidateFilter {
    pub tenant_id: TenantId,
    pub segment: Segment,
    /// Only customers whose last visit is older than this (or who never visited)
    pub last_visit_before: Option<DateTime<Utc>>,
    pub limit: i64,
}

/// Channel preference carried by every rule action
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryPreference {
    pub preferred_channel: Channel,
    #[serde(default)]
    pub fallback_to_email: bool,
}

/// Rule action configuration, keyed by trigger kind
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "trigger", rename_all = "snake_case")]
pub enum RuleAction {
    PeriodicCheck {
        #[serde(flatten)]
        delivery: DeliveryPreference,
        #[serde(default)]
        min_days_inactive: Option<i64>,
        #[serde(default)]
        min_visits: Option<i32>,
    },
    SegmentChanged {
        #[serde(flatten)]
        delivery: DeliveryPreference,
        #[serde(default)]
        from_segment: Option<Segment>,
    },
    PostVisit {
        #[serde(flatten)]
        delivery: DeliveryPreference,
    },
}

impl RuleAction {
    pub fn trigger_kind(&self) -> TriggerKind {
        match self {
            RuleAction::PeriodicCheck { .. } => TriggerKind::PeriodicCheck,
            RuleAction::SegmentChanged { .. } => TriggerKind::SegmentChanged,
            RuleAction::PostVisit { .. } => TriggerKind::PostVisit,
        }
    }

    pub fn delivery(&self) -> &DeliveryPreference {
        match self {
            RuleAction::PeriodicCheck { delivery, .. }
            | RuleAction::SegmentChanged { delivery, .. }
            | RuleAction::PostVisit { delivery } => delivery,
        }
    }
}

/// Rule trigger kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "text", rename_all = "snake_case")]
pub enum TriggerKind {
    PeriodicCheck,
    SegmentChanged,
    PostVisit,
}

impl TriggerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerKind::PeriodicCheck => "periodic_check",
            TriggerKind::SegmentChanged => "segment_changed",
            TriggerKind::PostVisit => "post_visit",
        }
    }
}

impl std::fmt::Display for TriggerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TriggerKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "periodic_check" => Ok(TriggerKind::PeriodicCheck),
            "segment_changed" => Ok(TriggerKind::SegmentChanged),
            "post_visit" => Ok(TriggerKind::PostVisit),
            _ => Err(format!("Invalid trigger kind: {}", s)),
        }
    }
}

/// Automation rule model
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct AutomationRule {
    pub id: RuleId,
    pub tenant_id: TenantId,
    pub name: String,
    pub target_segment: Segment,
    pub action_config: Json<RuleAction>,
    pub template_id: TemplateId,
    pub cooldown_days: i32,
    pub max_executions_per_customer: i32,
    pub max_daily_executions: i32,
    pub execution_hours_start: i32,
    pub execution_hours_end: i32,
    pub execution_days_of_week: Vec<i32>,
    pub active: bool,
    pub execution_count: i64,
    pub last_executed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl AutomationRule {
    pub fn action(&self) -> &RuleAction {
        &self.action_config.0
    }

    pub fn trigger_kind(&self) -> TriggerKind {
        self.action().trigger_kind()
    }

    pub fn delivery(&self) -> &DeliveryPreference {
        self.action().delivery()
    }
}

/// Message template model
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct MessageTemplate {
    pub id: TemplateId,
    pub tenant_id: TenantId,
    pub name: String,
    pub channel: Channel,
    pub subject: Option<String>,
    pub body: String,
    pub send_delay_hours: i32,
    pub variables: Vec<String>,
    pub provider_template_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Scheduled message status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "text", rename_all = "lowercase")]
pub enum ScheduledMessageStatus {
    Planned,
    Processing,
    Sent,
    Delivered,
    Skipped,
    Failed,
}

impl ScheduledMessageStatus {
    /// Statuses counted against the tenant daily cap
    pub const ACTIVE: [ScheduledMessageStatus; 4] = [
        ScheduledMessageStatus::Planned,
        ScheduledMessageStatus::Processing,
        ScheduledMessageStatus::Sent,
        ScheduledMessageStatus::Delivered,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ScheduledMessageStatus::Planned => "planned",
            ScheduledMessageStatus::Processing => "processing",
            ScheduledMessageStatus::Sent => "sent",
            ScheduledMessageStatus::Delivered => "delivered",
            ScheduledMessageStatus::Skipped => "skipped",
            ScheduledMessageStatus::Failed => "failed",
        }
    }

    /// Sent or delivered
    pub fn is_sent(&self) -> bool {
        matches!(
            self,
            ScheduledMessageStatus::Sent | ScheduledMessageStatus::Delivered
        )
    }

    /// Waiting for or undergoing delivery
    pub fn is_pending(&self) -> bool {
        matches!(
            self,
            ScheduledMessageStatus::Planned | ScheduledMessageStatus::Processing
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ScheduledMessageStatus::Delivered
                | ScheduledMessageStatus::Skipped
                | ScheduledMessageStatus::Failed
        )
    }

    /// Valid state machine moves
    pub fn can_transition_to(&self, next: ScheduledMessageStatus) -> bool {
        use ScheduledMessageStatus::*;
        if self.is_terminal() {
            return false;
        }
        matches!(
            (self, next),
            (Planned, Processing)
                | (Processing, Sent)
                | (Processing, Skipped)
                | (Processing, Planned)
                | (Processing, Failed)
                | (Sent, Delivered)
        )
    }

    /// `can_transition_to` as an error for the storage layer
    pub fn ensure_transition(&self, next: ScheduledMessageStatus) -> comanda_common::Result<()> {
        if self.can_transition_to(next) {
            Ok(())
        } else {
            Err(comanda_common::Error::InvalidTransition(format!(
                "{} -> {}",
                self, next
            )))
        }
    }
}

impl std::fmt::Display for ScheduledMessageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ScheduledMessageStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "planned" => Ok(ScheduledMessageStatus::Planned),
            "processing" => Ok(ScheduledMessageStatus::Processing),
            "sent" => Ok(ScheduledMessageStatus::Sent),
            "delivered" => Ok(ScheduledMessageStatus::Delivered),
            "skipped" => Ok(ScheduledMessageStatus::Skipped),
            "failed" => Ok(ScheduledMessageStatus::Failed),
            _ => Err(format!("Invalid scheduled message status: {}", s)),
        }
    }
}

/// Scheduled message model
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct ScheduledMessage {
    pub id: ScheduledMessageId,
    pub tenant_id: TenantId,
    pub customer_id: CustomerId,
    pub rule_id: RuleId,
    pub template_id: TemplateId,
    pub scheduled_for: DateTime<Utc>,
    pub channel_planned: Channel,
    pub channel_final: Option<Channel>,
    pub subject: Option<String>,
    pub body: String,
    pub variables: Json<BTreeMap<String, String>>,
    pub previous_segment: Option<Segment>,
    pub status: ScheduledMessageStatus,
    pub retry_count: i32,
    pub last_error: Option<String>,
    pub provider_message_id: Option<String>,
    pub provider_response: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_attempted_at: Option<DateTime<Utc>>,
    pub sent_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
}

/// Create scheduled message input
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateScheduledMessage {
    pub tenant_id: TenantId,
    pub customer_id: CustomerId,
    pub rule_id: RuleId,
    pub template_id: TemplateId,
    pub scheduled_for: DateTime<Utc>,
    pub channel_planned: Channel,
    pub subject: Option<String>,
    pub body: String,
    pub variables: BTreeMap<String, String>,
    pub previous_segment: Option<Segment>,
    pub created_at: DateTime<Utc>,
}

/// Outcome of a successful provider call
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendReceipt {
    pub channel: Channel,
    pub provider_message_id: String,
    pub provider_response: serde_json::Value,
    pub sent_at: DateTime<Utc>,
}

/// Send history for one (customer, rule) pair
#[derive(Debug, Clone, Default, PartialEq, FromRow)]
pub struct PairHistory {
    /// Messages in sent/delivered
    pub sent_count: i64,
    /// Latest sent_at among sent/delivered messages
    pub last_sent_at: Option<DateTime<Utc>>,
    /// Messages in planned/processing
    pub pending_count: i64,
}

/// Result of returning stale claims to the queue
#[derive(Debug, Clone, Default)]
pub struct StaleRelease {
    pub requeued: u64,
    /// Claims that ran out of retries, as stored after the move to failed
    pub failed: Vec<ScheduledMessage>,
}

/// Message counts per status
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub planned: i64,
    pub processing: i64,
    pub sent: i64,
    pub delivered: i64,
    pub skipped: i64,
    pub failed: i64,
}

impl QueueStats {
    pub fn add(&mut self, status: ScheduledMessageStatus, count: i64) {
        match status {
            ScheduledMessageStatus::Planned => self.planned += count,
            ScheduledMessageStatus::Processing => self.processing += count,
            ScheduledMessageStatus::Sent => self.sent += count,
            ScheduledMessageStatus::Delivered => self.delivered += count,
            ScheduledMessageStatus::Skipped => self.skipped += count,
            ScheduledMessageStatus::Failed => self.failed += count,
        }
    }
}

/// Interaction log entry kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "text", rename_all = "snake_case")]
pub enum InteractionKind {
    MessageSent,
    MessageFailed,
}

impl InteractionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            InteractionKind::MessageSent => "message_sent",
            InteractionKind::MessageFailed => "message_failed",
        }
    }
}

impl std::fmt::Display for InteractionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for InteractionKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "message_sent" => Ok(InteractionKind::MessageSent),
            "message_failed" => Ok(InteractionKind::MessageFailed),
            _ => Err(format!("Invalid interaction kind: {}", s)),
        }
    }
}

/// Characters kept in an interaction log content preview
pub const CONTENT_PREVIEW_CHARS: usize = 160;

/// Append-only delivery audit record
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct InteractionLog {
    pub id: InteractionLogId,
    pub tenant_id: TenantId,
    pub customer_id: CustomerId,
    pub rule_id: Option<RuleId>,
    pub scheduled_message_id: ScheduledMessageId,
    pub kind: InteractionKind,
    pub channel: Option<Channel>,
    pub provider_message_id: Option<String>,
    pub provider_response: serde_json::Value,
    pub content_preview: String,
    pub created_at: DateTime<Utc>,
}

/// Create interaction log input
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateInteractionLog {
    pub tenant_id: TenantId,
    pub customer_id: CustomerId,
    pub rule_id: Option<RuleId>,
    pub scheduled_message_id: ScheduledMessageId,
    pub kind: InteractionKind,
    pub channel: Option<Channel>,
    pub provider_message_id: Option<String>,
    pub provider_response: serde_json::Value,
    pub content_preview: String,
}

/// Truncate a body to the preview length on a char boundary
pub fn content_preview(body: &str) -> String {
    body.chars().take(CONTENT_PREVIEW_CHARS).collect()
}

/// Per-tenant provider credentials
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct ChannelCredentials {
    pub tenant_id: TenantId,
    pub channel: Channel,
    pub config: serde_json::Value,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ChannelCredentials {
    /// Parse the config as WhatsApp provider credentials
    pub fn whatsapp(&self) -> Result<WhatsAppCredentials, serde_json::Error> {
        serde_json::from_value(self.config.clone())
    }

    /// Parse the config as SMTP credentials
    pub fn email(&self) -> Result<EmailCredentials, serde_json::Error> {
        serde_json::from_value(self.config.clone())
    }
}

/// Twilio-compatible WhatsApp account
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WhatsAppCredentials {
    pub account_sid: String,
    pub auth_token: String,
    pub from_number: String,
    #[serde(default)]
    pub api_base: Option<String>,
}

/// SMTP connection security
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SmtpSecurity {
    Tls,
    #[default]
    Starttls,
    None,
}

/// SMTP account used for email delivery
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmailCredentials {
    pub host: String,
    #[serde(default = "default_smtp_port")]
    pub port: u16,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    pub from_address: String,
    #[serde(default)]
    pub from_name: Option<String>,
    #[serde(default)]
    pub security: SmtpSecurity,
}

fn default_smtp_port() -> u16 {
    587
}
