//! Common types for Comanda

use uuid::Uuid;

/// Unique identifier for tenants (one restaurant account)
pub type TenantId = Uuid;

/// Unique identifier for customers
pub type CustomerId = Uuid;

/// Unique identifier for automation rules
pub type RuleId = Uuid;

/// Unique identifier for message templates
pub type TemplateId = Uuid;

/// Unique identifier for scheduled messages
pub type ScheduledMessageId = Uuid;

/// Unique identifier for interaction log entries
pub type InteractionLogId = Uuid;
