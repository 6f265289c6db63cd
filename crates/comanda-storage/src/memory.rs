//! In-memory implementation of every repository trait
//!
//! Backs the pipeline tests and local dry runs. All state sits behind one
//! mutex, so conditional status updates are atomic the same way the
//! `WHERE status = ...` updates are in Postgres.

use crate::models::{
    AutomationRule, CandidateFilter, Channel, ChannelCredentials, CreateInteractionLog,
    CreateScheduledMessage, Customer, CustomerVisit, InteractionLog, MessageTemplate,
    PairHistory, QueueStats, ScheduledMessage, ScheduledMessageStatus, Segment, SendReceipt,
    StaleRelease, Tenant, TriggerKind, VisitAggregate,
};
use crate::repository::scheduled_messages::STALE_CLAIM_ERROR;
use crate::repository::{
    ChannelCredentialsRepository, CustomerRepository, InteractionLogRepository, RuleRepository,
    ScheduledMessageRepository, TemplateRepository, TenantRepository,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use comanda_common::types::{CustomerId, RuleId, ScheduledMessageId, TemplateId, TenantId};
use comanda_common::{Error, Result};
use sqlx::types::Json;
use std::collections::{BTreeMap, HashMap, HashSet};
use tokio::sync::Mutex;
use uuid::Uuid;

#[derive(Default)]
struct State {
    tenants: Vec<Tenant>,
    customers: BTreeMap<CustomerId, Customer>,
    visits: Vec<CustomerVisit>,
    rules: Vec<AutomationRule>,
    templates: HashMap<TemplateId, MessageTemplate>,
    messages: Vec<ScheduledMessage>,
    logs: Vec<InteractionLog>,
    credentials: HashMap<(TenantId, Channel), ChannelCredentials>,
    fail_tenant_listing: bool,
    failing_customers: HashSet<CustomerId>,
}

impl State {
    fn message_mut(&mut self, id: ScheduledMessageId) -> Option<&mut ScheduledMessage> {
        self.messages.iter_mut().find(|m| m.id == id)
    }

    /// Move the message from `expected` to `next` and apply `update`.
    /// Ok(false) when the message is not currently in `expected`.
    fn transition(
        &mut self,
        id: ScheduledMessageId,
        expected: ScheduledMessageStatus,
        next: ScheduledMessageStatus,
        update: impl FnOnce(&mut ScheduledMessage),
    ) -> Result<bool> {
        expected.ensure_transition(next)?;
        Ok(match self.message_mut(id) {
            Some(message) if message.status == expected => {
                message.status = next;
                update(message);
                true
            }
            _ => false,
        })
    }

    fn has_pending(&self, customer_id: CustomerId, rule_id: RuleId) -> bool {
        self.messages.iter().any(|m| {
            m.customer_id == customer_id && m.rule_id == rule_id && m.status.is_pending()
        })
    }
}

/// In-memory store
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_tenant(&self, tenant: Tenant) {
        self.state.lock().await.tenants.push(tenant);
    }

    pub async fn insert_customer(&self, customer: Customer) {
        self.state.lock().await.customers.insert(customer.id, customer);
    }

    pub async fn insert_visit(&self, visit: CustomerVisit) {
        self.state.lock().await.visits.push(visit);
    }

    pub async fn insert_rule(&self, rule: AutomationRule) {
        self.state.lock().await.rules.push(rule);
    }

    pub async fn insert_template(&self, template: MessageTemplate) {
        self.state.lock().await.templates.insert(template.id, template);
    }

    pub async fn insert_credentials(&self, credentials: ChannelCredentials) {
        self.state
            .lock()
            .await
            .credentials
            .insert((credentials.tenant_id, credentials.channel), credentials);
    }

    /// Insert a message as-is, bypassing `create`
    pub async fn insert_message(&self, message: ScheduledMessage) {
        self.state.lock().await.messages.push(message);
    }

    /// Make tenant listing fail
    #[cfg(any(test, feature = "test-util"))]
    pub async fn fail_tenant_listing(&self) {
        self.state.lock().await.fail_tenant_listing = true;
    }

    /// Make visit aggregation fail for one customer
    #[cfg(any(test, feature = "test-util"))]
    pub async fn fail_customer(&self, customer_id: CustomerId) {
        self.state.lock().await.failing_customers.insert(customer_id);
    }

    /// Modify a stored customer in place
    pub async fn update_customer(&self, id: CustomerId, update: impl FnOnce(&mut Customer)) {
        if let Some(customer) = self.state.lock().await.customers.get_mut(&id) {
            update(customer);
        }
    }

    /// Snapshot of every scheduled message, in insertion order
    pub async fn messages(&self) -> Vec<ScheduledMessage> {
        self.state.lock().await.messages.clone()
    }

    /// Snapshot of the interaction log
    pub async fn interaction_logs(&self) -> Vec<InteractionLog> {
        self.state.lock().await.logs.clone()
    }

    /// Snapshot of one rule
    pub async fn rule(&self, id: RuleId) -> Option<AutomationRule> {
        self.state
            .lock()
            .await
            .rules
            .iter()
            .find(|r| r.id == id)
            .cloned()
    }
}

#[async_trait]
impl TenantRepository for MemoryStore {
    async fn list_active(&self) -> Result<Vec<Tenant>> {
        let state = self.state.lock().await;
        if state.fail_tenant_listing {
            return Err(Error::Database("tenant listing unavailable".to_string()));
        }
        Ok(state.tenants.iter().filter(|t| t.active).cloned().collect())
    }

    async fn get(&self, id: TenantId) -> Result<Option<Tenant>> {
        let state = self.state.lock().await;
        Ok(state.tenants.iter().find(|t| t.id == id).cloned())
    }
}

#[async_trait]
impl CustomerRepository for MemoryStore {
    async fn get(&self, id: CustomerId) -> Result<Option<Customer>> {
        Ok(self.state.lock().await.customers.get(&id).cloned())
    }

    async fn list_ids(&self, tenant_id: TenantId) -> Result<Vec<CustomerId>> {
        let state = self.state.lock().await;
        Ok(state
            .customers
            .values()
            .filter(|c| c.tenant_id == tenant_id)
            .map(|c| c.id)
            .collect())
    }

    async fn visit_aggregate(
        &self,
        tenant_id: TenantId,
        customer_id: CustomerId,
    ) -> Result<VisitAggregate> {
        let state = self.state.lock().await;
        if state.failing_customers.contains(&customer_id) {
            return Err(Error::Database(format!(
                "visit history unavailable for {}",
                customer_id
            )));
        }

        let mut aggregate = VisitAggregate::default();
        for visit in state
            .visits
            .iter()
            .filter(|v| v.tenant_id == tenant_id && v.customer_id == customer_id)
        {
            aggregate.total_visits += 1;
            aggregate.total_spent += visit.amount;
            aggregate.last_visit_at = aggregate.last_visit_at.max(Some(visit.visited_at));
        }
        Ok(aggregate)
    }

    async fn update_stats(
        &self,
        tenant_id: TenantId,
        customer_id: CustomerId,
        stats: &VisitAggregate,
    ) -> Result<()> {
        let mut state = self.state.lock().await;
        if let Some(customer) = state
            .customers
            .get_mut(&customer_id)
            .filter(|c| c.tenant_id == tenant_id)
        {
            customer.total_visits = i32::try_from(stats.total_visits).unwrap_or(i32::MAX);
            customer.total_spent = stats.total_spent;
            customer.last_visit_at = stats.last_visit_at;
            customer.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn update_segment(
        &self,
        tenant_id: TenantId,
        customer_id: CustomerId,
        segment: Segment,
    ) -> Result<()> {
        let mut state = self.state.lock().await;
        if let Some(customer) = state
            .customers
            .get_mut(&customer_id)
            .filter(|c| c.tenant_id == tenant_id)
        {
            customer.segment = segment;
            customer.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn list_candidates(&self, filter: &CandidateFilter) -> Result<Vec<Customer>> {
        let state = self.state.lock().await;
        let limit = usize::try_from(filter.limit).unwrap_or(0);

        Ok(state
            .customers
            .values()
            .filter(|c| c.tenant_id == filter.tenant_id && c.segment == filter.segment)
            .filter(|c| c.notifications_enabled)
            .filter(|c| {
                (c.whatsapp_consent && c.has_phone()) || (c.email_consent && c.has_email())
            })
            .filter(|c| match (filter.last_visit_before, c.last_visit_at) {
                (Some(before), Some(last)) => last < before,
                _ => true,
            })
            .take(limit)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl RuleRepository for MemoryStore {
    async fn get(&self, id: RuleId) -> Result<Option<AutomationRule>> {
        Ok(self.rule(id).await)
    }

    async fn list_active(
        &self,
        tenant_id: TenantId,
        trigger: TriggerKind,
    ) -> Result<Vec<AutomationRule>> {
        let state = self.state.lock().await;
        Ok(state
            .rules
            .iter()
            .filter(|r| r.tenant_id == tenant_id && r.active && r.trigger_kind() == trigger)
            .cloned()
            .collect())
    }

    async fn record_execution(
        &self,
        id: RuleId,
        executed_at: DateTime<Utc>,
        created: i64,
    ) -> Result<()> {
        let mut state = self.state.lock().await;
        if let Some(rule) = state.rules.iter_mut().find(|r| r.id == id) {
            rule.last_executed_at = Some(executed_at);
            rule.execution_count += created;
            rule.updated_at = executed_at;
        }
        Ok(())
    }
}

#[async_trait]
impl TemplateRepository for MemoryStore {
    async fn get(&self, tenant_id: TenantId, id: TemplateId) -> Result<Option<MessageTemplate>> {
        let state = self.state.lock().await;
        Ok(state
            .templates
            .get(&id)
            .filter(|t| t.tenant_id == tenant_id)
            .cloned())
    }
}

#[async_trait]
impl ScheduledMessageRepository for MemoryStore {
    async fn create(&self, input: CreateScheduledMessage) -> Result<Option<ScheduledMessage>> {
        let message = ScheduledMessage {
            id: Uuid::now_v7(),
            tenant_id: input.tenant_id,
            customer_id: input.customer_id,
            rule_id: input.rule_id,
            template_id: input.template_id,
            scheduled_for: input.scheduled_for,
            channel_planned: input.channel_planned,
            channel_final: None,
            subject: input.subject,
            body: input.body,
            variables: Json(input.variables),
            previous_segment: input.previous_segment,
            status: ScheduledMessageStatus::Planned,
            retry_count: 0,
            last_error: None,
            provider_message_id: None,
            provider_response: None,
            created_at: input.created_at,
            updated_at: input.created_at,
            last_attempted_at: None,
            sent_at: None,
            delivered_at: None,
            failed_at: None,
        };

        let mut state = self.state.lock().await;
        if state.has_pending(message.customer_id, message.rule_id) {
            return Ok(None);
        }
        state.messages.push(message.clone());
        Ok(Some(message))
    }

    async fn get(&self, id: ScheduledMessageId) -> Result<Option<ScheduledMessage>> {
        let state = self.state.lock().await;
        Ok(state.messages.iter().find(|m| m.id == id).cloned())
    }

    async fn list_due(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<ScheduledMessage>> {
        let state = self.state.lock().await;
        let mut due: Vec<ScheduledMessage> = state
            .messages
            .iter()
            .filter(|m| m.status == ScheduledMessageStatus::Planned && m.scheduled_for <= now)
            .cloned()
            .collect();
        due.sort_by_key(|m| m.scheduled_for);
        due.truncate(usize::try_from(limit).unwrap_or(0));
        Ok(due)
    }

    async fn claim(&self, id: ScheduledMessageId, now: DateTime<Utc>) -> Result<bool> {
        let mut state = self.state.lock().await;
        state.transition(
            id,
            ScheduledMessageStatus::Planned,
            ScheduledMessageStatus::Processing,
            |m| {
                m.last_attempted_at = Some(now);
                m.updated_at = now;
            },
        )
    }

    async fn mark_sent(&self, id: ScheduledMessageId, receipt: &SendReceipt) -> Result<bool> {
        let mut state = self.state.lock().await;
        state.transition(
            id,
            ScheduledMessageStatus::Processing,
            ScheduledMessageStatus::Sent,
            |m| {
                m.channel_final = Some(receipt.channel);
                m.provider_message_id = Some(receipt.provider_message_id.clone());
                m.provider_response = Some(receipt.provider_response.clone());
                m.sent_at = Some(receipt.sent_at);
                m.last_error = None;
                m.updated_at = receipt.sent_at;
            },
        )
    }

    async fn mark_skipped(
        &self,
        id: ScheduledMessageId,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let mut state = self.state.lock().await;
        state.transition(
            id,
            ScheduledMessageStatus::Processing,
            ScheduledMessageStatus::Skipped,
            |m| {
                m.last_error = Some(reason.to_string());
                m.updated_at = now;
            },
        )
    }

    async fn reschedule(
        &self,
        id: ScheduledMessageId,
        retry_count: i32,
        scheduled_for: DateTime<Utc>,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let mut state = self.state.lock().await;
        state.transition(
            id,
            ScheduledMessageStatus::Processing,
            ScheduledMessageStatus::Planned,
            |m| {
                m.retry_count = retry_count;
                m.scheduled_for = scheduled_for;
                m.last_error = Some(error.to_string());
                m.updated_at = now;
            },
        )
    }

    async fn mark_failed(
        &self,
        id: ScheduledMessageId,
        retry_count: i32,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let mut state = self.state.lock().await;
        state.transition(
            id,
            ScheduledMessageStatus::Processing,
            ScheduledMessageStatus::Failed,
            |m| {
                m.retry_count = retry_count;
                m.last_error = Some(error.to_string());
                m.failed_at = Some(now);
                m.updated_at = now;
            },
        )
    }

    async fn confirm_delivery(
        &self,
        provider_message_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<ScheduledMessage>> {
        ScheduledMessageStatus::Sent.ensure_transition(ScheduledMessageStatus::Delivered)?;

        let mut state = self.state.lock().await;
        let message = state.messages.iter_mut().find(|m| {
            m.status == ScheduledMessageStatus::Sent
                && m.provider_message_id.as_deref() == Some(provider_message_id)
        });

        Ok(message.map(|m| {
            m.status = ScheduledMessageStatus::Delivered;
            m.delivered_at = Some(now);
            m.updated_at = now;
            m.clone()
        }))
    }

    async fn pair_history(
        &self,
        customer_id: CustomerId,
        rule_id: RuleId,
        exclude: Option<ScheduledMessageId>,
    ) -> Result<PairHistory> {
        let state = self.state.lock().await;
        let mut history = PairHistory::default();

        for message in state
            .messages
            .iter()
            .filter(|m| m.customer_id == customer_id && m.rule_id == rule_id)
        {
            if message.status.is_sent() {
                history.sent_count += 1;
                history.last_sent_at = history.last_sent_at.max(message.sent_at);
            } else if message.status.is_pending() && Some(message.id) != exclude {
                history.pending_count += 1;
            }
        }
        Ok(history)
    }

    async fn count_active_created_between(
        &self,
        tenant_id: TenantId,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        exclude: Option<ScheduledMessageId>,
    ) -> Result<i64> {
        let state = self.state.lock().await;
        let count = state
            .messages
            .iter()
            .filter(|m| m.tenant_id == tenant_id)
            .filter(|m| m.created_at >= from && m.created_at < to)
            .filter(|m| ScheduledMessageStatus::ACTIVE.contains(&m.status))
            .filter(|m| Some(m.id) != exclude)
            .count();
        Ok(count as i64)
    }

    async fn release_stale(
        &self,
        claimed_before: DateTime<Utc>,
        max_retries: i32,
        now: DateTime<Utc>,
    ) -> Result<StaleRelease> {
        let mut state = self.state.lock().await;
        let mut release = StaleRelease::default();

        let stale: Vec<(ScheduledMessageId, i32)> = state
            .messages
            .iter()
            .filter(|m| {
                m.status == ScheduledMessageStatus::Processing
                    && m.last_attempted_at.is_some_and(|at| at < claimed_before)
            })
            .map(|m| (m.id, m.retry_count))
            .collect();

        for (id, retry_count) in stale {
            let next = if retry_count + 1 > max_retries {
                ScheduledMessageStatus::Failed
            } else {
                ScheduledMessageStatus::Planned
            };

            state.transition(id, ScheduledMessageStatus::Processing, next, |m| {
                if next == ScheduledMessageStatus::Failed {
                    m.failed_at = Some(now);
                } else {
                    m.retry_count += 1;
                }
                m.last_error = Some(STALE_CLAIM_ERROR.to_string());
                m.updated_at = now;
            })?;

            match next {
                ScheduledMessageStatus::Failed => {
                    if let Some(message) = state.message_mut(id) {
                        release.failed.push(message.clone());
                    }
                }
                _ => release.requeued += 1,
            }
        }
        Ok(release)
    }

    async fn queue_stats(&self) -> Result<QueueStats> {
        let state = self.state.lock().await;
        let mut stats = QueueStats::default();
        for message in &state.messages {
            stats.add(message.status, 1);
        }
        Ok(stats)
    }
}

#[async_trait]
impl InteractionLogRepository for MemoryStore {
    async fn insert(&self, input: CreateInteractionLog) -> Result<InteractionLog> {
        let entry = InteractionLog {
            id: Uuid::now_v7(),
            tenant_id: input.tenant_id,
            customer_id: input.customer_id,
            rule_id: input.rule_id,
            scheduled_message_id: input.scheduled_message_id,
            kind: input.kind,
            channel: input.channel,
            provider_message_id: input.provider_message_id,
            provider_response: input.provider_response,
            content_preview: input.content_preview,
            created_at: Utc::now(),
        };

        self.state.lock().await.logs.push(entry.clone());
        Ok(entry)
    }
}

#[async_trait]
impl ChannelCredentialsRepository for MemoryStore {
    async fn get_active(
        &self,
        tenant_id: TenantId,
        channel: Channel,
    ) -> Result<Option<ChannelCredentials>> {
        let state = self.state.lock().await;
        Ok(state
            .credentials
            .get(&(tenant_id, channel))
            .filter(|c| c.active)
            .cloned())
    }
}
