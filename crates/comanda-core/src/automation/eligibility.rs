//! Eligibility Engine - Decides whether a customer may receive a rule's message
//!
//! The same check runs when a message is scheduled and again right before it
//! is sent, so it always re-reads customer, rule and history from storage.

use super::window::{calendar_days_between, local_day_bounds, ExecutionWindow};
use chrono::{DateTime, Datelike, Duration, Offset, Timelike, Utc};
use comanda_common::types::{CustomerId, RuleId, ScheduledMessageId};
use comanda_common::Result;
use comanda_storage::models::{
    AutomationRule, Channel, Customer, DeliveryPreference, RuleAction, Segment,
};
use comanda_storage::Repositories;
use serde::Serialize;

/// Inactivity threshold for rules targeting inactive customers
pub const DEFAULT_MIN_DAYS_INACTIVE: i64 = 30;

/// Visits required before an at-risk customer is worth winning back
pub const DEFAULT_MIN_VISITS_AT_RISK: i32 = 3;

/// Why a customer is not eligible
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IneligibilityReason {
    CustomerNotFound,
    RuleNotFound,
    RuleInactive,
    NotificationsDisabled,
    NoValidChannel,
    NoWhatsappConsent,
    NoPhoneNumber,
    NoEmailConsent,
    NoEmailAddress,
    CooldownActive,
    MaxExecutionsReached,
    DailyLimitReached,
    OutsideTimeWindow,
    OutsideAllowedDays,
    NotInactiveEnough,
    WrongPreviousSegment,
    NotFrequentEnoughForRisk,
    AlreadyScheduled,
}

impl IneligibilityReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            IneligibilityReason::CustomerNotFound => "customer_not_found",
            IneligibilityReason::RuleNotFound => "rule_not_found",
            IneligibilityReason::RuleInactive => "rule_inactive",
            IneligibilityReason::NotificationsDisabled => "notifications_disabled",
            IneligibilityReason::NoValidChannel => "no_valid_channel",
            IneligibilityReason::NoWhatsappConsent => "no_whatsapp_consent",
            IneligibilityReason::NoPhoneNumber => "no_phone_number",
            IneligibilityReason::NoEmailConsent => "no_email_consent",
            IneligibilityReason::NoEmailAddress => "no_email_address",
            IneligibilityReason::CooldownActive => "cooldown_active",
            IneligibilityReason::MaxExecutionsReached => "max_executions_reached",
            IneligibilityReason::DailyLimitReached => "daily_limit_reached",
            IneligibilityReason::OutsideTimeWindow => "outside_time_window",
            IneligibilityReason::OutsideAllowedDays => "outside_allowed_days",
            IneligibilityReason::NotInactiveEnough => "not_inactive_enough",
            IneligibilityReason::WrongPreviousSegment => "wrong_previous_segment",
            IneligibilityReason::NotFrequentEnoughForRisk => "not_frequent_enough_for_risk",
            IneligibilityReason::AlreadyScheduled => "already_scheduled",
        }
    }
}

impl std::fmt::Display for IneligibilityReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Inputs that are not read from storage
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EligibilityContext {
    pub now: DateTime<Utc>,
    /// Segment before a segment-changed event
    pub previous_segment: Option<Segment>,
    /// Message being delivered, left out of the daily cap and pending checks
    pub exclude_message: Option<ScheduledMessageId>,
}

impl EligibilityContext {
    pub fn at(now: DateTime<Utc>) -> Self {
        Self {
            now,
            previous_segment: None,
            exclude_message: None,
        }
    }

    pub fn with_previous_segment(mut self, segment: Option<Segment>) -> Self {
        self.previous_segment = segment;
        self
    }

    pub fn excluding(mut self, message_id: ScheduledMessageId) -> Self {
        self.exclude_message = Some(message_id);
        self
    }
}

/// Outcome of an eligibility check
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EligibilityDecision {
    pub eligible: bool,
    pub reasons: Vec<IneligibilityReason>,
    pub channel: Option<Channel>,
}

impl EligibilityDecision {
    fn rejected(reasons: Vec<IneligibilityReason>) -> Self {
        Self {
            eligible: false,
            reasons,
            channel: None,
        }
    }

    /// Reason codes joined with commas
    pub fn reason_codes(&self) -> String {
        self.reasons
            .iter()
            .map(IneligibilityReason::as_str)
            .collect::<Vec<_>>()
            .join(",")
    }
}

/// Pick the delivery channel, first match wins
pub fn select_channel(
    preference: &DeliveryPreference,
    whatsapp_usable: bool,
    email_usable: bool,
) -> Option<Channel> {
    match preference.preferred_channel {
        Channel::Whatsapp if whatsapp_usable => Some(Channel::Whatsapp),
        Channel::Email if email_usable => Some(Channel::Email),
        _ if preference.fallback_to_email && email_usable => Some(Channel::Email),
        _ if whatsapp_usable => Some(Channel::Whatsapp),
        _ => None,
    }
}

/// Eligibility engine
#[derive(Clone)]
pub struct EligibilityEngine {
    repos: Repositories,
}

impl EligibilityEngine {
    pub fn new(repos: Repositories) -> Self {
        Self { repos }
    }

    /// Evaluate every gate and collect all failing reasons.
    ///
    /// Errors only on storage failures; missing records are reasons.
    pub async fn check(
        &self,
        customer_id: CustomerId,
        rule_id: RuleId,
        ctx: EligibilityContext,
    ) -> Result<EligibilityDecision> {
        let rule = self.repos.rules.get(rule_id).await?;
        let customer = self.repos.customers.get(customer_id).await?;

        let (rule, customer) = match (rule, customer) {
            (Some(rule), Some(customer)) if customer.tenant_id == rule.tenant_id => {
                (rule, customer)
            }
            (Some(_), _) => {
                return Ok(EligibilityDecision::rejected(vec![
                    IneligibilityReason::CustomerNotFound,
                ]))
            }
            (None, Some(_)) => {
                return Ok(EligibilityDecision::rejected(vec![
                    IneligibilityReason::RuleNotFound,
                ]))
            }
            (None, None) => {
                return Ok(EligibilityDecision::rejected(vec![
                    IneligibilityReason::CustomerNotFound,
                    IneligibilityReason::RuleNotFound,
                ]))
            }
        };

        if !rule.active {
            return Ok(EligibilityDecision::rejected(vec![
                IneligibilityReason::RuleInactive,
            ]));
        }

        let offset = self
            .repos
            .tenants
            .get(rule.tenant_id)
            .await?
            .map(|tenant| tenant.offset())
            .unwrap_or_else(|| Utc.fix());

        let mut reasons = Vec::new();

        if !customer.notifications_enabled {
            reasons.push(IneligibilityReason::NotificationsDisabled);
        }

        let channel = self.resolve_channel(&customer, &rule).await?;
        if channel.is_none() {
            reasons.push(IneligibilityReason::NoValidChannel);
            reasons.extend(consent_diagnostics(&customer));
        }

        let history = self
            .repos
            .messages
            .pair_history(customer.id, rule.id, ctx.exclude_message)
            .await?;

        if let Some(last_sent) = history.last_sent_at {
            if ctx.now - last_sent < Duration::days(i64::from(rule.cooldown_days)) {
                reasons.push(IneligibilityReason::CooldownActive);
            }
        }

        if history.sent_count >= i64::from(rule.max_executions_per_customer) {
            reasons.push(IneligibilityReason::MaxExecutionsReached);
        }

        let (day_start, day_end) = local_day_bounds(ctx.now, offset);
        let today = self
            .repos
            .messages
            .count_active_created_between(rule.tenant_id, day_start, day_end, ctx.exclude_message)
            .await?;
        if today >= i64::from(rule.max_daily_executions) {
            reasons.push(IneligibilityReason::DailyLimitReached);
        }

        let window = ExecutionWindow::from_rule(&rule);
        let local = ctx.now.with_timezone(&offset);
        if !window.contains_hour(local.hour()) {
            reasons.push(IneligibilityReason::OutsideTimeWindow);
        }
        if !window.allows_weekday(local.weekday().number_from_monday()) {
            reasons.push(IneligibilityReason::OutsideAllowedDays);
        }

        reasons.extend(rule_specific_reasons(&rule, &customer, &ctx, offset));

        if history.pending_count > 0 {
            reasons.push(IneligibilityReason::AlreadyScheduled);
        }

        Ok(EligibilityDecision {
            eligible: reasons.is_empty(),
            reasons,
            channel,
        })
    }

    /// A channel is usable with consent, contact data and active tenant credentials
    async fn resolve_channel(
        &self,
        customer: &Customer,
        rule: &AutomationRule,
    ) -> Result<Option<Channel>> {
        let whatsapp = self.usable(customer, Channel::Whatsapp).await?;
        let email = self.usable(customer, Channel::Email).await?;
        Ok(select_channel(rule.delivery(), whatsapp, email))
    }

    async fn usable(&self, customer: &Customer, channel: Channel) -> Result<bool> {
        if !customer.has_consent(channel) || !customer.has_contact(channel) {
            return Ok(false);
        }
        Ok(self
            .repos
            .credentials
            .get_active(customer.tenant_id, channel)
            .await?
            .is_some())
    }
}

fn consent_diagnostics(customer: &Customer) -> Vec<IneligibilityReason> {
    let mut reasons = Vec::new();
    if !customer.whatsapp_consent {
        reasons.push(IneligibilityReason::NoWhatsappConsent);
    }
    if !customer.has_phone() {
        reasons.push(IneligibilityReason::NoPhoneNumber);
    }
    if !customer.email_consent {
        reasons.push(IneligibilityReason::NoEmailConsent);
    }
    if !customer.has_email() {
        reasons.push(IneligibilityReason::NoEmailAddress);
    }
    reasons
}

fn rule_specific_reasons(
    rule: &AutomationRule,
    customer: &Customer,
    ctx: &EligibilityContext,
    offset: chrono::FixedOffset,
) -> Vec<IneligibilityReason> {
    let mut reasons = Vec::new();

    let (min_days_inactive, min_visits) = match rule.action() {
        RuleAction::PeriodicCheck {
            min_days_inactive,
            min_visits,
            ..
        } => (*min_days_inactive, *min_visits),
        RuleAction::SegmentChanged { from_segment, .. } => {
            if let Some(expected) = from_segment {
                if ctx.previous_segment != Some(*expected) {
                    reasons.push(IneligibilityReason::WrongPreviousSegment);
                }
            }
            (None, None)
        }
        RuleAction::PostVisit { .. } => (None, None),
    };

    let inactivity_threshold = min_days_inactive.or_else(|| {
        (rule.target_segment == Segment::Inactive).then_some(DEFAULT_MIN_DAYS_INACTIVE)
    });
    if let (Some(threshold), Some(last_visit)) = (inactivity_threshold, customer.last_visit_at) {
        if calendar_days_between(last_visit, ctx.now, offset) < threshold {
            reasons.push(IneligibilityReason::NotInactiveEnough);
        }
    }

    if rule.target_segment == Segment::AtRisk
        && customer.total_visits < min_visits.unwrap_or(DEFAULT_MIN_VISITS_AT_RISK)
    {
        reasons.push(IneligibilityReason::NotFrequentEnoughForRisk);
    }

    reasons
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use comanda_storage::fixtures;
    use comanda_storage::models::{MessageTemplate, Tenant};
    use comanda_storage::MemoryStore;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    struct Fixture {
        store: Arc<MemoryStore>,
        engine: EligibilityEngine,
        tenant: Tenant,
        customer: Customer,
        template: MessageTemplate,
    }

    // Wednesday, inside every default window
    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 12, 14, 0, 0).unwrap()
    }

    async fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let tenant = fixtures::tenant("Casa Lucía");
        let mut customer = fixtures::customer(tenant.id, "Ana");
        customer.total_visits = 5;
        customer.last_visit_at = Some(now() - Duration::days(10));
        let template = fixtures::template(tenant.id, Channel::Whatsapp, "Hola {{first_name}}");

        store.insert_tenant(tenant.clone()).await;
        store.insert_customer(customer.clone()).await;
        store.insert_template(template.clone()).await;
        store
            .insert_credentials(fixtures::whatsapp_credentials(tenant.id, "http://localhost"))
            .await;
        store
            .insert_credentials(fixtures::email_credentials(tenant.id))
            .await;

        Fixture {
            engine: EligibilityEngine::new(Repositories::in_memory(store.clone())),
            store,
            tenant,
            customer,
            template,
        }
    }

    impl Fixture {
        async fn rule(&self, configure: impl FnOnce(&mut AutomationRule)) -> AutomationRule {
            let mut rule = fixtures::rule(
                self.tenant.id,
                self.template.id,
                Segment::Regular,
                fixtures::periodic(Channel::Whatsapp),
            );
            configure(&mut rule);
            self.store.insert_rule(rule.clone()).await;
            rule
        }

        async fn check(&self, rule: &AutomationRule) -> EligibilityDecision {
            self.engine
                .check(self.customer.id, rule.id, EligibilityContext::at(now()))
                .await
                .unwrap()
        }
    }

    #[tokio::test]
    async fn test_eligible_customer() {
        let f = fixture().await;
        let rule = f.rule(|_| {}).await;

        let decision = f.check(&rule).await;
        assert_eq!(decision.reasons, vec![]);
        assert!(decision.eligible);
        assert_eq!(decision.channel, Some(Channel::Whatsapp));
    }

    #[tokio::test]
    async fn test_missing_records_are_reasons() {
        let f = fixture().await;
        let rule = f.rule(|_| {}).await;

        let decision = f
            .engine
            .check(uuid::Uuid::now_v7(), rule.id, EligibilityContext::at(now()))
            .await
            .unwrap();
        assert_eq!(decision.reasons, vec![IneligibilityReason::CustomerNotFound]);

        let decision = f
            .engine
            .check(f.customer.id, uuid::Uuid::now_v7(), EligibilityContext::at(now()))
            .await
            .unwrap();
        assert_eq!(decision.reasons, vec![IneligibilityReason::RuleNotFound]);
    }

    #[tokio::test]
    async fn test_inactive_rule_is_hard_stop() {
        let f = fixture().await;
        let rule = f.rule(|r| r.active = false).await;
        f.store
            .update_customer(f.customer.id, |c| c.notifications_enabled = false)
            .await;

        let decision = f.check(&rule).await;
        assert_eq!(decision.reasons, vec![IneligibilityReason::RuleInactive]);
    }

    #[tokio::test]
    async fn test_cooldown() {
        let f = fixture().await;
        let rule = f
            .rule(|r| {
                r.cooldown_days = 7;
                r.max_executions_per_customer = 10;
            })
            .await;

        f.store
            .insert_message(fixtures::sent_message(&f.customer, &rule, now() - Duration::days(3)))
            .await;
        let decision = f.check(&rule).await;
        assert!(!decision.eligible);
        assert_eq!(decision.reasons, vec![IneligibilityReason::CooldownActive]);

        let g = fixture().await;
        let rule = g
            .rule(|r| {
                r.cooldown_days = 7;
                r.max_executions_per_customer = 10;
            })
            .await;
        g.store
            .insert_message(fixtures::sent_message(&g.customer, &rule, now() - Duration::days(8)))
            .await;
        assert!(g.check(&rule).await.eligible);
    }

    #[tokio::test]
    async fn test_execution_cap() {
        let f = fixture().await;
        let rule = f
            .rule(|r| {
                r.cooldown_days = 0;
                r.max_executions_per_customer = 1;
            })
            .await;
        f.store
            .insert_message(fixtures::sent_message(&f.customer, &rule, now() - Duration::days(90)))
            .await;

        let decision = f.check(&rule).await;
        assert_eq!(
            decision.reasons,
            vec![IneligibilityReason::MaxExecutionsReached]
        );
    }

    #[tokio::test]
    async fn test_tenant_daily_cap() {
        let f = fixture().await;
        let rule = f.rule(|r| r.max_daily_executions = 5).await;
        let other_rule = f.rule(|_| {}).await;

        for i in 0..5 {
            let other = fixtures::customer(f.tenant.id, &format!("Cliente{}", i));
            f.store
                .insert_message(fixtures::scheduled_message(
                    &other,
                    &other_rule,
                    now() - Duration::hours(1),
                ))
                .await;
        }

        let decision = f.check(&rule).await;
        assert_eq!(decision.reasons, vec![IneligibilityReason::DailyLimitReached]);
    }

    #[tokio::test]
    async fn test_in_flight_message_excluded() {
        let f = fixture().await;
        let rule = f.rule(|r| r.max_daily_executions = 1).await;
        let message = fixtures::scheduled_message(&f.customer, &rule, now());
        f.store.insert_message(message.clone()).await;

        let decision = f.check(&rule).await;
        assert_eq!(
            decision.reasons,
            vec![
                IneligibilityReason::DailyLimitReached,
                IneligibilityReason::AlreadyScheduled
            ]
        );

        let decision = f
            .engine
            .check(
                f.customer.id,
                rule.id,
                EligibilityContext::at(now()).excluding(message.id),
            )
            .await
            .unwrap();
        assert!(decision.eligible);
    }

    #[tokio::test]
    async fn test_time_and_day_windows() {
        let f = fixture().await;
        let rule = f
            .rule(|r| {
                r.execution_hours_start = 18;
                r.execution_hours_end = 22;
                r.execution_days_of_week = vec![6, 7];
            })
            .await;

        let decision = f.check(&rule).await;
        assert_eq!(
            decision.reasons,
            vec![
                IneligibilityReason::OutsideTimeWindow,
                IneligibilityReason::OutsideAllowedDays
            ]
        );
    }

    #[tokio::test]
    async fn test_collects_all_reasons() {
        let f = fixture().await;
        let rule = f.rule(|_| {}).await;
        f.store
            .update_customer(f.customer.id, |c| {
                c.notifications_enabled = false;
                c.whatsapp_consent = false;
                c.email = None;
            })
            .await;

        let decision = f.check(&rule).await;
        assert_eq!(
            decision.reasons,
            vec![
                IneligibilityReason::NotificationsDisabled,
                IneligibilityReason::NoValidChannel,
                IneligibilityReason::NoWhatsappConsent,
                IneligibilityReason::NoEmailAddress,
            ]
        );
        assert_eq!(
            decision.reason_codes(),
            "notifications_disabled,no_valid_channel,no_whatsapp_consent,no_email_address"
        );
    }

    #[tokio::test]
    async fn test_check_is_deterministic() {
        let f = fixture().await;
        let rule = f
            .rule(|r| {
                r.execution_days_of_week = vec![1];
                r.cooldown_days = 30;
                r.max_executions_per_customer = 5;
            })
            .await;
        f.store
            .insert_message(fixtures::sent_message(&f.customer, &rule, now() - Duration::days(2)))
            .await;

        let first = f.check(&rule).await;
        let second = f.check(&rule).await;
        assert_eq!(first, second);
        assert_eq!(first.reasons.len(), 2);
    }

    #[tokio::test]
    async fn test_channel_fallback_and_credentials() {
        let f = fixture().await;
        let rule = f
            .rule(|r| {
                r.action_config.0 = RuleAction::PeriodicCheck {
                    delivery: DeliveryPreference {
                        preferred_channel: Channel::Whatsapp,
                        fallback_to_email: true,
                    },
                    min_days_inactive: None,
                    min_visits: None,
                }
            })
            .await;
        f.store
            .update_customer(f.customer.id, |c| c.whatsapp_consent = false)
            .await;

        let decision = f.check(&rule).await;
        assert_eq!(decision.channel, Some(Channel::Email));

        // without active email credentials nothing is usable
        let mut disabled = fixtures::email_credentials(f.tenant.id);
        disabled.active = false;
        f.store.insert_credentials(disabled).await;

        let decision = f.check(&rule).await;
        assert_eq!(decision.channel, None);
        assert_eq!(
            decision.reasons,
            vec![
                IneligibilityReason::NoValidChannel,
                IneligibilityReason::NoWhatsappConsent
            ]
        );
    }

    #[test]
    fn test_select_channel_priority() {
        let whatsapp_first = DeliveryPreference {
            preferred_channel: Channel::Whatsapp,
            fallback_to_email: false,
        };
        let email_first = DeliveryPreference {
            preferred_channel: Channel::Email,
            fallback_to_email: false,
        };

        assert_eq!(select_channel(&whatsapp_first, true, true), Some(Channel::Whatsapp));
        assert_eq!(select_channel(&whatsapp_first, false, true), None);
        assert_eq!(select_channel(&email_first, true, true), Some(Channel::Email));
        assert_eq!(select_channel(&email_first, true, false), Some(Channel::Whatsapp));
        assert_eq!(select_channel(&email_first, false, false), None);
    }

    #[tokio::test]
    async fn test_rule_specific_gates() {
        let f = fixture().await;

        let inactive = f
            .rule(|r| {
                r.target_segment = Segment::Inactive;
            })
            .await;
        // last visit 10 days ago, default threshold 30
        assert_eq!(
            f.check(&inactive).await.reasons,
            vec![IneligibilityReason::NotInactiveEnough]
        );

        let at_risk = f
            .rule(|r| {
                r.target_segment = Segment::AtRisk;
                r.action_config.0 = RuleAction::PeriodicCheck {
                    delivery: DeliveryPreference {
                        preferred_channel: Channel::Whatsapp,
                        fallback_to_email: false,
                    },
                    min_days_inactive: None,
                    min_visits: Some(6),
                };
            })
            .await;
        assert_eq!(
            f.check(&at_risk).await.reasons,
            vec![IneligibilityReason::NotFrequentEnoughForRisk]
        );

        let changed = f
            .rule(|r| {
                r.action_config.0 = RuleAction::SegmentChanged {
                    delivery: DeliveryPreference {
                        preferred_channel: Channel::Whatsapp,
                        fallback_to_email: false,
                    },
                    from_segment: Some(Segment::Vip),
                };
            })
            .await;
        assert_eq!(
            f.check(&changed).await.reasons,
            vec![IneligibilityReason::WrongPreviousSegment]
        );

        let decision = f
            .engine
            .check(
                f.customer.id,
                changed.id,
                EligibilityContext::at(now()).with_previous_segment(Some(Segment::Vip)),
            )
            .await
            .unwrap();
        assert!(decision.eligible);
    }
}
