//! Daily Orchestrator - Recomputes customers and turns rules into scheduled messages
//!
//! Tenants are processed one after another. Within a tenant, stats and
//! segments are recomputed in bounded concurrent batches, then periodic and
//! segment-change rules are evaluated candidate by candidate so that the
//! daily cap sees every message created earlier in the same run.

use super::eligibility::{
    EligibilityContext, EligibilityEngine, IneligibilityReason, DEFAULT_MIN_DAYS_INACTIVE,
};
use super::segmentation::{SegmentChange, SegmentationService};
use super::template::TemplateRenderer;
use super::window::{local_day_bounds, ExecutionWindow};
use crate::guard::PassGuard;
use crate::metrics::Metrics;
use chrono::{DateTime, Duration, FixedOffset, TimeZone, Utc};
use comanda_common::config::{AutomationConfig, SegmentationConfig};
use comanda_common::types::CustomerId;
use comanda_common::{Error, Result};
use comanda_storage::models::{
    AutomationRule, CandidateFilter, CreateScheduledMessage, RuleAction, Segment, Tenant,
    TriggerKind,
};
use comanda_storage::Repositories;
use futures::future::join_all;
use serde::Serialize;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::{Duration as StdDuration, Instant};
use tracing::{debug, error, info, warn};

/// Counters for one orchestrator run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AutomationRunStats {
    pub tenants_processed: u64,
    pub customers_processed: u64,
    pub segments_updated: u64,
    pub rules_evaluated: u64,
    pub messages_created: u64,
    pub candidates_skipped: u64,
    pub errors: Vec<String>,
}

/// Result of `run_daily`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AutomationRunReport {
    pub success: bool,
    /// Milliseconds
    pub duration: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Another run held the pass when this one was requested
    pub already_running: bool,
    pub stats: AutomationRunStats,
}

impl AutomationRunReport {
    fn failed(started: Instant, error: String, stats: AutomationRunStats) -> Self {
        Self {
            success: false,
            duration: elapsed_ms(started),
            error: Some(error),
            already_running: false,
            stats,
        }
    }
}

/// Daily automation orchestrator
pub struct AutomationOrchestrator {
    repos: Repositories,
    segmentation: SegmentationService,
    eligibility: EligibilityEngine,
    renderer: TemplateRenderer,
    metrics: Arc<Metrics>,
    config: AutomationConfig,
    running: AtomicBool,
}

impl AutomationOrchestrator {
    pub fn new(
        repos: Repositories,
        config: AutomationConfig,
        segmentation: SegmentationConfig,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            segmentation: SegmentationService::new(repos.clone(), segmentation),
            eligibility: EligibilityEngine::new(repos.clone()),
            renderer: TemplateRenderer::new(),
            repos,
            metrics,
            config,
            running: AtomicBool::new(false),
        }
    }

    /// Fire `run_daily` once a day at the configured UTC hour
    pub async fn run_scheduled(&self) {
        info!(
            "Automation scheduler started (daily at {:02}:00 UTC)",
            self.config.daily_run_hour_utc
        );

        loop {
            let now = Utc::now();
            let next = next_run_after(now, self.config.daily_run_hour_utc);
            let wait = (next - now).to_std().unwrap_or(StdDuration::ZERO);
            debug!(next_run = %next, "Waiting for next automation run");
            tokio::time::sleep(wait).await;

            let report = self.run_daily().await;
            if !report.success {
                error!(
                    error = report.error.as_deref().unwrap_or_default(),
                    "Scheduled automation run failed"
                );
            }
        }
    }

    pub async fn run_daily(&self) -> AutomationRunReport {
        self.run_daily_at(Utc::now()).await
    }

    /// Run the whole pipeline as of `now`
    pub async fn run_daily_at(&self, now: DateTime<Utc>) -> AutomationRunReport {
        let started = Instant::now();
        let Some(_guard) = PassGuard::acquire(&self.running) else {
            warn!("Automation run already in progress");
            let mut report = AutomationRunReport::failed(
                started,
                "automation run already in progress".to_string(),
                AutomationRunStats::default(),
            );
            report.already_running = true;
            return report;
        };

        let deadline = started + StdDuration::from_secs(self.config.run_deadline_secs);
        let mut stats = AutomationRunStats::default();

        info!("Daily automation run started");

        let tenants = match self.repos.tenants.list_active().await {
            Ok(tenants) => tenants,
            Err(e) => {
                error!("Failed to list tenants: {}", e);
                self.metrics.record_run(false);
                return AutomationRunReport::failed(
                    started,
                    format!("tenant listing failed: {}", e),
                    stats,
                );
            }
        };

        for tenant in &tenants {
            if Instant::now() >= deadline {
                warn!("Automation run deadline exceeded");
                stats.errors.push("run deadline exceeded".to_string());
                break;
            }
            self.process_tenant(tenant, now, deadline, &mut stats).await;
            stats.tenants_processed += 1;
        }

        info!(
            tenants = stats.tenants_processed,
            customers = stats.customers_processed,
            segments_updated = stats.segments_updated,
            rules = stats.rules_evaluated,
            created = stats.messages_created,
            skipped = stats.candidates_skipped,
            errors = stats.errors.len(),
            "Daily automation run finished"
        );

        self.metrics.record_run(true);
        AutomationRunReport {
            success: true,
            duration: elapsed_ms(started),
            error: None,
            already_running: false,
            stats,
        }
    }

    async fn process_tenant(
        &self,
        tenant: &Tenant,
        now: DateTime<Utc>,
        deadline: Instant,
        stats: &mut AutomationRunStats,
    ) {
        debug!(tenant_id = %tenant.id, "Processing tenant");

        let customer_ids = match self.repos.customers.list_ids(tenant.id).await {
            Ok(ids) => ids,
            Err(e) => {
                stats
                    .errors
                    .push(format!("tenant {}: list customers: {}", tenant.id, e));
                return;
            }
        };

        self.recompute_stats(tenant, &customer_ids, stats).await;
        let changes = self.recompute_segments(tenant, &customer_ids, now, stats).await;

        match self
            .repos
            .rules
            .list_active(tenant.id, TriggerKind::PeriodicCheck)
            .await
        {
            Ok(rules) => {
                for rule in &rules {
                    if Instant::now() >= deadline {
                        stats.errors.push("run deadline exceeded".to_string());
                        return;
                    }
                    self.evaluate_periodic(tenant, rule, now, stats).await;
                }
            }
            Err(e) => stats
                .errors
                .push(format!("tenant {}: list periodic rules: {}", tenant.id, e)),
        }

        if changes.is_empty() {
            return;
        }

        match self
            .repos
            .rules
            .list_active(tenant.id, TriggerKind::SegmentChanged)
            .await
        {
            Ok(rules) => {
                for rule in &rules {
                    if Instant::now() >= deadline {
                        stats.errors.push("run deadline exceeded".to_string());
                        return;
                    }
                    self.evaluate_segment_changes(tenant, rule, &changes, now, stats)
                        .await;
                }
            }
            Err(e) => stats
                .errors
                .push(format!("tenant {}: list segment rules: {}", tenant.id, e)),
        }
    }

    async fn recompute_stats(
        &self,
        tenant: &Tenant,
        customer_ids: &[CustomerId],
        stats: &mut AutomationRunStats,
    ) {
        for batch in customer_ids.chunks(self.config.stats_batch_size.max(1)) {
            let results = join_all(
                batch
                    .iter()
                    .map(|id| self.segmentation.recompute_stats(tenant.id, *id)),
            )
            .await;

            for (id, result) in batch.iter().zip(results) {
                match result {
                    Ok(_) => stats.customers_processed += 1,
                    Err(e) => {
                        warn!(customer_id = %id, "Stats recompute failed: {}", e);
                        stats.errors.push(format!("customer {}: stats: {}", id, e));
                    }
                }
            }
        }
    }

    async fn recompute_segments(
        &self,
        tenant: &Tenant,
        customer_ids: &[CustomerId],
        now: DateTime<Utc>,
        stats: &mut AutomationRunStats,
    ) -> Vec<SegmentChange> {
        let mut changes = Vec::new();

        for batch in customer_ids.chunks(self.config.stats_batch_size.max(1)) {
            let results = join_all(
                batch
                    .iter()
                    .map(|id| self.segmentation.recompute_segment(tenant, *id, now)),
            )
            .await;

            for (id, result) in batch.iter().zip(results) {
                match result {
                    Ok(Some(change)) => {
                        stats.segments_updated += 1;
                        changes.push(change);
                    }
                    Ok(None) => {}
                    Err(e) => {
                        warn!(customer_id = %id, "Segment recompute failed: {}", e);
                        stats.errors.push(format!("customer {}: segment: {}", id, e));
                    }
                }
            }
        }

        changes
    }

    async fn evaluate_periodic(
        &self,
        tenant: &Tenant,
        rule: &AutomationRule,
        now: DateTime<Utc>,
        stats: &mut AutomationRunStats,
    ) {
        stats.rules_evaluated += 1;

        let filter = CandidateFilter {
            tenant_id: tenant.id,
            segment: rule.target_segment,
            last_visit_before: inactivity_cutoff(rule, now, tenant.offset()),
            limit: self.config.candidate_limit,
        };

        let candidates = match self.repos.customers.list_candidates(&filter).await {
            Ok(candidates) => candidates,
            Err(e) => {
                stats
                    .errors
                    .push(format!("rule {}: list candidates: {}", rule.id, e));
                return;
            }
        };

        let mut created = 0;
        for candidate in &candidates {
            match self.schedule(tenant, rule, candidate.id, None, now).await {
                Ok(true) => created += 1,
                Ok(false) => stats.candidates_skipped += 1,
                Err(e) => stats.errors.push(format!(
                    "rule {} customer {}: {}",
                    rule.id, candidate.id, e
                )),
            }
        }

        self.finish_rule(rule, created, now, stats).await;
    }

    async fn evaluate_segment_changes(
        &self,
        tenant: &Tenant,
        rule: &AutomationRule,
        changes: &[SegmentChange],
        now: DateTime<Utc>,
        stats: &mut AutomationRunStats,
    ) {
        stats.rules_evaluated += 1;

        let mut created = 0;
        for change in changes.iter().filter(|c| c.current == rule.target_segment) {
            match self
                .schedule(tenant, rule, change.customer_id, Some(change.previous), now)
                .await
            {
                Ok(true) => created += 1,
                Ok(false) => stats.candidates_skipped += 1,
                Err(e) => stats.errors.push(format!(
                    "rule {} customer {}: {}",
                    rule.id, change.customer_id, e
                )),
            }
        }

        self.finish_rule(rule, created, now, stats).await;
    }

    async fn finish_rule(
        &self,
        rule: &AutomationRule,
        created: u64,
        now: DateTime<Utc>,
        stats: &mut AutomationRunStats,
    ) {
        stats.messages_created += created;
        let created = i64::try_from(created).unwrap_or(i64::MAX);
        if let Err(e) = self.repos.rules.record_execution(rule.id, now, created).await {
            stats
                .errors
                .push(format!("rule {}: bookkeeping: {}", rule.id, e));
        }
        debug!(rule_id = %rule.id, created, "Rule evaluated");
    }

    /// Create a planned message when the customer is eligible.
    /// Returns whether a message was created.
    async fn schedule(
        &self,
        tenant: &Tenant,
        rule: &AutomationRule,
        customer_id: CustomerId,
        previous_segment: Option<Segment>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let ctx = EligibilityContext::at(now).with_previous_segment(previous_segment);
        let decision = self.eligibility.check(customer_id, rule.id, ctx).await?;

        if !decision.eligible {
            self.metrics.record_rejections(&decision.reasons);
            debug!(
                customer_id = %customer_id,
                rule_id = %rule.id,
                reasons = %decision.reason_codes(),
                "Customer not eligible"
            );
            return Ok(false);
        }

        let template = self
            .repos
            .templates
            .get(tenant.id, rule.template_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("template {}", rule.template_id)))?;
        let customer = self
            .repos
            .customers
            .get(customer_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("customer {}", customer_id)))?;

        let rendered = self.renderer.render(&template, &customer, tenant, now);
        let scheduled_for = ExecutionWindow::from_rule(rule).adjust(
            now + Duration::hours(i64::from(template.send_delay_hours)),
            tenant.offset(),
        );

        let created = self
            .repos
            .messages
            .create(CreateScheduledMessage {
                tenant_id: tenant.id,
                customer_id,
                rule_id: rule.id,
                template_id: template.id,
                scheduled_for,
                channel_planned: decision.channel.unwrap_or(rule.delivery().preferred_channel),
                subject: rendered.subject,
                body: rendered.body,
                variables: rendered.variables,
                previous_segment,
                created_at: now,
            })
            .await?;

        // The store keeps one pending message per customer and rule
        let Some(message) = created else {
            self.metrics
                .record_rejections(&[IneligibilityReason::AlreadyScheduled]);
            debug!(customer_id = %customer_id, rule_id = %rule.id, "Already scheduled");
            return Ok(false);
        };

        self.metrics.record_scheduled();
        debug!(
            message_id = %message.id,
            customer_id = %customer_id,
            scheduled_for = %scheduled_for,
            "Message scheduled"
        );
        Ok(true)
    }
}

/// Last-visit cutoff used to pre-filter candidates of inactivity rules.
///
/// A visit before the cutoff is at least `days` tenant-local calendar days
/// old, matching the eligibility gate.
fn inactivity_cutoff(
    rule: &AutomationRule,
    now: DateTime<Utc>,
    offset: FixedOffset,
) -> Option<DateTime<Utc>> {
    let configured = match rule.action() {
        RuleAction::PeriodicCheck {
            min_days_inactive, ..
        } => *min_days_inactive,
        _ => None,
    };
    configured
        .or_else(|| (rule.target_segment == Segment::Inactive).then_some(DEFAULT_MIN_DAYS_INACTIVE))
        .map(|days| local_day_bounds(now, offset).0 - Duration::days(days - 1))
}

/// Next occurrence of `hour:00` UTC strictly after `now`
pub fn next_run_after(now: DateTime<Utc>, hour: u32) -> DateTime<Utc> {
    let today = now
        .date_naive()
        .and_hms_opt(hour.min(23), 0, 0)
        .map(|t| Utc.from_utc_datetime(&t))
        .unwrap_or(now);
    if today > now {
        today
    } else {
        today + Duration::days(1)
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}
