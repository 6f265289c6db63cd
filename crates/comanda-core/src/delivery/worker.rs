//! Delivery Worker - Sends due scheduled messages through channel transports

use super::pacer::Pacer;
use super::transport::{OutboundMessage, ProviderReceipt, TransportError, TransportRegistry};
use crate::automation::eligibility::{EligibilityContext, EligibilityEngine};
use crate::automation::window::ExecutionWindow;
use crate::guard::PassGuard;
use crate::metrics::Metrics;
use chrono::{DateTime, Duration, Offset, Utc};
use comanda_common::config::DeliveryConfig;
use comanda_common::Result;
use comanda_storage::models::{
    content_preview, Channel, CreateInteractionLog, InteractionKind, ScheduledMessage,
    SendReceipt,
};
use comanda_storage::Repositories;
use futures::future::join_all;
use serde::Serialize;
use serde_json::json;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration as StdDuration;
use tokio::time::{interval, timeout, Instant};
use tracing::{debug, error, info, warn};

/// What happened to one message in a pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Sent,
    /// Ineligible at send time (terminal)
    Skipped,
    /// Back in the queue for another attempt
    Retried,
    Failed,
    /// Another worker claimed the message first
    LostClaim,
}

impl DeliveryOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryOutcome::Sent => "sent",
            DeliveryOutcome::Skipped => "skipped",
            DeliveryOutcome::Retried => "retried",
            DeliveryOutcome::Failed => "failed",
            DeliveryOutcome::LostClaim => "lost_claim",
        }
    }
}

/// Summary of one delivery pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryPassReport {
    pub already_running: bool,
    pub fetched: usize,
    pub sent: usize,
    pub skipped: usize,
    pub retried: usize,
    pub failed: usize,
    pub lost_claims: usize,
    /// Stale claims returned to the queue or failed
    pub released: u64,
    pub deadline_reached: bool,
    pub errors: Vec<String>,
}

impl DeliveryPassReport {
    fn record(&mut self, outcome: DeliveryOutcome) {
        match outcome {
            DeliveryOutcome::Sent => self.sent += 1,
            DeliveryOutcome::Skipped => self.skipped += 1,
            DeliveryOutcome::Retried => self.retried += 1,
            DeliveryOutcome::Failed => self.failed += 1,
            DeliveryOutcome::LostClaim => self.lost_claims += 1,
        }
    }
}

/// Delivery worker
pub struct DeliveryWorker {
    repos: Repositories,
    eligibility: EligibilityEngine,
    transports: TransportRegistry,
    metrics: Arc<Metrics>,
    config: DeliveryConfig,
    running: AtomicBool,
}

impl DeliveryWorker {
    pub fn new(
        repos: Repositories,
        transports: TransportRegistry,
        metrics: Arc<Metrics>,
        config: DeliveryConfig,
    ) -> Self {
        Self {
            eligibility: EligibilityEngine::new(repos.clone()),
            repos,
            transports,
            metrics,
            config,
            running: AtomicBool::new(false),
        }
    }

    /// Poll the queue forever
    pub async fn run(&self) {
        let mut ticker = interval(StdDuration::from_secs(self.config.poll_interval_secs.max(1)));

        info!(
            "Delivery worker started (batch: {}, interval: {}s)",
            self.config.batch_size, self.config.poll_interval_secs
        );

        loop {
            ticker.tick().await;

            let report = self.run_once().await;
            if report.fetched > 0 || !report.errors.is_empty() {
                info!(
                    fetched = report.fetched,
                    sent = report.sent,
                    skipped = report.skipped,
                    retried = report.retried,
                    failed = report.failed,
                    errors = report.errors.len(),
                    "Delivery pass finished"
                );
            }
        }
    }

    pub async fn run_once(&self) -> DeliveryPassReport {
        self.run_once_at(Utc::now()).await
    }

    /// One pass over messages due at `now`
    pub async fn run_once_at(&self, now: DateTime<Utc>) -> DeliveryPassReport {
        let mut report = DeliveryPassReport::default();

        let Some(_guard) = PassGuard::acquire(&self.running) else {
            debug!("Delivery pass already in progress");
            report.already_running = true;
            return report;
        };

        let claimed_before = now - Duration::minutes(self.config.stale_claim_minutes);
        match self
            .repos
            .messages
            .release_stale(claimed_before, self.config.max_retries, now)
            .await
        {
            Ok(release) => {
                report.released = release.requeued + release.failed.len() as u64;
                if report.released > 0 {
                    warn!(
                        requeued = release.requeued,
                        failed = release.failed.len(),
                        "Released stale delivery claims"
                    );
                }
                for message in &release.failed {
                    self.metrics.record_delivery(DeliveryOutcome::Failed.as_str());
                    self.log_interaction(
                        message,
                        InteractionKind::MessageFailed,
                        message.channel_final.unwrap_or(message.channel_planned),
                        None,
                        json!({ "error": message.last_error.as_deref().unwrap_or_default() }),
                    )
                    .await;
                }
            }
            Err(e) => report.errors.push(format!("release stale claims: {}", e)),
        }

        let due = match self.repos.messages.list_due(now, self.config.fetch_limit).await {
            Ok(due) => due,
            Err(e) => {
                error!("Failed to fetch due messages: {}", e);
                report.errors.push(format!("fetch due messages: {}", e));
                return report;
            }
        };
        report.fetched = due.len();

        let deadline = Instant::now() + StdDuration::from_secs(self.config.pass_deadline_secs);
        let mut pacer = Pacer::new(StdDuration::from_millis(self.config.batch_pacing_ms));

        for batch in due.chunks(self.config.batch_size.max(1)) {
            pacer.ready().await;
            if Instant::now() >= deadline {
                warn!("Delivery pass deadline reached, leaving the rest for the next pass");
                report.deadline_reached = true;
                break;
            }

            let results = join_all(batch.iter().map(|message| self.deliver(message, now))).await;
            for (message, result) in batch.iter().zip(results) {
                match result {
                    Ok(outcome) => {
                        self.metrics.record_delivery(outcome.as_str());
                        report.record(outcome);
                    }
                    Err(e) => {
                        error!(message_id = %message.id, "Delivery failed: {}", e);
                        report.errors.push(format!("message {}: {}", message.id, e));
                    }
                }
            }
        }

        report
    }

    /// Mark a sent message as delivered from a provider receipt
    pub async fn confirm_delivery(
        &self,
        provider_message_id: &str,
    ) -> Result<Option<ScheduledMessage>> {
        let confirmed = self
            .repos
            .messages
            .confirm_delivery(provider_message_id, Utc::now())
            .await?;

        match &confirmed {
            Some(message) => debug!(message_id = %message.id, "Delivery confirmed"),
            None => debug!(provider_message_id, "No sent message for receipt"),
        }

        Ok(confirmed)
    }

    async fn deliver(&self, message: &ScheduledMessage, now: DateTime<Utc>) -> Result<DeliveryOutcome> {
        if !self.repos.messages.claim(message.id, now).await? {
            debug!(message_id = %message.id, "Message claimed by another worker");
            return Ok(DeliveryOutcome::LostClaim);
        }

        let ctx = EligibilityContext::at(now)
            .with_previous_segment(message.previous_segment)
            .excluding(message.id);
        let decision = self
            .eligibility
            .check(message.customer_id, message.rule_id, ctx)
            .await?;

        if !decision.eligible {
            let reasons = decision.reason_codes();
            self.metrics.record_rejections(&decision.reasons);
            self.repos
                .messages
                .mark_skipped(message.id, &reasons, now)
                .await?;
            info!(message_id = %message.id, reasons = %reasons, "Message skipped");
            return Ok(DeliveryOutcome::Skipped);
        }

        let channel = decision.channel.unwrap_or(message.channel_planned);
        match self.send(message, channel).await? {
            Ok(receipt) => self.complete(message, channel, receipt, now).await,
            Err(e) => self.handle_failure(message, channel, e, now).await,
        }
    }

    /// Outer error is storage, inner error is the transport's
    async fn send(
        &self,
        message: &ScheduledMessage,
        channel: Channel,
    ) -> Result<std::result::Result<ProviderReceipt, TransportError>> {
        let Some(credentials) = self
            .repos
            .credentials
            .get_active(message.tenant_id, channel)
            .await?
        else {
            return Ok(Err(TransportError::CredentialsMissing(channel)));
        };

        let Some(transport) = self.transports.get(channel) else {
            return Ok(Err(TransportError::Permanent(format!(
                "no transport for {}",
                channel
            ))));
        };

        let customer = self.repos.customers.get(message.customer_id).await?;
        let Some(to) = customer
            .as_ref()
            .and_then(|c| c.address_for(channel))
            .map(str::to_string)
        else {
            return Ok(Err(TransportError::Permanent(format!(
                "customer has no {} address",
                channel
            ))));
        };

        let content_sid = match channel {
            Channel::Whatsapp => self
                .repos
                .templates
                .get(message.tenant_id, message.template_id)
                .await?
                .and_then(|t| t.provider_template_id),
            Channel::Email => None,
        };
        let content_variables = content_sid.as_ref().map(|_| json!(message.variables.0));

        let outbound = OutboundMessage {
            to,
            subject: message.subject.clone(),
            body: message.body.clone(),
            content_sid,
            content_variables,
        };

        let limit = StdDuration::from_secs(self.config.transport_timeout_secs);
        Ok(match timeout(limit, transport.send(&credentials, &outbound)).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout(limit)),
        })
    }

    async fn complete(
        &self,
        message: &ScheduledMessage,
        channel: Channel,
        receipt: ProviderReceipt,
        now: DateTime<Utc>,
    ) -> Result<DeliveryOutcome> {
        let sent = SendReceipt {
            channel,
            provider_message_id: receipt.provider_message_id.clone(),
            provider_response: receipt.response.clone(),
            sent_at: now,
        };
        if !self.repos.messages.mark_sent(message.id, &sent).await? {
            warn!(message_id = %message.id, "Message left processing before it was marked sent");
            return Ok(DeliveryOutcome::LostClaim);
        }

        self.log_interaction(
            message,
            InteractionKind::MessageSent,
            channel,
            Some(receipt.provider_message_id.clone()),
            receipt.response,
        )
        .await;

        info!(
            message_id = %message.id,
            channel = %channel,
            provider_message_id = %receipt.provider_message_id,
            "Message sent"
        );
        Ok(DeliveryOutcome::Sent)
    }

    async fn handle_failure(
        &self,
        message: &ScheduledMessage,
        channel: Channel,
        err: TransportError,
        now: DateTime<Utc>,
    ) -> Result<DeliveryOutcome> {
        let error_text = err.to_string();

        if err.is_retryable() {
            let attempt = message.retry_count + 1;
            if attempt <= self.config.max_retries {
                let retry_at = self.retry_time(message, attempt, now).await?;
                self.repos
                    .messages
                    .reschedule(message.id, attempt, retry_at, &error_text, now)
                    .await?;
                warn!(
                    message_id = %message.id,
                    attempt,
                    retry_at = %retry_at,
                    "Delivery failed, retrying: {}", error_text
                );
                return Ok(DeliveryOutcome::Retried);
            }
        }

        self.repos
            .messages
            .mark_failed(message.id, message.retry_count, &error_text, now)
            .await?;

        self.log_interaction(
            message,
            InteractionKind::MessageFailed,
            channel,
            None,
            json!({ "error": error_text }),
        )
        .await;

        error!(message_id = %message.id, channel = %channel, "Delivery failed: {}", error_text);
        Ok(DeliveryOutcome::Failed)
    }

    /// Linear backoff, moved into the rule's window
    async fn retry_time(
        &self,
        message: &ScheduledMessage,
        attempt: i32,
        now: DateTime<Utc>,
    ) -> Result<DateTime<Utc>> {
        let at = now + Duration::seconds(self.config.retry_delay_base_secs * i64::from(attempt));

        let Some(rule) = self.repos.rules.get(message.rule_id).await? else {
            return Ok(at);
        };
        let offset = self
            .repos
            .tenants
            .get(message.tenant_id)
            .await?
            .map(|t| t.offset())
            .unwrap_or_else(|| Utc.fix());

        Ok(ExecutionWindow::from_rule(&rule).adjust(at, offset))
    }

    async fn log_interaction(
        &self,
        message: &ScheduledMessage,
        kind: InteractionKind,
        channel: Channel,
        provider_message_id: Option<String>,
        provider_response: serde_json::Value,
    ) {
        let entry = CreateInteractionLog {
            tenant_id: message.tenant_id,
            customer_id: message.customer_id,
            rule_id: Some(message.rule_id),
            scheduled_message_id: message.id,
            kind,
            channel: Some(channel),
            provider_message_id,
            provider_response,
            content_preview: content_preview(&message.body),
        };

        if let Err(e) = self.repos.interactions.insert(entry).await {
            warn!(message_id = %message.id, "Failed to write interaction log: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delivery::transport::MessageTransport;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use comanda_storage::fixtures;
    use comanda_storage::models::{
        AutomationRule, ChannelCredentials, Customer, DeliveryPreference, RuleAction,
        ScheduledMessageStatus, Segment,
    };
    use comanda_storage::{MemoryStore, ScheduledMessageRepository};
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakeTransport {
        channel: Channel,
        fail_with: Option<fn() -> TransportError>,
        calls: AtomicUsize,
    }

    impl FakeTransport {
        fn ok() -> Arc<Self> {
            Arc::new(Self {
                channel: Channel::Whatsapp,
                fail_with: None,
                calls: AtomicUsize::new(0),
            })
        }

        fn email() -> Arc<Self> {
            Arc::new(Self {
                channel: Channel::Email,
                fail_with: None,
                calls: AtomicUsize::new(0),
            })
        }

        fn failing(fail_with: fn() -> TransportError) -> Arc<Self> {
            Arc::new(Self {
                channel: Channel::Whatsapp,
                fail_with: Some(fail_with),
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl MessageTransport for FakeTransport {
        fn channel(&self) -> Channel {
            self.channel
        }

        async fn send(
            &self,
            _credentials: &ChannelCredentials,
            _message: &OutboundMessage,
        ) -> std::result::Result<ProviderReceipt, TransportError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            match self.fail_with {
                Some(fail) => Err(fail()),
                None => Ok(ProviderReceipt {
                    provider_message_id: format!("SM{}", n),
                    response: json!({ "status": "queued" }),
                }),
            }
        }
    }

    // Wednesday afternoon
    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 12, 14, 0, 0).unwrap()
    }

    struct Fixture {
        store: Arc<MemoryStore>,
        worker: DeliveryWorker,
        customer: Customer,
        rule: AutomationRule,
    }

    fn config() -> DeliveryConfig {
        DeliveryConfig {
            batch_pacing_ms: 0,
            retry_delay_base_secs: 0,
            ..DeliveryConfig::default()
        }
    }

    async fn fixture(transport: Arc<FakeTransport>, config: DeliveryConfig) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let tenant = fixtures::tenant("Casa Lucía");
        let customer = fixtures::customer(tenant.id, "Ana");
        let template = fixtures::template(tenant.id, Channel::Whatsapp, "Hola {{first_name}}");
        let rule = fixtures::rule(
            tenant.id,
            template.id,
            Segment::New,
            fixtures::periodic(Channel::Whatsapp),
        );

        store.insert_tenant(tenant.clone()).await;
        store.insert_customer(customer.clone()).await;
        store.insert_template(template).await;
        store.insert_rule(rule.clone()).await;
        store
            .insert_credentials(fixtures::whatsapp_credentials(tenant.id, "http://localhost"))
            .await;

        let worker = DeliveryWorker::new(
            Repositories::in_memory(store.clone()),
            TransportRegistry::new().with(transport),
            Arc::new(Metrics::new().unwrap()),
            config,
        );

        Fixture {
            store,
            worker,
            customer,
            rule,
        }
    }

    impl Fixture {
        async fn enqueue(&self) -> ScheduledMessage {
            let message =
                fixtures::scheduled_message(&self.customer, &self.rule, now() - Duration::minutes(1));
            self.store.insert_message(message.clone()).await;
            message
        }

        async fn stored(&self, message: &ScheduledMessage) -> ScheduledMessage {
            ScheduledMessageRepository::get(self.store.as_ref(), message.id)
                .await
                .unwrap()
                .unwrap()
        }
    }

    #[tokio::test]
    async fn test_sends_due_message() {
        let f = fixture(FakeTransport::ok(), config()).await;
        let message = f.enqueue().await;

        let report = f.worker.run_once_at(now()).await;
        assert_eq!(report.fetched, 1);
        assert_eq!(report.sent, 1);
        assert!(report.errors.is_empty());

        let stored = f.stored(&message).await;
        assert_eq!(stored.status, ScheduledMessageStatus::Sent);
        assert_eq!(stored.channel_final, Some(Channel::Whatsapp));
        assert_eq!(stored.provider_message_id.as_deref(), Some("SM0"));
        assert_eq!(stored.sent_at, Some(now()));

        let logs = f.store.interaction_logs().await;
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].kind, InteractionKind::MessageSent);
        assert_eq!(logs[0].content_preview, "Hola Ana");
    }

    #[tokio::test]
    async fn test_retry_exhaustion() {
        let transport = FakeTransport::failing(|| TransportError::Transient("503".into()));
        let f = fixture(transport.clone(), config()).await;
        let message = f.enqueue().await;

        for attempt in 1..=3 {
            let report = f.worker.run_once_at(now()).await;
            assert_eq!(report.retried, 1, "attempt {}", attempt);
            let stored = f.stored(&message).await;
            assert_eq!(stored.status, ScheduledMessageStatus::Planned);
            assert_eq!(stored.retry_count, attempt);
        }

        let report = f.worker.run_once_at(now()).await;
        assert_eq!(report.failed, 1);

        let stored = f.stored(&message).await;
        assert_eq!(stored.status, ScheduledMessageStatus::Failed);
        assert_eq!(stored.retry_count, 3);
        assert!(stored.last_error.unwrap().contains("503"));

        // terminal: nothing left to pick up
        let report = f.worker.run_once_at(now()).await;
        assert_eq!(report.fetched, 0);
        assert_eq!(transport.calls.load(Ordering::SeqCst), 4);

        let logs = f.store.interaction_logs().await;
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].kind, InteractionKind::MessageFailed);
    }

    #[tokio::test]
    async fn test_credentials_missing_is_terminal() {
        let transport =
            FakeTransport::failing(|| TransportError::CredentialsMissing(Channel::Whatsapp));
        let f = fixture(transport, config()).await;
        let message = f.enqueue().await;

        let report = f.worker.run_once_at(now()).await;
        assert_eq!(report.failed, 1);

        let stored = f.stored(&message).await;
        assert_eq!(stored.status, ScheduledMessageStatus::Failed);
        assert_eq!(stored.retry_count, 0);
    }

    #[tokio::test]
    async fn test_retry_moves_into_window() {
        let transport = FakeTransport::failing(|| TransportError::Timeout(StdDuration::from_secs(15)));
        let f = fixture(
            transport,
            DeliveryConfig {
                retry_delay_base_secs: 3600,
                ..config()
            },
        )
        .await;
        let mut rule = f.rule.clone();
        rule.id = uuid::Uuid::now_v7();
        rule.execution_hours_start = 9;
        rule.execution_hours_end = 14;
        f.store.insert_rule(rule.clone()).await;

        let message = fixtures::scheduled_message(&f.customer, &rule, now());
        f.store.insert_message(message.clone()).await;

        let report = f.worker.run_once_at(now()).await;
        assert_eq!(report.retried, 1);

        // 15:00 is past the window, next attempt is Thursday 09:00
        let stored = f.stored(&message).await;
        assert_eq!(
            stored.scheduled_for,
            Utc.with_ymd_and_hms(2024, 6, 13, 9, 0, 0).unwrap()
        );
    }

    #[tokio::test]
    async fn test_ineligible_message_is_skipped() {
        let transport = FakeTransport::ok();
        let f = fixture(transport.clone(), config()).await;
        let message = f.enqueue().await;
        f.store
            .update_customer(f.customer.id, |c| c.notifications_enabled = false)
            .await;

        let report = f.worker.run_once_at(now()).await;
        assert_eq!(report.skipped, 1);

        let stored = f.stored(&message).await;
        assert_eq!(stored.status, ScheduledMessageStatus::Skipped);
        assert_eq!(stored.last_error.as_deref(), Some("notifications_disabled"));
        assert_eq!(transport.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_claimed_message_is_not_sent_twice() {
        let transport = FakeTransport::ok();
        let f = fixture(transport.clone(), config()).await;
        let message = f.enqueue().await;

        assert!(f.store.claim(message.id, now()).await.unwrap());

        let outcome = f.worker.deliver(&message, now()).await.unwrap();
        assert_eq!(outcome, DeliveryOutcome::LostClaim);
        assert_eq!(transport.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_concurrent_pass_reports_already_running() {
        let f = fixture(FakeTransport::ok(), config()).await;
        f.enqueue().await;

        f.worker.running.store(true, Ordering::SeqCst);
        let report = f.worker.run_once_at(now()).await;
        assert!(report.already_running);
        assert_eq!(report.fetched, 0);

        f.worker.running.store(false, Ordering::SeqCst);
        let report = f.worker.run_once_at(now()).await;
        assert!(!report.already_running);
        assert_eq!(report.sent, 1);
        assert!(!f.worker.running.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_confirm_delivery() {
        let f = fixture(FakeTransport::ok(), config()).await;
        let message = f.enqueue().await;
        f.worker.run_once_at(now()).await;

        let confirmed = f.worker.confirm_delivery("SM0").await.unwrap();
        assert_eq!(confirmed.map(|m| m.id), Some(message.id));
        assert_eq!(
            f.stored(&message).await.status,
            ScheduledMessageStatus::Delivered
        );

        assert!(f.worker.confirm_delivery("SM0").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_falls_back_to_email_without_whatsapp_consent() {
        let whatsapp = FakeTransport::ok();
        let email = FakeTransport::email();
        let f = fixture(whatsapp.clone(), config()).await;
        let worker = DeliveryWorker::new(
            Repositories::in_memory(f.store.clone()),
            TransportRegistry::new()
                .with(whatsapp.clone())
                .with(email.clone()),
            Arc::new(Metrics::new().unwrap()),
            config(),
        );
        f.store
            .insert_credentials(fixtures::email_credentials(f.customer.tenant_id))
            .await;

        let mut rule = f.rule.clone();
        rule.id = uuid::Uuid::now_v7();
        rule.action_config.0 = RuleAction::PeriodicCheck {
            delivery: DeliveryPreference {
                preferred_channel: Channel::Whatsapp,
                fallback_to_email: true,
            },
            min_days_inactive: None,
            min_visits: None,
        };
        f.store.insert_rule(rule.clone()).await;
        f.store
            .update_customer(f.customer.id, |c| c.whatsapp_consent = false)
            .await;

        let message = fixtures::scheduled_message(&f.customer, &rule, now() - Duration::minutes(1));
        f.store.insert_message(message.clone()).await;

        let report = worker.run_once_at(now()).await;
        assert_eq!(report.sent, 1);

        let stored = f.stored(&message).await;
        assert_eq!(stored.status, ScheduledMessageStatus::Sent);
        assert_eq!(stored.channel_planned, Channel::Whatsapp);
        assert_eq!(stored.channel_final, Some(Channel::Email));
        assert_eq!(whatsapp.calls.load(Ordering::SeqCst), 0);
        assert_eq!(email.calls.load(Ordering::SeqCst), 1);

        let logs = f.store.interaction_logs().await;
        assert_eq!(logs[0].channel, Some(Channel::Email));
    }

    #[tokio::test]
    async fn test_pass_fetches_at_most_fetch_limit() {
        let transport = FakeTransport::ok();
        let f = fixture(transport.clone(), config()).await;
        for i in 0..60 {
            let customer = fixtures::customer(f.customer.tenant_id, &format!("Cliente {}", i));
            f.store.insert_customer(customer.clone()).await;
            f.store
                .insert_message(fixtures::scheduled_message(
                    &customer,
                    &f.rule,
                    now() - Duration::minutes(1),
                ))
                .await;
        }

        let report = f.worker.run_once_at(now()).await;
        assert_eq!(report.fetched, 50);
        assert_eq!(report.sent, 50);
        assert_eq!(transport.calls.load(Ordering::SeqCst), 50);

        let planned = f
            .store
            .messages()
            .await
            .into_iter()
            .filter(|m| m.status == ScheduledMessageStatus::Planned)
            .count();
        assert_eq!(planned, 10);

        let report = f.worker.run_once_at(now()).await;
        assert_eq!(report.fetched, 10);
        assert_eq!(report.sent, 10);
    }

    #[tokio::test]
    async fn test_exhausted_stale_claim_is_failed_and_logged() {
        let transport = FakeTransport::ok();
        let f = fixture(transport.clone(), config()).await;
        let mut message =
            fixtures::scheduled_message(&f.customer, &f.rule, now() - Duration::hours(2));
        message.retry_count = 3;
        f.store.insert_message(message.clone()).await;
        assert!(f
            .store
            .claim(message.id, now() - Duration::hours(1))
            .await
            .unwrap());

        let report = f.worker.run_once_at(now()).await;
        assert_eq!(report.released, 1);
        assert_eq!(report.fetched, 0);
        assert_eq!(transport.calls.load(Ordering::SeqCst), 0);

        let stored = f.stored(&message).await;
        assert_eq!(stored.status, ScheduledMessageStatus::Failed);

        let logs = f.store.interaction_logs().await;
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].kind, InteractionKind::MessageFailed);
        assert_eq!(logs[0].scheduled_message_id, message.id);
        assert_eq!(logs[0].channel, Some(Channel::Whatsapp));
    }
}
