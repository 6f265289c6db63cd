//! Prometheus counters for the automation pipeline

use crate::automation::eligibility::IneligibilityReason;
use prometheus::{Encoder, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};

/// Pipeline metrics registered on a private registry
pub struct Metrics {
    registry: Registry,
    messages_scheduled: IntCounter,
    eligibility_rejections: IntCounterVec,
    deliveries: IntCounterVec,
    automation_runs: IntCounterVec,
}

impl Metrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new_custom(Some("comanda".to_string()), None)?;

        let messages_scheduled = IntCounter::with_opts(Opts::new(
            "messages_scheduled_total",
            "Messages created by the daily orchestrator",
        ))?;
        let eligibility_rejections = IntCounterVec::new(
            Opts::new(
                "eligibility_rejections_total",
                "Eligibility failures by reason",
            ),
            &["reason"],
        )?;
        let deliveries = IntCounterVec::new(
            Opts::new("deliveries_total", "Delivery attempts by outcome"),
            &["outcome"],
        )?;
        let automation_runs = IntCounterVec::new(
            Opts::new("automation_runs_total", "Daily automation runs by status"),
            &["status"],
        )?;

        registry.register(Box::new(messages_scheduled.clone()))?;
        registry.register(Box::new(eligibility_rejections.clone()))?;
        registry.register(Box::new(deliveries.clone()))?;
        registry.register(Box::new(automation_runs.clone()))?;

        Ok(Self {
            registry,
            messages_scheduled,
            eligibility_rejections,
            deliveries,
            automation_runs,
        })
    }

    pub fn record_scheduled(&self) {
        self.messages_scheduled.inc();
    }

    pub fn record_rejections(&self, reasons: &[IneligibilityReason]) {
        for reason in reasons {
            self.eligibility_rejections
                .with_label_values(&[reason.as_str()])
                .inc();
        }
    }

    pub fn record_delivery(&self, outcome: &str) {
        self.deliveries.with_label_values(&[outcome]).inc();
    }

    pub fn record_run(&self, success: bool) {
        let status = if success { "success" } else { "failure" };
        self.automation_runs.with_label_values(&[status]).inc();
    }

    /// Text exposition format
    pub fn render(&self) -> Result<String, prometheus::Error> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_includes_recorded_counters() {
        let metrics = Metrics::new().unwrap();
        metrics.record_scheduled();
        metrics.record_rejections(&[
            IneligibilityReason::CooldownActive,
            IneligibilityReason::CooldownActive,
        ]);
        metrics.record_delivery("sent");
        metrics.record_run(true);

        let text = metrics.render().unwrap();
        assert!(text.contains("comanda_messages_scheduled_total 1"));
        assert!(text.contains("comanda_eligibility_rejections_total{reason=\"cooldown_active\"} 2"));
        assert!(text.contains("comanda_deliveries_total{outcome=\"sent\"} 1"));
        assert!(text.contains("comanda_automation_runs_total{status=\"success\"} 1"));
    }
}
