//! Customer stats recompute and segment classification

use super::window::calendar_days_between;
use chrono::{DateTime, Utc};
use comanda_common::config::SegmentationConfig;
use comanda_common::types::{CustomerId, TenantId};
use comanda_common::{Error, Result};
use comanda_storage::models::{Segment, Tenant, VisitAggregate};
use comanda_storage::Repositories;
use tracing::debug;

/// A customer's segment moved between two labels
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentChange {
    pub customer_id: CustomerId,
    pub previous: Segment,
    pub current: Segment,
}

/// Classify a customer from lifecycle stats
pub fn classify(
    total_visits: i32,
    total_spent: f64,
    days_since_last_visit: Option<i64>,
    config: &SegmentationConfig,
) -> Segment {
    let days = match days_since_last_visit {
        Some(days) if total_visits > 0 => days,
        _ => return Segment::New,
    };

    if days >= config.inactive_after_days {
        Segment::Inactive
    } else if days >= config.at_risk_after_days {
        Segment::AtRisk
    } else if total_visits >= config.vip_min_visits || total_spent >= config.vip_min_spent {
        Segment::Vip
    } else if total_visits >= config.regular_min_visits {
        Segment::Regular
    } else {
        Segment::New
    }
}

/// Writes stats and segment labels back onto customers
#[derive(Clone)]
pub struct SegmentationService {
    repos: Repositories,
    config: SegmentationConfig,
}

impl SegmentationService {
    pub fn new(repos: Repositories, config: SegmentationConfig) -> Self {
        Self { repos, config }
    }

    /// Aggregate visit history and store it on the customer
    pub async fn recompute_stats(
        &self,
        tenant_id: TenantId,
        customer_id: CustomerId,
    ) -> Result<VisitAggregate> {
        let stats = self
            .repos
            .customers
            .visit_aggregate(tenant_id, customer_id)
            .await?;

        self.repos
            .customers
            .update_stats(tenant_id, customer_id, &stats)
            .await?;

        Ok(stats)
    }

    /// Reclassify the customer; returns the change when the label moved
    pub async fn recompute_segment(
        &self,
        tenant: &Tenant,
        customer_id: CustomerId,
        now: DateTime<Utc>,
    ) -> Result<Option<SegmentChange>> {
        let customer = self
            .repos
            .customers
            .get(customer_id)
            .await?
            .filter(|c| c.tenant_id == tenant.id)
            .ok_or_else(|| Error::NotFound(format!("customer {}", customer_id)))?;

        let days = customer
            .last_visit_at
            .map(|last| calendar_days_between(last, now, tenant.offset()));
        let segment = classify(customer.total_visits, customer.total_spent, days, &self.config);

        if segment == customer.segment {
            return Ok(None);
        }

        self.repos
            .customers
            .update_segment(tenant.id, customer_id, segment)
            .await?;

        debug!(
            customer_id = %customer_id,
            previous = %customer.segment,
            current = %segment,
            "Customer segment changed"
        );

        Ok(Some(SegmentChange {
            customer_id,
            previous: customer.segment,
            current: segment,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use comanda_storage::{fixtures, CustomerRepository, MemoryStore};
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    #[test]
    fn test_classify() {
        let config = SegmentationConfig::default();

        assert_eq!(classify(0, 0.0, None, &config), Segment::New);
        assert_eq!(classify(1, 20.0, Some(2), &config), Segment::New);
        assert_eq!(classify(3, 90.0, Some(5), &config), Segment::Regular);
        assert_eq!(classify(10, 300.0, Some(5), &config), Segment::Vip);
        assert_eq!(classify(2, 1500.0, Some(5), &config), Segment::Vip);
        assert_eq!(classify(12, 2000.0, Some(30), &config), Segment::AtRisk);
        assert_eq!(classify(12, 2000.0, Some(60), &config), Segment::Inactive);
    }

    #[tokio::test]
    async fn test_recompute_stats_and_segment() {
        let store = Arc::new(MemoryStore::new());
        let tenant = fixtures::tenant("Casa Lucía");
        let customer = fixtures::customer(tenant.id, "Ana");
        let now = Utc::now();

        store.insert_tenant(tenant.clone()).await;
        store.insert_customer(customer.clone()).await;
        for days_ago in [50, 45, 40] {
            store
                .insert_visit(fixtures::visit(
                    tenant.id,
                    customer.id,
                    25.0,
                    now - Duration::days(days_ago),
                ))
                .await;
        }

        let service = SegmentationService::new(
            Repositories::in_memory(store.clone()),
            SegmentationConfig::default(),
        );

        let stats = service.recompute_stats(tenant.id, customer.id).await.unwrap();
        assert_eq!(stats.total_visits, 3);
        assert_eq!(stats.total_spent, 75.0);

        let change = service
            .recompute_segment(&tenant, customer.id, now)
            .await
            .unwrap();
        assert_eq!(
            change,
            Some(SegmentChange {
                customer_id: customer.id,
                previous: Segment::New,
                current: Segment::AtRisk,
            })
        );

        // second pass sees the stored label and reports nothing
        let again = service
            .recompute_segment(&tenant, customer.id, now)
            .await
            .unwrap();
        assert_eq!(again, None);

        let stored = store.get(customer.id).await.unwrap().unwrap();
        assert_eq!(stored.segment, Segment::AtRisk);
        assert_eq!(stored.total_visits, 3);
    }
}
