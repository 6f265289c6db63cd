//! Customer repository

use crate::db::{db_err, DatabasePool};
use crate::models::{CandidateFilter, Customer, Segment, VisitAggregate};
use async_trait::async_trait;
use comanda_common::types::{CustomerId, TenantId};
use comanda_common::Result;

/// Customer repository trait
#[async_trait]
pub trait CustomerRepository: Send + Sync {
    async fn get(&self, id: CustomerId) -> Result<Option<Customer>>;

    /// All customer ids of a tenant, in stable order
    async fn list_ids(&self, tenant_id: TenantId) -> Result<Vec<CustomerId>>;

    /// Aggregate the customer's visit history
    async fn visit_aggregate(
        &self,
        tenant_id: TenantId,
        customer_id: CustomerId,
    ) -> Result<VisitAggregate>;

    /// Write lifecycle stats back onto the customer
    async fn update_stats(
        &self,
        tenant_id: TenantId,
        customer_id: CustomerId,
        stats: &VisitAggregate,
    ) -> Result<()>;

    async fn update_segment(
        &self,
        tenant_id: TenantId,
        customer_id: CustomerId,
        segment: Segment,
    ) -> Result<()>;

    /// Reachable customers in a segment, ordered by id
    async fn list_candidates(&self, filter: &CandidateFilter) -> Result<Vec<Customer>>;
}

/// Database customer repository
pub struct DbCustomerRepository {
    pool: DatabasePool,
}

impl DbCustomerRepository {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CustomerRepository for DbCustomerRepository {
    async fn get(&self, id: CustomerId) -> Result<Option<Customer>> {
        sqlx::query_as::<_, Customer>("SELECT * FROM customers WHERE id = $1")
            .bind(id)
            .fetch_optional(self.pool.pool())
            .await
            .map_err(db_err)
    }

    async fn list_ids(&self, tenant_id: TenantId) -> Result<Vec<CustomerId>> {
        sqlx::query_scalar::<_, CustomerId>(
            "SELECT id FROM customers WHERE tenant_id = $1 ORDER BY id",
        )
        .bind(tenant_id)
        .fetch_all(self.pool.pool())
        .await
        .map_err(db_err)
    }

    async fn visit_aggregate(
        &self,
        tenant_id: TenantId,
        customer_id: CustomerId,
    ) -> Result<VisitAggregate> {
        sqlx::query_as::<_, VisitAggregate>(
            r#"
            SELECT COUNT(*)::BIGINT AS total_visits,
                   COALESCE(SUM(amount), 0)::DOUBLE PRECISION AS total_spent,
                   MAX(visited_at) AS last_visit_at
            FROM customer_visits
            WHERE tenant_id = $1 AND customer_id = $2
            "#,
        )
        .bind(tenant_id)
        .bind(customer_id)
        .fetch_one(self.pool.pool())
        .await
        .map_err(db_err)
    }

    async fn update_stats(
        &self,
        tenant_id: TenantId,
        customer_id: CustomerId,
        stats: &VisitAggregate,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE customers SET
                total_visits = $3,
                total_spent = $4,
                last_visit_at = $5,
                updated_at = NOW()
            WHERE tenant_id = $1 AND id = $2
            "#,
        )
        .bind(tenant_id)
        .bind(customer_id)
        .bind(i32::try_from(stats.total_visits).unwrap_or(i32::MAX))
        .bind(stats.total_spent)
        .bind(stats.last_visit_at)
        .execute(self.pool.pool())
        .await
        .map_err(db_err)?;

        Ok(())
    }

    async fn update_segment(
        &self,
        tenant_id: TenantId,
        customer_id: CustomerId,
        segment: Segment,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE customers SET segment = $3, updated_at = NOW() WHERE tenant_id = $1 AND id = $2",
        )
        .bind(tenant_id)
        .bind(customer_id)
        .bind(segment)
        .execute(self.pool.pool())
        .await
        .map_err(db_err)?;

        Ok(())
    }

    async fn list_candidates(&self, filter: &CandidateFilter) -> Result<Vec<Customer>> {
        sqlx::query_as::<_, Customer>(
            r#"
            SELECT * FROM customers
            WHERE tenant_id = $1
              AND segment = $2
              AND notifications_enabled
              AND (
                  (whatsapp_consent AND COALESCE(TRIM(phone), '') <> '')
                  OR (email_consent AND COALESCE(TRIM(email), '') <> '')
              )
              AND ($3::TIMESTAMPTZ IS NULL OR last_visit_at IS NULL OR last_visit_at < $3)
            ORDER BY id
            LIMIT $4
            "#,
        )
        .bind(filter.tenant_id)
        .bind(filter.segment)
        .bind(filter.last_visit_before)
        .bind(filter.limit)
        .fetch_all(self.pool.pool())
        .await
        .map_err(db_err)
    }
}
