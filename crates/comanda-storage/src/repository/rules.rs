//! Automation rule repository

use crate::db::{db_err, DatabasePool};
use crate::models::{AutomationRule, TriggerKind};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use comanda_common::types::{RuleId, TenantId};
use comanda_common::Result;

/// Automation rule repository trait
#[async_trait]
pub trait RuleRepository: Send + Sync {
    async fn get(&self, id: RuleId) -> Result<Option<AutomationRule>>;

    /// Active rules of one trigger kind for a tenant
    async fn list_active(
        &self,
        tenant_id: TenantId,
        trigger: TriggerKind,
    ) -> Result<Vec<AutomationRule>>;

    /// Bump execution bookkeeping after a pass
    async fn record_execution(
        &self,
        id: RuleId,
        executed_at: DateTime<Utc>,
        created: i64,
    ) -> Result<()>;
}

/// Database automation rule repository
pub struct DbRuleRepository {
    pool: DatabasePool,
}

impl DbRuleRepository {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RuleRepository for DbRuleRepository {
    async fn get(&self, id: RuleId) -> Result<Option<AutomationRule>> {
        sqlx::query_as::<_, AutomationRule>("SELECT * FROM automation_rules WHERE id = $1")
            .bind(id)
            .fetch_optional(self.pool.pool())
            .await
            .map_err(db_err)
    }

    async fn list_active(
        &self,
        tenant_id: TenantId,
        trigger: TriggerKind,
    ) -> Result<Vec<AutomationRule>> {
        sqlx::query_as::<_, AutomationRule>(
            r#"
            SELECT * FROM automation_rules
            WHERE tenant_id = $1 AND trigger_kind = $2 AND active
            ORDER BY created_at, id
            "#,
        )
        .bind(tenant_id)
        .bind(trigger)
        .fetch_all(self.pool.pool())
        .await
        .map_err(db_err)
    }

    async fn record_execution(
        &self,
        id: RuleId,
        executed_at: DateTime<Utc>,
        created: i64,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE automation_rules SET
                last_executed_at = $2,
                execution_count = execution_count + $3,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(executed_at)
        .bind(created)
        .execute(self.pool.pool())
        .await
        .map_err(db_err)?;

        Ok(())
    }
}
