//! Message template repository

use crate::db::{db_err, DatabasePool};
use crate::models::MessageTemplate;
use async_trait::async_trait;
use comanda_common::types::{TemplateId, TenantId};
use comanda_common::Result;

/// Message template repository trait
#[async_trait]
pub trait TemplateRepository: Send + Sync {
    async fn get(&self, tenant_id: TenantId, id: TemplateId) -> Result<Option<MessageTemplate>>;
}

/// Database message template repository
pub struct DbTemplateRepository {
    pool: DatabasePool,
}

impl DbTemplateRepository {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TemplateRepository for DbTemplateRepository {
    async fn get(&self, tenant_id: TenantId, id: TemplateId) -> Result<Option<MessageTemplate>> {
        sqlx::query_as::<_, MessageTemplate>(
            "SELECT * FROM message_templates WHERE tenant_id = $1 AND id = $2",
        )
        .bind(tenant_id)
        .bind(id)
        .fetch_optional(self.pool.pool())
        .await
        .map_err(db_err)
    }
}
