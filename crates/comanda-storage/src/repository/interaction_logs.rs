//! Interaction log repository (append-only)

use crate::db::{db_err, DatabasePool};
use crate::models::{CreateInteractionLog, InteractionLog};
use async_trait::async_trait;
use comanda_common::Result;
use uuid::Uuid;

/// Interaction log repository trait
#[async_trait]
pub trait InteractionLogRepository: Send + Sync {
    async fn insert(&self, input: CreateInteractionLog) -> Result<InteractionLog>;
}

/// Database interaction log repository
pub struct DbInteractionLogRepository {
    pool: DatabasePool,
}

impl DbInteractionLogRepository {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl InteractionLogRepository for DbInteractionLogRepository {
    async fn insert(&self, input: CreateInteractionLog) -> Result<InteractionLog> {
        sqlx::query_as::<_, InteractionLog>(
            r#"
            INSERT INTO interaction_logs (
                id, tenant_id, customer_id, rule_id, scheduled_message_id,
                kind, channel, provider_message_id, provider_response, content_preview
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            RETURNING *
            "#,
        )
        .bind(Uuid::now_v7())
        .bind(input.tenant_id)
        .bind(input.customer_id)
        .bind(input.rule_id)
        .bind(input.scheduled_message_id)
        .bind(input.kind)
        .bind(input.channel)
        .bind(&input.provider_message_id)
        .bind(&input.provider_response)
        .bind(&input.content_preview)
        .fetch_one(self.pool.pool())
        .await
        .map_err(db_err)
    }
}
