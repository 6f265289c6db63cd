//! Channel credentials repository

use crate::db::{db_err, DatabasePool};
use crate::models::{Channel, ChannelCredentials};
use async_trait::async_trait;
use comanda_common::types::TenantId;
use comanda_common::Result;

/// Channel credentials repository trait
#[async_trait]
pub trait ChannelCredentialsRepository: Send + Sync {
    /// Active provider credentials, `None` when missing or disabled
    async fn get_active(
        &self,
        tenant_id: TenantId,
        channel: Channel,
    ) -> Result<Option<ChannelCredentials>>;
}

/// Database channel credentials repository
pub struct DbChannelCredentialsRepository {
    pool: DatabasePool,
}

impl DbChannelCredentialsRepository {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ChannelCredentialsRepository for DbChannelCredentialsRepository {
    async fn get_active(
        &self,
        tenant_id: TenantId,
        channel: Channel,
    ) -> Result<Option<ChannelCredentials>> {
        sqlx::query_as::<_, ChannelCredentials>(
            "SELECT * FROM channel_credentials WHERE tenant_id = $1 AND channel = $2 AND active",
        )
        .bind(tenant_id)
        .bind(channel)
        .fetch_optional(self.pool.pool())
        .await
        .map_err(db_err)
    }
}
