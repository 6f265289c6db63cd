//! Tenant repository

use crate::db::{db_err, DatabasePool};
use crate::models::Tenant;
use async_trait::async_trait;
use comanda_common::types::TenantId;
use comanda_common::Result;

/// Tenant repository trait
#[async_trait]
pub trait TenantRepository: Send + Sync {
    /// Active tenants in listing order
    async fn list_active(&self) -> Result<Vec<Tenant>>;

    async fn get(&self, id: TenantId) -> Result<Option<Tenant>>;
}

/// Database tenant repository
pub struct DbTenantRepository {
    pool: DatabasePool,
}

impl DbTenantRepository {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TenantRepository for DbTenantRepository {
    async fn list_active(&self) -> Result<Vec<Tenant>> {
        sqlx::query_as::<_, Tenant>("SELECT * FROM tenants WHERE active ORDER BY created_at, id")
            .fetch_all(self.pool.pool())
            .await
            .map_err(db_err)
    }

    async fn get(&self, id: TenantId) -> Result<Option<Tenant>> {
        sqlx::query_as::<_, Tenant>("SELECT * FROM tenants WHERE id = $1")
            .bind(id)
            .fetch_optional(self.pool.pool())
            .await
            .map_err(db_err)
    }
}
