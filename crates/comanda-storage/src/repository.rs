//! Repository layer for data access

pub mod channel_credentials;
pub mod customers;
pub mod interaction_logs;
pub mod rules;
pub mod scheduled_messages;
pub mod templates;
pub mod tenants;

use crate::db::DatabasePool;
use crate::memory::MemoryStore;
use std::sync::Arc;

// Re-export concrete repository implementations
pub use channel_credentials::DbChannelCredentialsRepository;
pub use customers::DbCustomerRepository;
pub use interaction_logs::DbInteractionLogRepository;
pub use rules::DbRuleRepository;
pub use scheduled_messages::DbScheduledMessageRepository;
pub use templates::DbTemplateRepository;
pub use tenants::DbTenantRepository;

// Re-export repository traits
pub use channel_credentials::ChannelCredentialsRepository;
pub use customers::CustomerRepository;
pub use interaction_logs::InteractionLogRepository;
pub use rules::RuleRepository;
pub use scheduled_messages::ScheduledMessageRepository;
pub use templates::TemplateRepository;
pub use tenants::TenantRepository;

/// Every repository the pipeline needs, behind trait objects
#[derive(Clone)]
pub struct Repositories {
    pub tenants: Arc<dyn TenantRepository>,
    pub customers: Arc<dyn CustomerRepository>,
    pub rules: Arc<dyn RuleRepository>,
    pub templates: Arc<dyn TemplateRepository>,
    pub messages: Arc<dyn ScheduledMessageRepository>,
    pub interactions: Arc<dyn InteractionLogRepository>,
    pub credentials: Arc<dyn ChannelCredentialsRepository>,
}

impl Repositories {
    /// Postgres-backed repositories sharing one pool
    pub fn postgres(pool: DatabasePool) -> Self {
        Self {
            tenants: Arc::new(DbTenantRepository::new(pool.clone())),
            customers: Arc::new(DbCustomerRepository::new(pool.clone())),
            rules: Arc::new(DbRuleRepository::new(pool.clone())),
            templates: Arc::new(DbTemplateRepository::new(pool.clone())),
            messages: Arc::new(DbScheduledMessageRepository::new(pool.clone())),
            interactions: Arc::new(DbInteractionLogRepository::new(pool.clone())),
            credentials: Arc::new(DbChannelCredentialsRepository::new(pool)),
        }
    }

    /// Repositories backed by a single in-memory store
    pub fn in_memory(store: Arc<MemoryStore>) -> Self {
        Self {
            tenants: store.clone(),
            customers: store.clone(),
            rules: store.clone(),
            templates: store.clone(),
            messages: store.clone(),
            interactions: store.clone(),
            credentials: store,
        }
    }
}
