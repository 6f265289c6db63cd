//! Channel transports and their error classification

use async_trait::async_trait;
use comanda_storage::models::{Channel, ChannelCredentials};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Transport failure, classified where it is raised
#[derive(Debug, Error)]
pub enum TransportError {
    /// Network trouble, rate limiting or a provider-side error
    #[error("transient delivery failure: {0}")]
    Transient(String),

    /// The provider refused this message for good
    #[error("permanent delivery failure: {0}")]
    Permanent(String),

    #[error("no active {0} credentials")]
    CredentialsMissing(Channel),

    #[error("credentials rejected: {0}")]
    CredentialsRejected(String),

    #[error("provider did not answer within {0:?}")]
    Timeout(Duration),
}

impl TransportError {
    /// Whether another attempt may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, TransportError::Transient(_) | TransportError::Timeout(_))
    }
}

/// A rendered message ready for a provider
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundMessage {
    /// Phone number or email address
    pub to: String,
    pub subject: Option<String>,
    pub body: String,
    /// Provider-side approved template, sent instead of a free-form body
    pub content_sid: Option<String>,
    pub content_variables: Option<serde_json::Value>,
}

/// What a provider returned for an accepted message
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderReceipt {
    pub provider_message_id: String,
    pub response: serde_json::Value,
}

/// Sends messages over one channel
#[async_trait]
pub trait MessageTransport: Send + Sync {
    fn channel(&self) -> Channel;

    async fn send(
        &self,
        credentials: &ChannelCredentials,
        message: &OutboundMessage,
    ) -> Result<ProviderReceipt, TransportError>;
}

/// Transports keyed by channel
#[derive(Clone, Default)]
pub struct TransportRegistry {
    transports: HashMap<Channel, Arc<dyn MessageTransport>>,
}

impl TransportRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, transport: Arc<dyn MessageTransport>) -> Self {
        self.transports.insert(transport.channel(), transport);
        self
    }

    pub fn get(&self, channel: Channel) -> Option<Arc<dyn MessageTransport>> {
        self.transports.get(&channel).cloned()
    }
}
