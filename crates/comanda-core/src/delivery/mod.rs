//! Delivery Module - Queue worker and channel transports

pub mod email;
pub mod pacer;
pub mod transport;
pub mod whatsapp;
pub mod worker;

pub use email::EmailTransport;
pub use pacer::Pacer;
pub use transport::{
    MessageTransport, OutboundMessage, ProviderReceipt, TransportError, TransportRegistry,
};
pub use whatsapp::WhatsAppTransport;
pub use worker::{DeliveryOutcome, DeliveryPassReport, DeliveryWorker};
