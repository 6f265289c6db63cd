//! Comanda Core - Customer automation pipeline
//!
//! This crate provides segmentation, rule evaluation, eligibility checks,
//! template rendering and the delivery worker that sends scheduled messages
//! over WhatsApp and email.

pub mod automation;
pub mod delivery;
mod guard;
pub mod metrics;

pub use automation::{
    AutomationOrchestrator, AutomationRunReport, AutomationRunStats, EligibilityContext,
    EligibilityDecision, EligibilityEngine, IneligibilityReason, SegmentationService,
    TemplateRenderer,
};
pub use delivery::{
    DeliveryPassReport, DeliveryWorker, EmailTransport, MessageTransport, TransportError,
    TransportRegistry, WhatsAppTransport,
};
pub use metrics::Metrics;
