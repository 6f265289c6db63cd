//! Automation Module - Segmentation, eligibility and the daily orchestrator

pub mod eligibility;
pub mod orchestrator;
pub mod segmentation;
pub mod template;
pub mod window;

pub use eligibility::{
    EligibilityContext, EligibilityDecision, EligibilityEngine, IneligibilityReason,
};
pub use orchestrator::{AutomationOrchestrator, AutomationRunReport, AutomationRunStats};
pub use segmentation::{classify, SegmentChange, SegmentationService};
pub use template::{RenderedMessage, TemplateRenderer};
pub use window::ExecutionWindow;
