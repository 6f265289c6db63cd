//! Comanda API - HTTP surface for the automation jobs
//!
//! Health probes, authenticated job triggers for the daily orchestrator and
//! the delivery worker, delivery receipts and Prometheus metrics.

pub mod auth;
pub mod handlers;
pub mod routes;

pub use auth::AppState;
pub use routes::create_router;
