//! Daily automation job handler

use axum::{extract::State, http::StatusCode, Json};
use comanda_core::AutomationRunReport;
use std::sync::Arc;
use tracing::info;

use crate::auth::AppState;

/// Run the daily orchestrator now.
///
/// 409 when a run is already in progress, 500 when the run failed as a whole.
pub async fn run_automation(
    State(state): State<Arc<AppState>>,
) -> (StatusCode, Json<AutomationRunReport>) {
    info!("Automation run requested");

    let report = state.orchestrator.run_daily().await;
    let status = if report.success {
        StatusCode::OK
    } else if report.already_running {
        StatusCode::CONFLICT
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    };

    (status, Json(report))
}
