//! Delivery worker handlers

use axum::{extract::State, http::StatusCode, Json};
use comanda_common::Error;
use comanda_core::DeliveryPassReport;
use comanda_storage::models::{QueueStats, ScheduledMessage};
use serde::Deserialize;
use std::sync::Arc;

use super::ApiError;
use crate::auth::AppState;

/// Provider delivery receipt
#[derive(Debug, Clone, Deserialize)]
pub struct DeliveryReceipt {
    pub provider_message_id: String,
}

/// Run one delivery pass now
pub async fn run_delivery(State(state): State<Arc<AppState>>) -> Json<DeliveryPassReport> {
    Json(state.worker.run_once().await)
}

/// Message counts per status
pub async fn queue_stats(State(state): State<Arc<AppState>>) -> Result<Json<QueueStats>, ApiError> {
    Ok(Json(state.repos.messages.queue_stats().await?))
}

/// Mark a sent message as delivered
pub async fn confirm_receipt(
    State(state): State<Arc<AppState>>,
    Json(receipt): Json<DeliveryReceipt>,
) -> Result<(StatusCode, Json<ScheduledMessage>), ApiError> {
    if receipt.provider_message_id.trim().is_empty() {
        return Err(Error::Validation("provider_message_id is required".to_string()).into());
    }

    let message = state
        .worker
        .confirm_delivery(&receipt.provider_message_id)
        .await?
        .ok_or_else(|| {
            Error::NotFound(format!(
                "sent message with provider id {}",
                receipt.provider_message_id
            ))
        })?;

    Ok((StatusCode::OK, Json(message)))
}
