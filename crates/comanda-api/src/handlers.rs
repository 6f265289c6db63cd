//! API request handlers

pub mod automation;
pub mod delivery;
pub mod health;
pub mod metrics;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use tracing::error;

pub use health::*;

/// Shared error type rendered as `{ error, code }`
#[derive(Debug)]
pub struct ApiError(pub comanda_common::Error);

impl From<comanda_common::Error> for ApiError {
    fn from(e: comanda_common::Error) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.0.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if status.is_server_error() {
            error!("Request failed: {}", self.0);
        }

        (
            status,
            Json(json!({ "error": self.0.to_string(), "code": self.0.code() })),
        )
            .into_response()
    }
}
