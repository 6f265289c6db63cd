//! Authentication module
//!
//! Job endpoints are called by an external scheduler holding a shared secret.

use axum::{
    extract::{Request, State},
    http::StatusCode,
    middleware::Next,
    response::Response,
};
use comanda_core::{AutomationOrchestrator, DeliveryWorker, Metrics};
use comanda_storage::{DatabasePool, Repositories};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::{debug, warn};

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub repos: Repositories,
    pub orchestrator: Arc<AutomationOrchestrator>,
    pub worker: Arc<DeliveryWorker>,
    pub metrics: Arc<Metrics>,
    /// Shared secret for job endpoints; every call is rejected when unset
    pub job_secret: Option<String>,
    /// Checked by the readiness probe when present
    pub db_pool: Option<DatabasePool>,
}

/// Extract the presented secret from `Authorization: Bearer` or `X-API-Key`
pub fn extract_api_key(req: &Request) -> Option<&str> {
    if let Some(auth) = req.headers().get("authorization") {
        if let Some(token) = auth.to_str().ok().and_then(|s| s.strip_prefix("Bearer ")) {
            return Some(token.trim());
        }
    }

    req.headers()
        .get("x-api-key")
        .and_then(|key| key.to_str().ok())
        .map(str::trim)
}

/// Compare fixed-size digests instead of the raw strings
fn verify_secret(presented: &str, expected: &str) -> bool {
    Sha256::digest(presented.as_bytes()) == Sha256::digest(expected.as_bytes())
}

/// Authentication middleware
pub async fn auth_middleware(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    let Some(expected) = state.job_secret.as_deref().filter(|s| !s.is_empty()) else {
        warn!(
            "Rejecting request to {}: no job secret configured",
            request.uri().path()
        );
        return Err(StatusCode::UNAUTHORIZED);
    };

    let presented = extract_api_key(&request).ok_or_else(|| {
        warn!("Missing job secret in request to {}", request.uri().path());
        StatusCode::UNAUTHORIZED
    })?;

    if !verify_secret(presented, expected) {
        warn!("Invalid job secret in request to {}", request.uri().path());
        return Err(StatusCode::UNAUTHORIZED);
    }

    debug!("Job request authenticated for {}", request.uri().path());
    Ok(next.run(request).await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;

    fn request(header: &str, value: &str) -> Request {
        Request::builder()
            .uri("/api/v1/automation/run")
            .header(header, value)
            .body(Body::empty())
            .unwrap()
    }

    #[test]
    fn extracts_bearer_and_api_key_headers() {
        assert_eq!(
            extract_api_key(&request("authorization", "Bearer s3cret")),
            Some("s3cret")
        );
        assert_eq!(extract_api_key(&request("x-api-key", "s3cret")), Some("s3cret"));
        assert_eq!(extract_api_key(&request("authorization", "Basic abc")), None);
    }

    #[test]
    fn verifies_secret() {
        assert!(verify_secret("s3cret", "s3cret"));
        assert!(!verify_secret("s3cret ", "s3cret"));
        assert!(!verify_secret("", "s3cret"));
    }
}
