//! API routes

use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use crate::auth::{auth_middleware, AppState};
use crate::handlers::{automation, delivery, health, metrics};

/// Create the API router
pub fn create_router(state: AppState) -> Router {
    let state = Arc::new(state);

    // Health check routes (no auth required)
    let health_routes = Router::new()
        .route("/", get(health::health))
        .route("/live", get(health::liveness))
        .route("/ready", get(health::readiness));

    let automation_routes = Router::new().route("/run", post(automation::run_automation));

    let delivery_routes = Router::new()
        .route("/run", post(delivery::run_delivery))
        .route("/queue", get(delivery::queue_stats))
        .route("/receipts", post(delivery::confirm_receipt));

    // API v1 routes with authentication
    let api_v1 = Router::new()
        .nest("/automation", automation_routes)
        .nest("/delivery", delivery_routes)
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ));

    Router::new()
        .nest("/health", health_routes)
        .nest("/api/v1", api_v1)
        .route("/metrics", get(metrics::metrics))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use chrono::Utc;
    use comanda_common::config::{AutomationConfig, DeliveryConfig, SegmentationConfig};
    use comanda_core::{AutomationOrchestrator, DeliveryWorker, Metrics, TransportRegistry};
    use comanda_storage::models::{Channel, ScheduledMessageStatus, Segment};
    use comanda_storage::{fixtures, MemoryStore, Repositories};
    use pretty_assertions::assert_eq;
    use serde_json::Value;
    use tower::ServiceExt;

    const SECRET: &str = "job-secret";

    fn app(store: Arc<MemoryStore>, secret: Option<&str>) -> Router {
        let repos = Repositories::in_memory(store);
        let metrics = Arc::new(Metrics::new().unwrap());

        create_router(AppState {
            orchestrator: Arc::new(AutomationOrchestrator::new(
                repos.clone(),
                AutomationConfig::default(),
                SegmentationConfig::default(),
                metrics.clone(),
            )),
            worker: Arc::new(DeliveryWorker::new(
                repos.clone(),
                TransportRegistry::new(),
                metrics.clone(),
                DeliveryConfig::default(),
            )),
            repos,
            metrics,
            job_secret: secret.map(str::to_string),
            db_pool: None,
        })
    }

    fn post(uri: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("authorization", format!("Bearer {}", SECRET))
            .body(Body::empty())
            .unwrap()
    }

    async fn json_body(response: axum::response::Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn health_needs_no_auth() {
        let app = app(Arc::new(MemoryStore::new()), Some(SECRET));

        for uri in ["/health", "/health/live", "/health/ready"] {
            let response = app
                .clone()
                .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK, "{}", uri);
        }
    }

    #[tokio::test]
    async fn job_endpoints_require_secret() {
        let app = app(Arc::new(MemoryStore::new()), Some(SECRET));

        let missing = Request::builder()
            .method("POST")
            .uri("/api/v1/automation/run")
            .body(Body::empty())
            .unwrap();
        let response = app.clone().oneshot(missing).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let wrong = Request::builder()
            .method("POST")
            .uri("/api/v1/automation/run")
            .header("x-api-key", "nope")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(wrong).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn unset_secret_rejects_everything() {
        let app = app(Arc::new(MemoryStore::new()), None);

        let response = app.oneshot(post("/api/v1/automation/run")).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn automation_run_reports_stats() {
        let store = Arc::new(MemoryStore::new());
        store.insert_tenant(fixtures::tenant("Casa Lucía")).await;
        let app = app(store, Some(SECRET));

        let response = app.oneshot(post("/api/v1/automation/run")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = json_body(response).await;
        assert_eq!(body["success"], true);
        assert_eq!(body["stats"]["tenantsProcessed"], 1);
        assert!(body.get("error").is_none());
    }

    #[tokio::test]
    async fn failed_automation_run_is_500() {
        let store = Arc::new(MemoryStore::new());
        store.fail_tenant_listing().await;
        let app = app(store, Some(SECRET));

        let response = app.oneshot(post("/api/v1/automation/run")).await.unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let body = json_body(response).await;
        assert_eq!(body["success"], false);
        assert!(body["error"].as_str().unwrap().contains("tenant listing"));
    }

    #[tokio::test]
    async fn delivery_run_and_queue() {
        let app = app(Arc::new(MemoryStore::new()), Some(SECRET));

        let response = app.clone().oneshot(post("/api/v1/delivery/run")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await["fetched"], 0);

        let queue = Request::builder()
            .uri("/api/v1/delivery/queue")
            .header("x-api-key", SECRET)
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(queue).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await["planned"], 0);
    }

    #[tokio::test]
    async fn receipt_marks_message_delivered() {
        let store = Arc::new(MemoryStore::new());
        let tenant = fixtures::tenant("Casa Lucía");
        let customer = fixtures::customer(tenant.id, "Ana");
        let template = fixtures::template(tenant.id, Channel::Whatsapp, "Hola");
        let rule = fixtures::rule(
            tenant.id,
            template.id,
            Segment::Regular,
            fixtures::periodic(Channel::Whatsapp),
        );
        let message = fixtures::sent_message(&customer, &rule, Utc::now());
        let provider_id = message.provider_message_id.clone().unwrap();
        store.insert_message(message).await;
        let app = app(store.clone(), Some(SECRET));

        let receipt = |id: &str| {
            Request::builder()
                .method("POST")
                .uri("/api/v1/delivery/receipts")
                .header("authorization", format!("Bearer {}", SECRET))
                .header("content-type", "application/json")
                .body(Body::from(
                    serde_json::json!({ "provider_message_id": id }).to_string(),
                ))
                .unwrap()
        };

        let response = app.clone().oneshot(receipt(&provider_id)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            store.messages().await[0].status,
            ScheduledMessageStatus::Delivered
        );

        let response = app.oneshot(receipt("SM-unknown")).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(json_body(response).await["code"], "NOT_FOUND");
    }

    #[tokio::test]
    async fn metrics_are_public() {
        let app = app(Arc::new(MemoryStore::new()), Some(SECRET));
        app.clone().oneshot(post("/api/v1/automation/run")).await.unwrap();

        let response = app
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(text.contains("comanda_automation_runs_total"));
    }
}
