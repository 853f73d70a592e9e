//! HTTP health surface, driven through the router with mock clients.

use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use orchestration_service::config::OrchestratorConfig;
use orchestration_service::services::clients::mock::MockClientFactory;
use orchestration_service::services::metrics::init_metrics;
use orchestration_service::{build_router, AppState};
use serde_json::Value;
use std::sync::Arc;
use tower::util::ServiceExt;

fn configured() -> OrchestratorConfig {
    let mut config = OrchestratorConfig::default();
    config.services = config.services.with_api_keys("test-key");
    config
}

async fn spawn_state(factory: &MockClientFactory) -> AppState {
    let state = AppState::in_memory(&configured(), Arc::new(factory.clone()));
    state.orchestrator.initialize().await.unwrap();
    state
}

async fn get(router: Router, uri: &str) -> (StatusCode, Value) {
    let response = router
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, serde_json::from_slice(&body).unwrap())
}

#[tokio::test]
async fn health_check_reports_every_service() {
    let factory = MockClientFactory::new();
    let router = build_router(spawn_state(&factory).await);

    let (status, body) = get(router, "/health").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
    for service in ["nutrition", "generative_ai", "payment", "identity"] {
        assert_eq!(body["services"][service]["status"], "healthy", "{}", service);
        assert_eq!(body["services"][service]["configured"], true);
        assert_eq!(body["services"][service]["ready"], true);
    }
    assert!(body["last_checked"].is_string());
    assert!(body["uptime"].is_u64());
}

#[tokio::test]
async fn one_failing_service_degrades_but_still_answers_ok() {
    let factory = MockClientFactory::new();
    factory.payment.behavior.set_healthy(false);
    let router = build_router(spawn_state(&factory).await);

    let (status, body) = get(router, "/health").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "degraded");
    assert_eq!(body["services"]["payment"]["status"], "unhealthy");
    assert!(body["services"]["payment"]["error"].is_string());
    assert!(body["services"]["nutrition"].get("error").is_none());
}

#[tokio::test]
async fn three_failing_services_are_unhealthy() {
    let factory = MockClientFactory::new();
    factory.nutrition.behavior.set_healthy(false);
    factory.generative_ai.behavior.set_healthy(false);
    factory.identity.behavior.set_healthy(false);
    let router = build_router(spawn_state(&factory).await);

    let (status, body) = get(router, "/health").await;

    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["status"], "unhealthy");
    assert_eq!(body["services"]["payment"]["status"], "healthy");
}

#[tokio::test]
async fn ready_only_after_initialization() {
    let factory = MockClientFactory::new();
    let state = AppState::in_memory(&configured(), Arc::new(factory));

    let (status, body) = get(build_router(state.clone()), "/ready").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["orchestrator"], "initializing");

    state.orchestrator.initialize().await.unwrap();
    let (status, body) = get(build_router(state.clone()), "/ready").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["orchestrator"], "ready");

    state.orchestrator.shutdown();
    let (status, _) = get(build_router(state), "/ready").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn request_id_is_echoed() {
    let factory = MockClientFactory::new();
    let router = build_router(spawn_state(&factory).await);

    let response = router
        .oneshot(
            Request::builder()
                .uri("/ready")
                .header("x-request-id", "req-123")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.headers()["x-request-id"], "req-123");
}

#[tokio::test]
async fn metrics_are_exposed_in_prometheus_format() {
    init_metrics();
    let factory = MockClientFactory::new();
    let router = build_router(spawn_state(&factory).await);

    // Populates the per-service health gauge.
    let _ = get(router.clone(), "/health").await;

    let response = router
        .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()["content-type"],
        "text/plain; charset=utf-8"
    );

    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let text = String::from_utf8(body.to_vec()).unwrap();
    assert!(text.contains("service_health{service=\"nutrition\"}"));
}
