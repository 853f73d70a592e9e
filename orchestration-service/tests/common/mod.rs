//! Shared helpers for the integration tests.
#![allow(dead_code)]

use axum::{
    body::Body,
    http::{HeaderMap, Method, Request, StatusCode},
    Router,
};
use orchestration_service::config::OrchestratorConfig;
use orchestration_service::services::clients::mock::MockClientFactory;
use orchestration_service::startup::{AppState, Backends};
use secrecy::Secret;
use serde_json::Value;
use std::sync::Arc;
use tower::util::ServiceExt;

pub const TENANT: &str = "tenant-a";
pub const USER: &str = "user-1";
pub const ADMIN_KEY: &str = "test-admin-key";

/// Default configuration with every service given a credential.
pub fn configured() -> OrchestratorConfig {
    let mut config = OrchestratorConfig::default();
    config.services = config.services.with_api_keys("test-key");
    config.admin_api_key = Some(Secret::new(ADMIN_KEY.to_string()));
    config
}

pub async fn ready_state(
    config: &OrchestratorConfig,
    factory: &MockClientFactory,
    backends: Backends,
) -> AppState {
    let state = AppState::new(config, Arc::new(factory.clone()), backends);
    state.orchestrator.initialize().await.unwrap();
    state
}

pub struct TestResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Value,
}

/// Send a request as `USER` of `TENANT`.
pub async fn send(router: &Router, method: Method, uri: &str, body: Option<Value>) -> TestResponse {
    send_as(router, TENANT, USER, method, uri, body).await
}

pub async fn send_as(
    router: &Router,
    tenant_id: &str,
    user_id: &str,
    method: Method,
    uri: &str,
    body: Option<Value>,
) -> TestResponse {
    let builder = Request::builder()
        .header("x-tenant-id", tenant_id)
        .header("x-user-id", user_id);
    dispatch(router, builder, method, uri, body).await
}

/// Send an operator request carrying `admin_key` and no caller identity.
pub async fn send_admin(
    router: &Router,
    admin_key: &str,
    method: Method,
    uri: &str,
    body: Option<Value>,
) -> TestResponse {
    let builder = Request::builder().header("x-admin-api-key", admin_key);
    dispatch(router, builder, method, uri, body).await
}

async fn dispatch(
    router: &Router,
    builder: axum::http::request::Builder,
    method: Method,
    uri: &str,
    body: Option<Value>,
) -> TestResponse {
    let builder = builder.method(method).uri(uri);
    let request = match body {
        Some(json) => builder
            .header("content-type", "application/json")
            .body(Body::from(json.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };

    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let headers = response.headers().clone();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };

    TestResponse {
        status,
        headers,
        body,
    }
}

pub fn consent_body(consent_type: &str) -> Value {
    serde_json::json!({
        "disclaimer_version": "2024-01",
        "ip_address": "203.0.113.7",
        "device_attributes": ["Mozilla/5.0", "1920x1080", "Europe/Berlin"],
        "consent_type": consent_type
    })
}
