//! Consent lifecycle through the HTTP API.

mod common;

use async_trait::async_trait;
use axum::http::{Method, StatusCode};
use common::{configured, consent_body, ready_state, send, USER};
use orchestration_service::build_router;
use orchestration_service::error::OrchestrationError;
use orchestration_service::models::ConsentRecord;
use orchestration_service::services::clients::mock::MockClientFactory;
use orchestration_service::services::{ConsentStore, InMemoryConsentStore};
use orchestration_service::startup::Backends;
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

const CONSENT: &str = "/api/v1/consent";

#[tokio::test]
async fn upgrade_then_partial_revocation() {
    let factory = MockClientFactory::new();
    let state = ready_state(&configured(), &factory, Backends::in_memory()).await;
    let router = build_router(state);

    let basic = send(&router, Method::POST, CONSENT, Some(consent_body("basic"))).await;
    assert_eq!(basic.status, StatusCode::CREATED);
    assert_eq!(basic.body["action"], "granted");
    assert_eq!(basic.body["user_id"], USER);
    assert_eq!(basic.body["device_fingerprint"].as_str().unwrap().len(), 64);

    send(&router, Method::POST, CONSENT, Some(consent_body("premium"))).await;
    let status = send(&router, Method::GET, CONSENT, None).await;
    assert_eq!(status.body["effective_tier"], "premium");

    let revoked = send(
        &router,
        Method::POST,
        "/api/v1/consent/revoke",
        Some(consent_body("enhanced")),
    )
    .await;
    assert_eq!(revoked.status, StatusCode::CREATED);
    assert_eq!(revoked.body["action"], "revoked");

    let status = send(&router, Method::GET, CONSENT, None).await;
    assert_eq!(status.status, StatusCode::OK);
    assert_eq!(status.body["effective_tier"], "basic");
    assert_eq!(status.body["history"].as_array().unwrap().len(), 3);
}

#[tokio::test]
async fn revoking_basic_leaves_nothing_in_force() {
    let factory = MockClientFactory::new();
    let state = ready_state(&configured(), &factory, Backends::in_memory()).await;
    let router = build_router(state.clone());

    send(&router, Method::POST, CONSENT, Some(consent_body("enhanced"))).await;
    send(&router, Method::POST, "/api/v1/consent/revoke", Some(consent_body("basic"))).await;

    let status = send(&router, Method::GET, CONSENT, None).await;
    assert!(status.body["effective_tier"].is_null());

    let response = send(
        &router,
        Method::POST,
        "/api/v1/ai/generate",
        Some(json!({ "prompt": "hello" })),
    )
    .await;
    assert_eq!(response.status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn invalid_ip_address_is_rejected() {
    let factory = MockClientFactory::new();
    let state = ready_state(&configured(), &factory, Backends::in_memory()).await;
    let router = build_router(state);

    let mut body = consent_body("basic");
    body["ip_address"] = json!("not-an-ip");
    let response = send(&router, Method::POST, CONSENT, Some(body)).await;

    assert_eq!(response.status, StatusCode::UNPROCESSABLE_ENTITY);

    let status = send(&router, Method::GET, CONSENT, None).await;
    assert_eq!(status.body["history"].as_array().unwrap().len(), 0);
}

#[tokio::test]
async fn grants_against_a_stale_disclaimer_do_not_count() {
    let factory = MockClientFactory::new();
    let mut config = configured();
    config.consent.disclaimer_version = Some("2025-06".to_string());
    let state = ready_state(&config, &factory, Backends::in_memory()).await;
    let router = build_router(state);

    // consent_body signs the 2024-01 disclaimer.
    send(&router, Method::POST, CONSENT, Some(consent_body("premium"))).await;
    let status = send(&router, Method::GET, CONSENT, None).await;
    assert!(status.body["effective_tier"].is_null());

    let mut current = consent_body("enhanced");
    current["disclaimer_version"] = json!("2025-06");
    send(&router, Method::POST, CONSENT, Some(current)).await;
    let status = send(&router, Method::GET, CONSENT, None).await;
    assert_eq!(status.body["effective_tier"], "enhanced");
}

/// Counts history reads on top of the in-memory store.
#[derive(Default)]
struct CountingConsentStore {
    inner: InMemoryConsentStore,
    history_reads: AtomicUsize,
}

#[async_trait]
impl ConsentStore for CountingConsentStore {
    async fn append(&self, record: &ConsentRecord) -> Result<(), OrchestrationError> {
        self.inner.append(record).await
    }

    async fn history(
        &self,
        tenant_id: &str,
        user_id: &str,
    ) -> Result<Vec<ConsentRecord>, OrchestrationError> {
        self.history_reads.fetch_add(1, Ordering::SeqCst);
        self.inner.history(tenant_id, user_id).await
    }
}

#[tokio::test]
async fn status_reads_history_once_inside_the_audit() {
    let factory = MockClientFactory::new();
    let store = Arc::new(CountingConsentStore::default());
    let mut backends = Backends::in_memory();
    backends.consent_store = store.clone();
    let state = ready_state(&configured(), &factory, backends).await;
    let router = build_router(state);

    send(&router, Method::POST, CONSENT, Some(consent_body("enhanced"))).await;
    let reads_before = store.history_reads.load(Ordering::SeqCst);

    let status = send(&router, Method::GET, CONSENT, None).await;

    assert_eq!(status.status, StatusCode::OK);
    assert_eq!(status.body["effective_tier"], "enhanced");
    assert_eq!(store.history_reads.load(Ordering::SeqCst) - reads_before, 1);
}
