use crate::services::metrics::get_metrics;
use crate::services::HealthStatus;
use crate::startup::AppState;
use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use serde_json::json;

/// Probe every upstream service. Degraded still answers 200 so load
/// balancers keep routing; only an unhealthy aggregate is a 503.
pub async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let report = state.orchestrator.perform_health_check().await;
    let status = match report.status {
        HealthStatus::Healthy | HealthStatus::Degraded => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };
    (status, Json(report))
}

/// Readiness check endpoint for K8s readiness probes.
pub async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    let orchestrator = state.orchestrator.state_name();
    if !state.orchestrator.is_ready() {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "status": "not_ready", "orchestrator": orchestrator })),
        );
    }

    if let Some(db) = &state.db {
        if let Err(e) = db.health_check().await {
            return (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({
                    "status": "not_ready",
                    "orchestrator": orchestrator,
                    "error": e.to_string()
                })),
            );
        }
    }

    (
        StatusCode::OK,
        Json(json!({
            "status": "ready",
            "service": "orchestration-service",
            "version": env!("CARGO_PKG_VERSION"),
            "orchestrator": orchestrator
        })),
    )
}

pub async fn metrics_endpoint() -> impl IntoResponse {
    (
        StatusCode::OK,
        [("content-type", "text/plain; charset=utf-8")],
        get_metrics(),
    )
}
