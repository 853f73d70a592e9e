use crate::startup::AppState;
use axum::{
    extract::{Request, State},
    http::HeaderMap,
    middleware::Next,
    response::{IntoResponse, Response},
};
use secrecy::ExposeSecret;
use service_core::error::AppError;

pub const ADMIN_API_KEY_HEADER: &str = "x-admin-api-key";

/// Gate for operator routes such as budget overrides and period resets.
/// Caller identity headers grant nothing here; only the admin key does.
/// Without a configured key every request is refused.
pub async fn admin_auth_middleware(
    State(state): State<AppState>,
    headers: HeaderMap,
    request: Request,
    next: Next,
) -> Response {
    let provided = headers
        .get(ADMIN_API_KEY_HEADER)
        .and_then(|value| value.to_str().ok());

    match (provided, state.admin_api_key.as_ref()) {
        (Some(key), Some(expected)) if !key.is_empty() && key == expected.expose_secret().as_str() => {
            next.run(request).await
        }
        _ => {
            tracing::warn!(
                path = %request.uri().path(),
                "Failed admin authentication attempt"
            );
            AppError::Forbidden(anyhow::anyhow!("Invalid or missing admin API key")).into_response()
        }
    }
}
