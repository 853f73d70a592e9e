//! Caller identity for API requests.
//!
//! The service sits behind the frontend gateway, which authenticates the
//! user and forwards `x-tenant-id` and `x-user-id`. Both are required.

use crate::services::CallerContext;
use axum::{async_trait, extract::FromRequestParts, http::request::Parts};
use service_core::error::AppError;

pub const TENANT_ID_HEADER: &str = "x-tenant-id";
pub const USER_ID_HEADER: &str = "x-user-id";

fn required_header(parts: &Parts, name: &str) -> Result<String, AppError> {
    parts
        .headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
        .ok_or_else(|| AppError::BadRequest(anyhow::anyhow!("Missing {} header", name)))
}

#[async_trait]
impl<S> FromRequestParts<S> for CallerContext
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let tenant_id = required_header(parts, TENANT_ID_HEADER)?;
        let user_id = required_header(parts, USER_ID_HEADER)?;
        Ok(CallerContext::new(tenant_id, user_id))
    }
}
