//! Error taxonomy of the orchestration layer.

use crate::models::{ConsentType, QuotaType, ServiceKind};
use chrono::{DateTime, Utc};
use service_core::error::AppError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum OrchestrationError {
    /// A client was requested before initialization completed, or after
    /// shutdown. Fatal for the request; not retried.
    #[error("Service orchestrator is not initialized")]
    NotInitialized,

    #[error("Service orchestrator failed to initialize: {0}")]
    InitializationFailed(String),

    #[error("Service not configured: {0}")]
    NotConfigured(ServiceKind),

    /// The caller should back off until `reset_time`.
    #[error("Rate limit exceeded for {service} ({limit} requests per window), resets at {reset_time}")]
    RateLimit {
        service: ServiceKind,
        reset_time: DateTime<Utc>,
        limit: u32,
    },

    /// Spending ceiling reached. The caller must stop until the period resets.
    #[error("Budget exceeded for {service} ({quota_type}), resets at {reset_time}")]
    QuotaExceeded {
        service: ServiceKind,
        quota_type: QuotaType,
        reset_time: DateTime<Utc>,
    },

    #[error("External API error from {service} (status {status_code:?}): {original_error}")]
    ExternalApi {
        service: ServiceKind,
        status_code: Option<u16>,
        original_error: String,
    },

    #[error("Consent required: {required} consent is not on file")]
    ConsentRequired { required: ConsentType },

    #[error("Validation error: {0}")]
    Validation(#[from] validator::ValidationErrors),

    #[error("Persistence error: {0}")]
    Persistence(String),
}

impl OrchestrationError {
    /// Seconds until the caller may try again, for rate and budget refusals.
    pub fn retry_after_secs(&self) -> Option<u64> {
        let reset_time = match self {
            OrchestrationError::RateLimit { reset_time, .. }
            | OrchestrationError::QuotaExceeded { reset_time, .. } => reset_time,
            _ => return None,
        };
        let secs = (*reset_time - Utc::now()).num_seconds().max(0);
        Some(secs as u64)
    }
}

impl From<OrchestrationError> for AppError {
    fn from(err: OrchestrationError) -> Self {
        let retry_after = err.retry_after_secs();
        match err {
            OrchestrationError::NotInitialized | OrchestrationError::InitializationFailed(_) => {
                AppError::ServiceUnavailable(err.to_string())
            }
            OrchestrationError::NotConfigured(_) => AppError::ServiceUnavailable(err.to_string()),
            OrchestrationError::RateLimit { .. } => {
                AppError::TooManyRequests(err.to_string(), retry_after)
            }
            OrchestrationError::QuotaExceeded { service, quota_type, .. } => AppError::QuotaExceeded(
                format!("{} {} exhausted for this period", service, quota_type),
                retry_after,
            ),
            OrchestrationError::ExternalApi { .. } => AppError::BadGateway(err.to_string()),
            OrchestrationError::ConsentRequired { .. } => {
                AppError::Forbidden(anyhow::anyhow!(err.to_string()))
            }
            OrchestrationError::Validation(errors) => AppError::ValidationError(errors),
            OrchestrationError::Persistence(msg) => AppError::DatabaseError(anyhow::anyhow!(msg)),
        }
    }
}
