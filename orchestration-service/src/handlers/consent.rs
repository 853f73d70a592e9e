//! Consent grants, revocations and history for the calling user.

use crate::models::{ConsentAction, ConsentRecord, ConsentType};
use crate::services::{CallerContext, ConsentRequest, QueryContext};
use crate::startup::AppState;
use axum::{
    extract::{Json, State},
    http::StatusCode,
};
use serde::{Deserialize, Serialize};
use service_core::error::AppError;

/// Grant or revocation body. Tenant and user come from the caller headers.
#[derive(Debug, Deserialize)]
pub struct ConsentBody {
    pub disclaimer_version: String,
    pub ip_address: String,
    #[serde(default)]
    pub device_attributes: Vec<String>,
    pub consent_type: ConsentType,
    #[serde(default)]
    pub additional_consents: Vec<String>,
}

impl ConsentBody {
    fn into_request(self, caller: &CallerContext) -> ConsentRequest {
        ConsentRequest {
            tenant_id: caller.tenant_id.clone(),
            user_id: caller.user_id.clone(),
            disclaimer_version: self.disclaimer_version,
            ip_address: self.ip_address,
            device_attributes: self.device_attributes,
            consent_type: self.consent_type,
            additional_consents: self.additional_consents,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ConsentStatusResponse {
    pub effective_tier: Option<ConsentType>,
    pub history: Vec<ConsentRecord>,
}

async fn append(
    state: &AppState,
    caller: &CallerContext,
    body: ConsentBody,
    action: ConsentAction,
) -> Result<ConsentRecord, AppError> {
    let operation = match action {
        ConsentAction::Granted => "grant",
        ConsentAction::Revoked => "revoke",
    };
    let ctx = QueryContext::new(&caller.tenant_id, "consent", operation).user(&caller.user_id);
    let request = body.into_request(caller);

    let record = state
        .data_access
        .execute_healthcare_query(&ctx, move || async move {
            match action {
                ConsentAction::Granted => state.consent.record_consent(request).await,
                ConsentAction::Revoked => state.consent.revoke_consent(request).await,
            }
        })
        .await?;
    Ok(record)
}

pub async fn grant_consent(
    State(state): State<AppState>,
    caller: CallerContext,
    Json(body): Json<ConsentBody>,
) -> Result<(StatusCode, Json<ConsentRecord>), AppError> {
    let record = append(&state, &caller, body, ConsentAction::Granted).await?;
    Ok((StatusCode::CREATED, Json(record)))
}

pub async fn revoke_consent(
    State(state): State<AppState>,
    caller: CallerContext,
    Json(body): Json<ConsentBody>,
) -> Result<(StatusCode, Json<ConsentRecord>), AppError> {
    let record = append(&state, &caller, body, ConsentAction::Revoked).await?;
    Ok((StatusCode::CREATED, Json(record)))
}

/// History holds IP addresses and device fingerprints, so reads are audited.
pub async fn consent_status(
    State(state): State<AppState>,
    caller: CallerContext,
) -> Result<Json<ConsentStatusResponse>, AppError> {
    let ctx = QueryContext::new(&caller.tenant_id, "consent", "history")
        .user(&caller.user_id)
        .phi();

    let history = state
        .data_access
        .execute_healthcare_query(&ctx, || {
            state.consent.history(&caller.tenant_id, &caller.user_id)
        })
        .await?;
    let effective_tier = state.consent.tier_in(&history);

    Ok(Json(ConsentStatusResponse {
        effective_tier,
        history,
    }))
}
