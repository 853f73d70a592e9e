//! Text generation. Prompts may carry health details, so every call needs
//! enhanced consent and is audited as PHI access.

use crate::models::ConsentType;
use crate::services::clients::GenerationParams;
use crate::services::{CallerContext, QueryContext};
use crate::startup::AppState;
use axum::extract::{Json, State};
use serde::{Deserialize, Serialize};
use service_core::error::AppError;
use validator::Validate;

#[derive(Debug, Deserialize, Validate)]
pub struct GenerateRequest {
    #[validate(length(min = 1, max = 32000, message = "Prompt must be between 1 and 32000 characters"))]
    pub prompt: String,

    #[serde(default)]
    pub system_instruction: Option<String>,

    #[serde(default)]
    #[validate(range(min = 0.0, max = 2.0, message = "Temperature must be between 0 and 2"))]
    pub temperature: Option<f32>,

    #[serde(default)]
    #[validate(range(min = 1, message = "max_tokens must be positive"))]
    pub max_tokens: Option<u32>,
}

#[derive(Debug, Serialize)]
pub struct GenerateResponse {
    pub text: String,
    pub model: String,
    pub input_tokens: u32,
    pub output_tokens: u32,
}

pub async fn generate_text(
    State(state): State<AppState>,
    caller: CallerContext,
    Json(payload): Json<GenerateRequest>,
) -> Result<Json<GenerateResponse>, AppError> {
    payload.validate()?;

    let params = GenerationParams {
        temperature: payload.temperature,
        max_tokens: payload.max_tokens,
        system_instruction: payload.system_instruction,
    };
    let ctx = QueryContext::new(&caller.tenant_id, "generative_ai", "generate")
        .user(&caller.user_id)
        .phi();

    let response = state
        .data_access
        .execute_consented_query(&state.consent, ConsentType::Enhanced, &ctx, || {
            state.gateway.generate_text(&caller, &payload.prompt, &params)
        })
        .await
        .map_err(AppError::from)?;

    Ok(Json(GenerateResponse {
        text: response.text,
        model: response.model,
        input_tokens: response.input_tokens,
        output_tokens: response.output_tokens,
    }))
}
