//! Recipe search through the nutrition service.

use crate::services::clients::{RecipeQuery, RecipeSummary};
use crate::services::CallerContext;
use crate::startup::AppState;
use axum::extract::{Json, State};
use serde::Serialize;
use service_core::error::AppError;

#[derive(Debug, Serialize)]
pub struct RecipeSearchResponse {
    pub results: Vec<RecipeSummary>,
    pub total_results: u64,
    /// True when served from the response cache without an upstream call.
    pub cached: bool,
}

pub async fn search_recipes(
    State(state): State<AppState>,
    caller: CallerContext,
    Json(query): Json<RecipeQuery>,
) -> Result<Json<RecipeSearchResponse>, AppError> {
    let found = state.gateway.search_recipes(&caller, &query).await?;
    Ok(Json(RecipeSearchResponse {
        results: found.value.results,
        total_results: found.value.total_results,
        cached: found.hit,
    }))
}
