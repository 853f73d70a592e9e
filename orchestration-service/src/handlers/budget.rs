//! Budget status for callers, and the operator overrides and resets.

use crate::models::{MonthlyApiBudget, ServiceKind};
use crate::services::CallerContext;
use crate::startup::AppState;
use axum::{
    extract::{Json, Path, State},
    http::StatusCode,
};
use serde::{Deserialize, Serialize};
use service_core::error::AppError;
use std::collections::BTreeMap;
use validator::Validate;

#[derive(Debug, Deserialize, Validate)]
pub struct BudgetOverride {
    #[validate(range(min = 0.0, message = "Budget cannot be negative"))]
    pub monthly_budget_usd: f64,

    #[serde(default)]
    pub service_budgets_usd: BTreeMap<ServiceKind, f64>,
}

/// Budget for the calling user. Never creates a ledger.
pub async fn get_budget(
    State(state): State<AppState>,
    caller: CallerContext,
) -> Json<MonthlyApiBudget> {
    Json(
        state
            .cost_tracker
            .get_budget_status(&caller.tenant_id, &caller.user_id),
    )
}

/// Operator override of one user's ceilings. Mounted behind the admin key.
pub async fn set_budget(
    State(state): State<AppState>,
    Path((tenant_id, user_id)): Path<(String, String)>,
    Json(payload): Json<BudgetOverride>,
) -> Result<Json<MonthlyApiBudget>, AppError> {
    payload.validate()?;
    if let Some((service, _)) = payload
        .service_budgets_usd
        .iter()
        .find(|(_, limit)| !limit.is_finite() || **limit < 0.0)
    {
        return Err(AppError::BadRequest(anyhow::anyhow!(
            "Budget for {} cannot be negative",
            service
        )));
    }

    let budget = state.cost_tracker.set_user_budget(
        &tenant_id,
        &user_id,
        payload.monthly_budget_usd,
        payload.service_budgets_usd,
    );
    Ok(Json(budget))
}

/// Start a new period for one user. Spend goes back to zero; usage history
/// is kept.
pub async fn reset_budget(
    State(state): State<AppState>,
    Path((tenant_id, user_id)): Path<(String, String)>,
) -> (StatusCode, Json<MonthlyApiBudget>) {
    state.cost_tracker.reset(&tenant_id, &user_id);
    (
        StatusCode::OK,
        Json(state.cost_tracker.get_budget_status(&tenant_id, &user_id)),
    )
}

#[derive(Debug, Serialize)]
pub struct ResetAllResponse {
    pub ledgers_reset: usize,
}

/// Period rollover for every tracked user, for the external scheduler.
pub async fn reset_all_budgets(State(state): State<AppState>) -> Json<ResetAllResponse> {
    Json(ResetAllResponse {
        ledgers_reset: state.cost_tracker.reset_all(),
    })
}
