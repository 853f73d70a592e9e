//! Usage records for billable external calls.

use super::ServiceKind;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UsageOutcome {
    Success,
    /// The call failed or the caller timed it out. Still billed, because the
    /// upstream may have charged for it.
    Failed,
}

/// A single billable call. Append-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageRecord {
    pub id: String,

    /// Tenant ID for multi-tenancy.
    pub tenant_id: String,

    pub user_id: String,

    pub service: ServiceKind,

    /// Operation name, e.g. `recipes.search`.
    pub operation: String,

    pub cost_usd: f64,

    pub outcome: UsageOutcome,

    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,
}

impl UsageRecord {
    pub fn new(
        tenant_id: impl Into<String>,
        user_id: impl Into<String>,
        service: ServiceKind,
        operation: impl Into<String>,
        cost_usd: f64,
        outcome: UsageOutcome,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            tenant_id: tenant_id.into(),
            user_id: user_id.into(),
            service,
            operation: operation.into(),
            cost_usd,
            outcome,
            timestamp: Utc::now(),
        }
    }
}
