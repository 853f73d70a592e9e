//! Audit log entries for PHI-touching persistence operations.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditStatus {
    Success,
    Error,
    /// Refused before the operation ran, e.g. missing consent.
    Denied,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ComplianceFlag {
    PhiAccess,
    AuditAll,
    OperationFailed,
    SlowQuery,
    ConsentDenied,
}

impl fmt::Display for ComplianceFlag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ComplianceFlag::PhiAccess => "PHI_ACCESS",
            ComplianceFlag::AuditAll => "AUDIT_ALL",
            ComplianceFlag::OperationFailed => "OPERATION_FAILED",
            ComplianceFlag::SlowQuery => "SLOW_QUERY",
            ComplianceFlag::ConsentDenied => "CONSENT_DENIED",
        };
        f.write_str(name)
    }
}

/// One audited persistence operation.
///
/// Entries have no update or delete path anywhere in the service; sinks only
/// append them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditLogEntry {
    pub id: String,

    pub tenant_id: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,

    /// `<resource_type>.<operation>`, e.g. `meal_log.read`.
    pub action: String,

    pub resource_type: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource_id: Option<String>,

    pub phi_accessed: bool,

    /// Wall time of the wrapped operation in milliseconds.
    pub execution_time: u64,

    pub compliance_flags: Vec<ComplianceFlag>,

    pub status: AuditStatus,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,

    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,
}

impl AuditLogEntry {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        tenant_id: impl Into<String>,
        user_id: Option<String>,
        action: impl Into<String>,
        resource_type: impl Into<String>,
        resource_id: Option<String>,
        phi_accessed: bool,
        execution_time: u64,
        compliance_flags: Vec<ComplianceFlag>,
        status: AuditStatus,
        error_message: Option<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            tenant_id: tenant_id.into(),
            user_id,
            action: action.into(),
            resource_type: resource_type.into(),
            resource_id,
            phi_accessed,
            execution_time,
            compliance_flags,
            status,
            error_message,
            timestamp: Utc::now(),
        }
    }
}
