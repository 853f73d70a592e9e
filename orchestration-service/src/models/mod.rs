//! Domain models for the orchestration service.

pub mod audit;
pub mod budget;
pub mod consent;
pub mod service;
pub mod usage;

pub use audit::{AuditLogEntry, AuditStatus, ComplianceFlag};
pub use budget::{
    month_start, next_month_start, AlertThresholds, BudgetAlerts, MonthlyApiBudget, QuotaType,
    ServiceBudget,
};
pub use consent::{device_fingerprint, ConsentAction, ConsentRecord, ConsentType, FINGERPRINT_LEN};
pub use service::ServiceKind;
pub use usage::{UsageOutcome, UsageRecord};
