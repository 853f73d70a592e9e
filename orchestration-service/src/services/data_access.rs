//! Audited execution of PHI-touching persistence operations.
//!
//! The wrapped operation always runs to completion first; only then is the
//! elapsed time measured and the audit entry written. The caller always gets
//! the operation's own outcome back. An audit write that fails is diverted to
//! the emergency channel and never replaces that outcome.

use crate::config::AuditConfig;
use crate::error::OrchestrationError;
use crate::models::{AuditLogEntry, AuditStatus, ComplianceFlag, ConsentType};
use crate::services::audit::{AuditSink, EmergencyChannel};
use crate::services::consent::ConsentGate;
use crate::services::metrics;
use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Who is touching what, for one wrapped operation.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryContext {
    pub tenant_id: String,
    pub user_id: Option<String>,
    /// e.g. `read`, `update`
    pub operation_name: String,
    /// e.g. `meal_log`
    pub resource_type: String,
    pub resource_id: Option<String>,
    pub phi_access: bool,
}

impl QueryContext {
    pub fn new(
        tenant_id: impl Into<String>,
        resource_type: impl Into<String>,
        operation_name: impl Into<String>,
    ) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            user_id: None,
            operation_name: operation_name.into(),
            resource_type: resource_type.into(),
            resource_id: None,
            phi_access: false,
        }
    }

    pub fn user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn resource(mut self, resource_id: impl Into<String>) -> Self {
        self.resource_id = Some(resource_id.into());
        self
    }

    pub fn phi(mut self) -> Self {
        self.phi_access = true;
        self
    }

    /// `<resource_type>.<operation_name>`
    pub fn action(&self) -> String {
        format!("{}.{}", self.resource_type, self.operation_name)
    }
}

#[derive(Clone)]
pub struct HealthcareDataAccessWrapper {
    sink: Arc<dyn AuditSink>,
    emergency: Arc<dyn EmergencyChannel>,
    config: AuditConfig,
}

impl HealthcareDataAccessWrapper {
    pub fn new(
        sink: Arc<dyn AuditSink>,
        emergency: Arc<dyn EmergencyChannel>,
        config: AuditConfig,
    ) -> Self {
        Self {
            sink,
            emergency,
            config,
        }
    }

    /// Run `operation` and audit it.
    ///
    /// Failures are always audited. Successes are audited when the context
    /// touches PHI or audit-all mode is on.
    pub async fn execute_healthcare_query<T, E, F, Fut>(
        &self,
        ctx: &QueryContext,
        operation: F,
    ) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        let started = Instant::now();
        let result = operation().await;
        let elapsed = started.elapsed();

        match &result {
            Ok(_) => {
                if ctx.phi_access || self.config.audit_all {
                    self.write(ctx, elapsed, AuditStatus::Success, None).await;
                }
            }
            Err(e) => {
                self.write(ctx, elapsed, AuditStatus::Error, Some(e.to_string()))
                    .await;
            }
        }

        result
    }

    /// Check consent of at least `required` for the context's user, then run
    /// `operation` through [`execute_healthcare_query`](Self::execute_healthcare_query).
    ///
    /// A refusal is audited with status `denied` and `operation` never runs.
    pub async fn execute_consented_query<T, E, F, Fut>(
        &self,
        gate: &ConsentGate,
        required: ConsentType,
        ctx: &QueryContext,
        operation: F,
    ) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display + From<OrchestrationError>,
    {
        let started = Instant::now();
        let check = match ctx.user_id.as_deref() {
            Some(user_id) => gate.require(&ctx.tenant_id, user_id, required).await,
            None => Err(OrchestrationError::ConsentRequired { required }),
        };

        if let Err(err) = check {
            let status = match err {
                OrchestrationError::ConsentRequired { .. } => AuditStatus::Denied,
                _ => AuditStatus::Error,
            };
            self.write(ctx, started.elapsed(), status, Some(err.to_string()))
                .await;
            return Err(E::from(err));
        }

        self.execute_healthcare_query(ctx, operation).await
    }

    fn flags(&self, ctx: &QueryContext, elapsed: Duration, status: AuditStatus) -> Vec<ComplianceFlag> {
        let mut flags = Vec::new();
        if ctx.phi_access {
            flags.push(ComplianceFlag::PhiAccess);
        } else if self.config.audit_all {
            flags.push(ComplianceFlag::AuditAll);
        }
        match status {
            AuditStatus::Error => flags.push(ComplianceFlag::OperationFailed),
            AuditStatus::Denied => flags.push(ComplianceFlag::ConsentDenied),
            AuditStatus::Success => {}
        }
        if self
            .config
            .slow_query_threshold
            .is_some_and(|threshold| elapsed > threshold)
        {
            flags.push(ComplianceFlag::SlowQuery);
        }
        flags
    }

    async fn write(
        &self,
        ctx: &QueryContext,
        elapsed: Duration,
        status: AuditStatus,
        error_message: Option<String>,
    ) {
        let entry = AuditLogEntry::new(
            ctx.tenant_id.clone(),
            ctx.user_id.clone(),
            ctx.action(),
            ctx.resource_type.clone(),
            ctx.resource_id.clone(),
            ctx.phi_access,
            elapsed.as_millis() as u64,
            self.flags(ctx, elapsed, status),
            status,
            error_message,
        );

        match self.sink.append(&entry).await {
            Ok(()) => {
                tracing::debug!(
                    audit_id = %entry.id,
                    tenant_id = %entry.tenant_id,
                    action = %entry.action,
                    status = ?entry.status,
                    execution_time_ms = entry.execution_time,
                    "Audit entry written"
                );
                metrics::record_audit_entry(status_label(status));
            }
            Err(e) => {
                metrics::record_audit_write_failure(self.sink.name());
                self.emergency.report(&entry, &e);
            }
        }
    }
}

fn status_label(status: AuditStatus) -> &'static str {
    match status {
        AuditStatus::Success => "success",
        AuditStatus::Error => "error",
        AuditStatus::Denied => "denied",
    }
}
