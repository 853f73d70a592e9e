//! Audit sinks and the emergency channel for audit entries that could not be
//! persisted.
//!
//! A sink is a dedicated append-only path. It never goes through the
//! instrumented data-access wrapper, so writing an audit entry can never
//! itself produce another audit entry.

use crate::error::OrchestrationError;
use crate::models::AuditLogEntry;
use async_trait::async_trait;
use std::sync::{Mutex, RwLock};

#[async_trait]
pub trait AuditSink: Send + Sync {
    /// Append `entry`. Sinks expose no update or delete.
    async fn append(&self, entry: &AuditLogEntry) -> Result<(), OrchestrationError>;

    /// Short name used in logs and metrics.
    fn name(&self) -> &'static str;
}

/// Where audit entries go when their sink fails.
pub trait EmergencyChannel: Send + Sync {
    fn report(&self, entry: &AuditLogEntry, error: &OrchestrationError);
}

/// Logs undeliverable audit entries at error level on the `audit_emergency`
/// target, with the full entry serialised so it can be replayed from logs.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingEmergencyChannel;

impl EmergencyChannel for TracingEmergencyChannel {
    fn report(&self, entry: &AuditLogEntry, error: &OrchestrationError) {
        let serialized = serde_json::to_string(entry)
            .unwrap_or_else(|e| format!("<unserializable audit entry: {}>", e));
        tracing::error!(
            target: "audit_emergency",
            error = %error,
            audit_id = %entry.id,
            tenant_id = %entry.tenant_id,
            action = %entry.action,
            entry = %serialized,
            "Failed to persist audit log entry"
        );
    }
}

/// Keeps every report in memory in addition to logging it.
#[derive(Default)]
pub struct RecordingEmergencyChannel {
    reports: Mutex<Vec<(AuditLogEntry, String)>>,
}

impl RecordingEmergencyChannel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reports(&self) -> Vec<(AuditLogEntry, String)> {
        self.reports
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

impl EmergencyChannel for RecordingEmergencyChannel {
    fn report(&self, entry: &AuditLogEntry, error: &OrchestrationError) {
        TracingEmergencyChannel.report(entry, error);
        self.reports
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((entry.clone(), error.to_string()));
    }
}

/// Process-local audit log.
#[derive(Default)]
pub struct InMemoryAuditSink {
    entries: RwLock<Vec<AuditLogEntry>>,
}

impl InMemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Entries for one tenant, in write order.
    pub fn entries_for_tenant(&self, tenant_id: &str) -> Vec<AuditLogEntry> {
        self.entries
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|entry| entry.tenant_id == tenant_id)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl AuditSink for InMemoryAuditSink {
    async fn append(&self, entry: &AuditLogEntry) -> Result<(), OrchestrationError> {
        self.entries
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(entry.clone());
        Ok(())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

/// A sink whose every write fails, for exercising the emergency path.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnavailableAuditSink;

#[async_trait]
impl AuditSink for UnavailableAuditSink {
    async fn append(&self, _entry: &AuditLogEntry) -> Result<(), OrchestrationError> {
        Err(OrchestrationError::Persistence(
            "audit store unavailable".to_string(),
        ))
    }

    fn name(&self) -> &'static str {
        "unavailable"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::AuditStatus;

    fn entry(tenant: &str) -> AuditLogEntry {
        AuditLogEntry::new(
            tenant,
            Some("user-1".to_string()),
            "meal_log.read",
            "meal_log",
            None,
            true,
            3,
            vec![],
            AuditStatus::Success,
            None,
        )
    }

    #[tokio::test]
    async fn in_memory_reads_are_tenant_scoped() {
        let sink = InMemoryAuditSink::new();
        sink.append(&entry("tenant-a")).await.unwrap();
        sink.append(&entry("tenant-b")).await.unwrap();
        sink.append(&entry("tenant-a")).await.unwrap();

        assert_eq!(sink.len(), 3);
        assert_eq!(sink.entries_for_tenant("tenant-a").len(), 2);
        assert!(sink.entries_for_tenant("tenant-c").is_empty());
    }

    #[test]
    fn recording_channel_keeps_the_failed_entry() {
        let channel = RecordingEmergencyChannel::new();
        let failed = entry("tenant-a");
        channel.report(&failed, &OrchestrationError::Persistence("down".to_string()));

        let reports = channel.reports();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].0, failed);
        assert!(reports[0].1.contains("down"));
    }
}
