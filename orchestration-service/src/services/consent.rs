//! Tiered consent checks in front of feature-gated operations.
//!
//! Consent history is append-only. Validity is derived by replaying a user's
//! records in timestamp order: a grant activates its tier, a revocation
//! deactivates its tier and every tier above it.

use crate::config::ConsentConfig;
use crate::error::OrchestrationError;
use crate::models::{device_fingerprint, ConsentAction, ConsentRecord, ConsentType};
use crate::services::metrics;
use async_trait::async_trait;
use dashmap::DashMap;
use serde::Deserialize;
use std::collections::BTreeSet;
use std::sync::Arc;
use validator::Validate;

/// Append-only storage for consent records, always read per tenant and user.
#[async_trait]
pub trait ConsentStore: Send + Sync {
    async fn append(&self, record: &ConsentRecord) -> Result<(), OrchestrationError>;

    /// Records for one user within one tenant, oldest first.
    async fn history(
        &self,
        tenant_id: &str,
        user_id: &str,
    ) -> Result<Vec<ConsentRecord>, OrchestrationError>;
}

#[derive(Default)]
pub struct InMemoryConsentStore {
    records: DashMap<(String, String), Vec<ConsentRecord>>,
}

impl InMemoryConsentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.iter().map(|entry| entry.value().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ConsentStore for InMemoryConsentStore {
    async fn append(&self, record: &ConsentRecord) -> Result<(), OrchestrationError> {
        self.records
            .entry((record.tenant_id.clone(), record.user_id.clone()))
            .or_default()
            .push(record.clone());
        Ok(())
    }

    async fn history(
        &self,
        tenant_id: &str,
        user_id: &str,
    ) -> Result<Vec<ConsentRecord>, OrchestrationError> {
        Ok(self
            .records
            .get(&(tenant_id.to_string(), user_id.to_string()))
            .map(|records| records.clone())
            .unwrap_or_default())
    }
}

/// A grant or revocation as submitted by the client.
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct ConsentRequest {
    #[validate(length(min = 1, message = "Tenant ID is required"))]
    pub tenant_id: String,

    #[validate(length(min = 1, message = "User ID is required"))]
    pub user_id: String,

    #[validate(length(min = 1, message = "Disclaimer version is required"))]
    pub disclaimer_version: String,

    #[validate(ip(message = "Invalid IP address"))]
    pub ip_address: String,

    /// Hashed into the record's device fingerprint; never stored raw.
    #[serde(default)]
    #[validate(length(max = 32, message = "Too many device attributes"))]
    pub device_attributes: Vec<String>,

    pub consent_type: ConsentType,

    #[serde(default)]
    pub additional_consents: Vec<String>,
}

pub struct ConsentGate {
    store: Arc<dyn ConsentStore>,
    disclaimer_version: Option<String>,
}

impl ConsentGate {
    pub fn new(store: Arc<dyn ConsentStore>, config: &ConsentConfig) -> Self {
        Self {
            store,
            disclaimer_version: config.disclaimer_version.clone(),
        }
    }

    pub async fn record_consent(
        &self,
        request: ConsentRequest,
    ) -> Result<ConsentRecord, OrchestrationError> {
        self.append(request, ConsentAction::Granted).await
    }

    /// Record a revocation of `request.consent_type`. Earlier history is kept.
    pub async fn revoke_consent(
        &self,
        request: ConsentRequest,
    ) -> Result<ConsentRecord, OrchestrationError> {
        self.append(request, ConsentAction::Revoked).await
    }

    async fn append(
        &self,
        request: ConsentRequest,
        action: ConsentAction,
    ) -> Result<ConsentRecord, OrchestrationError> {
        request.validate()?;

        let record = ConsentRecord::new(
            request.tenant_id,
            request.user_id,
            request.disclaimer_version,
            request.ip_address,
            device_fingerprint(&request.device_attributes),
            request.consent_type,
            action,
            request.additional_consents,
        );
        self.store.append(&record).await?;

        tracing::info!(
            tenant_id = %record.tenant_id,
            user_id = %record.user_id,
            consent_type = %record.consent_type,
            action = ?record.action,
            disclaimer_version = %record.disclaimer_version,
            "Consent recorded"
        );
        Ok(record)
    }

    pub async fn history(
        &self,
        tenant_id: &str,
        user_id: &str,
    ) -> Result<Vec<ConsentRecord>, OrchestrationError> {
        self.store.history(tenant_id, user_id).await
    }

    /// Highest tier currently in force for the user, if any.
    pub async fn effective_tier(
        &self,
        tenant_id: &str,
        user_id: &str,
    ) -> Result<Option<ConsentType>, OrchestrationError> {
        let history = self.store.history(tenant_id, user_id).await?;
        Ok(self.tier_in(&history))
    }

    /// Tier in force for an already fetched history, under this gate's
    /// disclaimer version.
    pub fn tier_in(&self, history: &[ConsentRecord]) -> Option<ConsentType> {
        effective_tier(history, self.disclaimer_version.as_deref())
    }

    pub async fn has_valid_consent(
        &self,
        tenant_id: &str,
        user_id: &str,
        required: ConsentType,
    ) -> Result<bool, OrchestrationError> {
        let tier = self.effective_tier(tenant_id, user_id).await?;
        Ok(tier.is_some_and(|tier| tier >= required))
    }

    /// `Ok(())` when consent of at least `required` is in force, otherwise
    /// `ConsentRequired`.
    pub async fn require(
        &self,
        tenant_id: &str,
        user_id: &str,
        required: ConsentType,
    ) -> Result<(), OrchestrationError> {
        if self.has_valid_consent(tenant_id, user_id, required).await? {
            return Ok(());
        }

        tracing::info!(
            tenant_id = %tenant_id,
            user_id = %user_id,
            required = %required,
            "Consent missing, operation refused"
        );
        metrics::record_consent_denial(&required.to_string());
        Err(OrchestrationError::ConsentRequired { required })
    }
}

/// Replay `history` and return the highest tier left active. When
/// `disclaimer_version` is set, grants against other versions are ignored.
pub fn effective_tier(
    history: &[ConsentRecord],
    disclaimer_version: Option<&str>,
) -> Option<ConsentType> {
    let mut ordered: Vec<&ConsentRecord> = history.iter().collect();
    ordered.sort_by_key(|record| record.timestamp);

    let mut active = BTreeSet::new();
    for record in ordered {
        match record.action {
            ConsentAction::Granted => {
                let current = disclaimer_version
                    .map_or(true, |version| version == record.disclaimer_version);
                if current {
                    active.insert(record.consent_type);
                }
            }
            ConsentAction::Revoked => {
                active.retain(|tier| *tier < record.consent_type);
            }
        }
    }
    active.last().copied()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(user: &str, tier: ConsentType) -> ConsentRequest {
        ConsentRequest {
            tenant_id: "tenant-a".to_string(),
            user_id: user.to_string(),
            disclaimer_version: "2024-01".to_string(),
            ip_address: "203.0.113.7".to_string(),
            device_attributes: vec!["Mozilla/5.0".to_string(), "1920x1080".to_string()],
            consent_type: tier,
            additional_consents: vec![],
        }
    }

    fn gate(version: Option<&str>) -> (ConsentGate, Arc<InMemoryConsentStore>) {
        let store = Arc::new(InMemoryConsentStore::new());
        let gate = ConsentGate::new(
            store.clone(),
            &ConsentConfig {
                disclaimer_version: version.map(str::to_string),
            },
        );
        (gate, store)
    }

    #[tokio::test]
    async fn premium_requires_a_premium_record_and_revocation_withdraws_it() {
        let (gate, store) = gate(None);

        gate.record_consent(request("u1", ConsentType::Basic)).await.unwrap();
        assert!(!gate.has_valid_consent("tenant-a", "u1", ConsentType::Premium).await.unwrap());
        assert!(gate.has_valid_consent("tenant-a", "u1", ConsentType::Basic).await.unwrap());

        gate.record_consent(request("u1", ConsentType::Premium)).await.unwrap();
        assert!(gate.has_valid_consent("tenant-a", "u1", ConsentType::Premium).await.unwrap());
        assert!(gate.has_valid_consent("tenant-a", "u1", ConsentType::Enhanced).await.unwrap());

        gate.revoke_consent(request("u1", ConsentType::Premium)).await.unwrap();
        assert!(!gate.has_valid_consent("tenant-a", "u1", ConsentType::Premium).await.unwrap());
        assert!(gate.has_valid_consent("tenant-a", "u1", ConsentType::Basic).await.unwrap());

        let history = gate.history("tenant-a", "u1").await.unwrap();
        assert_eq!(history.len(), 3);
        assert_eq!(history[2].action, ConsentAction::Revoked);
        assert_eq!(store.len(), 3);
    }

    #[tokio::test]
    async fn revoking_a_tier_withdraws_higher_tiers_too() {
        let (gate, _) = gate(None);
        gate.record_consent(request("u1", ConsentType::Basic)).await.unwrap();
        gate.record_consent(request("u1", ConsentType::Premium)).await.unwrap();
        gate.revoke_consent(request("u1", ConsentType::Enhanced)).await.unwrap();

        assert_eq!(
            gate.effective_tier("tenant-a", "u1").await.unwrap(),
            Some(ConsentType::Basic)
        );
    }

    #[tokio::test]
    async fn require_reports_the_missing_tier() {
        let (gate, _) = gate(None);
        match gate.require("tenant-a", "nobody", ConsentType::Enhanced).await {
            Err(OrchestrationError::ConsentRequired { required }) => {
                assert_eq!(required, ConsentType::Enhanced)
            }
            other => panic!("expected consent error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn consent_does_not_leak_across_tenants() {
        let (gate, _) = gate(None);
        gate.record_consent(request("u1", ConsentType::Premium)).await.unwrap();

        assert!(!gate.has_valid_consent("tenant-b", "u1", ConsentType::Basic).await.unwrap());
        assert!(gate.history("tenant-b", "u1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn grants_against_an_old_disclaimer_do_not_count() {
        let (gate, _) = gate(Some("2025-06"));
        gate.record_consent(request("u1", ConsentType::Premium)).await.unwrap();
        assert!(!gate.has_valid_consent("tenant-a", "u1", ConsentType::Basic).await.unwrap());

        let mut current = request("u1", ConsentType::Enhanced);
        current.disclaimer_version = "2025-06".to_string();
        gate.record_consent(current).await.unwrap();
        assert_eq!(
            gate.effective_tier("tenant-a", "u1").await.unwrap(),
            Some(ConsentType::Enhanced)
        );
    }

    #[tokio::test]
    async fn invalid_requests_are_rejected_and_not_stored() {
        let (gate, store) = gate(None);
        let mut bad = request("u1", ConsentType::Basic);
        bad.ip_address = "not-an-ip".to_string();

        assert!(matches!(
            gate.record_consent(bad).await,
            Err(OrchestrationError::Validation(_))
        ));
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn stored_fingerprint_is_a_fixed_length_hash() {
        let (gate, _) = gate(None);
        let record = gate.record_consent(request("u1", ConsentType::Basic)).await.unwrap();
        assert_eq!(record.device_fingerprint.len(), crate::models::FINGERPRINT_LEN);
        assert_ne!(record.device_fingerprint, "Mozilla/5.0");
    }
}
