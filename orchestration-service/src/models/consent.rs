//! Consent records gating non-basic features.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use uuid::Uuid;

/// Consent tiers. `Basic < Enhanced < Premium`; a higher tier includes every
/// lower one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsentType {
    Basic,
    Enhanced,
    Premium,
}

impl fmt::Display for ConsentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConsentType::Basic => f.write_str("basic"),
            ConsentType::Enhanced => f.write_str("enhanced"),
            ConsentType::Premium => f.write_str("premium"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsentAction {
    Granted,
    /// Withdraws earlier grants of this tier and every higher tier.
    Revoked,
}

/// One entry in a user's consent history. Never edited; superseded only by
/// later entries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsentRecord {
    pub id: String,

    pub tenant_id: String,

    pub user_id: String,

    pub disclaimer_version: String,

    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,

    pub ip_address: String,

    /// SHA-256 hex digest, always 64 characters.
    pub device_fingerprint: String,

    pub consent_type: ConsentType,

    pub action: ConsentAction,

    #[serde(default)]
    pub additional_consents: Vec<String>,
}

impl ConsentRecord {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        tenant_id: impl Into<String>,
        user_id: impl Into<String>,
        disclaimer_version: impl Into<String>,
        ip_address: impl Into<String>,
        device_fingerprint: impl Into<String>,
        consent_type: ConsentType,
        action: ConsentAction,
        additional_consents: Vec<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            tenant_id: tenant_id.into(),
            user_id: user_id.into(),
            disclaimer_version: disclaimer_version.into(),
            timestamp: Utc::now(),
            ip_address: ip_address.into(),
            device_fingerprint: device_fingerprint.into(),
            consent_type,
            action,
            additional_consents,
        }
    }
}

/// Length of a device fingerprint in hex characters.
pub const FINGERPRINT_LEN: usize = 64;

/// Hash device attributes (user agent, screen size, timezone, ...) into a
/// fixed-length fingerprint. Attribute order matters.
pub fn device_fingerprint<S: AsRef<str>>(attributes: &[S]) -> String {
    let mut hasher = Sha256::new();
    for attribute in attributes {
        hasher.update(attribute.as_ref().as_bytes());
        // Separator keeps ["ab", "c"] and ["a", "bc"] distinct.
        hasher.update([0x1f]);
    }
    hex::encode(hasher.finalize())
}
