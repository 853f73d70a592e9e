//! Identity of the external services mediated by the orchestrator.

use serde::{Deserialize, Serialize};
use std::fmt;

/// One of the four paid or rate-limited upstream services.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceKind {
    Nutrition,
    GenerativeAi,
    Payment,
    Identity,
}

impl ServiceKind {
    pub const ALL: [ServiceKind; 4] = [
        ServiceKind::Nutrition,
        ServiceKind::GenerativeAi,
        ServiceKind::Payment,
        ServiceKind::Identity,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceKind::Nutrition => "nutrition",
            ServiceKind::GenerativeAi => "generative_ai",
            ServiceKind::Payment => "payment",
            ServiceKind::Identity => "identity",
        }
    }

    /// Prefix used for this service's environment variables.
    pub fn env_prefix(&self) -> &'static str {
        match self {
            ServiceKind::Nutrition => "NUTRITION",
            ServiceKind::GenerativeAi => "GENAI",
            ServiceKind::Payment => "PAYMENT",
            ServiceKind::Identity => "IDENTITY",
        }
    }
}

impl fmt::Display for ServiceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
