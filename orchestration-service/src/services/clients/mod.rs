//! Narrow client interfaces for the upstream services.
//!
//! Each service sits behind a trait so the orchestrator can hand out typed
//! handles without knowing the backend (HTTP implementation or mock).

pub mod genai;
pub mod identity;
pub mod mock;
pub mod nutrition;
pub mod payment;

use crate::config::{GenAiSettings, ServiceSettings};
use crate::error::OrchestrationError;
use crate::models::ServiceKind;
use async_trait::async_trait;
use secrecy::Secret;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use validator::Validate;

/// Timeout applied by the HTTP clients themselves.
pub(crate) const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Error type for client operations.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ClientError {
    #[error("Client not configured: {0}")]
    NotConfigured(String),

    #[error("API error {status}: {message}")]
    Api { status: u16, message: String },

    #[error("Network error: {0}")]
    Network(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Timed out after {0:?}")]
    Timeout(Duration),
}

impl ClientError {
    pub fn status_code(&self) -> Option<u16> {
        match self {
            ClientError::Api { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Wrap as an `ExternalApi` error attributed to `service`.
    pub fn into_external(self, service: ServiceKind) -> OrchestrationError {
        OrchestrationError::ExternalApi {
            service,
            status_code: self.status_code(),
            original_error: self.to_string(),
        }
    }
}

impl From<reqwest::Error> for ClientError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ClientError::Timeout(HTTP_TIMEOUT)
        } else if err.is_decode() {
            ClientError::InvalidResponse(err.to_string())
        } else {
            ClientError::Network(err.to_string())
        }
    }
}

/// Turn a non-2xx response into `ClientError::Api`.
pub(crate) async fn ensure_success(
    response: reqwest::Response,
) -> Result<reqwest::Response, ClientError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let message = response.text().await.unwrap_or_default();
    Err(ClientError::Api {
        status: status.as_u16(),
        message,
    })
}

pub(crate) fn http_client() -> Result<reqwest::Client, ClientError> {
    reqwest::Client::builder()
        .timeout(HTTP_TIMEOUT)
        .build()
        .map_err(|e| ClientError::NotConfigured(format!("Failed to create HTTP client: {}", e)))
}

// Nutrition

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct RecipeQuery {
    #[validate(length(min = 1, message = "Search query cannot be empty"))]
    pub query: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diet: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub intolerances: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_calories: Option<u32>,
    #[serde(default = "default_result_count")]
    #[validate(range(min = 1, max = 100, message = "Number of results must be between 1 and 100"))]
    pub number: u32,
}

fn default_result_count() -> u32 {
    10
}

impl RecipeQuery {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            diet: None,
            intolerances: Vec::new(),
            max_calories: None,
            number: default_result_count(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecipeSummary {
    pub id: u64,
    pub title: String,
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub calories: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecipeSearchResult {
    pub results: Vec<RecipeSummary>,
    pub total_results: u64,
}

#[async_trait]
pub trait NutritionClient: Send + Sync {
    async fn search_recipes(&self, query: &RecipeQuery) -> Result<RecipeSearchResult, ClientError>;

    async fn health_check(&self) -> Result<(), ClientError>;
}

// Generative AI

#[derive(Debug, Clone, Default, PartialEq)]
pub struct GenerationParams {
    /// Overrides the configured temperature.
    pub temperature: Option<f32>,
    /// Overrides the configured output token limit.
    pub max_tokens: Option<u32>,
    pub system_instruction: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GenerationResponse {
    pub text: String,
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub model: String,
}

#[async_trait]
pub trait GenerativeAiClient: Send + Sync {
    async fn generate(
        &self,
        prompt: &str,
        params: &GenerationParams,
    ) -> Result<GenerationResponse, ClientError>;

    async fn health_check(&self) -> Result<(), ClientError>;
}

// Payment

#[derive(Debug, Clone, PartialEq)]
pub struct CheckoutRequest {
    pub customer_email: String,
    pub price_id: String,
    pub success_url: String,
    pub cancel_url: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CheckoutSession {
    pub id: String,
    #[serde(default)]
    pub url: Option<String>,
}

#[async_trait]
pub trait PaymentClient: Send + Sync {
    async fn create_checkout_session(
        &self,
        request: &CheckoutRequest,
    ) -> Result<CheckoutSession, ClientError>;

    async fn health_check(&self) -> Result<(), ClientError>;
}

// Identity

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct IdentityUser {
    pub id: String,
    #[serde(default)]
    pub email: Option<String>,
}

#[async_trait]
pub trait IdentityClient: Send + Sync {
    /// Resolve an access token to the user it was issued for.
    async fn verify_session(&self, access_token: &str) -> Result<IdentityUser, ClientError>;

    async fn health_check(&self) -> Result<(), ClientError>;
}

/// Builds client handles. Called at most once per service by the orchestrator.
pub trait ClientFactory: Send + Sync {
    fn nutrition(&self, settings: &ServiceSettings) -> Result<Arc<dyn NutritionClient>, ClientError>;

    fn generative_ai(
        &self,
        settings: &GenAiSettings,
    ) -> Result<Arc<dyn GenerativeAiClient>, ClientError>;

    fn payment(&self, settings: &ServiceSettings) -> Result<Arc<dyn PaymentClient>, ClientError>;

    fn identity(&self, settings: &ServiceSettings) -> Result<Arc<dyn IdentityClient>, ClientError>;
}

/// Factory for the production HTTP clients.
#[derive(Debug, Clone, Copy, Default)]
pub struct HttpClientFactory;

impl ClientFactory for HttpClientFactory {
    fn nutrition(&self, settings: &ServiceSettings) -> Result<Arc<dyn NutritionClient>, ClientError> {
        Ok(Arc::new(nutrition::HttpNutritionClient::new(settings)?))
    }

    fn generative_ai(
        &self,
        settings: &GenAiSettings,
    ) -> Result<Arc<dyn GenerativeAiClient>, ClientError> {
        Ok(Arc::new(genai::GeminiClient::new(settings)?))
    }

    fn payment(&self, settings: &ServiceSettings) -> Result<Arc<dyn PaymentClient>, ClientError> {
        Ok(Arc::new(payment::StripePaymentClient::new(settings)?))
    }

    fn identity(&self, settings: &ServiceSettings) -> Result<Arc<dyn IdentityClient>, ClientError> {
        Ok(Arc::new(identity::HttpIdentityClient::new(settings)?))
    }
}

/// Extract the credential or fail with `NotConfigured`.
pub(crate) fn require_key(
    settings: &ServiceSettings,
    name: &str,
) -> Result<Secret<String>, ClientError> {
    settings
        .api_key
        .clone()
        .ok_or_else(|| ClientError::NotConfigured(format!("{} credentials missing", name)))
}

/// Reachability probe: any response below 500 counts as up.
pub(crate) async fn probe(client: &reqwest::Client, url: &str) -> Result<(), ClientError> {
    let response = client.get(url).send().await?;
    if response.status().is_server_error() {
        return Err(ClientError::Api {
            status: response.status().as_u16(),
            message: "health probe failed".to_string(),
        });
    }
    Ok(())
}
