//! Mock client implementations for testing.
//!
//! Every mock counts the calls that would have reached the network and can
//! be switched to fail, hang, or report unhealthy at runtime.

use super::{
    CheckoutRequest, CheckoutSession, ClientError, ClientFactory, GenerationParams,
    GenerationResponse, GenerativeAiClient, IdentityClient, IdentityUser, NutritionClient,
    PaymentClient, RecipeQuery, RecipeSearchResult, RecipeSummary,
};
use crate::config::{GenAiSettings, ServiceSettings};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Shared behaviour switches for a mock client.
#[derive(Default)]
pub struct MockBehavior {
    calls: AtomicUsize,
    health_checks: AtomicUsize,
    unhealthy: AtomicBool,
    hang_health_check: AtomicBool,
    failure: Mutex<Option<ClientError>>,
    latency: Mutex<Duration>,
}

impl MockBehavior {
    /// Number of upstream calls made (health checks excluded).
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn health_checks(&self) -> usize {
        self.health_checks.load(Ordering::SeqCst)
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.unhealthy.store(!healthy, Ordering::SeqCst);
    }

    /// Make health checks never complete.
    pub fn set_hanging(&self, hanging: bool) {
        self.hang_health_check.store(hanging, Ordering::SeqCst);
    }

    /// Make every subsequent call fail with `error`; `None` restores success.
    pub fn fail_with(&self, error: Option<ClientError>) {
        *self.failure.lock().unwrap_or_else(|e| e.into_inner()) = error;
    }

    /// Delay each call, e.g. to hold two concurrent requests in flight.
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock().unwrap_or_else(|e| e.into_inner()) = latency;
    }

    async fn call(&self) -> Result<(), ClientError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let latency = *self.latency.lock().unwrap_or_else(|e| e.into_inner());
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        let failure = self.failure.lock().unwrap_or_else(|e| e.into_inner()).clone();
        match failure {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    async fn health(&self) -> Result<(), ClientError> {
        self.health_checks.fetch_add(1, Ordering::SeqCst);
        if self.hang_health_check.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        if self.unhealthy.load(Ordering::SeqCst) {
            return Err(ClientError::Network("mock service unhealthy".to_string()));
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct MockNutritionClient {
    pub behavior: MockBehavior,
}

#[async_trait]
impl NutritionClient for MockNutritionClient {
    async fn search_recipes(&self, query: &RecipeQuery) -> Result<RecipeSearchResult, ClientError> {
        self.behavior.call().await?;
        Ok(RecipeSearchResult {
            results: vec![RecipeSummary {
                id: 1,
                title: format!("Mock recipe for {}", query.query),
                image: None,
                calories: Some(420.0),
            }],
            total_results: 1,
        })
    }

    async fn health_check(&self) -> Result<(), ClientError> {
        self.behavior.health().await
    }
}

#[derive(Default)]
pub struct MockGenerativeAiClient {
    pub behavior: MockBehavior,
}

#[async_trait]
impl GenerativeAiClient for MockGenerativeAiClient {
    async fn generate(
        &self,
        prompt: &str,
        _params: &GenerationParams,
    ) -> Result<GenerationResponse, ClientError> {
        self.behavior.call().await?;
        Ok(GenerationResponse {
            text: format!("Mock response for: {}", prompt),
            input_tokens: (prompt.len() / 4) as u32,
            output_tokens: 10,
            model: "mock-model".to_string(),
        })
    }

    async fn health_check(&self) -> Result<(), ClientError> {
        self.behavior.health().await
    }
}

#[derive(Default)]
pub struct MockPaymentClient {
    pub behavior: MockBehavior,
}

#[async_trait]
impl PaymentClient for MockPaymentClient {
    async fn create_checkout_session(
        &self,
        request: &CheckoutRequest,
    ) -> Result<CheckoutSession, ClientError> {
        self.behavior.call().await?;
        Ok(CheckoutSession {
            id: format!("cs_mock_{}", request.price_id),
            url: Some("https://checkout.example.test/session".to_string()),
        })
    }

    async fn health_check(&self) -> Result<(), ClientError> {
        self.behavior.health().await
    }
}

#[derive(Default)]
pub struct MockIdentityClient {
    pub behavior: MockBehavior,
}

#[async_trait]
impl IdentityClient for MockIdentityClient {
    async fn verify_session(&self, access_token: &str) -> Result<IdentityUser, ClientError> {
        self.behavior.call().await?;
        Ok(IdentityUser {
            id: format!("user-for-{}", access_token),
            email: None,
        })
    }

    async fn health_check(&self) -> Result<(), ClientError> {
        self.behavior.health().await
    }
}

/// Factory handing out shared mock instances so tests can inspect them.
#[derive(Default, Clone)]
pub struct MockClientFactory {
    pub nutrition: Arc<MockNutritionClient>,
    pub generative_ai: Arc<MockGenerativeAiClient>,
    pub payment: Arc<MockPaymentClient>,
    pub identity: Arc<MockIdentityClient>,
    constructed: Arc<AtomicUsize>,
}

impl MockClientFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// How many client handles the factory has built.
    pub fn constructed(&self) -> usize {
        self.constructed.load(Ordering::SeqCst)
    }

    fn built(&self) {
        self.constructed.fetch_add(1, Ordering::SeqCst);
    }
}

impl ClientFactory for MockClientFactory {
    fn nutrition(&self, _settings: &ServiceSettings) -> Result<Arc<dyn NutritionClient>, ClientError> {
        self.built();
        Ok(self.nutrition.clone())
    }

    fn generative_ai(
        &self,
        _settings: &GenAiSettings,
    ) -> Result<Arc<dyn GenerativeAiClient>, ClientError> {
        self.built();
        Ok(self.generative_ai.clone())
    }

    fn payment(&self, _settings: &ServiceSettings) -> Result<Arc<dyn PaymentClient>, ClientError> {
        self.built();
        Ok(self.payment.clone())
    }

    fn identity(&self, _settings: &ServiceSettings) -> Result<Arc<dyn IdentityClient>, ClientError> {
        self.built();
        Ok(self.identity.clone())
    }
}
