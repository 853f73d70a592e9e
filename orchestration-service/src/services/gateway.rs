//! Request-facing entry points for the upstream services.
//!
//! Each method resolves the client through the orchestrator and sends the
//! call through the [`CallGuard`]. Recipe search is the one idempotent read
//! and is served from the response cache when possible; a cache hit is not
//! billed and consumes no rate-limit capacity.

use crate::error::OrchestrationError;
use crate::models::{ConsentType, ServiceKind};
use crate::services::cache::{fingerprint, CacheManager, Cached, Sensitivity};
use crate::services::clients::{
    CheckoutRequest, CheckoutSession, GenerationParams, GenerationResponse, IdentityUser,
    RecipeQuery, RecipeSearchResult,
};
use crate::services::guard::{BillableCall, CallGuard};
use crate::services::orchestrator::ServiceOrchestrator;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use validator::Validate;

const ANONYMOUS_USER: &str = "anonymous";

/// The tenant and user a call is made on behalf of.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallerContext {
    pub tenant_id: String,
    pub user_id: String,
}

impl CallerContext {
    pub fn new(tenant_id: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            user_id: user_id.into(),
        }
    }

    /// A caller not yet tied to a user, e.g. before session verification.
    pub fn anonymous(tenant_id: impl Into<String>) -> Self {
        Self::new(tenant_id, ANONYMOUS_USER)
    }
}

pub struct ServiceGateway {
    orchestrator: Arc<ServiceOrchestrator>,
    guard: CallGuard,
    recipe_cache: Arc<CacheManager<RecipeSearchResult>>,
    call_timeout: Option<Duration>,
}

impl ServiceGateway {
    pub fn new(
        orchestrator: Arc<ServiceOrchestrator>,
        guard: CallGuard,
        recipe_cache: Arc<CacheManager<RecipeSearchResult>>,
    ) -> Self {
        Self {
            orchestrator,
            guard,
            recipe_cache,
            call_timeout: None,
        }
    }

    /// Deadline applied to every upstream call made through the gateway.
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = Some(timeout);
        self
    }

    pub fn guard(&self) -> &CallGuard {
        &self.guard
    }

    pub fn recipe_cache(&self) -> &Arc<CacheManager<RecipeSearchResult>> {
        &self.recipe_cache
    }

    fn billable(&self, caller: &CallerContext, service: ServiceKind, operation: &str) -> BillableCall {
        let call = BillableCall::new(&caller.tenant_id, &caller.user_id, service, operation);
        match self.call_timeout {
            Some(timeout) => call.timeout(timeout),
            None => call,
        }
    }

    pub async fn search_recipes(
        &self,
        caller: &CallerContext,
        query: &RecipeQuery,
    ) -> Result<Cached<RecipeSearchResult>, OrchestrationError> {
        query.validate()?;
        let client = self.orchestrator.nutrition()?;

        let operation = "recipes.search";
        let key = fingerprint(
            operation,
            &json!({
                "query": query.query,
                "diet": query.diet,
                "intolerances": query.intolerances,
                "max_calories": query.max_calories,
                "number": query.number,
            }),
        );
        let call = self.billable(caller, ServiceKind::Nutrition, operation);

        let result = self
            .recipe_cache
            .get_or_fetch(&key, None, Sensitivity::Public, || {
                self.guard
                    .execute(&call, || client.search_recipes(query))
            })
            .await?;

        tracing::debug!(
            user_id = %caller.user_id,
            fingerprint = &key[..12],
            cache_hit = result.hit,
            results = result.value.results.len(),
            "Recipe search served"
        );
        Ok(result)
    }

    /// Generate text. Needs enhanced consent, since prompts may carry health
    /// details; responses are never cached.
    pub async fn generate_text(
        &self,
        caller: &CallerContext,
        prompt: &str,
        params: &GenerationParams,
    ) -> Result<GenerationResponse, OrchestrationError> {
        let client = self.orchestrator.generative_ai()?;
        let call = self
            .billable(caller, ServiceKind::GenerativeAi, "ai.generate")
            .requires(ConsentType::Enhanced);

        let response = self
            .guard
            .execute(&call, || client.generate(prompt, params))
            .await?;

        tracing::info!(
            user_id = %caller.user_id,
            model = %response.model,
            input_tokens = response.input_tokens,
            output_tokens = response.output_tokens,
            "Text generated"
        );
        Ok(response)
    }

    pub async fn create_checkout(
        &self,
        caller: &CallerContext,
        request: &CheckoutRequest,
    ) -> Result<CheckoutSession, OrchestrationError> {
        let client = self.orchestrator.payment()?;
        let call = self.billable(caller, ServiceKind::Payment, "checkout.create");
        self.guard
            .execute(&call, || client.create_checkout_session(request))
            .await
    }

    pub async fn verify_session(
        &self,
        caller: &CallerContext,
        access_token: &str,
    ) -> Result<IdentityUser, OrchestrationError> {
        let client = self.orchestrator.identity()?;
        let call = self.billable(caller, ServiceKind::Identity, "session.verify");
        self.guard
            .execute(&call, || client.verify_session(access_token))
            .await
    }
}
