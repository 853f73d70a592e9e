//! The guarded path every billable upstream call takes.
//!
//! Checks run in a fixed order: consent, spending ceiling, rate limit. The
//! spending check holds the call's cost against the budget until the call is
//! billed, so calls in flight count against the ceiling. A refusal at any step
//! means the upstream is never called and nothing is billed. A call that goes out, whether it succeeds, fails or is timed out by
//! the caller, produces exactly one usage record. Nothing here retries.

use crate::error::OrchestrationError;
use crate::models::{ConsentType, ServiceKind, UsageOutcome, UsageRecord};
use crate::services::clients::ClientError;
use crate::services::consent::ConsentGate;
use crate::services::cost_tracker::CostTracker;
use crate::services::metrics;
use crate::services::rate_limiter::RateLimiter;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Description of one billable call.
#[derive(Debug, Clone, PartialEq)]
pub struct BillableCall {
    pub tenant_id: String,
    pub user_id: String,
    pub service: ServiceKind,
    pub operation: String,
    pub required_consent: Option<ConsentType>,
    /// Caller-imposed deadline. Expiry counts as a failed call.
    pub timeout: Option<Duration>,
    /// Overrides the configured per-call price.
    pub cost_usd: Option<f64>,
}

impl BillableCall {
    pub fn new(
        tenant_id: impl Into<String>,
        user_id: impl Into<String>,
        service: ServiceKind,
        operation: impl Into<String>,
    ) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            user_id: user_id.into(),
            service,
            operation: operation.into(),
            required_consent: None,
            timeout: None,
            cost_usd: None,
        }
    }

    pub fn requires(mut self, consent: ConsentType) -> Self {
        self.required_consent = Some(consent);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn cost(mut self, cost_usd: f64) -> Self {
        self.cost_usd = Some(cost_usd);
        self
    }
}

#[derive(Clone)]
pub struct CallGuard {
    rate_limiter: Arc<RateLimiter>,
    cost_tracker: Arc<CostTracker>,
    consent: Arc<ConsentGate>,
}

impl CallGuard {
    pub fn new(
        rate_limiter: Arc<RateLimiter>,
        cost_tracker: Arc<CostTracker>,
        consent: Arc<ConsentGate>,
    ) -> Self {
        Self {
            rate_limiter,
            cost_tracker,
            consent,
        }
    }

    pub fn cost_tracker(&self) -> &Arc<CostTracker> {
        &self.cost_tracker
    }

    pub fn rate_limiter(&self) -> &Arc<RateLimiter> {
        &self.rate_limiter
    }

    pub fn consent(&self) -> &Arc<ConsentGate> {
        &self.consent
    }

    /// Run `call_upstream` if every check passes, then bill it.
    pub async fn execute<T, F, Fut>(
        &self,
        call: &BillableCall,
        call_upstream: F,
    ) -> Result<T, OrchestrationError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, ClientError>>,
    {
        if let Some(required) = call.required_consent {
            self.consent
                .require(&call.tenant_id, &call.user_id, required)
                .await?;
        }
        let cost_usd = call
            .cost_usd
            .unwrap_or_else(|| self.cost_tracker.cost_of(call.service));
        let reservation = self.cost_tracker.reserve(
            &call.tenant_id,
            &call.user_id,
            call.service,
            cost_usd,
        )?;
        self.rate_limiter.check(call.service)?;

        let started = Instant::now();
        let outcome = match call.timeout {
            Some(limit) => match tokio::time::timeout(limit, call_upstream()).await {
                Ok(outcome) => outcome,
                Err(_) => Err(ClientError::Timeout(limit)),
            },
            None => call_upstream().await,
        };
        let elapsed = started.elapsed();

        let usage_outcome = if outcome.is_ok() {
            UsageOutcome::Success
        } else {
            UsageOutcome::Failed
        };
        reservation.settle(UsageRecord::new(
            call.tenant_id.clone(),
            call.user_id.clone(),
            call.service,
            call.operation.clone(),
            cost_usd,
            usage_outcome,
        ));
        metrics::record_external_call(
            call.service.as_str(),
            &call.operation,
            if outcome.is_ok() { "success" } else { "error" },
            elapsed.as_secs_f64(),
        );

        outcome.map_err(|e| {
            tracing::warn!(
                service = %call.service,
                operation = %call.operation,
                user_id = %call.user_id,
                error = %e,
                elapsed_ms = elapsed.as_millis() as u64,
                "External call failed"
            );
            e.into_external(call.service)
        })
    }
}
