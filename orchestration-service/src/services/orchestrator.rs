//! Lifecycle and health of the upstream service clients.
//!
//! The orchestrator moves through `Initializing -> Ready | Failed`, and to
//! `Stopped` on shutdown. Typed getters only hand out clients in `Ready`.
//! Clients are built lazily by the [`ClientFactory`] on first use and reused
//! afterwards.

use crate::config::ServicesConfig;
use crate::error::OrchestrationError;
use crate::models::ServiceKind;
use crate::services::clients::{
    ClientError, ClientFactory, GenerativeAiClient, IdentityClient, NutritionClient,
    PaymentClient,
};
use crate::services::metrics;
use chrono::{DateTime, Utc};
use once_cell::sync::OnceCell;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::time::Instant;

/// Lazily built clients. Exists only once configuration validated.
pub struct ServiceRegistry {
    config: ServicesConfig,
    factory: Arc<dyn ClientFactory>,
    nutrition: OnceCell<Arc<dyn NutritionClient>>,
    generative_ai: OnceCell<Arc<dyn GenerativeAiClient>>,
    payment: OnceCell<Arc<dyn PaymentClient>>,
    identity: OnceCell<Arc<dyn IdentityClient>>,
}

impl ServiceRegistry {
    fn new(config: ServicesConfig, factory: Arc<dyn ClientFactory>) -> Self {
        Self {
            config,
            factory,
            nutrition: OnceCell::new(),
            generative_ai: OnceCell::new(),
            payment: OnceCell::new(),
            identity: OnceCell::new(),
        }
    }

    fn ensure_configured(&self, service: ServiceKind) -> Result<(), OrchestrationError> {
        if self.config.settings(service).is_configured() {
            Ok(())
        } else {
            Err(OrchestrationError::NotConfigured(service))
        }
    }

    pub fn nutrition(&self) -> Result<Arc<dyn NutritionClient>, OrchestrationError> {
        self.ensure_configured(ServiceKind::Nutrition)?;
        self.nutrition
            .get_or_try_init(|| self.factory.nutrition(&self.config.nutrition))
            .cloned()
            .map_err(build_error(ServiceKind::Nutrition))
    }

    pub fn generative_ai(&self) -> Result<Arc<dyn GenerativeAiClient>, OrchestrationError> {
        self.ensure_configured(ServiceKind::GenerativeAi)?;
        self.generative_ai
            .get_or_try_init(|| self.factory.generative_ai(&self.config.genai))
            .cloned()
            .map_err(build_error(ServiceKind::GenerativeAi))
    }

    pub fn payment(&self) -> Result<Arc<dyn PaymentClient>, OrchestrationError> {
        self.ensure_configured(ServiceKind::Payment)?;
        self.payment
            .get_or_try_init(|| self.factory.payment(&self.config.payment))
            .cloned()
            .map_err(build_error(ServiceKind::Payment))
    }

    pub fn identity(&self) -> Result<Arc<dyn IdentityClient>, OrchestrationError> {
        self.ensure_configured(ServiceKind::Identity)?;
        self.identity
            .get_or_try_init(|| self.factory.identity(&self.config.identity))
            .cloned()
            .map_err(build_error(ServiceKind::Identity))
    }

    async fn check(&self, service: ServiceKind) -> Result<(), String> {
        let outcome = match service {
            ServiceKind::Nutrition => match self.nutrition() {
                Ok(client) => client.health_check().await,
                Err(e) => return Err(e.to_string()),
            },
            ServiceKind::GenerativeAi => match self.generative_ai() {
                Ok(client) => client.health_check().await,
                Err(e) => return Err(e.to_string()),
            },
            ServiceKind::Payment => match self.payment() {
                Ok(client) => client.health_check().await,
                Err(e) => return Err(e.to_string()),
            },
            ServiceKind::Identity => match self.identity() {
                Ok(client) => client.health_check().await,
                Err(e) => return Err(e.to_string()),
            },
        };
        outcome.map_err(|e| e.to_string())
    }
}

fn build_error(service: ServiceKind) -> impl Fn(ClientError) -> OrchestrationError {
    move |e| {
        tracing::error!(service = %service, error = %e, "Failed to construct service client");
        match e {
            ClientError::NotConfigured(_) => OrchestrationError::NotConfigured(service),
            other => other.into_external(service),
        }
    }
}

pub enum OrchestratorState {
    Initializing,
    Ready(Arc<ServiceRegistry>),
    Failed(String),
    Stopped,
}

impl OrchestratorState {
    pub fn name(&self) -> &'static str {
        match self {
            OrchestratorState::Initializing => "initializing",
            OrchestratorState::Ready(_) => "ready",
            OrchestratorState::Failed(_) => "failed",
            OrchestratorState::Stopped => "stopped",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServiceHealth {
    pub status: HealthStatus,
    pub configured: bool,
    pub ready: bool,
    pub latency_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub services: BTreeMap<String, ServiceHealth>,
    pub last_checked: DateTime<Utc>,
    /// Seconds since the orchestrator was constructed.
    pub uptime: u64,
}

/// `healthy` iff every service is healthy, `degraded` iff at least two are.
pub fn aggregate_status(healthy: usize, total: usize) -> HealthStatus {
    if healthy == total {
        HealthStatus::Healthy
    } else if healthy >= 2 {
        HealthStatus::Degraded
    } else {
        HealthStatus::Unhealthy
    }
}

pub struct ServiceOrchestrator {
    config: ServicesConfig,
    factory: Arc<dyn ClientFactory>,
    probe_timeout: Duration,
    state: RwLock<OrchestratorState>,
    started: Instant,
}

impl ServiceOrchestrator {
    pub fn new(
        config: ServicesConfig,
        factory: Arc<dyn ClientFactory>,
        probe_timeout: Duration,
    ) -> Self {
        Self {
            config,
            factory,
            probe_timeout,
            state: RwLock::new(OrchestratorState::Initializing),
            started: Instant::now(),
        }
    }

    /// Validate configuration and move to `Ready`, or to `Failed` with the
    /// reason. Calling it again once ready is a no-op.
    pub async fn initialize(&self) -> Result<(), OrchestrationError> {
        {
            let state = self.state.read().unwrap_or_else(|e| e.into_inner());
            match &*state {
                OrchestratorState::Ready(_) => return Ok(()),
                OrchestratorState::Stopped => return Err(OrchestrationError::NotInitialized),
                OrchestratorState::Failed(reason) => {
                    return Err(OrchestrationError::InitializationFailed(reason.clone()))
                }
                OrchestratorState::Initializing => {}
            }
        }

        let next = match validate(&self.config) {
            Ok(()) => {
                let configured: Vec<&str> = ServiceKind::ALL
                    .iter()
                    .filter(|kind| self.config.settings(**kind).is_configured())
                    .map(|kind| kind.as_str())
                    .collect();
                tracing::info!(configured = ?configured, "Service orchestrator ready");
                OrchestratorState::Ready(Arc::new(ServiceRegistry::new(
                    self.config.clone(),
                    self.factory.clone(),
                )))
            }
            Err(reason) => {
                tracing::error!(reason = %reason, "Service orchestrator failed to initialize");
                OrchestratorState::Failed(reason)
            }
        };

        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        // A concurrent initialize() or shutdown() may have won the race.
        if let OrchestratorState::Initializing = &*state {
            *state = next;
        }
        match &*state {
            OrchestratorState::Ready(_) => Ok(()),
            OrchestratorState::Failed(reason) => {
                Err(OrchestrationError::InitializationFailed(reason.clone()))
            }
            _ => Err(OrchestrationError::NotInitialized),
        }
    }

    /// Release all clients. Getters fail with `NotInitialized` afterwards.
    pub fn shutdown(&self) {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        if !matches!(&*state, OrchestratorState::Stopped) {
            tracing::info!("Service orchestrator stopped");
        }
        *state = OrchestratorState::Stopped;
    }

    pub fn state_name(&self) -> &'static str {
        self.state.read().unwrap_or_else(|e| e.into_inner()).name()
    }

    pub fn is_ready(&self) -> bool {
        matches!(
            &*self.state.read().unwrap_or_else(|e| e.into_inner()),
            OrchestratorState::Ready(_)
        )
    }

    pub fn registry(&self) -> Result<Arc<ServiceRegistry>, OrchestrationError> {
        match &*self.state.read().unwrap_or_else(|e| e.into_inner()) {
            OrchestratorState::Ready(registry) => Ok(registry.clone()),
            OrchestratorState::Failed(reason) => {
                Err(OrchestrationError::InitializationFailed(reason.clone()))
            }
            OrchestratorState::Initializing | OrchestratorState::Stopped => {
                Err(OrchestrationError::NotInitialized)
            }
        }
    }

    pub fn nutrition(&self) -> Result<Arc<dyn NutritionClient>, OrchestrationError> {
        self.registry()?.nutrition()
    }

    pub fn generative_ai(&self) -> Result<Arc<dyn GenerativeAiClient>, OrchestrationError> {
        self.registry()?.generative_ai()
    }

    pub fn payment(&self) -> Result<Arc<dyn PaymentClient>, OrchestrationError> {
        self.registry()?.payment()
    }

    pub fn identity(&self) -> Result<Arc<dyn IdentityClient>, OrchestrationError> {
        self.registry()?.identity()
    }

    pub fn services_config(&self) -> &ServicesConfig {
        &self.config
    }

    /// Probe all four services concurrently, each under its own timeout.
    /// A failing or hung probe only marks its own service unhealthy.
    pub async fn perform_health_check(&self) -> HealthReport {
        let registry = self.registry().ok();
        let registry = registry.as_deref();

        let (nutrition, generative_ai, payment, identity) = tokio::join!(
            self.probe(ServiceKind::Nutrition, registry),
            self.probe(ServiceKind::GenerativeAi, registry),
            self.probe(ServiceKind::Payment, registry),
            self.probe(ServiceKind::Identity, registry),
        );

        let services: BTreeMap<String, ServiceHealth> = [
            (ServiceKind::Nutrition, nutrition),
            (ServiceKind::GenerativeAi, generative_ai),
            (ServiceKind::Payment, payment),
            (ServiceKind::Identity, identity),
        ]
        .into_iter()
        .map(|(kind, health)| (kind.as_str().to_string(), health))
        .collect();

        let healthy = services
            .values()
            .filter(|health| health.status == HealthStatus::Healthy)
            .count();
        let status = aggregate_status(healthy, services.len());

        tracing::debug!(status = ?status, healthy, "Health check completed");
        HealthReport {
            status,
            services,
            last_checked: Utc::now(),
            uptime: self.started.elapsed().as_secs(),
        }
    }

    async fn probe(&self, service: ServiceKind, registry: Option<&ServiceRegistry>) -> ServiceHealth {
        let configured = self.config.settings(service).is_configured();
        let ready = registry.is_some();

        let unhealthy = |error: String, latency_ms: u64| ServiceHealth {
            status: HealthStatus::Unhealthy,
            configured,
            ready,
            latency_ms,
            error: Some(error),
        };

        let health = match (configured, registry) {
            (false, _) => unhealthy("not configured".to_string(), 0),
            (true, None) => unhealthy(format!("orchestrator is {}", self.state_name()), 0),
            (true, Some(registry)) => {
                let started = Instant::now();
                let outcome = tokio::time::timeout(self.probe_timeout, registry.check(service)).await;
                let latency_ms = started.elapsed().as_millis() as u64;
                match outcome {
                    Ok(Ok(())) => ServiceHealth {
                        status: HealthStatus::Healthy,
                        configured,
                        ready,
                        latency_ms,
                        error: None,
                    },
                    Ok(Err(error)) => unhealthy(error, latency_ms),
                    Err(_) => unhealthy(
                        format!("health probe timed out after {:?}", self.probe_timeout),
                        latency_ms,
                    ),
                }
            }
        };

        if let Some(error) = &health.error {
            if configured {
                tracing::warn!(service = %service, error = %error, "Service health probe failed");
            }
        }
        metrics::set_service_health(service.as_str(), health.status == HealthStatus::Healthy);
        health
    }
}

fn validate(config: &ServicesConfig) -> Result<(), String> {
    for service in ServiceKind::ALL {
        let settings = config.settings(service);
        if !settings.is_configured() {
            continue;
        }
        reqwest::Url::parse(&settings.base_url)
            .map_err(|e| format!("{} base URL '{}' is invalid: {}", service, settings.base_url, e))?;
        if !settings.cost_per_call_usd.is_finite() || settings.cost_per_call_usd < 0.0 {
            return Err(format!("{} cost per call must be a non-negative amount", service));
        }
    }

    let genai = &config.genai;
    if genai.service.is_configured() {
        if !(0.0..=2.0).contains(&genai.temperature) {
            return Err(format!(
                "generative AI temperature {} is outside 0.0..=2.0",
                genai.temperature
            ));
        }
        if genai.max_tokens == 0 {
            return Err("generative AI max tokens must be positive".to_string());
        }
        if genai.model.trim().is_empty() {
            return Err("generative AI model name is empty".to_string());
        }
    }
    Ok(())
}
