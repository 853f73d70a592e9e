//! Application wiring and server lifecycle.

use crate::config::OrchestratorConfig;
use crate::handlers::{budget, consent, generate, health, recipes};
use crate::middleware::admin_auth_middleware;
use crate::services::clients::{ClientFactory, HttpClientFactory, RecipeSearchResult};
use crate::services::{
    AuditSink, CacheManager, CallGuard, CareDb, ConsentGate, ConsentStore, CostTracker,
    EmergencyChannel, HealthcareDataAccessWrapper, InMemoryAuditSink, InMemoryConsentStore,
    MongoAuditSink, MongoConsentStore, RateLimiter, ServiceGateway, ServiceOrchestrator,
    TracingEmergencyChannel,
};
use axum::{
    middleware::{self, from_fn_with_state},
    routing::{get, post, put},
    Router,
};
use secrecy::Secret;
use service_core::error::AppError;
use service_core::middleware::request_id_middleware;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<ServiceOrchestrator>,
    pub gateway: Arc<ServiceGateway>,
    pub consent: Arc<ConsentGate>,
    pub cost_tracker: Arc<CostTracker>,
    pub rate_limiter: Arc<RateLimiter>,
    pub recipe_cache: Arc<CacheManager<RecipeSearchResult>>,
    pub data_access: HealthcareDataAccessWrapper,
    pub db: Option<CareDb>,
    pub admin_api_key: Option<Secret<String>>,
}

/// Where consent records and audit entries are written.
pub struct Backends {
    pub consent_store: Arc<dyn ConsentStore>,
    pub audit_sink: Arc<dyn AuditSink>,
    pub emergency: Arc<dyn EmergencyChannel>,
    pub db: Option<CareDb>,
}

impl Backends {
    pub fn in_memory() -> Self {
        Self {
            consent_store: Arc::new(InMemoryConsentStore::new()),
            audit_sink: Arc::new(InMemoryAuditSink::new()),
            emergency: Arc::new(TracingEmergencyChannel),
            db: None,
        }
    }

    pub fn mongo(db: CareDb) -> Self {
        Self {
            consent_store: Arc::new(MongoConsentStore::new(db.clone())),
            audit_sink: Arc::new(MongoAuditSink::new(db.clone())),
            emergency: Arc::new(TracingEmergencyChannel),
            db: Some(db),
        }
    }
}

impl AppState {
    pub fn new(
        config: &OrchestratorConfig,
        factory: Arc<dyn ClientFactory>,
        backends: Backends,
    ) -> Self {
        let orchestrator = Arc::new(ServiceOrchestrator::new(
            config.services.clone(),
            factory,
            config.health_probe_timeout,
        ));
        let rate_limiter = Arc::new(RateLimiter::per_minute(config.services.rate_limits()));
        let cost_tracker = Arc::new(CostTracker::new(
            config.budget.clone(),
            config.services.prices(),
        ));
        let consent = Arc::new(ConsentGate::new(backends.consent_store, &config.consent));
        let recipe_cache = Arc::new(CacheManager::new("recipes", &config.cache));

        let guard = CallGuard::new(rate_limiter.clone(), cost_tracker.clone(), consent.clone());
        let mut gateway = ServiceGateway::new(orchestrator.clone(), guard, recipe_cache.clone());
        if let Some(timeout) = config.call_timeout {
            gateway = gateway.with_call_timeout(timeout);
        }

        let data_access = HealthcareDataAccessWrapper::new(
            backends.audit_sink,
            backends.emergency,
            config.audit.clone(),
        );

        Self {
            orchestrator,
            gateway: Arc::new(gateway),
            consent,
            cost_tracker,
            rate_limiter,
            recipe_cache,
            data_access,
            db: backends.db,
            admin_api_key: config.admin_api_key.clone(),
        }
    }

    /// State backed by in-memory stores, for tests and local runs without
    /// MongoDB.
    pub fn in_memory(config: &OrchestratorConfig, factory: Arc<dyn ClientFactory>) -> Self {
        Self::new(config, factory, Backends::in_memory())
    }
}

pub fn build_router(state: AppState) -> Router {
    let api = Router::new()
        .route("/recipes/search", post(recipes::search_recipes))
        .route("/ai/generate", post(generate::generate_text))
        .route("/budget", get(budget::get_budget))
        .route(
            "/consent",
            get(consent::consent_status).post(consent::grant_consent),
        )
        .route("/consent/revoke", post(consent::revoke_consent));

    let admin = Router::new()
        .route(
            "/tenants/:tenant_id/budgets/:user_id",
            put(budget::set_budget),
        )
        .route(
            "/tenants/:tenant_id/budgets/:user_id/reset",
            post(budget::reset_budget),
        )
        .route("/budgets/reset", post(budget::reset_all_budgets))
        .layer(from_fn_with_state(state.clone(), admin_auth_middleware));

    Router::new()
        .route("/health", get(health::health_check))
        .route("/ready", get(health::readiness_check))
        .route("/metrics", get(health::metrics_endpoint))
        .nest("/api/v1", api)
        .nest("/api/v1/admin", admin)
        .layer(TraceLayer::new_for_http())
        .layer(middleware::from_fn(request_id_middleware))
        .with_state(state)
}

/// Stops a running [`Application`] from outside, e.g. on an OS signal.
#[derive(Clone)]
pub struct ShutdownHandle {
    token: CancellationToken,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        tracing::info!("Shutdown requested");
        self.token.cancel();
    }
}

/// Application container for managing server lifecycle.
pub struct Application {
    http_port: u16,
    listener: TcpListener,
    state: AppState,
    sweep_interval: Duration,
    shutdown: CancellationToken,
}

impl Application {
    /// Connect to MongoDB, wire the production clients and bind the listener.
    pub async fn build(config: OrchestratorConfig) -> Result<Self, AppError> {
        let db = CareDb::connect(&config.mongodb.uri, &config.mongodb.database)
            .await
            .map_err(|e| {
                tracing::error!("Failed to connect to MongoDB: {}", e);
                e
            })?;

        db.initialize_indexes().await.map_err(|e| {
            tracing::error!("Failed to initialize database indexes: {}", e);
            e
        })?;

        let state = AppState::new(&config, Arc::new(HttpClientFactory), Backends::mongo(db));
        Self::build_with_state(&config, state).await
    }

    /// Initialize the orchestrator in `state` and bind the listener.
    /// Port 0 picks a random port.
    pub async fn build_with_state(
        config: &OrchestratorConfig,
        state: AppState,
    ) -> Result<Self, AppError> {
        state.orchestrator.initialize().await.map_err(|e| {
            tracing::error!("Failed to initialize service orchestrator: {}", e);
            AppError::from(e)
        })?;

        let addr = SocketAddr::from(([0, 0, 0, 0], config.common.port));
        let listener = TcpListener::bind(addr).await.map_err(|e| {
            tracing::error!("Failed to bind HTTP listener to {}: {}", addr, e);
            AppError::from(e)
        })?;
        let http_port = listener.local_addr()?.port();

        tracing::info!("Orchestration service: HTTP on port {}", http_port);

        Ok(Self {
            http_port,
            listener,
            state,
            sweep_interval: config.cache.sweep_interval,
            shutdown: CancellationToken::new(),
        })
    }

    /// Get the HTTP port the server is listening on.
    pub fn http_port(&self) -> u16 {
        self.http_port
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            token: self.shutdown.clone(),
        }
    }

    /// Serve until the shutdown handle fires, then stop the maintenance
    /// task and the orchestrator.
    pub async fn run_until_stopped(self) -> std::io::Result<()> {
        let maintenance = tokio::spawn(run_maintenance(
            self.state.clone(),
            self.sweep_interval,
            self.shutdown.clone(),
        ));

        let router = build_router(self.state.clone());
        let result = axum::serve(self.listener, router)
            .with_graceful_shutdown(self.shutdown.clone().cancelled_owned())
            .await;

        self.shutdown.cancel();
        if let Err(e) = maintenance.await {
            tracing::warn!("Maintenance task ended abnormally: {}", e);
        }
        self.state.orchestrator.shutdown();

        if let Err(e) = &result {
            tracing::error!("HTTP server error: {}", e);
        }
        result
    }
}

/// Periodically drop expired cache entries and rate-limit windows until
/// `shutdown` fires. Both operations are idempotent.
pub async fn run_maintenance(state: AppState, every: Duration, shutdown: CancellationToken) {
    if every.is_zero() {
        shutdown.cancelled().await;
        return;
    }

    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                let swept = state.recipe_cache.sweep();
                let purged = state.rate_limiter.purge_expired();
                if swept > 0 || purged > 0 {
                    tracing::debug!(swept, purged, "Maintenance sweep completed");
                }
            }
        }
    }

    tracing::info!("Maintenance task stopped");
}
