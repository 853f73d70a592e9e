pub mod audit;
pub mod cache;
pub mod clients;
pub mod consent;
pub mod cost_tracker;
pub mod data_access;
pub mod database;
pub mod gateway;
pub mod guard;
pub mod metrics;
pub mod orchestrator;
pub mod rate_limiter;

pub use audit::{AuditSink, EmergencyChannel, InMemoryAuditSink, TracingEmergencyChannel};
pub use cache::{fingerprint, CacheManager, CacheStats, Cached, Sensitivity};
pub use consent::{ConsentGate, ConsentRequest, ConsentStore, InMemoryConsentStore};
pub use cost_tracker::CostTracker;
pub use data_access::{HealthcareDataAccessWrapper, QueryContext};
pub use database::{CareDb, MongoAuditSink, MongoConsentStore};
pub use gateway::{CallerContext, ServiceGateway};
pub use guard::{BillableCall, CallGuard};
pub use orchestrator::{HealthReport, HealthStatus, ServiceHealth, ServiceOrchestrator};
pub use rate_limiter::{RateLimitDecision, RateLimiter};
