//! Prometheus metrics for orchestration-service.
//!
//! Upstream call, spend, cache and audit metrics. Recording helpers are no-ops
//! until [`init_metrics`] has run, so library users and tests need no setup.

use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder,
};
use std::sync::OnceLock;

// Global registry
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

// Upstream call metrics
pub static EXTERNAL_CALLS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
pub static EXTERNAL_CALL_DURATION_SECONDS: OnceLock<HistogramVec> = OnceLock::new();
pub static RATE_LIMIT_DENIALS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
pub static QUOTA_DENIALS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

// Spend metrics
pub static API_COST_MICRO_USD_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
pub static BUDGET_ALERTS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

// Cache metrics
pub static CACHE_LOOKUPS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
pub static CACHE_ENTRIES: OnceLock<IntGaugeVec> = OnceLock::new();

// Compliance metrics
pub static AUDIT_ENTRIES_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
pub static AUDIT_WRITE_FAILURES_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
pub static CONSENT_DENIALS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

// Health metrics
pub static SERVICE_HEALTH: OnceLock<IntGaugeVec> = OnceLock::new();

/// Initialize all metrics. Must be called once at startup.
pub fn init_metrics() {
    let registry = Registry::new();

    let external_calls = IntCounterVec::new(
        Opts::new("external_calls_total", "Total calls forwarded to external services"),
        &["service", "operation", "outcome"],
    )
    .expect("Failed to create external_calls_total metric");

    let external_call_duration = HistogramVec::new(
        HistogramOpts::new(
            "external_call_duration_seconds",
            "External service call duration in seconds",
        )
        .buckets(vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]),
        &["service"],
    )
    .expect("Failed to create external_call_duration_seconds metric");

    let rate_limit_denials = IntCounterVec::new(
        Opts::new("rate_limit_denials_total", "Calls refused by the rate limiter"),
        &["service"],
    )
    .expect("Failed to create rate_limit_denials_total metric");

    let quota_denials = IntCounterVec::new(
        Opts::new("quota_denials_total", "Calls refused by a spending ceiling"),
        &["service", "quota_type"],
    )
    .expect("Failed to create quota_denials_total metric");

    // Whole micro-dollars so the counter stays integral
    let api_cost = IntCounterVec::new(
        Opts::new("api_cost_micro_usd_total", "Recorded API spend in micro-USD"),
        &["service"],
    )
    .expect("Failed to create api_cost_micro_usd_total metric");

    let budget_alerts = IntCounterVec::new(
        Opts::new("budget_alerts_total", "Budget alert levels raised"),
        &["level"],
    )
    .expect("Failed to create budget_alerts_total metric");

    let cache_lookups = IntCounterVec::new(
        Opts::new("cache_lookups_total", "Response cache lookups"),
        &["result"], // hit, miss
    )
    .expect("Failed to create cache_lookups_total metric");

    let cache_entries = IntGaugeVec::new(
        Opts::new("cache_entries", "Entries currently held in the response cache"),
        &["cache"],
    )
    .expect("Failed to create cache_entries metric");

    let audit_entries = IntCounterVec::new(
        Opts::new("audit_entries_total", "Audit log entries written"),
        &["status"],
    )
    .expect("Failed to create audit_entries_total metric");

    let audit_write_failures = IntCounterVec::new(
        Opts::new(
            "audit_write_failures_total",
            "Audit entries diverted to the emergency channel",
        ),
        &["sink"],
    )
    .expect("Failed to create audit_write_failures_total metric");

    let consent_denials = IntCounterVec::new(
        Opts::new("consent_denials_total", "Operations refused for missing consent"),
        &["required"],
    )
    .expect("Failed to create consent_denials_total metric");

    let service_health = IntGaugeVec::new(
        Opts::new("service_health", "1 if the external service probe last succeeded"),
        &["service"],
    )
    .expect("Failed to create service_health metric");

    registry
        .register(Box::new(external_calls.clone()))
        .expect("Failed to register external_calls_total");
    registry
        .register(Box::new(external_call_duration.clone()))
        .expect("Failed to register external_call_duration_seconds");
    registry
        .register(Box::new(rate_limit_denials.clone()))
        .expect("Failed to register rate_limit_denials_total");
    registry
        .register(Box::new(quota_denials.clone()))
        .expect("Failed to register quota_denials_total");
    registry
        .register(Box::new(api_cost.clone()))
        .expect("Failed to register api_cost_micro_usd_total");
    registry
        .register(Box::new(budget_alerts.clone()))
        .expect("Failed to register budget_alerts_total");
    registry
        .register(Box::new(cache_lookups.clone()))
        .expect("Failed to register cache_lookups_total");
    registry
        .register(Box::new(cache_entries.clone()))
        .expect("Failed to register cache_entries");
    registry
        .register(Box::new(audit_entries.clone()))
        .expect("Failed to register audit_entries_total");
    registry
        .register(Box::new(audit_write_failures.clone()))
        .expect("Failed to register audit_write_failures_total");
    registry
        .register(Box::new(consent_denials.clone()))
        .expect("Failed to register consent_denials_total");
    registry
        .register(Box::new(service_health.clone()))
        .expect("Failed to register service_health");

    let _ = REGISTRY.set(registry);
    let _ = EXTERNAL_CALLS_TOTAL.set(external_calls);
    let _ = EXTERNAL_CALL_DURATION_SECONDS.set(external_call_duration);
    let _ = RATE_LIMIT_DENIALS_TOTAL.set(rate_limit_denials);
    let _ = QUOTA_DENIALS_TOTAL.set(quota_denials);
    let _ = API_COST_MICRO_USD_TOTAL.set(api_cost);
    let _ = BUDGET_ALERTS_TOTAL.set(budget_alerts);
    let _ = CACHE_LOOKUPS_TOTAL.set(cache_lookups);
    let _ = CACHE_ENTRIES.set(cache_entries);
    let _ = AUDIT_ENTRIES_TOTAL.set(audit_entries);
    let _ = AUDIT_WRITE_FAILURES_TOTAL.set(audit_write_failures);
    let _ = CONSENT_DENIALS_TOTAL.set(consent_denials);
    let _ = SERVICE_HEALTH.set(service_health);

    tracing::info!("Prometheus metrics initialized");
}

/// Get metrics in Prometheus text format.
pub fn get_metrics() -> String {
    let mut buffer = Vec::new();
    let encoder = TextEncoder::new();

    let registry = match REGISTRY.get() {
        Some(r) => r,
        None => {
            tracing::error!("Metrics registry not initialized");
            return "# Metrics registry not initialized\n".to_string();
        }
    };

    let metric_families = registry.gather();

    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!(error = %e, "Failed to encode metrics");
        return format!("# Failed to encode metrics: {}\n", e);
    }

    match String::from_utf8(buffer) {
        Ok(s) => s,
        Err(e) => {
            tracing::error!(error = %e, "Failed to convert metrics to UTF-8");
            format!("# Failed to convert metrics to UTF-8: {}\n", e)
        }
    }
}

// Helper functions for recording metrics

/// Record a completed (or failed) upstream call.
pub fn record_external_call(service: &str, operation: &str, outcome: &str, duration_secs: f64) {
    if let Some(counter) = EXTERNAL_CALLS_TOTAL.get() {
        counter
            .with_label_values(&[service, operation, outcome])
            .inc();
    }
    if let Some(histogram) = EXTERNAL_CALL_DURATION_SECONDS.get() {
        histogram.with_label_values(&[service]).observe(duration_secs);
    }
}

pub fn record_rate_limit_denial(service: &str) {
    if let Some(counter) = RATE_LIMIT_DENIALS_TOTAL.get() {
        counter.with_label_values(&[service]).inc();
    }
}

pub fn record_quota_denial(service: &str, quota_type: &str) {
    if let Some(counter) = QUOTA_DENIALS_TOTAL.get() {
        counter.with_label_values(&[service, quota_type]).inc();
    }
}

/// Record spend attributed to a service.
pub fn record_cost(service: &str, cost_usd: f64) {
    if let Some(counter) = API_COST_MICRO_USD_TOTAL.get() {
        let micros = (cost_usd * 1_000_000.0).round().max(0.0) as u64;
        counter.with_label_values(&[service]).inc_by(micros);
    }
}

pub fn record_budget_alert(level: &str) {
    if let Some(counter) = BUDGET_ALERTS_TOTAL.get() {
        counter.with_label_values(&[level]).inc();
    }
}

pub fn record_cache_lookup(hit: bool) {
    if let Some(counter) = CACHE_LOOKUPS_TOTAL.get() {
        let result = if hit { "hit" } else { "miss" };
        counter.with_label_values(&[result]).inc();
    }
}

pub fn set_cache_entries(cache: &str, entries: usize) {
    if let Some(gauge) = CACHE_ENTRIES.get() {
        gauge.with_label_values(&[cache]).set(entries as i64);
    }
}

pub fn record_audit_entry(status: &str) {
    if let Some(counter) = AUDIT_ENTRIES_TOTAL.get() {
        counter.with_label_values(&[status]).inc();
    }
}

pub fn record_audit_write_failure(sink: &str) {
    if let Some(counter) = AUDIT_WRITE_FAILURES_TOTAL.get() {
        counter.with_label_values(&[sink]).inc();
    }
}

pub fn record_consent_denial(required: &str) {
    if let Some(counter) = CONSENT_DENIALS_TOTAL.get() {
        counter.with_label_values(&[required]).inc();
    }
}

pub fn set_service_health(service: &str, healthy: bool) {
    if let Some(gauge) = SERVICE_HEALTH.get() {
        gauge.with_label_values(&[service]).set(i64::from(healthy));
    }
}
