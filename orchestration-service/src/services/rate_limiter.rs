//! Fixed-window request ceilings per upstream service.
//!
//! Each window is keyed by service (optionally plus user) and lives in a
//! `DashMap`, so a counter update takes only that key's shard lock and
//! independent keys never contend.

use crate::error::OrchestrationError;
use crate::models::ServiceKind;
use crate::services::metrics;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

pub const DEFAULT_WINDOW: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct WindowKey {
    service: ServiceKind,
    user_id: Option<String>,
}

#[derive(Debug, Clone, Copy)]
struct Window {
    started: Instant,
    count: u32,
}

/// Outcome of [`RateLimiter::try_acquire`].
#[derive(Debug, Clone, PartialEq)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub limit: u32,
    pub remaining: u32,
    /// Time until the current window rolls over.
    pub reset_in: Duration,
    pub reset_time: DateTime<Utc>,
}

pub struct RateLimiter {
    windows: DashMap<WindowKey, Window>,
    limits: HashMap<ServiceKind, u32>,
    window: Duration,
}

impl RateLimiter {
    /// `limits` holds requests per window; a missing or zero limit disables
    /// limiting for that service.
    pub fn new(limits: HashMap<ServiceKind, u32>, window: Duration) -> Self {
        Self {
            windows: DashMap::new(),
            limits,
            window,
        }
    }

    pub fn per_minute(limits: HashMap<ServiceKind, u32>) -> Self {
        Self::new(limits, DEFAULT_WINDOW)
    }

    pub fn limit_for(&self, service: ServiceKind) -> Option<u32> {
        self.limits.get(&service).copied().filter(|limit| *limit > 0)
    }

    /// Count one call against the service-wide window.
    pub fn try_acquire(&self, service: ServiceKind) -> RateLimitDecision {
        self.acquire(WindowKey {
            service,
            user_id: None,
        })
    }

    /// Count one call against the window for this service and user.
    pub fn try_acquire_for_user(&self, service: ServiceKind, user_id: &str) -> RateLimitDecision {
        self.acquire(WindowKey {
            service,
            user_id: Some(user_id.to_string()),
        })
    }

    /// Like [`try_acquire`](Self::try_acquire) but turns a denial into
    /// `OrchestrationError::RateLimit`.
    pub fn check(&self, service: ServiceKind) -> Result<RateLimitDecision, OrchestrationError> {
        let decision = self.try_acquire(service);
        if decision.allowed {
            return Ok(decision);
        }

        tracing::warn!(
            service = %service,
            limit = decision.limit,
            reset_in_ms = decision.reset_in.as_millis() as u64,
            "Rate limit exceeded, call not forwarded"
        );
        metrics::record_rate_limit_denial(service.as_str());

        Err(OrchestrationError::RateLimit {
            service,
            reset_time: decision.reset_time,
            limit: decision.limit,
        })
    }

    fn acquire(&self, key: WindowKey) -> RateLimitDecision {
        let Some(limit) = self.limit_for(key.service) else {
            return RateLimitDecision {
                allowed: true,
                limit: 0,
                remaining: u32::MAX,
                reset_in: Duration::ZERO,
                reset_time: Utc::now(),
            };
        };

        let now = Instant::now();
        let mut entry = self.windows.entry(key).or_insert(Window {
            started: now,
            count: 0,
        });

        if now.duration_since(entry.started) >= self.window {
            *entry = Window {
                started: now,
                count: 0,
            };
        }

        let allowed = entry.count < limit;
        if allowed {
            entry.count += 1;
        }
        let remaining = limit - entry.count;
        let reset_in = self.window.saturating_sub(now.duration_since(entry.started));
        drop(entry);

        RateLimitDecision {
            allowed,
            limit,
            remaining,
            reset_in,
            reset_time: Utc::now()
                + chrono::Duration::from_std(reset_in).unwrap_or_else(|_| chrono::Duration::zero()),
        }
    }

    /// Drop windows that have already rolled over. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.windows.len();
        self.windows
            .retain(|_, window| now.duration_since(window.started) < self.window);
        before.saturating_sub(self.windows.len())
    }

    pub fn tracked_windows(&self) -> usize {
        self.windows.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn limiter(limit: u32) -> RateLimiter {
        RateLimiter::per_minute(HashMap::from([
            (ServiceKind::Nutrition, limit),
            (ServiceKind::GenerativeAi, limit),
        ]))
    }

    #[tokio::test(start_paused = true)]
    async fn exactly_limit_calls_pass_within_a_window() {
        let limiter = limiter(3);

        for expected_remaining in [2, 1, 0] {
            let decision = limiter.try_acquire(ServiceKind::Nutrition);
            assert!(decision.allowed);
            assert_eq!(decision.remaining, expected_remaining);
        }

        let denied = limiter.try_acquire(ServiceKind::Nutrition);
        assert!(!denied.allowed);
        assert_eq!(denied.limit, 3);
        assert!(denied.reset_time > Utc::now());
        assert_eq!(denied.reset_in, DEFAULT_WINDOW);
    }

    #[tokio::test(start_paused = true)]
    async fn calls_succeed_again_after_rollover() {
        let limiter = limiter(1);
        assert!(limiter.try_acquire(ServiceKind::Nutrition).allowed);
        assert!(!limiter.try_acquire(ServiceKind::Nutrition).allowed);

        tokio::time::advance(Duration::from_secs(30)).await;
        let still_denied = limiter.try_acquire(ServiceKind::Nutrition);
        assert!(!still_denied.allowed);
        assert_eq!(still_denied.reset_in, Duration::from_secs(30));

        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(limiter.try_acquire(ServiceKind::Nutrition).allowed);
    }

    #[tokio::test(start_paused = true)]
    async fn check_returns_rate_limit_error() {
        let limiter = limiter(1);
        limiter.check(ServiceKind::GenerativeAi).unwrap();

        match limiter.check(ServiceKind::GenerativeAi) {
            Err(OrchestrationError::RateLimit { service, limit, .. }) => {
                assert_eq!(service, ServiceKind::GenerativeAi);
                assert_eq!(limit, 1);
            }
            other => panic!("expected rate limit error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn services_and_users_have_independent_windows() {
        let limiter = limiter(1);
        assert!(limiter.try_acquire(ServiceKind::Nutrition).allowed);
        assert!(limiter.try_acquire(ServiceKind::GenerativeAi).allowed);
        assert!(limiter.try_acquire_for_user(ServiceKind::Nutrition, "alice").allowed);
        assert!(limiter.try_acquire_for_user(ServiceKind::Nutrition, "bob").allowed);
        assert!(!limiter.try_acquire_for_user(ServiceKind::Nutrition, "alice").allowed);
    }

    #[tokio::test]
    async fn unlimited_services_are_always_allowed() {
        let limiter = limiter(0);
        for _ in 0..100 {
            assert!(limiter.try_acquire(ServiceKind::Nutrition).allowed);
        }
        assert!(limiter.try_acquire(ServiceKind::Payment).allowed);
        assert_eq!(limiter.tracked_windows(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_callers_never_exceed_the_limit() {
        let limiter = Arc::new(limiter(50));

        let handles: Vec<_> = (0..200)
            .map(|_| {
                let limiter = limiter.clone();
                tokio::spawn(async move { limiter.try_acquire(ServiceKind::Nutrition).allowed })
            })
            .collect();

        let mut allowed = 0;
        for handle in handles {
            if handle.await.unwrap() {
                allowed += 1;
            }
        }
        assert_eq!(allowed, 50);
    }

    #[tokio::test(start_paused = true)]
    async fn purge_removes_only_rolled_over_windows() {
        let limiter = limiter(5);
        limiter.try_acquire(ServiceKind::Nutrition);
        tokio::time::advance(Duration::from_secs(45)).await;
        limiter.try_acquire(ServiceKind::GenerativeAi);
        tokio::time::advance(Duration::from_secs(20)).await;

        assert_eq!(limiter.purge_expired(), 1);
        assert_eq!(limiter.tracked_windows(), 1);
    }
}
