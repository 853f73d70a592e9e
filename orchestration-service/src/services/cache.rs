//! TTL cache for idempotent external reads.
//!
//! Entries expire a fixed TTL after they were written; a hit bumps the hit
//! counter and LRU position but never the expiry. Expired entries are evicted
//! lazily when looked up and in bulk by [`CacheManager::sweep`], which also
//! trims the cache back to its maximum size, least recently used first.

use crate::config::CacheConfig;
use crate::services::metrics;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// What kind of data a response carries, which decides whether it may be cached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sensitivity {
    Public,
    /// Tied to one caller's session, e.g. a checkout or identity lookup.
    SessionSpecific,
    /// Carries protected health information.
    Phi,
}

impl Sensitivity {
    pub fn is_cacheable(&self) -> bool {
        matches!(self, Sensitivity::Public)
    }
}

#[derive(Debug, Clone)]
struct CacheEntry<V> {
    value: V,
    cached_at: DateTime<Utc>,
    expires_at: Instant,
    hit_count: u64,
    last_accessed: Instant,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
    pub evictions: u64,
}

/// Result of [`CacheManager::get_or_fetch`].
#[derive(Debug, Clone, PartialEq)]
pub struct Cached<V> {
    pub value: V,
    /// `true` when served from the cache without calling `fetch`.
    pub hit: bool,
}

/// A caller's claim on the per-key fetch lock. The map entry goes away with
/// the last claim on it, whether the fetch finished, failed or was cancelled.
struct InflightSlot<'a> {
    inflight: &'a DashMap<String, Arc<Mutex<()>>>,
    key: String,
    lock: Arc<Mutex<()>>,
}

impl<'a> InflightSlot<'a> {
    fn claim(inflight: &'a DashMap<String, Arc<Mutex<()>>>, key: &str) -> Self {
        let lock = inflight
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        Self {
            inflight,
            key: key.to_string(),
            lock,
        }
    }
}

impl Drop for InflightSlot<'_> {
    fn drop(&mut self) {
        // Claims are only cloned out of the map under its shard lock, so the
        // count seen here is stable: the map plus this slot means no waiters.
        self.inflight.remove_if(&self.key, |_, current| {
            Arc::ptr_eq(current, &self.lock) && Arc::strong_count(current) <= 2
        });
    }
}

pub struct CacheManager<V> {
    name: &'static str,
    entries: DashMap<String, CacheEntry<V>>,
    inflight: DashMap<String, Arc<Mutex<()>>>,
    default_ttl: Duration,
    max_entries: usize,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl<V: Clone> CacheManager<V> {
    pub fn new(name: &'static str, config: &CacheConfig) -> Self {
        Self {
            name,
            entries: DashMap::new(),
            inflight: DashMap::new(),
            default_ttl: config.ttl,
            max_entries: config.max_entries.max(1),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    pub fn get(&self, key: &str) -> Option<V> {
        let value = self.lookup(key);
        self.record_lookup(value.is_some());
        value
    }

    /// Store `value` under `key` for `ttl` (or the configured default).
    /// Session-specific and PHI-bearing values are refused; returns whether
    /// the value was stored.
    pub fn set(&self, key: &str, value: V, ttl: Option<Duration>, sensitivity: Sensitivity) -> bool {
        if !sensitivity.is_cacheable() {
            tracing::debug!(
                cache = self.name,
                sensitivity = ?sensitivity,
                "Refusing to cache non-public response"
            );
            return false;
        }

        let now = Instant::now();
        self.entries.insert(
            key.to_string(),
            CacheEntry {
                value,
                cached_at: Utc::now(),
                expires_at: now + ttl.unwrap_or(self.default_ttl),
                hit_count: 0,
                last_accessed: now,
            },
        );

        let len = self.entries.len();
        if len > self.max_entries {
            self.evict_lru(len - self.max_entries);
        }
        metrics::set_cache_entries(self.name, self.entries.len());
        true
    }

    /// Return the cached value for `key`, or run `fetch` and cache its result.
    ///
    /// Concurrent misses on the same key are serialised: one caller fetches,
    /// the others wait and are then served from the cache. Errors are never
    /// cached. Non-cacheable requests always call `fetch`.
    pub async fn get_or_fetch<F, Fut, E>(
        &self,
        key: &str,
        ttl: Option<Duration>,
        sensitivity: Sensitivity,
        fetch: F,
    ) -> Result<Cached<V>, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        if !sensitivity.is_cacheable() {
            let value = fetch().await?;
            return Ok(Cached { value, hit: false });
        }

        if let Some(value) = self.lookup(key) {
            self.record_lookup(true);
            return Ok(Cached { value, hit: true });
        }

        let slot = InflightSlot::claim(&self.inflight, key);
        let _permit = slot.lock.clone().lock_owned().await;

        // Another caller may have filled the entry while we waited.
        if let Some(value) = self.lookup(key) {
            self.record_lookup(true);
            return Ok(Cached { value, hit: true });
        }
        self.record_lookup(false);

        let result = fetch().await;
        if let Ok(value) = &result {
            self.set(key, value.clone(), ttl, sensitivity);
        }
        result.map(|value| Cached { value, hit: false })
    }

    #[cfg(test)]
    fn inflight_len(&self) -> usize {
        self.inflight.len()
    }

    pub fn invalidate(&self, key: &str) -> bool {
        self.entries.remove(key).is_some()
    }

    pub fn clear(&self) {
        self.entries.clear();
        metrics::set_cache_entries(self.name, 0);
    }

    /// Hits served for `key` since it was written.
    pub fn hit_count(&self, key: &str) -> Option<u64> {
        self.entries.get(key).map(|entry| entry.hit_count)
    }

    pub fn cached_at(&self, key: &str) -> Option<DateTime<Utc>> {
        self.entries.get(key).map(|entry| entry.cached_at)
    }

    /// Drop expired entries, then evict least recently used entries until the
    /// cache is within its maximum size. Returns the number removed.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| now < entry.expires_at);
        let mut removed = before.saturating_sub(self.entries.len());
        self.evictions.fetch_add(removed as u64, Ordering::Relaxed);

        let len = self.entries.len();
        if len > self.max_entries {
            removed += self.evict_lru(len - self.max_entries);
        }

        metrics::set_cache_entries(self.name, self.entries.len());
        if removed > 0 {
            tracing::debug!(cache = self.name, removed, "Cache sweep evicted entries");
        }
        removed
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries: self.entries.len(),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Live lookup without touching the hit/miss counters.
    fn lookup(&self, key: &str) -> Option<V> {
        let now = Instant::now();
        if let Some(mut entry) = self.entries.get_mut(key) {
            if now < entry.expires_at {
                entry.hit_count += 1;
                entry.last_accessed = now;
                return Some(entry.value.clone());
            }
        }

        if self
            .entries
            .remove_if(key, |_, entry| now >= entry.expires_at)
            .is_some()
        {
            self.evictions.fetch_add(1, Ordering::Relaxed);
        }
        None
    }

    fn evict_lru(&self, count: usize) -> usize {
        let mut by_age: Vec<(String, Instant)> = self
            .entries
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().last_accessed))
            .collect();
        by_age.sort_by_key(|(_, last_accessed)| *last_accessed);

        let evicted = by_age
            .into_iter()
            .take(count)
            .filter(|(key, _)| self.entries.remove(key).is_some())
            .count();
        self.evictions.fetch_add(evicted as u64, Ordering::Relaxed);
        evicted
    }

    fn record_lookup(&self, hit: bool) {
        if hit {
            self.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
        metrics::record_cache_lookup(hit);
    }
}

/// Stable cache key for `operation` called with `params`.
///
/// Object keys are sorted, strings trimmed and `null` members dropped, so
/// requests that differ only in field order or omitted optionals share a key.
pub fn fingerprint(operation: &str, params: &Value) -> String {
    let normalized = normalize(params);
    let mut hasher = Sha256::new();
    hasher.update(operation.as_bytes());
    hasher.update([0x1f]);
    hasher.update(normalized.to_string().as_bytes());
    hex::encode(hasher.finalize())
}

fn normalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut members: Vec<(&String, &Value)> =
                map.iter().filter(|(_, v)| !v.is_null()).collect();
            members.sort_by(|a, b| a.0.cmp(b.0));
            Value::Object(
                members
                    .into_iter()
                    .map(|(k, v)| (k.clone(), normalize(v)))
                    .collect(),
            )
        }
        Value::Array(items) => Value::Array(items.iter().map(normalize).collect()),
        Value::String(s) => Value::String(s.trim().to_string()),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    fn cache(max_entries: usize) -> CacheManager<String> {
        CacheManager::new(
            "test",
            &CacheConfig {
                ttl: Duration::from_secs(60),
                max_entries,
                sweep_interval: Duration::from_secs(300),
            },
        )
    }

    #[tokio::test(start_paused = true)]
    async fn get_after_set_hits_until_ttl_elapses() {
        let cache = cache(10);
        assert!(cache.set("k", "v".to_string(), Some(Duration::from_secs(10)), Sensitivity::Public));

        assert_eq!(cache.get("k"), Some("v".to_string()));
        tokio::time::advance(Duration::from_secs(9)).await;
        assert_eq!(cache.get("k"), Some("v".to_string()));
        assert_eq!(cache.hit_count("k"), Some(2));

        // Hits above did not push expiry out.
        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(cache.get("k"), None);
        assert!(cache.is_empty());

        let stats = cache.stats();
        assert_eq!(stats.hits, 2);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.evictions, 1);
    }

    #[tokio::test]
    async fn session_and_phi_values_are_never_stored() {
        let cache = cache(10);
        assert!(!cache.set("a", "x".to_string(), None, Sensitivity::SessionSpecific));
        assert!(!cache.set("b", "x".to_string(), None, Sensitivity::Phi));
        assert!(cache.is_empty());

        let calls = AtomicUsize::new(0);
        for _ in 0..2 {
            let fetched = cache
                .get_or_fetch("c", None, Sensitivity::Phi, || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, ()>("fresh".to_string())
                })
                .await
                .unwrap();
            assert!(!fetched.hit);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_drops_expired_then_least_recently_used() {
        let cache = cache(2);
        cache.set("short", "1".to_string(), Some(Duration::from_secs(5)), Sensitivity::Public);
        cache.set("old", "2".to_string(), None, Sensitivity::Public);
        tokio::time::advance(Duration::from_secs(6)).await;

        assert_eq!(cache.sweep(), 1);
        assert_eq!(cache.len(), 1);

        cache.set("newer", "3".to_string(), None, Sensitivity::Public);
        tokio::time::advance(Duration::from_secs(1)).await;
        cache.get("old");
        tokio::time::advance(Duration::from_secs(1)).await;

        // Over capacity: "newer" is now the least recently used.
        cache.set("newest", "4".to_string(), None, Sensitivity::Public);
        assert_eq!(cache.len(), 2);
        assert!(cache.get("newer").is_none());
        assert!(cache.get("old").is_some());
        assert!(cache.get("newest").is_some());
    }

    #[tokio::test]
    async fn fetch_errors_are_not_cached() {
        let cache = cache(10);
        let failed = cache
            .get_or_fetch("k", None, Sensitivity::Public, || async { Err::<String, _>("boom") })
            .await;
        assert_eq!(failed, Err("boom"));
        assert!(cache.is_empty());

        let ok = cache
            .get_or_fetch("k", None, Sensitivity::Public, || async { Ok::<_, &str>("v".to_string()) })
            .await
            .unwrap();
        assert!(!ok.hit);
        assert_eq!(cache.get("k"), Some("v".to_string()));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_misses_fetch_once() {
        let cache = Arc::new(cache(10));
        let calls = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cache = cache.clone();
                let calls = calls.clone();
                tokio::spawn(async move {
                    cache
                        .get_or_fetch("same", None, Sensitivity::Public, || async {
                            calls.fetch_add(1, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(50)).await;
                            Ok::<_, ()>("value".to_string())
                        })
                        .await
                        .unwrap()
                })
            })
            .collect();

        let mut hits = 0;
        for handle in handles {
            if handle.await.unwrap().hit {
                hits += 1;
            }
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(hits, 7);
        assert_eq!(cache.stats().misses, 1);
        assert_eq!(cache.inflight_len(), 0);
    }

    fn spawn_fetch(
        cache: Arc<CacheManager<String>>,
        calls: Arc<AtomicUsize>,
        fail: bool,
    ) -> tokio::task::JoinHandle<Result<Cached<String>, &'static str>> {
        tokio::spawn(async move {
            cache
                .get_or_fetch("k", None, Sensitivity::Public, || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_secs(10)).await;
                    if fail {
                        Err("upstream down")
                    } else {
                        Ok("value".to_string())
                    }
                })
                .await
        })
    }

    #[tokio::test(start_paused = true)]
    async fn failed_fetch_hands_the_lock_to_waiters() {
        let cache = Arc::new(cache(10));
        let calls = Arc::new(AtomicUsize::new(0));

        // t=0..10 fails; the waiter then fetches over t=10..20.
        let first = spawn_fetch(cache.clone(), calls.clone(), true);
        tokio::time::sleep(Duration::from_secs(1)).await;
        let second = spawn_fetch(cache.clone(), calls.clone(), false);

        // Arrives while the waiter is fetching and must queue behind it.
        tokio::time::sleep(Duration::from_secs(14)).await;
        let third = spawn_fetch(cache.clone(), calls.clone(), false);

        assert_eq!(first.await.unwrap().unwrap_err(), "upstream down");
        assert!(!second.await.unwrap().unwrap().hit);
        let third = third.await.unwrap().unwrap();
        assert!(third.hit);
        assert_eq!(third.value, "value");

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(cache.inflight_len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_fetch_releases_its_slot() {
        let cache = cache(10);
        let pending = cache.get_or_fetch("k", None, Sensitivity::Public, || async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok::<_, ()>("late".to_string())
        });
        assert!(tokio::time::timeout(Duration::from_secs(1), pending)
            .await
            .is_err());
        assert_eq!(cache.inflight_len(), 0);

        let fresh = cache
            .get_or_fetch("k", None, Sensitivity::Public, || async {
                Ok::<_, ()>("now".to_string())
            })
            .await
            .unwrap();
        assert!(!fresh.hit);
        assert_eq!(fresh.value, "now");
    }

    #[test]
    fn fingerprint_ignores_key_order_whitespace_and_nulls() {
        let a = fingerprint("recipes.search", &json!({"query": "pasta ", "number": 10, "diet": null}));
        let b = fingerprint("recipes.search", &json!({"number": 10, "query": "pasta"}));
        let c = fingerprint("recipes.search", &json!({"number": 5, "query": "pasta"}));
        let d = fingerprint("recipes.lookup", &json!({"number": 10, "query": "pasta"}));

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, d);
        assert_eq!(a.len(), 64);
    }
}
