//! In-process cache backend on a sharded concurrent map.

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use keel_core::CachePriority;
use serde_json::Value;
use tokio::time::Instant;

use super::key::CacheKey;
use super::traits::{CacheBackend, CacheStats, EntryPolicy};

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    inserted_at: Instant,
    last_access: Instant,
    policy: EntryPolicy,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.inserted_at) >= self.policy.absolute_expiration
            || now.saturating_duration_since(self.last_access) >= self.policy.sliding_expiration
    }
}

/// [`CacheBackend`] backed by a [`DashMap`].
///
/// Expiry is checked lazily on access and by [`CacheBackend::purge_expired`].
/// With a capacity set, inserting past it first purges expired entries and
/// then evicts the lowest-priority, least recently used entries.
#[derive(Debug, Default)]
pub struct InMemoryCacheBackend {
    entries: DashMap<CacheKey, Entry>,
    max_entries: Option<usize>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
}

impl InMemoryCacheBackend {
    /// Unbounded backend.
    pub fn new() -> Self {
        Self::default()
    }

    /// Backend holding at most `max_entries` entries.
    pub fn with_capacity_limit(max_entries: usize) -> Self {
        Self {
            max_entries: Some(max_entries),
            ..Self::default()
        }
    }

    fn enforce_capacity(&self, max: usize) -> Vec<CacheKey> {
        if self.entries.len() <= max {
            return Vec::new();
        }
        let mut dropped = self.purge_expired();

        while self.entries.len() > max {
            let victim = self
                .entries
                .iter()
                .filter(|e| e.policy.priority != CachePriority::NeverRemove)
                .min_by_key(|e| (e.policy.priority, e.last_access))
                .map(|e| e.key().clone());
            let Some(victim) = victim else {
                break;
            };
            if self.entries.remove(&victim).is_some() {
                self.evictions.fetch_add(1, Ordering::Relaxed);
                tracing::trace!(key = %victim, "evicted cache entry for capacity");
                dropped.push(victim);
            }
        }
        dropped
    }
}

impl CacheBackend for InMemoryCacheBackend {
    fn get(&self, key: &CacheKey) -> Option<Value> {
        let now = Instant::now();
        let expired = match self.entries.get_mut(key) {
            Some(mut entry) => {
                if entry.is_expired(now) {
                    true
                } else {
                    entry.last_access = now;
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    return Some(entry.value.clone());
                }
            }
            None => false,
        };
        if expired && self.entries.remove_if(key, |_, e| e.is_expired(now)).is_some() {
            self.expirations.fetch_add(1, Ordering::Relaxed);
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    fn insert(&self, key: CacheKey, value: Value, policy: &EntryPolicy) -> Vec<CacheKey> {
        let now = Instant::now();
        self.entries.insert(
            key,
            Entry {
                value,
                inserted_at: now,
                last_access: now,
                policy: *policy,
            },
        );
        match self.max_entries {
            Some(max) => self.enforce_capacity(max),
            None => Vec::new(),
        }
    }

    fn remove(&self, key: &CacheKey) -> bool {
        self.entries.remove(key).is_some()
    }

    fn contains(&self, key: &CacheKey) -> bool {
        let now = Instant::now();
        self.entries.get(key).is_some_and(|e| !e.is_expired(now))
    }

    fn purge_expired(&self) -> Vec<CacheKey> {
        let now = Instant::now();
        let expired: Vec<CacheKey> = self
            .entries
            .iter()
            .filter(|e| e.is_expired(now))
            .map(|e| e.key().clone())
            .collect();
        let mut removed = Vec::with_capacity(expired.len());
        for key in expired {
            if self.entries.remove_if(&key, |_, e| e.is_expired(now)).is_some() {
                removed.push(key);
            }
        }
        self.expirations
            .fetch_add(removed.len() as u64, Ordering::Relaxed);
        removed
    }

    fn len(&self) -> usize {
        self.entries.len()
    }

    fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entry_count: self.entries.len() as u64,
            evictions: self.evictions.load(Ordering::Relaxed),
            expirations: self.expirations.load(Ordering::Relaxed),
            invalidations: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    fn key(n: u32) -> CacheKey {
        CacheKey::generate(&format!("q{}", n), "shop::Order", "usize")
    }

    fn policy(priority: CachePriority) -> EntryPolicy {
        EntryPolicy {
            priority,
            ..EntryPolicy::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_sliding_expiration() {
        let backend = InMemoryCacheBackend::new();
        backend.insert(key(1), json!(10), &EntryPolicy::default());

        tokio::time::advance(Duration::from_secs(90)).await;
        assert_eq!(backend.get(&key(1)), Some(json!(10)));

        // Access refreshed the idle timer.
        tokio::time::advance(Duration::from_secs(90)).await;
        assert_eq!(backend.get(&key(1)), Some(json!(10)));

        tokio::time::advance(Duration::from_secs(121)).await;
        assert_eq!(backend.get(&key(1)), None);
        assert!(backend.is_empty());
        assert_eq!(backend.stats().expirations, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_absolute_expiration_wins_over_access() {
        let backend = InMemoryCacheBackend::new();
        backend.insert(key(1), json!(true), &EntryPolicy::default());

        for _ in 0..4 {
            tokio::time::advance(Duration::from_secs(60)).await;
            assert!(backend.get(&key(1)).is_some());
        }
        tokio::time::advance(Duration::from_secs(60)).await;
        assert!(backend.get(&key(1)).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_purge_expired() {
        let backend = InMemoryCacheBackend::new();
        backend.insert(key(1), json!(1), &EntryPolicy::default());
        tokio::time::advance(Duration::from_secs(100)).await;
        backend.insert(key(2), json!(2), &EntryPolicy::default());
        tokio::time::advance(Duration::from_secs(30)).await;

        let removed = backend.purge_expired();
        assert_eq!(removed, vec![key(1)]);
        assert!(backend.contains(&key(2)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_capacity_evicts_lowest_priority_first() {
        let backend = InMemoryCacheBackend::with_capacity_limit(2);
        backend.insert(key(1), json!(1), &policy(CachePriority::High));
        tokio::time::advance(Duration::from_millis(10)).await;
        backend.insert(key(2), json!(2), &policy(CachePriority::Low));
        tokio::time::advance(Duration::from_millis(10)).await;
        let dropped = backend.insert(key(3), json!(3), &policy(CachePriority::Normal));

        assert_eq!(dropped, vec![key(2)]);
        assert!(backend.contains(&key(1)));
        assert!(!backend.contains(&key(2)));
        assert!(backend.contains(&key(3)));
        assert_eq!(backend.stats().evictions, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_insert_at_capacity_reports_expired_entries() {
        let backend = InMemoryCacheBackend::with_capacity_limit(1);
        assert!(backend.insert(key(1), json!(1), &EntryPolicy::default()).is_empty());
        tokio::time::advance(Duration::from_secs(121)).await;

        let dropped = backend.insert(key(2), json!(2), &EntryPolicy::default());
        assert_eq!(dropped, vec![key(1)]);
        assert_eq!(backend.stats().expirations, 1);
        assert_eq!(backend.stats().evictions, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_never_remove_survives_capacity() {
        let backend = InMemoryCacheBackend::with_capacity_limit(1);
        backend.insert(key(1), json!(1), &policy(CachePriority::NeverRemove));
        backend.insert(key(2), json!(2), &policy(CachePriority::NeverRemove));
        assert_eq!(backend.len(), 2);
    }

    #[test]
    fn test_hit_and_miss_counters() {
        let backend = InMemoryCacheBackend::new();
        assert!(backend.get(&key(1)).is_none());
        backend.insert(key(1), json!(null), &EntryPolicy::default());
        assert_eq!(backend.get(&key(1)), Some(json!(null)));
        let stats = backend.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.entry_count, 1);
    }
}
