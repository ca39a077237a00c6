//! Process-wide query result cache.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use keel_core::{CacheConfig, Entity, KeelError, KeelResult};
use serde::{de::DeserializeOwned, Serialize};
use tokio::time::Instant;

use super::key::CacheKey;
use super::memory_backend::InMemoryCacheBackend;
use super::registry::LiveKeyRegistry;
use super::traits::{CacheBackend, CacheStats, EntryPolicy};

/// Shared cache of query results, invalidated per entity type.
///
/// One instance is shared (behind an `Arc`) by every repository of every
/// session. Results are stored as JSON so one cache can hold any result type;
/// the result type is part of the key, so a key always decodes to the type
/// that produced it.
///
/// Keys dropped by the backend (expired or evicted for capacity) are released
/// from the registry. Expired entries are swept on a cache miss at most once
/// per expiry window, so neither the backend nor the registry grows past what
/// one window of misses can populate.
///
/// # Example
///
/// ```ignore
/// let cache = Arc::new(ResultCache::new(&CacheConfig::default()));
/// let key = cache.key_for::<Order, usize>(&store.render(&query));
/// let total = cache
///     .get_or_compute(&key, || async { store.count(&query).await })
///     .await?;
/// cache.invalidate(Order::entity_type());
/// ```
pub struct ResultCache {
    backend: Arc<dyn CacheBackend>,
    registry: LiveKeyRegistry,
    policy: EntryPolicy,
    invalidations: AtomicU64,
    last_sweep: Mutex<Instant>,
}

impl ResultCache {
    /// In-memory cache configured from `config`.
    pub fn new(config: &CacheConfig) -> Self {
        let backend = match config.max_entries {
            Some(max) => InMemoryCacheBackend::with_capacity_limit(max),
            None => InMemoryCacheBackend::new(),
        };
        Self::with_backend(Arc::new(backend), EntryPolicy::from(config))
    }

    /// Cache over a caller-supplied backend.
    pub fn with_backend(backend: Arc<dyn CacheBackend>, policy: EntryPolicy) -> Self {
        Self {
            backend,
            registry: LiveKeyRegistry::new(),
            policy,
            invalidations: AtomicU64::new(0),
            last_sweep: Mutex::new(Instant::now()),
        }
    }

    pub fn policy(&self) -> &EntryPolicy {
        &self.policy
    }

    /// Generate the key for a rendered query over `T` returning `R`, and
    /// register it for invalidation.
    pub fn key_for<T: Entity, R>(&self, query_text: &str) -> CacheKey {
        let key = CacheKey::for_query::<T, R>(query_text);
        self.registry.register(&key);
        tracing::trace!(key = %key, query = query_text, "generated cache key");
        key
    }

    /// Cached value for `key`, or the result of `compute` stored under it.
    ///
    /// No lock is held while `compute` runs. Concurrent misses on one key may
    /// both compute; the last store wins. Errors are returned uncached.
    pub async fn get_or_compute<R, F, Fut>(&self, key: &CacheKey, compute: F) -> KeelResult<R>
    where
        R: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = KeelResult<R>>,
    {
        if let Some(hit) = self.lookup(key) {
            return Ok(hit);
        }
        self.sweep_if_due();
        let generation = self.registry.generation(key.entity_type());
        let value = match compute().await {
            Ok(value) => value,
            Err(e) => {
                self.release(key);
                return Err(e);
            }
        };
        self.populate(key, generation, &value)?;
        Ok(value)
    }

    /// Synchronous counterpart of [`ResultCache::get_or_compute`].
    pub fn get_or_compute_blocking<R, F>(&self, key: &CacheKey, compute: F) -> KeelResult<R>
    where
        R: Serialize + DeserializeOwned,
        F: FnOnce() -> KeelResult<R>,
    {
        if let Some(hit) = self.lookup(key) {
            return Ok(hit);
        }
        self.sweep_if_due();
        let generation = self.registry.generation(key.entity_type());
        let value = match compute() {
            Ok(value) => value,
            Err(e) => {
                self.release(key);
                return Err(e);
            }
        };
        self.populate(key, generation, &value)?;
        Ok(value)
    }

    fn lookup<R: DeserializeOwned>(&self, key: &CacheKey) -> Option<R> {
        let cached = self.backend.get(key)?;
        match serde_json::from_value(cached) {
            Ok(value) => {
                tracing::debug!(key = %key, "cache hit");
                Some(value)
            }
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "cached value did not decode, dropping it");
                self.backend.remove(key);
                None
            }
        }
    }

    fn populate<R: Serialize>(&self, key: &CacheKey, generation: u64, value: &R) -> KeelResult<()> {
        let json = match serde_json::to_value(value) {
            Ok(json) => json,
            Err(e) => {
                self.release(key);
                return Err(KeelError::serialization(key.entity_type(), e));
            }
        };
        let backend = &self.backend;
        let policy = &self.policy;
        let mut dropped = Vec::new();
        let stored = self.registry.register_if_current(key, generation, || {
            dropped = backend.insert(key.clone(), json, policy);
        });
        // Released after the group lock is gone; dropped keys may share it.
        for key in &dropped {
            self.release(key);
        }
        if stored {
            tracing::debug!(key = %key, "cache miss, result stored");
        } else {
            tracing::debug!(
                key = %key,
                "cache miss, result not stored: entity type invalidated during compute"
            );
        }
        Ok(())
    }

    /// Evict every cached result of `entity_type`. Returns the number of keys dropped.
    pub fn invalidate(&self, entity_type: &str) -> usize {
        let backend = &self.backend;
        let removed = self.registry.invalidate(entity_type, |key| {
            backend.remove(key);
        });
        self.invalidations
            .fetch_add(removed as u64, Ordering::Relaxed);
        tracing::debug!(entity_type, removed, "invalidated cached results");
        removed
    }

    /// Drop expired entries and their registrations.
    pub fn purge_expired(&self) -> usize {
        let expired = self.backend.purge_expired();
        for key in &expired {
            self.release(key);
        }
        expired.len()
    }

    /// Forget a key the backend no longer holds. A concurrent repopulation
    /// keeps it registered.
    fn release(&self, key: &CacheKey) {
        let backend = &self.backend;
        self.registry.release(key, || backend.contains(key));
    }

    /// Purge once per expiry window. Entries can outlive their window by at
    /// most one more window before a miss sweeps them.
    fn sweep_if_due(&self) {
        let window = self
            .policy
            .sliding_expiration
            .min(self.policy.absolute_expiration)
            .max(Duration::from_millis(1));
        let now = Instant::now();
        let due = match self.last_sweep.try_lock() {
            Ok(mut last) if now.saturating_duration_since(*last) >= window => {
                *last = now;
                true
            }
            _ => false,
        };
        if due {
            let purged = self.purge_expired();
            if purged > 0 {
                tracing::debug!(purged, "swept expired cache entries");
            }
        }
    }

    /// Whether an unexpired result is stored under `key`.
    pub fn contains(&self, key: &CacheKey) -> bool {
        self.backend.contains(key)
    }

    pub fn is_registered(&self, key: &CacheKey) -> bool {
        self.registry.is_registered(key)
    }

    /// Keys currently registered for `entity_type`.
    pub fn registered_keys(&self, entity_type: &str) -> Vec<CacheKey> {
        self.registry.keys_for(entity_type)
    }

    pub fn len(&self) -> usize {
        self.backend.len()
    }

    pub fn is_empty(&self) -> bool {
        self.backend.is_empty()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            invalidations: self.invalidations.load(Ordering::Relaxed),
            ..self.backend.stats()
        }
    }
}

impl Default for ResultCache {
    fn default() -> Self {
        Self::new(&CacheConfig::default())
    }
}

impl std::fmt::Debug for ResultCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResultCache")
            .field("entries", &self.backend.len())
            .field("registered", &self.registry.len())
            .field("policy", &self.policy)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_core::{EntityId, StorageError};
    use serde::Deserialize;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use uuid::Uuid;

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Parcel {
        id: Uuid,
    }

    impl Entity for Parcel {
        fn entity_id(&self) -> EntityId {
            self.id
        }
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Courier {
        id: Uuid,
    }

    impl Entity for Courier {
        fn entity_id(&self) -> EntityId {
            self.id
        }
    }

    #[tokio::test]
    async fn test_second_call_is_served_from_cache() {
        let cache = ResultCache::default();
        let calls = AtomicUsize::new(0);
        let key = cache.key_for::<Parcel, usize>("FROM Parcel");

        for _ in 0..3 {
            let value = cache
                .get_or_compute(&key, || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(10usize)
                })
                .await
                .unwrap();
            assert_eq!(value, 10);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.stats().hits, 2);
    }

    #[tokio::test]
    async fn test_none_results_are_cached() {
        let cache = ResultCache::default();
        let calls = AtomicUsize::new(0);
        let key = cache.key_for::<Parcel, Option<Parcel>>("FROM Parcel WHERE id = 1");
        for _ in 0..2 {
            let value: Option<Parcel> = cache
                .get_or_compute(&key, || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(None)
                })
                .await
                .unwrap();
            assert!(value.is_none());
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_errors_are_not_cached() {
        let cache = ResultCache::default();
        let key = cache.key_for::<Parcel, usize>("FROM Parcel");
        let err = cache
            .get_or_compute(&key, || async {
                Err::<usize, _>(KeelError::Storage(StorageError::TransactionFailed {
                    reason: "connection reset".to_string(),
                }))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, KeelError::Storage(_)));
        assert!(!cache.contains(&key));
        assert!(!cache.is_registered(&key));

        let value = cache
            .get_or_compute(&key, || async { Ok(3usize) })
            .await
            .unwrap();
        assert_eq!(value, 3);
    }

    #[test]
    fn test_blocking_variant_shares_entries() {
        let cache = ResultCache::default();
        let key = cache.key_for::<Parcel, usize>("FROM Parcel");
        let first = cache.get_or_compute_blocking(&key, || Ok(7usize)).unwrap();
        let second = cache
            .get_or_compute_blocking(&key, || -> KeelResult<usize> {
                panic!("must be served from cache")
            })
            .unwrap();
        assert_eq!((first, second), (7, 7));
    }

    #[test]
    fn test_invalidate_is_scoped() {
        let cache = ResultCache::default();
        let parcel = cache.key_for::<Parcel, usize>("FROM Parcel");
        let courier = cache.key_for::<Courier, usize>("FROM Courier");
        cache.get_or_compute_blocking(&parcel, || Ok(1usize)).unwrap();
        cache.get_or_compute_blocking(&courier, || Ok(2usize)).unwrap();

        assert_eq!(cache.invalidate(Parcel::entity_type()), 1);
        assert!(!cache.contains(&parcel));
        assert!(!cache.is_registered(&parcel));
        assert!(cache.contains(&courier));
        assert!(cache.is_registered(&courier));
        assert_eq!(cache.stats().invalidations, 1);
    }

    #[tokio::test]
    async fn test_invalidation_during_compute_skips_store() {
        let cache = ResultCache::default();
        let key = cache.key_for::<Parcel, usize>("FROM Parcel");
        let value = cache
            .get_or_compute(&key, || async {
                cache.invalidate(Parcel::entity_type());
                Ok(5usize)
            })
            .await
            .unwrap();
        assert_eq!(value, 5);
        assert!(!cache.contains(&key));
        assert!(!cache.is_registered(&key));
    }

    #[tokio::test(start_paused = true)]
    async fn test_purge_expired_unregisters() {
        let cache = ResultCache::default();
        let key = cache.key_for::<Parcel, usize>("FROM Parcel");
        cache.get_or_compute_blocking(&key, || Ok(1usize)).unwrap();

        tokio::time::advance(Duration::from_secs(121)).await;
        assert_eq!(cache.purge_expired(), 1);
        assert!(!cache.is_registered(&key));
        assert!(cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_entry_is_recomputed() {
        let cache = ResultCache::default();
        let key = cache.key_for::<Parcel, usize>("FROM Parcel");
        cache.get_or_compute_blocking(&key, || Ok(1usize)).unwrap();

        tokio::time::advance(Duration::from_secs(301)).await;
        let value = cache.get_or_compute_blocking(&key, || Ok(2usize)).unwrap();
        assert_eq!(value, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_keys_are_swept_on_later_misses() {
        let cache = ResultCache::default();
        for window in 0..3 {
            for i in 0..100 {
                let text = format!("FROM Parcel SKIP {}-{}", window, i);
                let key = cache.key_for::<Parcel, usize>(&text);
                let value = cache.get_or_compute(&key, || async { Ok(i) }).await.unwrap();
                assert_eq!(value, i);
            }
            assert!(cache.registered_keys(Parcel::entity_type()).len() <= 200);
            assert!(cache.len() <= 200);
            tokio::time::advance(Duration::from_secs(301)).await;
        }

        let key = cache.key_for::<Parcel, usize>("FROM Parcel TAKE 1");
        cache.get_or_compute(&key, || async { Ok(1usize) }).await.unwrap();
        assert_eq!(cache.registered_keys(Parcel::entity_type()), vec![key]);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.stats().expirations, 300);
    }

    #[tokio::test(start_paused = true)]
    async fn test_capacity_eviction_releases_keys() {
        let cache = ResultCache::new(&CacheConfig::default().with_max_entries(2));
        let keys: Vec<CacheKey> = (0..3)
            .map(|i| cache.key_for::<Parcel, usize>(&format!("FROM Parcel TAKE {}", i)))
            .collect();
        for (i, key) in keys.iter().enumerate() {
            cache.get_or_compute_blocking(key, || Ok(i)).unwrap();
            tokio::time::advance(Duration::from_millis(10)).await;
        }

        assert_eq!(cache.len(), 2);
        assert!(!cache.contains(&keys[0]));
        assert!(!cache.is_registered(&keys[0]));
        assert!(cache.is_registered(&keys[1]));
        assert!(cache.is_registered(&keys[2]));
        assert_eq!(cache.stats().evictions, 1);
    }
}
