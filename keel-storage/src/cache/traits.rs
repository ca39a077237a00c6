//! Cache backend trait and entry policy.
//!
//! A backend only knows exact keys. Invalidation by entity type is layered on
//! top by the [`LiveKeyRegistry`](super::LiveKeyRegistry).

use std::time::Duration;

use keel_core::{CacheConfig, CachePriority};
use serde_json::Value;

use super::key::CacheKey;

/// Expiration and eviction policy applied to one entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryPolicy {
    /// Lifetime from insertion.
    pub absolute_expiration: Duration,
    /// Idle lifetime, refreshed on every hit.
    pub sliding_expiration: Duration,
    pub priority: CachePriority,
}

impl Default for EntryPolicy {
    fn default() -> Self {
        Self::from(&CacheConfig::default())
    }
}

impl From<&CacheConfig> for EntryPolicy {
    fn from(config: &CacheConfig) -> Self {
        Self {
            absolute_expiration: config.absolute_expiration,
            sliding_expiration: config.sliding_expiration,
            priority: config.priority,
        }
    }
}

/// Key-value store holding serialised query results.
///
/// Implementations must be safe for concurrent use and must never hold a
/// lock while returning control to the caller.
pub trait CacheBackend: Send + Sync {
    /// Unexpired value for `key`. A hit refreshes sliding expiration.
    fn get(&self, key: &CacheKey) -> Option<Value>;

    /// Store `value` under `key`, replacing any previous entry.
    ///
    /// Returns the keys of other entries dropped to make room, whether
    /// expired or evicted for capacity, so callers can forget them.
    fn insert(&self, key: CacheKey, value: Value, policy: &EntryPolicy) -> Vec<CacheKey>;

    /// Remove one entry. Returns whether an entry was present.
    fn remove(&self, key: &CacheKey) -> bool;

    /// Whether an unexpired entry exists, without touching it.
    fn contains(&self, key: &CacheKey) -> bool;

    /// Drop every expired entry and return the removed keys.
    fn purge_expired(&self) -> Vec<CacheKey>;

    /// Number of stored entries, expired or not.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Usage counters.
    fn stats(&self) -> CacheStats;
}

/// Statistics about cache usage.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Number of cache hits.
    pub hits: u64,
    /// Number of cache misses.
    pub misses: u64,
    /// Number of entries currently in cache.
    pub entry_count: u64,
    /// Number of evictions due to capacity.
    pub evictions: u64,
    /// Number of entries dropped because they expired.
    pub expirations: u64,
    /// Number of keys removed by entity-type invalidation.
    pub invalidations: u64,
}

impl CacheStats {
    /// Calculate the hit rate (0.0 to 1.0).
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_stats_hit_rate() {
        let stats = CacheStats {
            hits: 80,
            misses: 20,
            ..Default::default()
        };
        assert!((stats.hit_rate() - 0.8).abs() < 0.001);
    }

    #[test]
    fn test_cache_stats_hit_rate_empty() {
        assert_eq!(CacheStats::default().hit_rate(), 0.0);
    }

    #[test]
    fn test_entry_policy_from_config() {
        let config = CacheConfig::new()
            .with_sliding_expiration(Duration::from_secs(30))
            .with_priority(CachePriority::High);
        let policy = EntryPolicy::from(&config);
        assert_eq!(policy.absolute_expiration, Duration::from_secs(300));
        assert_eq!(policy.sliding_expiration, Duration::from_secs(30));
        assert_eq!(policy.priority, CachePriority::High);
    }
}
