//! Live-key registry.
//!
//! Tracks which cache keys are populated, grouped by entity type, so that a
//! write to one type can evict exactly that type's results. Each group also
//! carries an invalidation generation: a result computed while its group was
//! invalidated is stale and must not be registered.

use std::collections::HashSet;

use dashmap::DashMap;

use super::key::CacheKey;

#[derive(Debug, Default)]
struct Group {
    generation: u64,
    keys: HashSet<CacheKey>,
}

/// Per-entity-type sets of live cache keys.
///
/// All mutation of one group happens under that group's shard lock, so an
/// invalidation and a concurrent registration of the same type never
/// interleave.
#[derive(Debug, Default)]
pub struct LiveKeyRegistry {
    groups: DashMap<String, Group>,
}

impl LiveKeyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a key under its entity type.
    pub fn register(&self, key: &CacheKey) {
        self.groups
            .entry(key.entity_type().to_string())
            .or_default()
            .keys
            .insert(key.clone());
    }

    /// Current invalidation generation of an entity type.
    pub fn generation(&self, entity_type: &str) -> u64 {
        self.groups.get(entity_type).map_or(0, |g| g.generation)
    }

    /// Register `key` and run `populate` only if its entity type has not been
    /// invalidated since `generation` was read. Returns whether it ran.
    pub fn register_if_current(
        &self,
        key: &CacheKey,
        generation: u64,
        populate: impl FnOnce(),
    ) -> bool {
        let mut group = self.groups.entry(key.entity_type().to_string()).or_default();
        if group.generation != generation {
            return false;
        }
        group.keys.insert(key.clone());
        populate();
        true
    }

    /// Drain every key of `entity_type`, calling `evict` on each while the
    /// group is locked, and advance the generation. Returns the number of
    /// keys drained.
    pub fn invalidate(&self, entity_type: &str, mut evict: impl FnMut(&CacheKey)) -> usize {
        let mut group = self.groups.entry(entity_type.to_string()).or_default();
        group.generation += 1;
        let keys = std::mem::take(&mut group.keys);
        for key in &keys {
            evict(key);
        }
        keys.len()
    }

    /// Forget one key. Returns whether it was registered.
    pub fn unregister(&self, key: &CacheKey) -> bool {
        self.groups
            .get_mut(key.entity_type())
            .is_some_and(|mut g| g.keys.remove(key))
    }

    /// Forget `key` unless `still_cached` reports it populated. The check
    /// runs under the group lock, so it cannot race a concurrent
    /// [`LiveKeyRegistry::register_if_current`] of the same key.
    pub fn release(&self, key: &CacheKey, still_cached: impl FnOnce() -> bool) -> bool {
        match self.groups.get_mut(key.entity_type()) {
            Some(mut group) if group.keys.contains(key) && !still_cached() => {
                group.keys.remove(key)
            }
            _ => false,
        }
    }

    pub fn is_registered(&self, key: &CacheKey) -> bool {
        self.groups
            .get(key.entity_type())
            .is_some_and(|g| g.keys.contains(key))
    }

    /// Snapshot of the keys registered for an entity type.
    pub fn keys_for(&self, entity_type: &str) -> Vec<CacheKey> {
        self.groups
            .get(entity_type)
            .map(|g| g.keys.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Total registered keys across all entity types.
    pub fn len(&self) -> usize {
        self.groups.iter().map(|g| g.keys.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
