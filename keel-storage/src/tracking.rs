//! Change tracking for one unit-of-work session.
//!
//! The tracker holds a JSON snapshot of every entity the session has touched
//! together with its [`EntityState`]. Repositories stage writes here; the
//! unit of work turns the pending entries into a [`ChangeSet`] at commit.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Mutex, MutexGuard};

use keel_core::{Entity, EntityId, KeelError, KeelResult, StorageError};
use serde_json::Value;

// ============================================================================
// STATES AND CHANGES
// ============================================================================

/// Tracking state of an entity within a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityState {
    /// Not tracked by the session.
    Detached,
    /// Tracked and identical to the store.
    Unchanged,
    /// Staged for insertion.
    Added,
    /// Staged for update.
    Modified,
    /// Staged for removal.
    Deleted,
}

impl EntityState {
    /// Whether this state produces a write at commit.
    pub fn is_pending(self) -> bool {
        matches!(
            self,
            EntityState::Added | EntityState::Modified | EntityState::Deleted
        )
    }
}

/// Kind of write a [`Change`] asks the store to perform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

/// One staged write.
#[derive(Debug, Clone, PartialEq)]
pub struct Change {
    pub entity_type: &'static str,
    pub id: EntityId,
    pub kind: ChangeKind,
    /// Snapshot of the entity at staging time.
    pub data: Value,
    sequence: u64,
}

/// Every pending write of a session, in staging order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChangeSet {
    changes: Vec<Change>,
}

impl ChangeSet {
    pub fn changes(&self) -> &[Change] {
        &self.changes
    }

    pub fn len(&self) -> usize {
        self.changes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    /// Distinct entity types touched by this change set.
    pub fn entity_types(&self) -> BTreeSet<&'static str> {
        self.changes.iter().map(|c| c.entity_type).collect()
    }
}

impl<'a> IntoIterator for &'a ChangeSet {
    type Item = &'a Change;
    type IntoIter = std::slice::Iter<'a, Change>;

    fn into_iter(self) -> Self::IntoIter {
        self.changes.iter()
    }
}

// ============================================================================
// TRACKER
// ============================================================================

#[derive(Debug, Clone)]
struct TrackedEntry {
    state: EntityState,
    data: Value,
    sequence: u64,
}

#[derive(Debug, Default)]
struct TrackerInner {
    entries: HashMap<(&'static str, EntityId), TrackedEntry>,
    next_sequence: u64,
}

impl TrackerInner {
    fn upsert(&mut self, key: (&'static str, EntityId), state: EntityState, data: Value) {
        self.next_sequence += 1;
        let sequence = self.next_sequence;
        self.entries.insert(
            key,
            TrackedEntry {
                state,
                data,
                sequence,
            },
        );
    }
}

/// Session-scoped change tracker.
#[derive(Debug, Default)]
pub struct ChangeTracker {
    inner: Mutex<TrackerInner>,
}

impl ChangeTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> KeelResult<MutexGuard<'_, TrackerInner>> {
        self.inner
            .lock()
            .map_err(|_| KeelError::Storage(StorageError::LockPoisoned))
    }

    fn snapshot<T: Entity>(entity: &T) -> KeelResult<Value> {
        serde_json::to_value(entity).map_err(|e| KeelError::serialization(T::entity_type(), e))
    }

    /// Current state of the entity with `id`.
    pub fn state_of<T: Entity>(&self, id: EntityId) -> KeelResult<EntityState> {
        let inner = self.lock()?;
        Ok(inner
            .entries
            .get(&(T::entity_type(), id))
            .map(|e| e.state)
            .unwrap_or(EntityState::Detached))
    }

    pub fn is_attached<T: Entity>(&self, entity: &T) -> KeelResult<bool> {
        Ok(self.state_of::<T>(entity.entity_id())? != EntityState::Detached)
    }

    /// Tracked copy of an entity, with its state.
    pub fn tracked<T: Entity>(&self, id: EntityId) -> KeelResult<Option<(EntityState, T)>> {
        let inner = self.lock()?;
        match inner.entries.get(&(T::entity_type(), id)) {
            Some(entry) => {
                let entity = serde_json::from_value(entry.data.clone())
                    .map_err(|e| KeelError::serialization(T::entity_type(), e))?;
                Ok(Some((entry.state, entity)))
            }
            None => Ok(None),
        }
    }

    /// Stage an insertion. Re-adding a deleted entity turns it into an update.
    pub fn track_added<T: Entity>(&self, entity: &T) -> KeelResult<()> {
        let data = Self::snapshot(entity)?;
        let key = (T::entity_type(), entity.entity_id());
        let mut inner = self.lock()?;
        let state = match inner.entries.get(&key).map(|e| e.state) {
            Some(EntityState::Deleted) => EntityState::Modified,
            _ => EntityState::Added,
        };
        inner.upsert(key, state, data);
        Ok(())
    }

    /// Stage an update. An entity still awaiting insertion stays `Added`.
    pub fn track_modified<T: Entity>(&self, entity: &T) -> KeelResult<()> {
        let data = Self::snapshot(entity)?;
        let key = (T::entity_type(), entity.entity_id());
        let mut inner = self.lock()?;
        let state = match inner.entries.get(&key).map(|e| e.state) {
            Some(EntityState::Added) => EntityState::Added,
            _ => EntityState::Modified,
        };
        inner.upsert(key, state, data);
        Ok(())
    }

    /// Stage a removal. Removing an entity that was only added drops it.
    pub fn track_deleted<T: Entity>(&self, entity: &T) -> KeelResult<()> {
        let data = Self::snapshot(entity)?;
        let key = (T::entity_type(), entity.entity_id());
        let mut inner = self.lock()?;
        match inner.entries.get(&key).map(|e| e.state) {
            Some(EntityState::Added) => {
                inner.entries.remove(&key);
            }
            _ => inner.upsert(key, EntityState::Deleted, data),
        }
        Ok(())
    }

    /// Start tracking a loaded entity as `Unchanged` unless already tracked.
    pub fn attach_unchanged<T: Entity>(&self, entity: &T) -> KeelResult<()> {
        let key = (T::entity_type(), entity.entity_id());
        let mut inner = self.lock()?;
        if !inner.entries.contains_key(&key) {
            let data = Self::snapshot(entity)?;
            inner.upsert(key, EntityState::Unchanged, data);
        }
        Ok(())
    }

    /// Stop tracking an entity. Returns whether it was tracked.
    pub fn detach<T: Entity>(&self, entity: &T) -> KeelResult<bool> {
        let mut inner = self.lock()?;
        Ok(inner
            .entries
            .remove(&(T::entity_type(), entity.entity_id()))
            .is_some())
    }

    /// Pending writes in staging order.
    pub fn pending(&self) -> KeelResult<ChangeSet> {
        let inner = self.lock()?;
        let mut changes: Vec<Change> = inner
            .entries
            .iter()
            .filter_map(|(&(entity_type, id), entry)| {
                let kind = match entry.state {
                    EntityState::Added => ChangeKind::Insert,
                    EntityState::Modified => ChangeKind::Update,
                    EntityState::Deleted => ChangeKind::Delete,
                    EntityState::Unchanged | EntityState::Detached => return None,
                };
                Some(Change {
                    entity_type,
                    id,
                    kind,
                    data: entry.data.clone(),
                    sequence: entry.sequence,
                })
            })
            .collect();
        changes.sort_by_key(|c| c.sequence);
        Ok(ChangeSet { changes })
    }

    pub fn pending_count(&self) -> KeelResult<usize> {
        let inner = self.lock()?;
        Ok(inner.entries.values().filter(|e| e.state.is_pending()).count())
    }

    /// Mark the committed changes as persisted. Entries re-staged after the
    /// change set was taken are left pending.
    pub fn accept(&self, committed: &ChangeSet) -> KeelResult<()> {
        let mut inner = self.lock()?;
        for change in committed {
            let key = (change.entity_type, change.id);
            let current = inner
                .entries
                .get(&key)
                .is_some_and(|e| e.sequence == change.sequence);
            if !current {
                continue;
            }
            match change.kind {
                ChangeKind::Insert | ChangeKind::Update => {
                    if let Some(entry) = inner.entries.get_mut(&key) {
                        entry.state = EntityState::Unchanged;
                    }
                }
                ChangeKind::Delete => {
                    inner.entries.remove(&key);
                }
            }
        }
        Ok(())
    }

    /// Drop every tracked entry. Returns how many pending writes were discarded.
    pub fn clear(&self) -> KeelResult<usize> {
        let mut inner = self.lock()?;
        let discarded = inner.entries.values().filter(|e| e.state.is_pending()).count();
        inner.entries.clear();
        Ok(discarded)
    }
}
