//! Unit of work: one change-tracking session and its repositories.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use keel_core::{Entity, KeelError, KeelResult, StateError, StorageError};

use crate::cache::ResultCache;
use crate::repository::{Repository, RepositoryOptions};
use crate::store::Store;
use crate::tracking::{ChangeTracker, EntityState};

type RepositoryMap = HashMap<TypeId, Arc<dyn Any + Send + Sync>>;

/// Request-scoped session.
///
/// Repositories obtained from one unit of work share its change tracker, so
/// [`UnitOfWork::save_changes`] commits everything staged through any of
/// them in one store transaction. A session belongs to one logical operation
/// and should not be shared between concurrent tasks.
pub struct UnitOfWork<S: Store> {
    store: Arc<S>,
    cache: Arc<ResultCache>,
    tracker: Arc<ChangeTracker>,
    options: RepositoryOptions,
    repositories: Mutex<RepositoryMap>,
}

impl<S: Store> UnitOfWork<S> {
    pub fn new(store: Arc<S>, cache: Arc<ResultCache>, options: RepositoryOptions) -> Self {
        Self {
            store,
            cache,
            tracker: Arc::new(ChangeTracker::new()),
            options,
            repositories: Mutex::new(HashMap::new()),
        }
    }

    /// The repository for `T`, created on first use and reused for the rest
    /// of the session.
    pub fn repository<T: Entity>(&self) -> KeelResult<Arc<Repository<T, S>>> {
        let mut repositories = self
            .repositories
            .lock()
            .map_err(|_| KeelError::Storage(StorageError::LockPoisoned))?;
        let entry = repositories.entry(TypeId::of::<T>()).or_insert_with(|| {
            tracing::trace!(entity_type = T::entity_type(), "creating repository");
            let repository: Arc<dyn Any + Send + Sync> = Arc::new(Repository::<T, S>::new(
                Arc::clone(&self.store),
                Arc::clone(&self.tracker),
                Arc::clone(&self.cache),
                self.options,
            ));
            repository
        });
        Arc::clone(entry)
            .downcast::<Repository<T, S>>()
            .map_err(|_| {
                KeelError::State(StateError::RepositoryTypeMismatch {
                    entity_type: T::entity_type().to_string(),
                })
            })
    }

    /// Commit every pending change in one store transaction and return the
    /// number of affected rows.
    ///
    /// On failure nothing is marked as saved; the changes stay pending so the
    /// caller can retry or dispose. After a successful commit the cache is
    /// invalidated for each entity type that was written.
    pub async fn save_changes(&self) -> KeelResult<usize> {
        let changes = self.tracker.pending()?;
        if changes.is_empty() {
            return Ok(0);
        }

        match self.store.commit(&changes).await {
            Ok(affected) => {
                self.tracker.accept(&changes)?;
                for entity_type in changes.entity_types() {
                    self.cache.invalidate(entity_type);
                }
                tracing::info!(affected, changes = changes.len(), "unit of work committed");
                Ok(affected)
            }
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    pending = changes.len(),
                    "commit failed, changes remain pending"
                );
                Err(e)
            }
        }
    }

    pub fn has_changes(&self) -> KeelResult<bool> {
        Ok(self.tracker.pending_count()? > 0)
    }

    pub fn pending_count(&self) -> KeelResult<usize> {
        self.tracker.pending_count()
    }

    /// Tracking state of `entity` in this session.
    pub fn entity_state<T: Entity>(&self, entity: &T) -> KeelResult<EntityState> {
        self.tracker.state_of::<T>(entity.entity_id())
    }

    pub fn cache(&self) -> &Arc<ResultCache> {
        &self.cache
    }

    /// End the session, discarding pending changes. Returns how many were
    /// discarded.
    pub fn dispose(self) -> usize {
        let discarded = self.tracker.clear().unwrap_or(0);
        if let Ok(mut repositories) = self.repositories.lock() {
            repositories.clear();
        }
        tracing::debug!(discarded, "unit of work disposed");
        discarded
    }
}

impl<S: Store> Drop for UnitOfWork<S> {
    fn drop(&mut self) {
        if let Ok(discarded) = self.tracker.clear() {
            if discarded > 0 {
                tracing::warn!(discarded, "unit of work dropped with pending changes");
            }
        }
    }
}

impl<S: Store> std::fmt::Debug for UnitOfWork<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnitOfWork")
            .field("options", &self.options)
            .field("pending", &self.tracker.pending_count().ok())
            .finish()
    }
}
