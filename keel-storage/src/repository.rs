//! Generic repository with transparent result caching.
//!
//! Reads build a [`Query`], render it through the store, and go through the
//! shared [`ResultCache`]. Writes stage changes in the session's
//! [`ChangeTracker`] and immediately invalidate every cached result of the
//! entity type, so other repositories sharing the cache never serve a result
//! that predates a write they could know about.

use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use keel_core::{
    Entity, EntityId, GroupBy, Include, KeelConfig, KeelError, KeelResult, OrderBy, PagedResult,
    Predicate, Projection, Query, StateError, StorageError, ValidationError,
};
use serde::{de::DeserializeOwned, Serialize};

use crate::cache::ResultCache;
use crate::queryable::Queryable;
use crate::store::{NavigationKind, Store};
use crate::tracking::{ChangeTracker, EntityState};

/// Per-repository settings fixed at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RepositoryOptions {
    /// When false, reads skip the cache and no keys are generated.
    pub caching_enabled: bool,
    /// Page size for [`Repository::get_page`] when none is given.
    pub default_page_size: usize,
}

impl Default for RepositoryOptions {
    fn default() -> Self {
        Self::from(&KeelConfig::default())
    }
}

impl From<&KeelConfig> for RepositoryOptions {
    fn from(config: &KeelConfig) -> Self {
        Self {
            caching_enabled: config.cache.enabled,
            default_page_size: config.default_page_size,
        }
    }
}

/// Repository over entity type `T` backed by store `S`.
pub struct Repository<T: Entity, S: Store> {
    store: Arc<S>,
    tracker: Arc<ChangeTracker>,
    cache: Arc<ResultCache>,
    options: RepositoryOptions,
    _entity: PhantomData<fn() -> T>,
}

impl<T: Entity, S: Store> Repository<T, S> {
    pub fn new(
        store: Arc<S>,
        tracker: Arc<ChangeTracker>,
        cache: Arc<ResultCache>,
        options: RepositoryOptions,
    ) -> Self {
        Self {
            store,
            tracker,
            cache,
            options,
            _entity: PhantomData,
        }
    }

    pub fn caching_enabled(&self) -> bool {
        self.options.caching_enabled
    }

    /// Raw composable query surface. Executes directly against the store,
    /// without caching or change tracking.
    pub fn queryable(&self) -> Queryable<'_, T, S> {
        Queryable::new(self.store.as_ref())
    }

    // ========================================================================
    // WRITES
    // ========================================================================

    /// Stage `entity` for insertion.
    pub fn add(&self, entity: &T) -> KeelResult<()> {
        self.add_range(std::slice::from_ref(entity))
    }

    pub fn add_range<'a, I>(&self, entities: I) -> KeelResult<()>
    where
        I: IntoIterator<Item = &'a T>,
    {
        self.remove_cache_keys();
        entities
            .into_iter()
            .try_for_each(|entity| self.tracker.track_added(entity))
    }

    /// Stage `entity` for update.
    pub fn update(&self, entity: &T) -> KeelResult<()> {
        self.update_range(std::slice::from_ref(entity))
    }

    pub fn update_range<'a, I>(&self, entities: I) -> KeelResult<()>
    where
        I: IntoIterator<Item = &'a T>,
    {
        self.remove_cache_keys();
        entities
            .into_iter()
            .try_for_each(|entity| self.tracker.track_modified(entity))
    }

    /// Stage `entity` for removal. Returns true once staged.
    pub fn delete(&self, entity: &T) -> KeelResult<bool> {
        self.remove_cache_keys();
        self.tracker.track_deleted(entity)?;
        Ok(true)
    }

    pub fn delete_range<'a, I>(&self, entities: I) -> KeelResult<()>
    where
        I: IntoIterator<Item = &'a T>,
    {
        self.remove_cache_keys();
        entities
            .into_iter()
            .try_for_each(|entity| self.tracker.track_deleted(entity))
    }

    /// Stage removal of the entity with `id`. Returns false, without touching
    /// the change set, when no such entity exists.
    pub async fn delete_by_id(&self, id: EntityId) -> KeelResult<bool> {
        match self.find(id).await? {
            Some(entity) => self.delete(&entity),
            None => {
                tracing::debug!(entity_type = T::entity_type(), %id, "delete_by_id found nothing");
                Ok(false)
            }
        }
    }

    /// Stop tracking `entity` without deleting it.
    pub fn detach(&self, entity: &T) -> KeelResult<()> {
        self.tracker.detach(entity)?;
        Ok(())
    }

    pub fn detach_range<'a, I>(&self, entities: I) -> KeelResult<()>
    where
        I: IntoIterator<Item = &'a T>,
    {
        entities.into_iter().try_for_each(|entity| self.detach(entity))
    }

    /// Evict every cached result for `T`. Call after writing to the store
    /// outside this layer. Returns the number of keys evicted.
    pub fn remove_cache_keys(&self) -> usize {
        self.cache.invalidate(T::entity_type())
    }

    // ========================================================================
    // UNCACHED READS
    // ========================================================================

    /// Identity lookup against the session first, then the store. Never
    /// cached. Entities staged for removal are reported as absent.
    pub async fn find(&self, id: EntityId) -> KeelResult<Option<T>> {
        if let Some((state, entity)) = self.tracker.tracked::<T>(id)? {
            return Ok((state != EntityState::Deleted).then_some(entity));
        }
        let found: Option<T> = self.store.find(id).await?;
        self.attach_loaded(found.iter())?;
        Ok(found)
    }

    /// Number of distinct `group_by` keys among entities matching
    /// `predicate`. Not cached.
    pub async fn total_count_grouped(
        &self,
        predicate: Predicate,
        group_by: GroupBy,
    ) -> KeelResult<usize> {
        let query = Query::<T>::new().filter(predicate);
        query.validate()?;
        group_by.validate()?;
        self.store.count_groups(&query, &group_by).await
    }

    // ========================================================================
    // CACHED READS
    // ========================================================================

    /// Whether any entity matches `predicate`.
    pub async fn exists(&self, predicate: Predicate) -> KeelResult<bool> {
        let query = Query::<T>::new().filter(predicate);
        query.validate()?;
        let text = self.store.render(&query);
        let store = &self.store;
        self.cached(text, move || async move { store.exists(&query).await })
            .await
    }

    /// Number of entities matching `predicate`, or all of them.
    pub async fn total_count(&self, predicate: Option<Predicate>) -> KeelResult<usize> {
        let query = filter_query::<T>(predicate);
        query.validate()?;
        let text = self.store.render(&query);
        let store = &self.store;
        self.cached(text, move || async move { store.count(&query).await })
            .await
    }

    /// Synchronous [`Repository::total_count`]. Shares cache entries with it.
    pub fn total_count_blocking(&self, predicate: Option<Predicate>) -> KeelResult<usize> {
        let query = filter_query::<T>(predicate);
        query.validate()?;
        if !self.options.caching_enabled {
            return self.store.count_blocking(&query);
        }
        let key = self.cache.key_for::<T, usize>(&self.store.render(&query));
        self.cache
            .get_or_compute_blocking(&key, || self.store.count_blocking(&query))
    }

    /// First entity matching `predicate`, with `includes` eager-loaded.
    pub async fn get(
        &self,
        predicate: Option<Predicate>,
        includes: &[Include],
    ) -> KeelResult<Option<T>> {
        let query = Query::from_parts(predicate, includes, None, None);
        let found = self.first_cached::<T>(query).await?;
        self.attach_loaded(found.iter())?;
        Ok(found)
    }

    /// First entity matching `predicate` under `order_by`.
    pub async fn get_ordered(
        &self,
        predicate: Option<Predicate>,
        includes: &[Include],
        order_by: OrderBy,
    ) -> KeelResult<Option<T>> {
        let query = Query::from_parts(predicate, includes, Some(order_by), None);
        let found = self.first_cached::<T>(query).await?;
        self.attach_loaded(found.iter())?;
        Ok(found)
    }

    /// First match projected onto `projection` and decoded as `R`.
    pub async fn get_as<R>(
        &self,
        predicate: Option<Predicate>,
        includes: &[Include],
        projection: Projection,
    ) -> KeelResult<Option<R>>
    where
        R: Serialize + DeserializeOwned + Send + 'static,
    {
        let query = Query::from_parts(predicate, includes, None, Some(projection));
        self.first_cached::<R>(query).await
    }

    /// First match under `order_by`, projected and decoded as `R`.
    pub async fn get_ordered_as<R>(
        &self,
        predicate: Option<Predicate>,
        includes: &[Include],
        projection: Projection,
        order_by: OrderBy,
    ) -> KeelResult<Option<R>>
    where
        R: Serialize + DeserializeOwned + Send + 'static,
    {
        let query = Query::from_parts(predicate, includes, Some(order_by), Some(projection));
        self.first_cached::<R>(query).await
    }

    /// One page of entities matching `predicate`. `page_number` starts at 1.
    pub async fn get_page(
        &self,
        predicate: Option<Predicate>,
        order_by: Option<OrderBy>,
        page_number: usize,
        page_size: Option<usize>,
    ) -> KeelResult<PagedResult<T>> {
        let page_size = page_size.unwrap_or(self.options.default_page_size);
        if page_number == 0 {
            return Err(ValidationError::InvalidValue {
                field: "page_number".to_string(),
                reason: "pages are numbered from 1".to_string(),
            }
            .into());
        }
        if page_size == 0 {
            return Err(ValidationError::InvalidValue {
                field: "page_size".to_string(),
                reason: "page_size must be greater than 0".to_string(),
            }
            .into());
        }

        let mut query = filter_query::<T>(predicate.clone())
            .skip(PagedResult::<T>::offset(page_number, page_size))
            .take(page_size);
        if let Some(order_by) = order_by {
            query = query.order_by(order_by);
        }
        query.validate()?;

        let total = self.total_count(predicate).await?;
        let text = self.store.render(&query);
        let store = &self.store;
        let items: Vec<T> = self
            .cached(text, move || async move {
                let rows: Vec<T> = store.list(&query).await?;
                Ok(rows)
            })
            .await?;
        self.attach_loaded(items.iter())?;
        Ok(PagedResult::new(items, page_number, page_size, total))
    }

    // ========================================================================
    // NAVIGATION LOADING
    // ========================================================================

    /// Populate the single related entity behind `navigation`.
    pub async fn load_reference(&self, entity: &mut T, navigation: &str) -> KeelResult<()> {
        self.load_navigation(entity, navigation, NavigationKind::Reference)
            .await
    }

    /// Populate the related collection behind `navigation`.
    pub async fn load_collection(&self, entity: &mut T, navigation: &str) -> KeelResult<()> {
        self.load_navigation(entity, navigation, NavigationKind::Collection)
            .await
    }

    async fn load_navigation(
        &self,
        entity: &mut T,
        navigation: &str,
        kind: NavigationKind,
    ) -> KeelResult<()> {
        if navigation.trim().is_empty() {
            return Err(ValidationError::RequiredFieldMissing {
                field: "navigation".to_string(),
            }
            .into());
        }
        if !self.tracker.is_attached(entity)? {
            return Err(StateError::EntityDetached {
                entity_type: T::entity_type().to_string(),
                id: entity.entity_id(),
            }
            .into());
        }

        let related = self.store.load_navigation(&*entity, navigation, kind).await?;

        let mut row = serde_json::to_value(&*entity)
            .map_err(|e| KeelError::serialization(T::entity_type(), e))?;
        let Some(fields) = row.as_object_mut() else {
            return Err(StorageError::Serialization {
                entity_type: T::entity_type().to_string(),
                reason: "entity does not serialise to an object".to_string(),
            }
            .into());
        };
        fields.insert(navigation.to_string(), related);
        *entity = serde_json::from_value(row)
            .map_err(|e| KeelError::serialization(T::entity_type(), e))?;
        Ok(())
    }

    // ========================================================================
    // HELPERS
    // ========================================================================

    async fn first_cached<R>(&self, query: Query<T>) -> KeelResult<Option<R>>
    where
        R: Serialize + DeserializeOwned + Send + 'static,
    {
        query.validate()?;
        let text = self.store.render(&query);
        let store = &self.store;
        self.cached(text, move || async move {
            let row: Option<R> = store.first(&query).await?;
            Ok(row)
        })
        .await
    }

    async fn cached<R, F, Fut>(&self, query_text: String, compute: F) -> KeelResult<R>
    where
        R: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = KeelResult<R>>,
    {
        if !self.options.caching_enabled {
            return compute().await;
        }
        let key = self.cache.key_for::<T, R>(&query_text);
        self.cache.get_or_compute(&key, compute).await
    }

    fn attach_loaded<'a>(&self, entities: impl Iterator<Item = &'a T>) -> KeelResult<()> {
        entities
            .into_iter()
            .try_for_each(|entity| self.tracker.attach_unchanged(entity))
    }
}

impl<T: Entity, S: Store> std::fmt::Debug for Repository<T, S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Repository")
            .field("entity_type", &T::entity_type())
            .field("options", &self.options)
            .finish()
    }
}

fn filter_query<T: Entity>(predicate: Option<Predicate>) -> Query<T> {
    match predicate {
        Some(predicate) => Query::new().filter(predicate),
        None => Query::new(),
    }
}
