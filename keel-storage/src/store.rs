//! Storage capability consumed by repositories.
//!
//! A store executes [`Query`] descriptors and applies [`ChangeSet`]s. It owns
//! the translation of a descriptor into its own query language and the
//! canonical rendering used for cache keys.

use async_trait::async_trait;
use keel_core::{Entity, EntityId, GroupBy, KeelResult, Query};
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::tracking::ChangeSet;

/// Shape of a navigation property.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NavigationKind {
    /// At most one related entity.
    Reference,
    /// Zero or more related entities.
    Collection,
}

/// Async storage trait for query execution and atomic commits.
///
/// Implementations must lower every query in the order
/// filter → include → order → page → project.
#[async_trait]
pub trait Store: Send + Sync + 'static {
    /// Stable textual form of a query. Feeds cache key generation, so two
    /// logically identical queries must render identically.
    fn render<T: Entity>(&self, query: &Query<T>) -> String {
        query.canonical_text()
    }

    /// First row of the query, deserialised into `R`.
    async fn first<T, R>(&self, query: &Query<T>) -> KeelResult<Option<R>>
    where
        T: Entity,
        R: DeserializeOwned + Send + 'static;

    /// All rows of the query, deserialised into `R`.
    async fn list<T, R>(&self, query: &Query<T>) -> KeelResult<Vec<R>>
    where
        T: Entity,
        R: DeserializeOwned + Send + 'static;

    /// Number of rows matching the query's filter.
    async fn count<T: Entity>(&self, query: &Query<T>) -> KeelResult<usize>;

    /// Synchronous variant of [`Store::count`].
    fn count_blocking<T: Entity>(&self, query: &Query<T>) -> KeelResult<usize>;

    /// Whether any row matches the query's filter.
    async fn exists<T: Entity>(&self, query: &Query<T>) -> KeelResult<bool>;

    /// Number of distinct `group_by` keys among rows matching the filter.
    async fn count_groups<T: Entity>(&self, query: &Query<T>, group_by: &GroupBy)
        -> KeelResult<usize>;

    /// Look up one entity by identity.
    async fn find<T: Entity>(&self, id: EntityId) -> KeelResult<Option<T>>;

    /// Fetch the related data behind `navigation` for `entity`. References
    /// return an object or null, collections an array.
    async fn load_navigation<T: Entity>(
        &self,
        entity: &T,
        navigation: &str,
        kind: NavigationKind,
    ) -> KeelResult<Value>;

    /// Apply every change or none of them. Returns the number of affected rows.
    async fn commit(&self, changes: &ChangeSet) -> KeelResult<usize>;
}
