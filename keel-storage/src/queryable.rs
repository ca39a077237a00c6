//! Uncached query surface bound to a store.

use keel_core::{Entity, GroupBy, Include, KeelResult, OrderBy, Predicate, Projection, Query};
use serde::de::DeserializeOwned;

use crate::store::Store;

/// A [`Query`] plus the store that will run it.
///
/// Terminal operations consume the queryable and go straight to the store:
/// nothing is cached and nothing is attached to a session.
pub struct Queryable<'a, T: Entity, S: Store> {
    store: &'a S,
    query: Query<T>,
}

impl<'a, T: Entity, S: Store> Queryable<'a, T, S> {
    pub fn new(store: &'a S) -> Self {
        Self {
            store,
            query: Query::new(),
        }
    }

    pub fn filter(mut self, predicate: Predicate) -> Self {
        self.query = self.query.filter(predicate);
        self
    }

    pub fn include(mut self, include: impl Into<Include>) -> Self {
        self.query = self.query.include(include);
        self
    }

    pub fn order_by(mut self, order: OrderBy) -> Self {
        self.query = self.query.order_by(order);
        self
    }

    pub fn skip(mut self, count: usize) -> Self {
        self.query = self.query.skip(count);
        self
    }

    pub fn take(mut self, count: usize) -> Self {
        self.query = self.query.take(count);
        self
    }

    pub fn select(mut self, projection: Projection) -> Self {
        self.query = self.query.select(projection);
        self
    }

    pub fn query(&self) -> &Query<T> {
        &self.query
    }

    pub fn into_query(self) -> Query<T> {
        self.query
    }

    /// The store's rendering of the composed query.
    pub fn to_query_string(&self) -> String {
        self.store.render(&self.query)
    }

    pub async fn first(self) -> KeelResult<Option<T>> {
        self.first_as().await
    }

    pub async fn first_as<R>(self) -> KeelResult<Option<R>>
    where
        R: DeserializeOwned + Send + 'static,
    {
        self.query.validate()?;
        self.store.first(&self.query).await
    }

    pub async fn list(self) -> KeelResult<Vec<T>> {
        self.list_as().await
    }

    pub async fn list_as<R>(self) -> KeelResult<Vec<R>>
    where
        R: DeserializeOwned + Send + 'static,
    {
        self.query.validate()?;
        self.store.list(&self.query).await
    }

    pub async fn count(self) -> KeelResult<usize> {
        self.query.validate()?;
        self.store.count(&self.query).await
    }

    pub async fn exists(self) -> KeelResult<bool> {
        self.query.validate()?;
        self.store.exists(&self.query).await
    }

    pub async fn count_groups(self, group_by: &GroupBy) -> KeelResult<usize> {
        self.query.validate()?;
        group_by.validate()?;
        self.store.count_groups(&self.query, group_by).await
    }
}
