//! In-memory store
//!
//! Rows are kept as `serde_json::Value` objects, one table per entity type.
//! Navigations are declared up front with [`InMemoryStore::with_reference`]
//! and [`InMemoryStore::with_collection`], which tell the store which field
//! links two tables.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use keel_core::{
    compare_values, lookup_path, Entity, EntityId, GroupBy, Include, KeelError, KeelResult, Query,
    StorageError, ValidationError,
};
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

use crate::store::{NavigationKind, Store};
use crate::tracking::{ChangeKind, ChangeSet};

type Table = BTreeMap<EntityId, Value>;
type Tables = HashMap<&'static str, Table>;

#[derive(Debug, Clone)]
struct NavigationDef {
    kind: NavigationKind,
    target: &'static str,
    /// Reference: field on the owner holding the target id.
    /// Collection: field on each target row holding the owner id.
    foreign_key: String,
}

/// Eager-load paths merged into a tree so shared prefixes load once.
#[derive(Debug, Default)]
struct IncludeTree(BTreeMap<String, IncludeTree>);

impl IncludeTree {
    fn build(includes: &[Include]) -> Self {
        let mut root = IncludeTree::default();
        for include in includes {
            let mut node = &mut root;
            for segment in include.segments() {
                node = node.0.entry(segment.to_string()).or_default();
            }
        }
        root
    }

    fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Thread-safe in-memory implementation of [`Store`].
#[derive(Debug, Default)]
pub struct InMemoryStore {
    tables: RwLock<Tables>,
    navigations: HashMap<(&'static str, String), NavigationDef>,
}

impl InMemoryStore {
    /// Create an empty store with no navigations.
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a reference navigation `P.navigation -> C`, resolved through
    /// the id stored in `P.foreign_key`.
    pub fn with_reference<P: Entity, C: Entity>(
        mut self,
        navigation: &str,
        foreign_key: &str,
    ) -> Self {
        self.navigations.insert(
            (P::entity_type(), navigation.to_string()),
            NavigationDef {
                kind: NavigationKind::Reference,
                target: C::entity_type(),
                foreign_key: foreign_key.to_string(),
            },
        );
        self
    }

    /// Declare a collection navigation `P.navigation -> [C]`, resolved through
    /// `C.foreign_key` pointing back at the owner.
    pub fn with_collection<P: Entity, C: Entity>(
        mut self,
        navigation: &str,
        foreign_key: &str,
    ) -> Self {
        self.navigations.insert(
            (P::entity_type(), navigation.to_string()),
            NavigationDef {
                kind: NavigationKind::Collection,
                target: C::entity_type(),
                foreign_key: foreign_key.to_string(),
            },
        );
        self
    }

    fn read(&self) -> KeelResult<RwLockReadGuard<'_, Tables>> {
        self.tables
            .read()
            .map_err(|_| KeelError::Storage(StorageError::LockPoisoned))
    }

    fn write(&self) -> KeelResult<RwLockWriteGuard<'_, Tables>> {
        self.tables
            .write()
            .map_err(|_| KeelError::Storage(StorageError::LockPoisoned))
    }

    /// Row as persisted. Navigation fields are resolved on read and never
    /// stored on the owning row.
    fn storable(&self, entity_type: &str, mut row: Value) -> Value {
        if let Value::Object(fields) = &mut row {
            for (owner, navigation) in self.navigations.keys() {
                if *owner == entity_type {
                    fields.remove(navigation);
                }
            }
        }
        row
    }

    /// Insert a row directly, bypassing change tracking. Used for seeding.
    pub fn insert<T: Entity>(&self, entity: &T) -> KeelResult<()> {
        let row = self.storable(T::entity_type(), encode(entity)?);
        let mut tables = self.write()?;
        let table = tables.entry(T::entity_type()).or_default();
        if table.contains_key(&entity.entity_id()) {
            return Err(KeelError::Storage(StorageError::InsertFailed {
                entity_type: T::entity_type().to_string(),
                reason: "already exists".to_string(),
            }));
        }
        table.insert(entity.entity_id(), row);
        Ok(())
    }

    /// Insert many rows directly.
    pub fn seed<'a, T, I>(&self, entities: I) -> KeelResult<()>
    where
        T: Entity,
        I: IntoIterator<Item = &'a T>,
    {
        entities.into_iter().try_for_each(|e| self.insert(e))
    }

    /// Number of persisted rows of `T`.
    pub fn row_count<T: Entity>(&self) -> KeelResult<usize> {
        Ok(self.read()?.get(T::entity_type()).map_or(0, BTreeMap::len))
    }

    /// Persisted copy of one row.
    pub fn get<T: Entity>(&self, id: EntityId) -> KeelResult<Option<T>> {
        let row = self
            .read()?
            .get(T::entity_type())
            .and_then(|t| t.get(&id))
            .cloned();
        row.map(decode::<T, T>).transpose()
    }

    /// Remove every row of every table.
    pub fn clear(&self) -> KeelResult<()> {
        self.write()?.clear();
        Ok(())
    }

    fn navigation(&self, entity_type: &'static str, navigation: &str) -> KeelResult<&NavigationDef> {
        self.navigations
            .get(&(entity_type, navigation.to_string()))
            .ok_or_else(|| {
                KeelError::Storage(StorageError::UnknownNavigation {
                    entity_type: entity_type.to_string(),
                    navigation: navigation.to_string(),
                })
            })
    }

    // ------------------------------------------------------------------------
    // Query execution
    // ------------------------------------------------------------------------

    fn filtered<T: Entity>(tables: &Tables, query: &Query<T>) -> Vec<(EntityId, Value)> {
        tables
            .get(T::entity_type())
            .map(|table| {
                table
                    .iter()
                    .filter(|(_, row)| query.predicate().map_or(true, |p| p.matches(row)))
                    .map(|(id, row)| (*id, row.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    fn execute<T: Entity>(&self, query: &Query<T>) -> KeelResult<Vec<Value>> {
        let tables = self.read()?;
        let mut rows = Self::filtered(&tables, query);

        let tree = IncludeTree::build(query.includes());
        if !tree.is_empty() {
            for (id, row) in rows.iter_mut() {
                self.expand(&tables, T::entity_type(), *id, row, &tree)?;
            }
        }

        if let Some(order) = query.order() {
            rows.sort_by(|(_, a), (_, b)| {
                let ordering = total_order(
                    lookup_path(a, &order.field),
                    lookup_path(b, &order.field),
                );
                if order.descending {
                    ordering.reverse()
                } else {
                    ordering
                }
            });
        }

        let rows = rows
            .into_iter()
            .skip(query.skip_count().unwrap_or(0))
            .take(query.take_count().unwrap_or(usize::MAX))
            .map(|(_, row)| row);

        Ok(match query.projection() {
            Some(projection) => rows
                .map(|row| {
                    let mut projected = Map::new();
                    for field in projection.fields() {
                        let value = lookup_path(&row, field).cloned().unwrap_or(Value::Null);
                        projected.insert(field.clone(), value);
                    }
                    Value::Object(projected)
                })
                .collect(),
            None => rows.collect(),
        })
    }

    fn expand(
        &self,
        tables: &Tables,
        entity_type: &'static str,
        id: EntityId,
        row: &mut Value,
        tree: &IncludeTree,
    ) -> KeelResult<()> {
        for (navigation, children) in &tree.0 {
            let def = self.navigation(entity_type, navigation)?;
            let mut related = resolve(tables, def, id, row);
            for (related_id, related_row) in related.iter_mut() {
                self.expand(tables, def.target, *related_id, related_row, children)?;
            }
            set_field(row, navigation, shape(def.kind, related));
        }
        Ok(())
    }

    fn count_matching<T: Entity>(&self, query: &Query<T>) -> KeelResult<usize> {
        let tables = self.read()?;
        Ok(tables.get(T::entity_type()).map_or(0, |table| {
            table
                .values()
                .filter(|row| query.predicate().map_or(true, |p| p.matches(row)))
                .count()
        }))
    }

    fn any_matching<T: Entity>(&self, query: &Query<T>) -> KeelResult<bool> {
        let tables = self.read()?;
        Ok(tables.get(T::entity_type()).is_some_and(|table| {
            table
                .values()
                .any(|row| query.predicate().map_or(true, |p| p.matches(row)))
        }))
    }

    fn distinct_groups<T: Entity>(&self, query: &Query<T>, group_by: &GroupBy) -> KeelResult<usize> {
        let tables = self.read()?;
        let groups: BTreeSet<String> = Self::filtered(&tables, query)
            .iter()
            .map(|(_, row)| {
                let key: Vec<&Value> = group_by
                    .fields()
                    .iter()
                    .map(|f| lookup_path(row, f).unwrap_or(&Value::Null))
                    .collect();
                serde_json::to_string(&key).unwrap_or_default()
            })
            .collect();
        Ok(groups.len())
    }

    fn navigation_value<T: Entity>(
        &self,
        entity: &T,
        navigation: &str,
        kind: NavigationKind,
    ) -> KeelResult<Value> {
        let def = self.navigation(T::entity_type(), navigation)?;
        if def.kind != kind {
            return Err(KeelError::Validation(ValidationError::InvalidValue {
                field: navigation.to_string(),
                reason: format!("navigation is a {:?}, not a {:?}", def.kind, kind),
            }));
        }
        let row = encode(entity)?;
        let tables = self.read()?;
        let related = resolve(&tables, def, entity.entity_id(), &row);
        Ok(shape(def.kind, related))
    }

    fn apply(&self, changes: &ChangeSet) -> KeelResult<usize> {
        let mut tables = self.write()?;

        // Validate everything before touching a table so a failure leaves no partial writes.
        for change in changes {
            let exists = tables
                .get(change.entity_type)
                .is_some_and(|t| t.contains_key(&change.id));
            let failure = match change.kind {
                ChangeKind::Insert if exists => Some(StorageError::InsertFailed {
                    entity_type: change.entity_type.to_string(),
                    reason: format!("{} already exists", change.id),
                }),
                ChangeKind::Update if !exists => Some(StorageError::UpdateFailed {
                    entity_type: change.entity_type.to_string(),
                    id: change.id,
                    reason: "row does not exist".to_string(),
                }),
                ChangeKind::Delete if !exists => Some(StorageError::NotFound {
                    entity_type: change.entity_type.to_string(),
                    id: change.id,
                }),
                _ => None,
            };
            if let Some(err) = failure {
                return Err(KeelError::Storage(err));
            }
        }

        for change in changes {
            let table = tables.entry(change.entity_type).or_default();
            match change.kind {
                ChangeKind::Insert | ChangeKind::Update => {
                    table.insert(change.id, self.storable(change.entity_type, change.data.clone()));
                }
                ChangeKind::Delete => {
                    table.remove(&change.id);
                }
            }
        }

        tracing::debug!(applied = changes.len(), "in-memory commit applied");
        Ok(changes.len())
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn first<T, R>(&self, query: &Query<T>) -> KeelResult<Option<R>>
    where
        T: Entity,
        R: DeserializeOwned + Send + 'static,
    {
        self.execute(query)?
            .into_iter()
            .next()
            .map(decode::<T, R>)
            .transpose()
    }

    async fn list<T, R>(&self, query: &Query<T>) -> KeelResult<Vec<R>>
    where
        T: Entity,
        R: DeserializeOwned + Send + 'static,
    {
        self.execute(query)?
            .into_iter()
            .map(decode::<T, R>)
            .collect()
    }

    async fn count<T: Entity>(&self, query: &Query<T>) -> KeelResult<usize> {
        self.count_matching(query)
    }

    fn count_blocking<T: Entity>(&self, query: &Query<T>) -> KeelResult<usize> {
        self.count_matching(query)
    }

    async fn exists<T: Entity>(&self, query: &Query<T>) -> KeelResult<bool> {
        self.any_matching(query)
    }

    async fn count_groups<T: Entity>(
        &self,
        query: &Query<T>,
        group_by: &GroupBy,
    ) -> KeelResult<usize> {
        self.distinct_groups(query, group_by)
    }

    async fn find<T: Entity>(&self, id: EntityId) -> KeelResult<Option<T>> {
        self.get::<T>(id)
    }

    async fn load_navigation<T: Entity>(
        &self,
        entity: &T,
        navigation: &str,
        kind: NavigationKind,
    ) -> KeelResult<Value> {
        self.navigation_value(entity, navigation, kind)
    }

    async fn commit(&self, changes: &ChangeSet) -> KeelResult<usize> {
        self.apply(changes)
    }
}

// ============================================================================
// ROW HELPERS
// ============================================================================

fn encode<T: Entity>(entity: &T) -> KeelResult<Value> {
    serde_json::to_value(entity).map_err(|e| KeelError::serialization(T::entity_type(), e))
}

fn decode<T: Entity, R: DeserializeOwned>(row: Value) -> KeelResult<R> {
    serde_json::from_value(row).map_err(|e| KeelError::serialization(T::entity_type(), e))
}

/// Rows related to the owner `(id, row)` through `def`.
fn resolve(tables: &Tables, def: &NavigationDef, id: EntityId, row: &Value) -> Vec<(EntityId, Value)> {
    let Some(target) = tables.get(def.target) else {
        return Vec::new();
    };
    match def.kind {
        NavigationKind::Reference => lookup_path(row, &def.foreign_key)
            .and_then(Value::as_str)
            .and_then(|s| s.parse::<EntityId>().ok())
            .and_then(|fk| target.get(&fk).map(|related| (fk, related.clone())))
            .into_iter()
            .collect(),
        NavigationKind::Collection => {
            let owner = id.to_string();
            target
                .iter()
                .filter(|(_, child)| {
                    lookup_path(child, &def.foreign_key).and_then(Value::as_str)
                        == Some(owner.as_str())
                })
                .map(|(child_id, child)| (*child_id, child.clone()))
                .collect()
        }
    }
}

fn shape(kind: NavigationKind, related: Vec<(EntityId, Value)>) -> Value {
    match kind {
        NavigationKind::Reference => related
            .into_iter()
            .next()
            .map_or(Value::Null, |(_, row)| row),
        NavigationKind::Collection => {
            Value::Array(related.into_iter().map(|(_, row)| row).collect())
        }
    }
}

fn set_field(row: &mut Value, field: &str, value: Value) {
    if let Value::Object(map) = row {
        map.insert(field.to_string(), value);
    }
}

/// Total order for sorting: null < bool < number < string < array < object,
/// then by value within a kind.
fn total_order(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    fn rank(v: Option<&Value>) -> u8 {
        match v {
            None | Some(Value::Null) => 0,
            Some(Value::Bool(_)) => 1,
            Some(Value::Number(_)) => 2,
            Some(Value::String(_)) => 3,
            Some(Value::Array(_)) => 4,
            Some(Value::Object(_)) => 5,
        }
    }
    match rank(a).cmp(&rank(b)) {
        Ordering::Equal => match (a, b) {
            (Some(a), Some(b)) => compare_values(a, b).unwrap_or(Ordering::Equal),
            _ => Ordering::Equal,
        },
        other => other,
    }
}
