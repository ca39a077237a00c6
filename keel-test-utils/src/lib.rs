//! KEEL Test Utilities
//!
//! Shared test infrastructure for the KEEL workspace:
//! - Fixture entities (`Customer`, `Order`, `OrderLine`) and seeded stores
//! - `CountingStore`, a store wrapper that counts calls and injects failures
//! - Proptest strategies for predicates, orderings and orders
//! - Tracing initialisation for tests

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration, TimeZone, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

// Re-export core types for convenience
pub use keel_core::{
    CacheConfig, Entity, EntityId, GroupBy, Include, KeelConfig, KeelError, KeelResult, OrderBy,
    Predicate, Projection, Query, StateError, StorageError, Timestamp, ValidationError,
};
pub use keel_storage::{
    ChangeSet, DataContext, EntityState, InMemoryStore, NavigationKind, Repository, ResultCache,
    Store, UnitOfWork,
};

// ============================================================================
// FIXTURE ENTITIES
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Customer {
    pub id: EntityId,
    pub name: String,
    pub tier: u8,
    #[serde(default)]
    pub orders: Vec<Order>,
}

impl Customer {
    pub fn new(name: impl Into<String>, tier: u8) -> Self {
        Self {
            id: keel_core::new_entity_id(),
            name: name.into(),
            tier,
            orders: Vec::new(),
        }
    }
}

impl Entity for Customer {
    fn entity_id(&self) -> EntityId {
        self.id
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub id: EntityId,
    pub customer_id: EntityId,
    pub status: String,
    pub total_cents: i64,
    pub created_at: Timestamp,
    #[serde(default)]
    pub customer: Option<Customer>,
    #[serde(default)]
    pub lines: Vec<OrderLine>,
}

impl Order {
    pub fn new(customer_id: EntityId, status: impl Into<String>, total_cents: i64) -> Self {
        Self {
            id: keel_core::new_entity_id(),
            customer_id,
            status: status.into(),
            total_cents,
            created_at: Utc::now(),
            customer: None,
            lines: Vec::new(),
        }
    }
}

impl Entity for Order {
    fn entity_id(&self) -> EntityId {
        self.id
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderLine {
    pub id: EntityId,
    pub order_id: EntityId,
    pub sku: String,
    pub quantity: u32,
}

impl OrderLine {
    pub fn new(order_id: EntityId, sku: impl Into<String>, quantity: u32) -> Self {
        Self {
            id: keel_core::new_entity_id(),
            order_id,
            sku: sku.into(),
            quantity,
        }
    }
}

impl Entity for OrderLine {
    fn entity_id(&self) -> EntityId {
        self.id
    }
}

/// Projection target used by projected reads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderSummary {
    pub id: EntityId,
    pub total_cents: i64,
}

// ============================================================================
// FIXTURE STORES
// ============================================================================

/// Empty store with the fixture navigations declared:
/// `Order.customer`, `Order.lines` and `Customer.orders`.
pub fn fixture_store() -> InMemoryStore {
    InMemoryStore::new()
        .with_reference::<Order, Customer>("customer", "customer_id")
        .with_collection::<Order, OrderLine>("lines", "order_id")
        .with_collection::<Customer, Order>("orders", "customer_id")
}

/// Seeded data returned by [`seeded_store`].
#[derive(Debug, Clone)]
pub struct Seed {
    pub customer: Customer,
    pub orders: Vec<Order>,
    pub lines: Vec<OrderLine>,
}

/// Store holding one customer and `order_count` orders. Orders alternate
/// between `open` and `shipped`, have totals of 1000, 2000, ... cents,
/// creation times one minute apart, and two lines each.
pub fn seeded_store(order_count: usize) -> (InMemoryStore, Seed) {
    let store = fixture_store();
    let customer = Customer::new("Ada Lovelace", 2);
    let start = Utc.with_ymd_and_hms(2024, 1, 1, 9, 0, 0).single().unwrap_or_else(Utc::now);

    let orders: Vec<Order> = (0..order_count)
        .map(|i| {
            let status = if i % 2 == 0 { "open" } else { "shipped" };
            let mut order = Order::new(customer.id, status, (i as i64 + 1) * 1000);
            order.created_at = start + Duration::minutes(i as i64);
            order
        })
        .collect();
    let lines: Vec<OrderLine> = orders
        .iter()
        .flat_map(|o| {
            [
                OrderLine::new(o.id, "SKU-A", 1),
                OrderLine::new(o.id, "SKU-B", 3),
            ]
        })
        .collect();

    store.insert(&customer).expect("seed customer");
    store.seed(&orders).expect("seed orders");
    store.seed(&lines).expect("seed order lines");

    (
        store,
        Seed {
            customer,
            orders,
            lines,
        },
    )
}

// ============================================================================
// COUNTING STORE
// ============================================================================

/// Snapshot of store calls made through a [`CountingStore`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreCalls {
    pub first: usize,
    pub list: usize,
    pub count: usize,
    pub exists: usize,
    pub count_groups: usize,
    pub find: usize,
    pub load_navigation: usize,
    pub commit: usize,
}

impl StoreCalls {
    /// Every call that reads from the store.
    pub fn reads(&self) -> usize {
        self.first
            + self.list
            + self.count
            + self.exists
            + self.count_groups
            + self.find
            + self.load_navigation
    }

    pub fn total(&self) -> usize {
        self.reads() + self.commit
    }
}

#[derive(Debug, Default)]
struct Counters {
    first: AtomicUsize,
    list: AtomicUsize,
    count: AtomicUsize,
    exists: AtomicUsize,
    count_groups: AtomicUsize,
    find: AtomicUsize,
    load_navigation: AtomicUsize,
    commit: AtomicUsize,
}

/// Store wrapper recording how often each operation reached the store.
/// Can be told to fail the next commit.
#[derive(Debug)]
pub struct CountingStore<S = InMemoryStore> {
    inner: S,
    counters: Counters,
    fail_next_commit: AtomicBool,
}

impl<S: Store> CountingStore<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            counters: Counters::default(),
            fail_next_commit: AtomicBool::new(false),
        }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    pub fn calls(&self) -> StoreCalls {
        let c = &self.counters;
        StoreCalls {
            first: c.first.load(Ordering::SeqCst),
            list: c.list.load(Ordering::SeqCst),
            count: c.count.load(Ordering::SeqCst),
            exists: c.exists.load(Ordering::SeqCst),
            count_groups: c.count_groups.load(Ordering::SeqCst),
            find: c.find.load(Ordering::SeqCst),
            load_navigation: c.load_navigation.load(Ordering::SeqCst),
            commit: c.commit.load(Ordering::SeqCst),
        }
    }

    /// Make the next `commit` fail with a transaction error.
    pub fn fail_next_commit(&self) {
        self.fail_next_commit.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl<S: Store> Store for CountingStore<S> {
    fn render<T: Entity>(&self, query: &Query<T>) -> String {
        self.inner.render(query)
    }

    async fn first<T, R>(&self, query: &Query<T>) -> KeelResult<Option<R>>
    where
        T: Entity,
        R: DeserializeOwned + Send + 'static,
    {
        self.counters.first.fetch_add(1, Ordering::SeqCst);
        self.inner.first(query).await
    }

    async fn list<T, R>(&self, query: &Query<T>) -> KeelResult<Vec<R>>
    where
        T: Entity,
        R: DeserializeOwned + Send + 'static,
    {
        self.counters.list.fetch_add(1, Ordering::SeqCst);
        self.inner.list(query).await
    }

    async fn count<T: Entity>(&self, query: &Query<T>) -> KeelResult<usize> {
        self.counters.count.fetch_add(1, Ordering::SeqCst);
        self.inner.count(query).await
    }

    fn count_blocking<T: Entity>(&self, query: &Query<T>) -> KeelResult<usize> {
        self.counters.count.fetch_add(1, Ordering::SeqCst);
        self.inner.count_blocking(query)
    }

    async fn exists<T: Entity>(&self, query: &Query<T>) -> KeelResult<bool> {
        self.counters.exists.fetch_add(1, Ordering::SeqCst);
        self.inner.exists(query).await
    }

    async fn count_groups<T: Entity>(
        &self,
        query: &Query<T>,
        group_by: &GroupBy,
    ) -> KeelResult<usize> {
        self.counters.count_groups.fetch_add(1, Ordering::SeqCst);
        self.inner.count_groups(query, group_by).await
    }

    async fn find<T: Entity>(&self, id: EntityId) -> KeelResult<Option<T>> {
        self.counters.find.fetch_add(1, Ordering::SeqCst);
        self.inner.find(id).await
    }

    async fn load_navigation<T: Entity>(
        &self,
        entity: &T,
        navigation: &str,
        kind: NavigationKind,
    ) -> KeelResult<Value> {
        self.counters.load_navigation.fetch_add(1, Ordering::SeqCst);
        self.inner.load_navigation(entity, navigation, kind).await
    }

    async fn commit(&self, changes: &ChangeSet) -> KeelResult<usize> {
        self.counters.commit.fetch_add(1, Ordering::SeqCst);
        if self.fail_next_commit.swap(false, Ordering::SeqCst) {
            return Err(KeelError::Storage(StorageError::TransactionFailed {
                reason: "injected commit failure".to_string(),
            }));
        }
        self.inner.commit(changes).await
    }
}

/// Counting store over [`seeded_store`], wrapped in a context with a fresh cache.
pub fn seeded_context(
    order_count: usize,
    config: KeelConfig,
) -> (DataContext<CountingStore>, Arc<CountingStore>, Seed) {
    let (store, seed) = seeded_store(order_count);
    let store = Arc::new(CountingStore::new(store));
    let cache = Arc::new(ResultCache::new(&config.cache));
    let context =
        DataContext::with_cache(Arc::clone(&store), cache, config).expect("valid test config");
    (context, store, seed)
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    use super::*;
    use proptest::prelude::*;

    pub fn arb_status() -> impl Strategy<Value = String> {
        prop_oneof![
            Just("open".to_string()),
            Just("shipped".to_string()),
            Just("cancelled".to_string()),
        ]
    }

    pub fn arb_order(customer_id: EntityId) -> impl Strategy<Value = Order> {
        (arb_status(), 0i64..1_000_000)
            .prop_map(move |(status, total)| Order::new(customer_id, status, total))
    }

    /// Leaf comparisons over `Order` fields.
    pub fn arb_comparison() -> impl Strategy<Value = Predicate> {
        prop_oneof![
            arb_status().prop_map(|s| Predicate::eq("status", s)),
            arb_status().prop_map(|s| Predicate::ne("status", s)),
            (0i64..1_000_000).prop_map(|t| Predicate::gt("total_cents", t)),
            (0i64..1_000_000).prop_map(|t| Predicate::lte("total_cents", t)),
            "[a-z]{1,3}".prop_map(|s| Predicate::contains("status", s)),
        ]
    }

    /// Predicate trees up to three levels deep.
    pub fn arb_predicate() -> impl Strategy<Value = Predicate> {
        arb_comparison().prop_recursive(3, 16, 4, |inner| {
            prop_oneof![
                prop::collection::vec(inner.clone(), 1..4).prop_map(Predicate::And),
                prop::collection::vec(inner.clone(), 1..4).prop_map(Predicate::Or),
                inner.prop_map(Predicate::not),
            ]
        })
    }

    pub fn arb_order_by() -> impl Strategy<Value = OrderBy> {
        (
            prop_oneof![
                Just("total_cents"),
                Just("created_at"),
                Just("status")
            ],
            any::<bool>(),
        )
            .prop_map(|(field, descending)| OrderBy::new(field, descending))
    }
}

// ============================================================================
// TRACING
// ============================================================================

/// Install a test-friendly tracing subscriber honouring `RUST_LOG`.
/// Safe to call from every test.
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
