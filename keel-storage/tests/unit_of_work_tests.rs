//! Integration Tests for Unit of Work Sessions
//!
//! Staged writes become visible only through `save_changes`. A failed commit
//! leaves every change pending; a successful one marks them persisted and
//! evicts cached results for the written entity types.

use std::sync::Arc;

use keel_test_utils::{
    init_test_tracing, seeded_context, Customer, EntityState, Include, KeelConfig, KeelError,
    Order, OrderLine, Predicate, StorageError,
};

#[tokio::test]
async fn test_repository_is_memoized_per_entity_type() {
    let (ctx, _store, _seed) = seeded_context(1, KeelConfig::default());
    let uow = ctx.begin();

    let a = uow.repository::<Order>().unwrap();
    let b = uow.repository::<Order>().unwrap();
    assert!(Arc::ptr_eq(&a, &b));

    let lines = uow.repository::<OrderLine>().unwrap();
    assert_eq!(lines.total_count(None).await.unwrap(), 2);
}

#[tokio::test]
async fn test_save_without_changes_skips_store() {
    let (ctx, store, _seed) = seeded_context(1, KeelConfig::default());
    let uow = ctx.begin();

    assert!(!uow.has_changes().unwrap());
    assert_eq!(uow.save_changes().await.unwrap(), 0);
    assert_eq!(store.calls().commit, 0);
}

#[tokio::test]
async fn test_failed_commit_keeps_changes_pending() {
    init_test_tracing();
    let (ctx, store, seed) = seeded_context(3, KeelConfig::default());
    let uow = ctx.begin();
    let orders = uow.repository::<Order>().unwrap();

    let order = Order::new(seed.customer.id, "open", 12_345);
    orders.add(&order).unwrap();
    store.fail_next_commit();

    let err = uow.save_changes().await.unwrap_err();
    assert!(matches!(
        err,
        KeelError::Storage(StorageError::TransactionFailed { .. })
    ));
    assert!(uow.has_changes().unwrap());
    assert_eq!(uow.entity_state(&order).unwrap(), EntityState::Added);
    assert_eq!(store.inner().row_count::<Order>().unwrap(), 3);

    assert_eq!(uow.save_changes().await.unwrap(), 1);
    assert_eq!(uow.entity_state(&order).unwrap(), EntityState::Unchanged);
    assert_eq!(store.inner().row_count::<Order>().unwrap(), 4);
    assert_eq!(store.calls().commit, 2);
}

#[tokio::test]
async fn test_update_and_delete_are_committed_together() {
    let (ctx, store, seed) = seeded_context(2, KeelConfig::default());
    let uow = ctx.begin();
    let orders = uow.repository::<Order>().unwrap();

    let mut first = orders.find(seed.orders[0].id).await.unwrap().unwrap();
    first.status = "shipped".to_string();
    orders.update(&first).unwrap();
    assert!(orders.delete(&seed.orders[1]).unwrap());
    assert_eq!(uow.pending_count().unwrap(), 2);

    assert_eq!(uow.save_changes().await.unwrap(), 2);
    let stored: Option<Order> = store.inner().get(first.id).unwrap();
    assert_eq!(stored.map(|o| o.status), Some("shipped".to_string()));
    assert_eq!(store.inner().row_count::<Order>().unwrap(), 1);
}

#[tokio::test]
async fn test_update_of_eagerly_loaded_entity_stores_only_its_own_row() {
    let (ctx, store, seed) = seeded_context(2, KeelConfig::default());
    let uow = ctx.begin();
    let orders = uow.repository::<Order>().unwrap();

    let mut order = orders
        .get(
            Some(Predicate::eq("id", seed.orders[0].id.to_string())),
            &[Include::new("customer"), Include::new("lines")],
        )
        .await
        .unwrap()
        .unwrap();
    assert!(order.customer.is_some());
    assert_eq!(order.lines.len(), 2);

    order.status = "shipped".to_string();
    orders.update(&order).unwrap();
    assert_eq!(uow.save_changes().await.unwrap(), 1);

    let stored: Order = store.inner().get(order.id).unwrap().unwrap();
    assert_eq!(stored.status, "shipped");
    assert!(stored.customer.is_none());
    assert!(stored.lines.is_empty());
    assert_eq!(store.inner().row_count::<OrderLine>().unwrap(), 4);
}

#[tokio::test]
async fn test_delete_by_id_of_missing_entity_is_noop() {
    let (ctx, _store, _seed) = seeded_context(1, KeelConfig::default());
    let uow = ctx.begin();
    let orders = uow.repository::<Order>().unwrap();

    let deleted = orders
        .delete_by_id(keel_core::new_entity_id())
        .await
        .unwrap();
    assert!(!deleted);
    assert!(!uow.has_changes().unwrap());
}

#[tokio::test]
async fn test_find_hides_entity_staged_for_delete() {
    let (ctx, store, seed) = seeded_context(1, KeelConfig::default());
    let uow = ctx.begin();
    let orders = uow.repository::<Order>().unwrap();
    let id = seed.orders[0].id;

    assert!(orders.delete_by_id(id).await.unwrap());
    assert!(orders.find(id).await.unwrap().is_none());
    assert_eq!(store.calls().find, 1);
}

#[tokio::test]
async fn test_add_then_delete_cancels_out() {
    let (ctx, store, seed) = seeded_context(1, KeelConfig::default());
    let uow = ctx.begin();
    let orders = uow.repository::<Order>().unwrap();

    let order = Order::new(seed.customer.id, "open", 1);
    orders.add(&order).unwrap();
    orders.delete(&order).unwrap();
    assert!(!uow.has_changes().unwrap());
    assert_eq!(uow.save_changes().await.unwrap(), 0);
    assert_eq!(store.calls().commit, 0);
}

#[tokio::test]
async fn test_detach_stops_tracking() {
    let (ctx, _store, seed) = seeded_context(1, KeelConfig::default());
    let uow = ctx.begin();
    let orders = uow.repository::<Order>().unwrap();

    let order = orders.find(seed.orders[0].id).await.unwrap().unwrap();
    assert_eq!(uow.entity_state(&order).unwrap(), EntityState::Unchanged);
    orders.detach(&order).unwrap();
    assert_eq!(uow.entity_state(&order).unwrap(), EntityState::Detached);
}

#[tokio::test]
async fn test_add_range_commits_every_entity() {
    let (ctx, store, _seed) = seeded_context(0, KeelConfig::default());
    let uow = ctx.begin();
    let customers = uow.repository::<Customer>().unwrap();

    let batch = vec![Customer::new("Grace", 1), Customer::new("Edsger", 3)];
    customers.add_range(&batch).unwrap();
    assert_eq!(uow.save_changes().await.unwrap(), 2);
    assert_eq!(store.inner().row_count::<Customer>().unwrap(), 3);
}

#[tokio::test]
async fn test_duplicate_insert_fails_whole_commit() {
    let (ctx, store, seed) = seeded_context(1, KeelConfig::default());
    let uow = ctx.begin();
    let orders = uow.repository::<Order>().unwrap();

    orders
        .add(&Order::new(seed.customer.id, "open", 5))
        .unwrap();
    orders.add(&seed.orders[0]).unwrap();

    let err = uow.save_changes().await.unwrap_err();
    assert!(matches!(
        err,
        KeelError::Storage(StorageError::InsertFailed { .. })
    ));
    assert_eq!(store.inner().row_count::<Order>().unwrap(), 1);
    assert_eq!(uow.pending_count().unwrap(), 2);
}

#[tokio::test]
async fn test_dispose_discards_pending_changes() {
    let (ctx, store, seed) = seeded_context(1, KeelConfig::default());
    let uow = ctx.begin();
    let orders = uow.repository::<Order>().unwrap();
    orders
        .add(&Order::new(seed.customer.id, "open", 5))
        .unwrap();

    assert_eq!(uow.dispose(), 1);
    assert_eq!(store.calls().commit, 0);

    let next = ctx.begin();
    assert!(!next.has_changes().unwrap());
    assert_eq!(store.inner().row_count::<Order>().unwrap(), 1);
}

#[tokio::test]
async fn test_dropped_session_commits_nothing() {
    let (ctx, store, seed) = seeded_context(1, KeelConfig::default());
    {
        let uow = ctx.begin();
        let orders = uow.repository::<Order>().unwrap();
        orders
            .add(&Order::new(seed.customer.id, "open", 5))
            .unwrap();
    }
    assert_eq!(store.calls().commit, 0);
    assert_eq!(store.inner().row_count::<Order>().unwrap(), 1);
}
