//! Property-Based Tests for Query Rendering and Cache Keys
//!
//! For any predicate and ordering, equal queries render to equal text and
//! therefore share a cache key; counts served from the cache agree with a
//! direct count against the store.

use keel_storage::{CacheKey, Store};
use keel_test_utils::generators::{arb_order_by, arb_predicate};
use keel_test_utils::{seeded_context, seeded_store, KeelConfig, Order, Query};
use proptest::prelude::*;

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_equal_queries_share_cache_key(predicate in arb_predicate(), order in arb_order_by()) {
        let a = Query::<Order>::new().filter(predicate.clone()).order_by(order.clone()).take(10);
        let b = Query::<Order>::new().filter(predicate).order_by(order).take(10);

        let key_a = CacheKey::for_query::<Order, Vec<Order>>(&a.canonical_text());
        let key_b = CacheKey::for_query::<Order, Vec<Order>>(&b.canonical_text());
        prop_assert_eq!(key_a, key_b);
    }

    #[test]
    fn prop_result_type_changes_cache_key(predicate in arb_predicate()) {
        let text = Query::<Order>::new().filter(predicate).canonical_text();
        let count = CacheKey::for_query::<Order, usize>(&text);
        let exists = CacheKey::for_query::<Order, bool>(&text);
        prop_assert_ne!(&count, &exists);
        prop_assert_eq!(count.entity_type(), exists.entity_type());
    }

    #[test]
    fn prop_cached_count_matches_store(predicate in arb_predicate()) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .unwrap();
        runtime.block_on(async {
            let (direct, _) = seeded_store(12);
            let (ctx, _store, _seed) = seeded_context(12, KeelConfig::default());
            let uow = ctx.begin();
            let orders = uow.repository::<Order>().unwrap();

            let query = Query::<Order>::new().filter(predicate.clone());
            let expected = direct.count(&query).await.unwrap();
            let cached = orders.total_count(Some(predicate.clone())).await.unwrap();
            let again = orders.total_count(Some(predicate)).await.unwrap();
            assert_eq!(cached, expected);
            assert_eq!(again, expected);
        });
    }
}
