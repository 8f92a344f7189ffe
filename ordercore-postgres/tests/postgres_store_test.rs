//! `PostgresOrderStore` against a real database: the shared store contract
//! plus behaviour only a multi-connection backend can exhibit.

mod common;

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use ordercore::errors::{ReservationError, StoreError};
use ordercore::model::OrderStatus;
use ordercore::store::{DocumentKey, ExpectedVersion, OrderStore, WriteBatch};
use ordercore::types::Timestamp;
use ordercore::webhook::CallbackPayload;
use ordercore::Engine;
use ordercore_testing::contract::order_store_contract_tests;
use ordercore_testing::fixtures::{
    insert_order, load_order, next_change_for, order_id, order_request, pending_order,
    seed_product, stock_of, unique,
};
use rust_decimal_macros::dec;

order_store_contract_tests! {
    suite = postgres_contract,
    make_store = crate::common::connect_blocking,
}

#[tokio::test(flavor = "multi_thread")]
async fn migrations_can_be_reapplied() {
    let store = common::connect().await;
    store.migrate().await.unwrap();
    store.migrate().await.unwrap();
    store.ping().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn concurrent_creations_of_one_order_conflict() {
    let first = common::connect().await;
    let second = common::connect().await;
    let order = pending_order(order_id(&unique("ORD-PG-RACE")), Timestamp::now());

    let (a, b) = tokio::join!(
        first.commit(WriteBatch::atomic().put_order(order.clone(), ExpectedVersion::New)),
        second.commit(WriteBatch::atomic().put_order(order.clone(), ExpectedVersion::New)),
    );

    let outcomes = [a, b];
    assert_eq!(outcomes.iter().filter(|r| r.is_ok()).count(), 1);
    assert!(outcomes
        .iter()
        .any(|r| matches!(r, Err(StoreError::VersionConflict { .. }))));
    let stored = first.order(&order.id).await.unwrap().unwrap();
    let version: u64 = stored.version.into();
    assert_eq!(version, 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn reservations_never_oversell_across_connections() {
    let store = common::connect().await;
    let engine = Engine::new(Arc::new(store.clone()));
    let sku = seed_product(&store, &unique("sku-pg-rush"), 5).await;

    let attempts = (0..15).map(|_| {
        let service = engine.reservations();
        let request = order_request(&[(&sku, 1)], dec!(1.00));
        tokio::spawn(async move { service.create_order(request).await })
    });
    let results: Vec<_> = join_all(attempts)
        .await
        .into_iter()
        .map(|joined| joined.unwrap())
        .collect();

    let succeeded = results.iter().filter(|r| r.is_ok()).count();
    assert!(succeeded <= 5);
    for result in &results {
        if let Err(error) = result {
            assert!(
                matches!(
                    error,
                    ReservationError::OutOfStock { .. } | ReservationError::Contention { .. }
                ),
                "unexpected error: {error:?}"
            );
        }
    }
    assert_eq!(
        stock_of(&store, &sku).await,
        5 - u64::try_from(succeeded).unwrap()
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn clones_share_one_change_feed() {
    let store = common::connect().await;
    let mut feed = store.subscribe();
    let order = pending_order(order_id(&unique("ORD-PG-FEED")), Timestamp::now());

    insert_order(&store.clone(), order.clone()).await;

    let change = next_change_for(
        &mut feed,
        &DocumentKey::Order(order.id.clone()),
        Duration::from_secs(5),
    )
    .await
    .unwrap();
    assert!(change.before.is_none());
    assert_eq!(change.after.as_order(), Some(&order));
}

#[tokio::test(flavor = "multi_thread")]
async fn webhooks_and_sweep_run_on_postgres() {
    let store = common::connect().await;
    let engine = Engine::new(Arc::new(store.clone()));

    // Other tests share the database, so only this order is old enough to
    // expire.
    let two_days_ago = Timestamp::new(chrono::Utc::now() - chrono::Duration::hours(48));
    let delivered = insert_order(&store, pending_order(order_id(&unique("ORD-PG-DLV")), Timestamp::now())).await;
    let abandoned = insert_order(&store, pending_order(order_id(&unique("ORD-PG-OLD")), two_days_ago)).await;

    let completed = engine
        .webhooks()
        .handle_shipping_callback(&CallbackPayload::new(delivered.id.to_string(), "delivered"), None)
        .await
        .unwrap();
    assert_eq!(completed.status, OrderStatus::Completed);

    let report = engine.sweep().run_once().await.unwrap();
    assert!(report.expired >= 1);

    assert_eq!(load_order(&store, &abandoned.id).await.status, OrderStatus::Expired);
    assert_eq!(load_order(&store, &delivered.id).await.status, OrderStatus::Completed);
}
