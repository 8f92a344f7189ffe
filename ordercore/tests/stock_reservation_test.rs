//! Stock reservation against the in-memory store: totals, validation and
//! the no-oversell guarantee under concurrency.

use std::sync::Arc;

use futures::future::join_all;
use ordercore::catalog::StaticCatalog;
use ordercore::config::{EngineConfig, MaxRetryAttempts, RetrySettings};
use ordercore::errors::ReservationError;
use ordercore::model::{OrderStatus, ShippingMethod};
use ordercore::store::OrderStore;
use ordercore::types::{Quantity, TriggeredBy};
use ordercore::Engine;
use ordercore_memory::InMemoryOrderStore;
use ordercore_testing::fixtures::{money, order_request, product_id, seed_product, stock_of};
use ordercore_testing::{ChaosConfig, ChaosOrderStoreExt};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

fn engine() -> (InMemoryOrderStore, Engine) {
    let store = InMemoryOrderStore::new();
    let engine = Engine::new(Arc::new(store.clone()));
    (store, engine)
}

#[tokio::test]
async fn creates_pending_order_and_decrements_stock() {
    let (store, engine) = engine();
    let sku = seed_product(&store, "sku-basic", 10).await;

    let order = engine
        .reservations()
        .create_order(order_request(&[(&sku, 3)], dec!(10.00)))
        .await
        .unwrap();

    assert_eq!(order.status, OrderStatus::Pending);
    assert_eq!(order.subtotal, money(dec!(30.00)));
    assert_eq!(order.total_amount, money(dec!(30.00)));
    assert_eq!(order.stage_names(), vec!["ordered"]);
    assert!(order.id.as_ref().starts_with("ORD-"));
    assert_eq!(stock_of(&store, &sku).await, 7);

    let stored = store.order(&order.id).await.unwrap().unwrap();
    assert_eq!(stored.document, order);
}

#[tokio::test]
async fn reserves_every_product_of_a_multi_line_order() {
    let (store, engine) = engine();
    let first = seed_product(&store, "sku-first", 4).await;
    let second = seed_product(&store, "sku-second", 4).await;

    engine
        .reservations()
        .create_order(order_request(&[(&first, 1), (&second, 4)], dec!(2.50)))
        .await
        .unwrap();

    assert_eq!(stock_of(&store, &first).await, 3);
    assert_eq!(stock_of(&store, &second).await, 0);
}

#[tokio::test]
async fn insufficient_stock_changes_nothing() {
    let (store, engine) = engine();
    let plenty = seed_product(&store, "sku-plenty", 10).await;
    let scarce = seed_product(&store, "sku-scarce", 1).await;

    let error = engine
        .reservations()
        .create_order(order_request(&[(&plenty, 2), (&scarce, 2)], dec!(1.00)))
        .await
        .unwrap_err();

    match error {
        ReservationError::OutOfStock {
            product_id,
            requested,
            available,
        } => {
            assert_eq!(product_id, scarce);
            assert_eq!(requested, 2);
            assert_eq!(available, 1);
        }
        other => panic!("expected OutOfStock, got {other:?}"),
    }
    assert_eq!(stock_of(&store, &plenty).await, 10);
    assert_eq!(stock_of(&store, &scarce).await, 1);
    assert_eq!(store.order_count(), 0);
}

#[tokio::test]
async fn duplicate_lines_are_reserved_together() {
    let (store, engine) = engine();
    let sku = seed_product(&store, "sku-dup", 3).await;

    let error = engine
        .reservations()
        .create_order(order_request(&[(&sku, 2), (&sku, 2)], dec!(1.00)))
        .await
        .unwrap_err();

    assert!(matches!(
        error,
        ReservationError::OutOfStock {
            requested: 4,
            available: 3,
            ..
        }
    ));
    assert_eq!(stock_of(&store, &sku).await, 3);
}

#[tokio::test]
async fn unknown_product_is_invalid_input() {
    let (store, engine) = engine();
    let missing = product_id("sku-missing");

    let error = engine
        .reservations()
        .create_order(order_request(&[(&missing, 1)], dec!(1.00)))
        .await
        .unwrap_err();

    assert!(matches!(error, ReservationError::InvalidInput(_)));
    assert!(!error.is_retryable());
    assert_eq!(store.order_count(), 0);
}

#[tokio::test]
async fn empty_order_is_invalid_input() {
    let (_store, engine) = engine();
    let error = engine
        .reservations()
        .create_order(order_request(&[], dec!(1.00)))
        .await
        .unwrap_err();
    assert!(matches!(error, ReservationError::InvalidInput(_)));
}

#[tokio::test]
async fn supplied_subtotal_is_checked_within_tolerance() {
    let (store, engine) = engine();
    let sku = seed_product(&store, "sku-subtotal", 10).await;

    let mut close = order_request(&[(&sku, 3)], dec!(10.00));
    close.subtotal = Some(money(dec!(30.005)));
    let order = engine.reservations().create_order(close).await.unwrap();
    assert_eq!(order.subtotal, money(dec!(30.00)));

    let mut wrong = order_request(&[(&sku, 3)], dec!(10.00));
    wrong.subtotal = Some(money(dec!(29.00)));
    let error = engine.reservations().create_order(wrong).await.unwrap_err();
    assert!(matches!(error, ReservationError::InvalidInput(_)));
    assert_eq!(stock_of(&store, &sku).await, 7);
}

#[tokio::test]
async fn total_includes_shipping_tax_and_discount() {
    let (store, engine) = engine();
    let sku = seed_product(&store, "sku-total", 10).await;

    let mut request = order_request(&[(&sku, 2)], dec!(15.00));
    request.shipping_cost = money(dec!(5.00));
    request.tax_amount = money(dec!(4.50));
    request.discount_amount = money(dec!(2.00));
    request.total_amount = Some(money(dec!(37.50)));
    let order = engine.reservations().create_order(request).await.unwrap();
    assert_eq!(order.total_amount, money(dec!(37.50)));

    let mut mismatched = order_request(&[(&sku, 2)], dec!(15.00));
    mismatched.shipping_cost = money(dec!(5.00));
    mismatched.total_amount = Some(money(dec!(30.00)));
    let error = engine.reservations().create_order(mismatched).await.unwrap_err();
    assert!(matches!(error, ReservationError::InvalidInput(_)));
}

#[tokio::test]
async fn overflowing_amounts_are_invalid_input() {
    let (store, engine) = engine();
    let sku = seed_product(&store, "sku-overflow", 10).await;

    let huge_line = order_request(&[(&sku, 2)], Decimal::MAX);
    let error = engine.reservations().create_order(huge_line).await.unwrap_err();
    assert!(matches!(error, ReservationError::InvalidInput(_)));

    let mut huge_shipping = order_request(&[(&sku, 1)], Decimal::MAX);
    huge_shipping.shipping_cost = money(Decimal::MAX);
    let error = engine.reservations().create_order(huge_shipping).await.unwrap_err();
    assert!(matches!(error, ReservationError::InvalidInput(_)));

    assert_eq!(stock_of(&store, &sku).await, 10);
    assert_eq!(store.order_count(), 0);
}

#[tokio::test]
async fn pickup_orders_ship_for_free() {
    let (store, engine) = engine();
    let sku = seed_product(&store, "sku-pickup", 10).await;

    let mut request = order_request(&[(&sku, 1)], dec!(20.00));
    request.shipping_method = ShippingMethod::Pickup;
    request.shipping_cost = money(dec!(15.00));
    let order = engine.reservations().create_order(request).await.unwrap();

    assert_eq!(order.shipping_cost, money(dec!(0)));
    assert_eq!(order.total_amount, money(dec!(20.00)));
}

#[tokio::test]
async fn oversized_discount_clamps_total_at_zero() {
    let (store, engine) = engine();
    let sku = seed_product(&store, "sku-discount", 10).await;

    let mut request = order_request(&[(&sku, 1)], dec!(5.00));
    request.discount_amount = money(dec!(50.00));
    let order = engine.reservations().create_order(request).await.unwrap();

    assert_eq!(order.total_amount, money(dec!(0)));
}

#[tokio::test]
async fn catalog_prices_are_enforced() {
    let store = InMemoryOrderStore::new();
    let sku = seed_product(&store, "sku-catalog", 10).await;
    let unlisted = seed_product(&store, "sku-unlisted", 10).await;
    let catalog = StaticCatalog::new().with_price(sku.clone(), money(dec!(12.00)));
    let engine = Engine::new(Arc::new(store.clone())).with_catalog(Arc::new(catalog));

    let error = engine
        .reservations()
        .create_order(order_request(&[(&sku, 1)], dec!(9.99)))
        .await
        .unwrap_err();
    assert!(matches!(error, ReservationError::InvalidInput(_)));

    let error = engine
        .reservations()
        .create_order(order_request(&[(&unlisted, 1)], dec!(12.00)))
        .await
        .unwrap_err();
    assert!(matches!(error, ReservationError::InvalidInput(_)));

    engine
        .reservations()
        .create_order(order_request(&[(&sku, 1)], dec!(12.00)))
        .await
        .unwrap();
    assert_eq!(stock_of(&store, &sku).await, 9);
}

#[tokio::test]
async fn caller_identity_is_recorded() {
    let (store, engine) = engine();
    let sku = seed_product(&store, "sku-actor", 10).await;
    let actor = TriggeredBy::try_new("admin@example.com").unwrap();

    let mut request = order_request(&[(&sku, 1)], dec!(1.00));
    request.triggered_by = Some(actor.clone());
    let order = engine.reservations().create_order(request).await.unwrap();

    assert_eq!(order.created_by, Some(actor.clone()));
    assert_eq!(order.stage_history[0].triggered_by, Some(actor));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn last_unit_is_sold_exactly_once() {
    let (store, engine) = engine();
    let sku = seed_product(&store, "sku-last", 1).await;
    let service = engine.reservations();

    let (first, second) = tokio::join!(
        service.create_order(order_request(&[(&sku, 1)], dec!(99.00))),
        service.create_order(order_request(&[(&sku, 1)], dec!(99.00))),
    );

    let results = [first, second];
    let succeeded = results.iter().filter(|r| r.is_ok()).count();
    assert_eq!(succeeded, 1);
    assert!(results
        .iter()
        .any(|r| matches!(r, Err(ReservationError::OutOfStock { available: 0, .. }))));
    assert_eq!(stock_of(&store, &sku).await, 0);
    assert_eq!(store.order_count(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_buyers_never_oversell() {
    let (store, engine) = engine();
    let sku = seed_product(&store, "sku-rush", 5).await;

    let attempts = (0..20).map(|_| {
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
    assert!(succeeded >= 1);
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
    let remaining = stock_of(&store, &sku).await;
    assert_eq!(remaining, 5 - u64::try_from(succeeded).unwrap());
    assert_eq!(store.order_count(), succeeded);
}

#[tokio::test]
async fn persistent_conflicts_surface_as_contention() {
    let inner = InMemoryOrderStore::new();
    let sku = seed_product(&inner, "sku-contended", 10).await;
    let store = inner
        .clone()
        .with_chaos(ChaosConfig::deterministic().with_version_conflict_probability(1.0));

    let mut config = EngineConfig::default();
    config.reservation_retry = RetrySettings::reservation()
        .unwrap()
        .with_max_attempts(MaxRetryAttempts::try_new(3).unwrap());
    let engine = Engine::new(Arc::new(store)).with_config(config);

    let error = engine
        .reservations()
        .create_order(order_request(&[(&sku, 1)], dec!(1.00)))
        .await
        .unwrap_err();

    assert!(matches!(error, ReservationError::Contention { attempts: 3 }));
    assert!(error.is_retryable());
    assert_eq!(stock_of(&inner, &sku).await, 10);
    assert_eq!(inner.order_count(), 0);
}

#[tokio::test]
async fn store_outage_is_internal_and_not_retried() {
    let inner = InMemoryOrderStore::new();
    let sku = seed_product(&inner, "sku-outage", 10).await;
    let store = inner
        .clone()
        .with_chaos(ChaosConfig::deterministic().with_commit_failure_probability(1.0));
    let engine = Engine::new(Arc::new(store));

    let error = engine
        .reservations()
        .create_order(order_request(&[(&sku, 1)], dec!(1.00)))
        .await
        .unwrap_err();

    assert!(matches!(error, ReservationError::Internal(_)));
    assert_eq!(stock_of(&inner, &sku).await, 10);
}

#[test]
fn quantities_must_be_positive() {
    assert!(Quantity::try_new(0).is_err());
}
