//! Provider callbacks applied to stored orders.

use std::sync::Arc;

use chrono::Duration;
use ordercore::clock::{Clock, ManualClock};
use ordercore::errors::{StoreError, WebhookError};
use ordercore::model::{NotificationKind, OrderStatus};
use ordercore::store::OrderStore;
use ordercore::types::{OrderId, Timestamp, TriggeredBy};
use ordercore::webhook::CallbackPayload;
use ordercore::Engine;
use ordercore_memory::InMemoryOrderStore;
use ordercore_testing::fixtures::{insert_order, load_order, order_id, pending_order, unique};
use ordercore_testing::{ChaosConfig, ChaosOrderStoreExt};

struct Harness {
    store: InMemoryOrderStore,
    clock: ManualClock,
    engine: Engine,
}

fn harness() -> Harness {
    let store = InMemoryOrderStore::new();
    let clock = ManualClock::new(Timestamp::now());
    let engine = Engine::new(Arc::new(store.clone())).with_clock(Arc::new(clock.clone()));
    Harness {
        store,
        clock,
        engine,
    }
}

impl Harness {
    async fn order(&self) -> OrderId {
        let order = pending_order(order_id(&unique("ORD-HOOK")), self.clock.now());
        insert_order(&self.store, order).await.id
    }
}

#[tokio::test]
async fn payment_callback_records_status_and_stage() {
    let h = harness();
    let id = h.order().await;
    h.clock.advance(Duration::minutes(5));

    let order = h
        .engine
        .webhooks()
        .handle_payment_callback(&CallbackPayload::new(id.to_string(), "succeeded"), None)
        .await
        .unwrap();

    assert!(order.payment_status.is_succeeded());
    assert_eq!(order.status, OrderStatus::Pending);
    assert_eq!(order.stage_names(), vec!["ordered", "payment_succeeded"]);
    assert_eq!(order.updated_at, h.clock.now());
    assert_eq!(load_order(&h.store, &id).await, order);
}

#[tokio::test]
async fn shipping_delivery_completes_the_order() {
    let h = harness();
    let id = h.order().await;

    let order = h
        .engine
        .webhooks()
        .handle_shipping_callback(&CallbackPayload::new(id.to_string(), "delivered"), None)
        .await
        .unwrap();

    assert_eq!(order.status, OrderStatus::Completed);
    assert!(order.shipping_status.is_delivered());
    assert_eq!(
        order.stage_names(),
        vec!["ordered", "shipping_delivered", "completed"]
    );
}

#[tokio::test]
async fn intermediate_shipping_status_keeps_order_pending() {
    let h = harness();
    let id = h.order().await;

    let order = h
        .engine
        .webhooks()
        .handle_shipping_callback(&CallbackPayload::new(id.to_string(), "In_Transit"), None)
        .await
        .unwrap();

    assert_eq!(order.status, OrderStatus::Pending);
    assert_eq!(order.shipping_status.as_ref(), "in_transit");
    assert_eq!(order.stage_names(), vec!["ordered", "shipping_in_transit"]);
}

#[tokio::test]
async fn terminal_orders_keep_their_status() {
    let h = harness();
    let id = h.order().await;
    let webhooks = h.engine.webhooks();

    webhooks
        .handle_shipping_callback(&CallbackPayload::new(id.to_string(), "delivered"), None)
        .await
        .unwrap();
    let after = webhooks
        .handle_payment_callback(&CallbackPayload::new(id.to_string(), "refunded"), None)
        .await
        .unwrap();

    assert_eq!(after.status, OrderStatus::Completed);
    assert_eq!(after.payment_status.as_ref(), "refunded");
    assert_eq!(after.stage_names().last(), Some(&"payment_refunded"));
}

#[tokio::test]
async fn duplicate_deliveries_each_append_history() {
    let h = harness();
    let id = h.order().await;
    let webhooks = h.engine.webhooks();
    let payload = CallbackPayload::new(id.to_string(), "succeeded");

    webhooks.handle_payment_callback(&payload, None).await.unwrap();
    let order = webhooks.handle_payment_callback(&payload, None).await.unwrap();

    assert_eq!(
        order.stage_names(),
        vec!["ordered", "payment_succeeded", "payment_succeeded"]
    );
}

#[tokio::test]
async fn caller_identity_is_recorded_on_the_stage() {
    let h = harness();
    let id = h.order().await;
    let actor = TriggeredBy::try_new("payments-provider").unwrap();

    let order = h
        .engine
        .webhooks()
        .handle_payment_callback(&CallbackPayload::new(id.to_string(), "succeeded"), Some(&actor))
        .await
        .unwrap();

    assert_eq!(order.last_stage().unwrap().triggered_by, Some(actor));
}

#[tokio::test]
async fn incomplete_payloads_are_rejected_without_side_effects() {
    let h = harness();
    let id = h.order().await;
    let before = load_order(&h.store, &id).await;

    for payload in [
        CallbackPayload::default(),
        CallbackPayload {
            order_id: Some(id.to_string()),
            status: None,
        },
        CallbackPayload {
            order_id: None,
            status: Some("succeeded".to_string()),
        },
    ] {
        let error = h
            .engine
            .webhooks()
            .handle_payment_callback(&payload, None)
            .await
            .unwrap_err();
        assert!(error.is_client_error());
    }

    assert_eq!(load_order(&h.store, &id).await, before);
    assert!(h.store.notifications().await.unwrap().is_empty());
}

#[tokio::test]
async fn unknown_order_is_recorded_as_a_notification() {
    let h = harness();

    let error = h
        .engine
        .webhooks()
        .handle_shipping_callback(&CallbackPayload::new("ORD-NOPE", "delivered"), None)
        .await
        .unwrap_err();

    assert!(matches!(error, WebhookError::Failed(StoreError::NotFound(_))));
    assert!(!error.is_client_error());

    let notifications = h.store.notifications().await.unwrap();
    assert_eq!(notifications.len(), 1);
    assert_eq!(notifications[0].kind, NotificationKind::Shipment);
    assert_eq!(notifications[0].order_id, Some(order_id("ORD-NOPE")));
}

#[tokio::test]
async fn commit_failure_is_recorded_and_order_untouched() {
    let inner = InMemoryOrderStore::new();
    let order = insert_order(&inner, pending_order(order_id(&unique("ORD-FAIL")), Timestamp::now())).await;
    let store = inner
        .clone()
        .with_chaos(ChaosConfig::deterministic().with_version_conflict_probability(1.0));
    let engine = Engine::new(Arc::new(store));

    let error = engine
        .webhooks()
        .handle_payment_callback(&CallbackPayload::new(order.id.to_string(), "succeeded"), None)
        .await
        .unwrap_err();

    assert!(matches!(error, WebhookError::Failed(StoreError::VersionConflict { .. })));
    assert_eq!(load_order(&inner, &order.id).await, order);
    let notifications = inner.notifications().await.unwrap();
    assert_eq!(notifications.len(), 1);
    assert_eq!(notifications[0].kind, NotificationKind::Payment);
}
