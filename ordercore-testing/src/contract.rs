//! Behavioural contract for `OrderStore` adapters.
//!
//! Each `test_*` function exercises one guarantee of the port against a
//! store supplied by the caller and reports a [`ContractTestFailure`]
//! instead of panicking, so adapters can run the suite inside their own
//! fixtures. Every scenario uses fresh identifiers, which lets a single
//! database serve the whole suite.

use std::fmt;
use std::time::Duration;

use ordercore::errors::StoreError;
use ordercore::model::{Notification, NotificationKind, OrderStatus, Product, ShippingRecord};
use ordercore::store::{DocumentKey, ExpectedVersion, OrderStore, WriteBatch};
use ordercore::types::{DocVersion, ProductId, Timestamp};

use crate::fixtures::{next_change_for, order_id, pending_order, product_id, status, unique};

/// A failed contract scenario.
#[derive(Debug)]
pub struct ContractTestFailure {
    scenario: &'static str,
    detail: String,
}

impl ContractTestFailure {
    fn new(scenario: &'static str, detail: impl Into<String>) -> Self {
        Self {
            scenario,
            detail: detail.into(),
        }
    }

    fn store_error(scenario: &'static str, operation: &'static str, error: &StoreError) -> Self {
        Self::new(
            scenario,
            format!("{operation} operation returned unexpected error: {error}"),
        )
    }

    fn assertion(scenario: &'static str, detail: impl Into<String>) -> Self {
        Self::new(scenario, detail)
    }
}

impl fmt::Display for ContractTestFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.scenario, self.detail)
    }
}

impl std::error::Error for ContractTestFailure {}

/// Outcome of a contract scenario.
pub type ContractTestResult = Result<(), ContractTestFailure>;

fn contract_product(scenario: &'static str, label: &str) -> ProductId {
    product_id(&unique(&format!("{scenario}-{label}")))
}

async fn put_product<S: OrderStore + ?Sized>(
    scenario: &'static str,
    store: &S,
    product: Product,
    expected: ExpectedVersion,
) -> Result<DocVersion, ContractTestFailure> {
    let key = DocumentKey::Product(product.id.clone());
    let receipt = store
        .commit(WriteBatch::atomic().put_product(product, expected))
        .await
        .map_err(|error| ContractTestFailure::store_error(scenario, "commit", &error))?;
    receipt
        .version_of(&key)
        .ok_or_else(|| ContractTestFailure::assertion(scenario, "receipt did not list the write"))
}

async fn stock<S: OrderStore + ?Sized>(
    scenario: &'static str,
    store: &S,
    id: &ProductId,
) -> Result<Option<(DocVersion, u64)>, ContractTestFailure> {
    store
        .product(id)
        .await
        .map(|found| found.map(|v| (v.version, v.document.available_stock)))
        .map_err(|error| ContractTestFailure::store_error(scenario, "product", &error))
}

/// New documents start at version 1 and every write increments it.
pub async fn test_versions_start_at_one_and_increment<S>(store: &S) -> ContractTestResult
where
    S: OrderStore + ?Sized,
{
    const SCENARIO: &str = "versions_start_at_one_and_increment";
    let id = contract_product(SCENARIO, "sku");

    let first = put_product(SCENARIO, store, Product::new(id.clone(), 5), ExpectedVersion::New).await?;
    if first != DocVersion::initial() {
        return Err(ContractTestFailure::assertion(
            SCENARIO,
            format!("expected first version 1, observed {first}"),
        ));
    }

    let second = put_product(
        SCENARIO,
        store,
        Product::new(id.clone(), 4),
        ExpectedVersion::Exact(first),
    )
    .await?;
    if second != first.next() {
        return Err(ContractTestFailure::assertion(
            SCENARIO,
            format!("expected version {} after update, observed {second}", first.next()),
        ));
    }

    match stock(SCENARIO, store, &id).await? {
        Some((version, 4)) if version == second => Ok(()),
        other => Err(ContractTestFailure::assertion(
            SCENARIO,
            format!("expected stock 4 at version {second}, observed {other:?}"),
        )),
    }
}

/// Missing documents read as `None`, not as errors.
pub async fn test_missing_documents_read_as_none<S>(store: &S) -> ContractTestResult
where
    S: OrderStore + ?Sized,
{
    const SCENARIO: &str = "missing_documents_read_as_none";
    let missing_order = order_id(&unique("ORD-MISSING"));

    if stock(SCENARIO, store, &contract_product(SCENARIO, "none")).await?.is_some() {
        return Err(ContractTestFailure::assertion(SCENARIO, "unknown product was found"));
    }
    let order = store
        .order(&missing_order)
        .await
        .map_err(|error| ContractTestFailure::store_error(SCENARIO, "order", &error))?;
    let shipping = store
        .shipping(&missing_order)
        .await
        .map_err(|error| ContractTestFailure::store_error(SCENARIO, "shipping", &error))?;
    if order.is_some() || shipping.is_some() {
        return Err(ContractTestFailure::assertion(SCENARIO, "unknown order was found"));
    }
    Ok(())
}

/// A write expecting a stale version conflicts and leaves the document alone.
pub async fn test_stale_version_conflicts<S>(store: &S) -> ContractTestResult
where
    S: OrderStore + ?Sized,
{
    const SCENARIO: &str = "stale_version_conflicts";
    let id = contract_product(SCENARIO, "sku");

    let read_version =
        put_product(SCENARIO, store, Product::new(id.clone(), 1), ExpectedVersion::New).await?;
    put_product(
        SCENARIO,
        store,
        Product::new(id.clone(), 0),
        ExpectedVersion::Exact(read_version),
    )
    .await?;

    let stale = store
        .commit(
            WriteBatch::atomic().put_product(Product::new(id.clone(), 0), ExpectedVersion::Exact(read_version)),
        )
        .await;
    match stale {
        Err(StoreError::VersionConflict { .. }) => {}
        Err(error) => return Err(ContractTestFailure::store_error(SCENARIO, "commit", &error)),
        Ok(_) => {
            return Err(ContractTestFailure::assertion(
                SCENARIO,
                "expected version conflict but commit succeeded",
            ))
        }
    }

    match stock(SCENARIO, store, &id).await? {
        Some((version, 0)) if version == read_version.next() => Ok(()),
        other => Err(ContractTestFailure::assertion(
            SCENARIO,
            format!("stale write changed the product: {other:?}"),
        )),
    }
}

/// `ExpectedVersion::New` conflicts when the document already exists.
pub async fn test_new_conflicts_on_existing_document<S>(store: &S) -> ContractTestResult
where
    S: OrderStore + ?Sized,
{
    const SCENARIO: &str = "new_conflicts_on_existing_document";
    let order = pending_order(order_id(&unique("ORD-NEW")), Timestamp::now());

    store
        .commit(WriteBatch::atomic().put_order(order.clone(), ExpectedVersion::New))
        .await
        .map_err(|error| ContractTestFailure::store_error(SCENARIO, "commit", &error))?;

    match store
        .commit(WriteBatch::atomic().put_order(order, ExpectedVersion::New))
        .await
    {
        Err(StoreError::VersionConflict { .. }) => Ok(()),
        Err(error) => Err(ContractTestFailure::store_error(SCENARIO, "commit", &error)),
        Ok(_) => Err(ContractTestFailure::assertion(
            SCENARIO,
            "expected version conflict creating an existing order",
        )),
    }
}

/// A conflict anywhere in an atomic batch leaves every document untouched.
pub async fn test_atomic_batch_is_all_or_nothing<S>(store: &S) -> ContractTestResult
where
    S: OrderStore + ?Sized,
{
    const SCENARIO: &str = "atomic_batch_is_all_or_nothing";
    let fresh = contract_product(SCENARIO, "fresh");
    let moved = contract_product(SCENARIO, "moved");

    let fresh_version =
        put_product(SCENARIO, store, Product::new(fresh.clone(), 10), ExpectedVersion::New).await?;
    let moved_version =
        put_product(SCENARIO, store, Product::new(moved.clone(), 10), ExpectedVersion::New).await?;
    put_product(
        SCENARIO,
        store,
        Product::new(moved.clone(), 9),
        ExpectedVersion::Exact(moved_version),
    )
    .await?;

    let order = pending_order(order_id(&unique("ORD-ATOMIC")), Timestamp::now());
    let batch = WriteBatch::atomic()
        .put_product(Product::new(fresh.clone(), 7), ExpectedVersion::Exact(fresh_version))
        .put_product(Product::new(moved.clone(), 7), ExpectedVersion::Exact(moved_version))
        .put_order(order.clone(), ExpectedVersion::New);

    if store.commit(batch).await.is_ok() {
        return Err(ContractTestFailure::assertion(
            SCENARIO,
            "batch with a stale write was committed",
        ));
    }

    let fresh_after = stock(SCENARIO, store, &fresh).await?;
    let order_after = store
        .order(&order.id)
        .await
        .map_err(|error| ContractTestFailure::store_error(SCENARIO, "order", &error))?;
    if fresh_after != Some((fresh_version, 10)) || order_after.is_some() {
        return Err(ContractTestFailure::assertion(
            SCENARIO,
            format!(
                "failed batch left partial effects: product {fresh_after:?}, order present {}",
                order_after.is_some()
            ),
        ));
    }
    Ok(())
}

/// A best-effort batch applies what it can and reports the rest.
pub async fn test_best_effort_batch_reports_skipped<S>(store: &S) -> ContractTestResult
where
    S: OrderStore + ?Sized,
{
    const SCENARIO: &str = "best_effort_batch_reports_skipped";
    let now = Timestamp::now();
    let kept = pending_order(order_id(&unique("ORD-KEPT")), now);
    let raced = pending_order(order_id(&unique("ORD-RACED")), now);

    for order in [&kept, &raced] {
        store
            .commit(WriteBatch::atomic().put_order(order.clone(), ExpectedVersion::New))
            .await
            .map_err(|error| ContractTestFailure::store_error(SCENARIO, "commit", &error))?;
    }
    let mut touched = raced.clone();
    touched.payment_status = status("succeeded");
    store
        .commit(WriteBatch::atomic().put_order(touched, ExpectedVersion::Exact(DocVersion::initial())))
        .await
        .map_err(|error| ContractTestFailure::store_error(SCENARIO, "commit", &error))?;

    let mut kept_expired = kept.clone();
    kept_expired.status = OrderStatus::Expired;
    let mut raced_expired = raced.clone();
    raced_expired.status = OrderStatus::Expired;
    let receipt = store
        .commit(
            WriteBatch::best_effort()
                .put_order(kept_expired, ExpectedVersion::Exact(DocVersion::initial()))
                .put_order(raced_expired, ExpectedVersion::Exact(DocVersion::initial())),
        )
        .await
        .map_err(|error| ContractTestFailure::store_error(SCENARIO, "commit", &error))?;

    let raced_key = DocumentKey::Order(raced.id.clone());
    let kept_key = DocumentKey::Order(kept.id.clone());
    if receipt.version_of(&kept_key).is_none()
        || receipt.skipped.len() != 1
        || receipt.skipped[0].key != raced_key
    {
        return Err(ContractTestFailure::assertion(
            SCENARIO,
            format!(
                "expected kept order applied and raced order skipped, observed applied={:?} skipped={:?}",
                receipt.applied,
                receipt.skipped.iter().map(|s| &s.key).collect::<Vec<_>>()
            ),
        ));
    }

    let raced_now = store
        .order(&raced.id)
        .await
        .map_err(|error| ContractTestFailure::store_error(SCENARIO, "order", &error))?;
    match raced_now {
        Some(current) if current.document.status == OrderStatus::Pending => Ok(()),
        other => Err(ContractTestFailure::assertion(
            SCENARIO,
            format!("skipped write was applied: {other:?}"),
        )),
    }
}

/// `orders_with_status` returns exactly the orders in that status.
pub async fn test_orders_with_status_filters<S>(store: &S) -> ContractTestResult
where
    S: OrderStore + ?Sized,
{
    const SCENARIO: &str = "orders_with_status_filters";
    let now = Timestamp::now();
    let pending = pending_order(order_id(&unique("ORD-PENDING")), now);
    let mut cancelled = pending_order(order_id(&unique("ORD-CANCELLED")), now);
    cancelled.status = OrderStatus::Cancelled;

    store
        .commit(
            WriteBatch::atomic()
                .put_order(pending.clone(), ExpectedVersion::New)
                .put_order(cancelled.clone(), ExpectedVersion::New),
        )
        .await
        .map_err(|error| ContractTestFailure::store_error(SCENARIO, "commit", &error))?;

    let found = store
        .orders_with_status(OrderStatus::Pending)
        .await
        .map_err(|error| ContractTestFailure::store_error(SCENARIO, "orders_with_status", &error))?;
    let has_pending = found.iter().any(|o| o.document.id == pending.id);
    let has_cancelled = found.iter().any(|o| o.document.id == cancelled.id);
    let all_pending = found.iter().all(|o| o.document.status == OrderStatus::Pending);
    if has_pending && !has_cancelled && all_pending {
        Ok(())
    } else {
        Err(ContractTestFailure::assertion(
            SCENARIO,
            format!("pending scan wrong: pending={has_pending} cancelled={has_cancelled} all_pending={all_pending}"),
        ))
    }
}

/// Shipping projections are upserted without version checks.
pub async fn test_shipping_upsert_last_writer_wins<S>(store: &S) -> ContractTestResult
where
    S: OrderStore + ?Sized,
{
    const SCENARIO: &str = "shipping_upsert_last_writer_wins";
    let id = order_id(&unique("ORD-SHIP"));

    for raw in ["in_transit", "delivered"] {
        store
            .commit(WriteBatch::atomic().upsert_shipping(ShippingRecord {
                order_id: id.clone(),
                status: status(raw),
                updated_at: Timestamp::now(),
            }))
            .await
            .map_err(|error| ContractTestFailure::store_error(SCENARIO, "commit", &error))?;
    }

    let record = store
        .shipping(&id)
        .await
        .map_err(|error| ContractTestFailure::store_error(SCENARIO, "shipping", &error))?;
    match record {
        Some(current)
            if current.document.status.is_delivered()
                && current.version == DocVersion::initial().next() =>
        {
            Ok(())
        }
        other => Err(ContractTestFailure::assertion(
            SCENARIO,
            format!("expected delivered at version 2, observed {other:?}"),
        )),
    }
}

/// Notifications are appended in order.
pub async fn test_notifications_are_appended<S>(store: &S) -> ContractTestResult
where
    S: OrderStore + ?Sized,
{
    const SCENARIO: &str = "notifications_are_appended";
    let marker = unique(SCENARIO);
    let first = Notification::new(NotificationKind::Sync, format!("{marker} first"), Timestamp::now());
    let second =
        Notification::new(NotificationKind::Sweep, format!("{marker} second"), Timestamp::now());

    store
        .commit(WriteBatch::atomic().notify(first).notify(second))
        .await
        .map_err(|error| ContractTestFailure::store_error(SCENARIO, "commit", &error))?;

    let messages: Vec<String> = store
        .notifications()
        .await
        .map_err(|error| ContractTestFailure::store_error(SCENARIO, "notifications", &error))?
        .into_iter()
        .filter(|n| n.message.starts_with(&marker))
        .map(|n| n.message)
        .collect();
    if messages == [format!("{marker} first"), format!("{marker} second")] {
        Ok(())
    } else {
        Err(ContractTestFailure::assertion(
            SCENARIO,
            format!("unexpected notifications: {messages:?}"),
        ))
    }
}

/// Committed writes appear on the change feed with before and after
/// snapshots; failed writes do not.
pub async fn test_change_feed_carries_snapshots<S>(store: &S) -> ContractTestResult
where
    S: OrderStore + ?Sized,
{
    const SCENARIO: &str = "change_feed_carries_snapshots";
    let timeout = Duration::from_secs(5);
    let id = contract_product(SCENARIO, "sku");
    let key = DocumentKey::Product(id.clone());
    let mut feed = store.subscribe();

    let created = put_product(SCENARIO, store, Product::new(id.clone(), 2), ExpectedVersion::New).await?;
    let _ = store
        .commit(WriteBatch::atomic().put_product(Product::new(id.clone(), 0), ExpectedVersion::New))
        .await;
    put_product(
        SCENARIO,
        store,
        Product::new(id.clone(), 1),
        ExpectedVersion::Exact(created),
    )
    .await?;

    let Some(first) = next_change_for(&mut feed, &key, timeout).await else {
        return Err(ContractTestFailure::assertion(SCENARIO, "no change for creation"));
    };
    if first.before.is_some() || first.version != created {
        return Err(ContractTestFailure::assertion(
            SCENARIO,
            format!("creation change malformed: {first:?}"),
        ));
    }

    let Some(second) = next_change_for(&mut feed, &key, timeout).await else {
        return Err(ContractTestFailure::assertion(SCENARIO, "no change for update"));
    };
    let before_stock = match &second.before {
        Some(ordercore::store::Document::Product(product)) => Some(product.available_stock),
        _ => None,
    };
    let after_stock = match &second.after {
        ordercore::store::Document::Product(product) => Some(product.available_stock),
        _ => None,
    };
    if before_stock == Some(2) && after_stock == Some(1) {
        Ok(())
    } else {
        Err(ContractTestFailure::assertion(
            SCENARIO,
            format!("update change malformed (the failed write must not appear): {second:?}"),
        ))
    }
}

/// Generates one `#[tokio::test]` per contract scenario for a store built
/// by `make_store`.
#[macro_export]
macro_rules! order_store_contract_tests {
    (suite = $suite:ident, make_store = $make_store:expr $(,)?) => {
        mod $suite {
            use $crate::contract::{
                test_atomic_batch_is_all_or_nothing, test_best_effort_batch_reports_skipped,
                test_change_feed_carries_snapshots, test_missing_documents_read_as_none,
                test_new_conflicts_on_existing_document, test_notifications_are_appended,
                test_orders_with_status_filters, test_shipping_upsert_last_writer_wins,
                test_stale_version_conflicts, test_versions_start_at_one_and_increment,
            };

            #[tokio::test(flavor = "multi_thread")]
            async fn versions_start_at_one_and_increment_contract() {
                let store = $make_store();
                test_versions_start_at_one_and_increment(&store)
                    .await
                    .expect("order store contract failed");
            }

            #[tokio::test(flavor = "multi_thread")]
            async fn missing_documents_read_as_none_contract() {
                let store = $make_store();
                test_missing_documents_read_as_none(&store)
                    .await
                    .expect("order store contract failed");
            }

            #[tokio::test(flavor = "multi_thread")]
            async fn stale_version_conflicts_contract() {
                let store = $make_store();
                test_stale_version_conflicts(&store)
                    .await
                    .expect("order store contract failed");
            }

            #[tokio::test(flavor = "multi_thread")]
            async fn new_conflicts_on_existing_document_contract() {
                let store = $make_store();
                test_new_conflicts_on_existing_document(&store)
                    .await
                    .expect("order store contract failed");
            }

            #[tokio::test(flavor = "multi_thread")]
            async fn atomic_batch_is_all_or_nothing_contract() {
                let store = $make_store();
                test_atomic_batch_is_all_or_nothing(&store)
                    .await
                    .expect("order store contract failed");
            }

            #[tokio::test(flavor = "multi_thread")]
            async fn best_effort_batch_reports_skipped_contract() {
                let store = $make_store();
                test_best_effort_batch_reports_skipped(&store)
                    .await
                    .expect("order store contract failed");
            }

            #[tokio::test(flavor = "multi_thread")]
            async fn orders_with_status_filters_contract() {
                let store = $make_store();
                test_orders_with_status_filters(&store)
                    .await
                    .expect("order store contract failed");
            }

            #[tokio::test(flavor = "multi_thread")]
            async fn shipping_upsert_last_writer_wins_contract() {
                let store = $make_store();
                test_shipping_upsert_last_writer_wins(&store)
                    .await
                    .expect("order store contract failed");
            }

            #[tokio::test(flavor = "multi_thread")]
            async fn notifications_are_appended_contract() {
                let store = $make_store();
                test_notifications_are_appended(&store)
                    .await
                    .expect("order store contract failed");
            }

            #[tokio::test(flavor = "multi_thread")]
            async fn change_feed_carries_snapshots_contract() {
                let store = $make_store();
                test_change_feed_carries_snapshots(&store)
                    .await
                    .expect("order store contract failed");
            }
        }
    };
}

pub use order_store_contract_tests;
