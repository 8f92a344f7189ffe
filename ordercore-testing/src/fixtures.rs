//! Builders and seeding helpers.
//!
//! These panic on failure; they are meant for tests and benchmarks only.

use std::time::Duration;

use ordercore::model::{
    Order, OrderItem, OrderStatus, Payment, Product, ShippingMethod, StageEvent,
};
use ordercore::reservation::CreateOrderRequest;
use ordercore::store::{Change, ChangeFeed, DocumentKey, ExpectedVersion, OrderStore, WriteBatch};
use ordercore::types::{
    Currency, CustomerId, Money, OrderId, PaymentId, ProductId, ProviderStatus, Quantity,
    StageName, Timestamp,
};
use rust_decimal::Decimal;
use tokio::sync::broadcast::error::RecvError;

/// A product id, panicking on invalid input.
pub fn product_id(id: &str) -> ProductId {
    ProductId::try_new(id).expect("valid product id")
}

/// An order id, panicking on invalid input.
pub fn order_id(id: &str) -> OrderId {
    OrderId::try_new(id).expect("valid order id")
}

/// A provider status, panicking on invalid input.
pub fn status(raw: &str) -> ProviderStatus {
    ProviderStatus::try_new(raw).expect("valid provider status")
}

/// An amount from a decimal, panicking when negative.
pub fn money(amount: Decimal) -> Money {
    Money::try_new(amount).expect("non-negative amount")
}

/// A unique identifier with a readable prefix, for tests sharing a store.
pub fn unique(prefix: &str) -> String {
    format!("{prefix}-{}", uuid::Uuid::now_v7().simple())
}

/// Stores a product with the given stock, replacing any existing one.
pub async fn seed_product(store: &dyn OrderStore, id: &str, stock: u64) -> ProductId {
    let id = product_id(id);
    store
        .commit(WriteBatch::atomic().put_product(Product::new(id.clone(), stock), ExpectedVersion::Any))
        .await
        .expect("seed product");
    id
}

/// Current stock of a product.
pub async fn stock_of(store: &dyn OrderStore, id: &ProductId) -> u64 {
    store
        .product(id)
        .await
        .expect("read product")
        .expect("product exists")
        .document
        .available_stock
}

/// Stores a payment, replacing any existing one.
pub async fn put_payment(
    store: &dyn OrderStore,
    id: &str,
    order: Option<&OrderId>,
    payment_status: &str,
) -> PaymentId {
    let id = PaymentId::try_new(id).expect("valid payment id");
    let payment = Payment {
        id: id.clone(),
        order_id: order.cloned(),
        amount: Money::zero(),
        status: status(payment_status),
    };
    store
        .commit(WriteBatch::atomic().put_payment(payment, ExpectedVersion::Any))
        .await
        .expect("put payment");
    id
}

/// A request for `quantity` units of each product at `unit_price`, in SAR.
pub fn order_request(products: &[(&ProductId, u32)], unit_price: Decimal) -> CreateOrderRequest {
    products.iter().fold(
        CreateOrderRequest::new(
            CustomerId::try_new("customer-1").expect("valid customer id"),
            Currency::try_new("SAR").expect("valid currency"),
        ),
        |request, (id, quantity)| {
            request.with_item(
                (*id).clone(),
                Quantity::try_new(*quantity).expect("positive quantity"),
                money(unit_price),
            )
        },
    )
}

/// A pending order with one zero-priced line, last touched at `at`.
pub fn pending_order(id: OrderId, at: Timestamp) -> Order {
    Order {
        id,
        customer_id: CustomerId::try_new("customer-1").expect("valid customer id"),
        items: vec![OrderItem {
            product_id: product_id("fixture-product"),
            quantity: Quantity::try_new(1).expect("positive quantity"),
            unit_price: Money::zero(),
        }],
        subtotal: Money::zero(),
        shipping_cost: Money::zero(),
        tax_amount: Money::zero(),
        discount_amount: Money::zero(),
        total_amount: Money::zero(),
        currency: Currency::try_new("SAR").expect("valid currency"),
        shipping_method: ShippingMethod::Standard,
        status: OrderStatus::Pending,
        payment_status: ProviderStatus::pending(),
        shipping_status: ProviderStatus::pending(),
        stage_history: vec![StageEvent {
            stage: StageName::ordered(),
            timestamp: at,
            triggered_by: None,
        }],
        created_by: None,
        created_at: at,
        updated_at: at,
    }
}

/// Stores `order` as a new document.
pub async fn insert_order(store: &dyn OrderStore, order: Order) -> Order {
    store
        .commit(WriteBatch::atomic().put_order(order.clone(), ExpectedVersion::New))
        .await
        .expect("insert order");
    order
}

/// Reads an order, panicking when absent.
pub async fn load_order(store: &dyn OrderStore, id: &OrderId) -> Order {
    store
        .order(id)
        .await
        .expect("read order")
        .expect("order exists")
        .document
}

/// Waits up to `timeout` for the next change to `key`, skipping others.
pub async fn next_change_for(
    feed: &mut ChangeFeed,
    key: &DocumentKey,
    timeout: Duration,
) -> Option<Change> {
    tokio::time::timeout(timeout, async {
        loop {
            match feed.recv().await {
                Ok(change) if change.after.key() == *key => return Some(change),
                Ok(_) | Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => return None,
            }
        }
    })
    .await
    .ok()
    .flatten()
}

/// Polls `check` every 10ms until it returns true or `timeout` passes.
pub async fn eventually<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
