//! Stock reservation: validate an order request, then decrement inventory
//! and create the order in one atomic commit.
//!
//! Each attempt reads every product involved along with its version and
//! stages the decremented products with `ExpectedVersion::Exact` next to the
//! new order with `ExpectedVersion::New`. If any product moved in between,
//! the commit fails as a whole and the attempt is retried from the reads.
//! Two buyers racing for the last unit therefore can never both succeed.

use std::collections::BTreeMap;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use crate::engine::Engine;
use crate::errors::ReservationError;
use crate::model::{Order, OrderItem, OrderStatus, ShippingMethod, StageEvent};
use crate::retry::{with_retry, RetryError, RetryPolicy};
use crate::store::{ExpectedVersion, WriteBatch};
use crate::types::{
    Currency, CustomerId, Money, OrderId, ProductId, ProviderStatus, Quantity, StageName,
    Timestamp, TriggeredBy,
};

/// Input of [`StockReservationService::create_order`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateOrderRequest {
    /// Customer placing the order
    pub customer_id: CustomerId,
    /// Lines to reserve
    pub items: Vec<OrderItem>,
    /// Currency of every amount
    pub currency: Currency,
    /// Delivery method
    #[serde(default)]
    pub shipping_method: ShippingMethod,
    /// Shipping charge; ignored for pickup
    #[serde(default = "Money::zero")]
    pub shipping_cost: Money,
    /// Precomputed tax
    #[serde(default = "Money::zero")]
    pub tax_amount: Money,
    /// Discount subtracted from the total
    #[serde(default = "Money::zero")]
    pub discount_amount: Money,
    /// Client-computed subtotal, checked when present
    #[serde(default)]
    pub subtotal: Option<Money>,
    /// Client-computed total, checked when present
    #[serde(default)]
    pub total_amount: Option<Money>,
    /// Authenticated identity of the caller
    #[serde(default)]
    pub triggered_by: Option<TriggeredBy>,
}

impl CreateOrderRequest {
    /// A request with no lines and no extra charges.
    pub fn new(customer_id: CustomerId, currency: Currency) -> Self {
        Self {
            customer_id,
            items: Vec::new(),
            currency,
            shipping_method: ShippingMethod::Standard,
            shipping_cost: Money::zero(),
            tax_amount: Money::zero(),
            discount_amount: Money::zero(),
            subtotal: None,
            total_amount: None,
            triggered_by: None,
        }
    }

    /// Adds a line.
    #[must_use]
    pub fn with_item(mut self, product_id: ProductId, quantity: Quantity, unit_price: Money) -> Self {
        self.items.push(OrderItem {
            product_id,
            quantity,
            unit_price,
        });
        self
    }
}

fn amount_overflow() -> ReservationError {
    ReservationError::InvalidInput("order amounts exceed the representable range".to_string())
}

/// Validated request: amounts resolved and demand aggregated per product.
#[derive(Debug, Clone)]
struct ReservationPlan {
    request: CreateOrderRequest,
    demand: BTreeMap<ProductId, u64>,
    subtotal: Money,
    shipping_cost: Money,
    total: Money,
}

impl ReservationPlan {
    fn build_order(&self, id: OrderId, now: Timestamp) -> Order {
        let request = &self.request;
        Order {
            id,
            customer_id: request.customer_id.clone(),
            items: request.items.clone(),
            subtotal: self.subtotal,
            shipping_cost: self.shipping_cost,
            tax_amount: request.tax_amount,
            discount_amount: request.discount_amount,
            total_amount: self.total,
            currency: request.currency.clone(),
            shipping_method: request.shipping_method,
            status: OrderStatus::Pending,
            payment_status: ProviderStatus::pending(),
            shipping_status: ProviderStatus::pending(),
            stage_history: vec![StageEvent {
                stage: StageName::ordered(),
                timestamp: now,
                triggered_by: request.triggered_by.clone(),
            }],
            created_by: request.triggered_by.clone(),
            created_at: now,
            updated_at: now,
        }
    }
}

/// Creates orders while reserving their stock.
#[derive(Debug, Clone)]
pub struct StockReservationService {
    engine: Engine,
}

impl StockReservationService {
    /// Creates the service.
    pub const fn new(engine: Engine) -> Self {
        Self { engine }
    }

    /// Validates `request`, reserves stock for every line and stores the new
    /// order, all or nothing.
    ///
    /// # Errors
    /// * `ReservationError::InvalidInput` - malformed request, unknown
    ///   product, or amounts outside the tolerance
    /// * `ReservationError::OutOfStock` - a product lacks stock
    /// * `ReservationError::Contention` - conflicts persisted past the
    ///   retry budget
    /// * `ReservationError::Internal` - the store failed
    #[instrument(
        name = "reservation.create_order",
        skip(self, request),
        fields(customer_id = %request.customer_id, lines = request.items.len())
    )]
    pub async fn create_order(&self, request: CreateOrderRequest) -> Result<Order, ReservationError> {
        let plan = self.plan(request).await?;
        let retry = self.engine.config().reservation_retry.to_retry_config();

        let result = with_retry(
            "reservation.create_order",
            &retry,
            |error: &ReservationError| {
                matches!(
                    error,
                    ReservationError::Internal(store) if RetryPolicy::ConflictsOnly.should_retry(store)
                )
            },
            |attempt| self.attempt(&plan, attempt),
        )
        .await;

        match result {
            Ok(order) => {
                info!(order_id = %order.id, total = %order.total_amount, "Order created");
                Ok(order)
            }
            Err(RetryError::Exhausted { attempts, .. }) => {
                warn!(attempts, "Stock reservation abandoned under contention");
                Err(ReservationError::Contention { attempts })
            }
            Err(RetryError::Aborted(error)) => Err(error),
        }
    }

    async fn plan(&self, request: CreateOrderRequest) -> Result<ReservationPlan, ReservationError> {
        if request.items.is_empty() {
            return Err(ReservationError::InvalidInput(
                "an order needs at least one item".to_string(),
            ));
        }

        let tolerance: Decimal = self.engine.config().price_tolerance.into();

        if let Some(catalog) = self.engine.catalog() {
            for item in &request.items {
                let Some(listed) = catalog.unit_price(&item.product_id).await else {
                    return Err(ReservationError::InvalidInput(format!(
                        "product {} is not in the catalog",
                        item.product_id
                    )));
                };
                if !listed.approx_eq(item.unit_price, tolerance) {
                    return Err(ReservationError::InvalidInput(format!(
                        "unit price {} for product {} does not match catalog price {listed}",
                        item.unit_price, item.product_id
                    )));
                }
            }
        }

        let mut demand: BTreeMap<ProductId, u64> = BTreeMap::new();
        for item in &request.items {
            let quantity: u32 = item.quantity.into();
            *demand.entry(item.product_id.clone()).or_default() += u64::from(quantity);
        }

        let subtotal = request
            .items
            .iter()
            .try_fold(Decimal::ZERO, |sum, item| {
                item.line_total().and_then(|line| sum.checked_add(line))
            })
            .map(Money::saturating_from)
            .ok_or_else(amount_overflow)?;
        if let Some(supplied) = request.subtotal {
            if !supplied.approx_eq(subtotal, tolerance) {
                return Err(ReservationError::InvalidInput(format!(
                    "subtotal {supplied} does not match line total {subtotal}"
                )));
            }
        }

        let shipping_cost = match request.shipping_method {
            ShippingMethod::Pickup => Money::zero(),
            ShippingMethod::Standard | ShippingMethod::Express => request.shipping_cost,
        };
        let total = subtotal
            .amount()
            .checked_add(shipping_cost.amount())
            .and_then(|sum| sum.checked_add(request.tax_amount.amount()))
            .and_then(|sum| sum.checked_sub(request.discount_amount.amount()))
            .map(Money::saturating_from)
            .ok_or_else(amount_overflow)?;
        if let Some(supplied) = request.total_amount {
            if !supplied.approx_eq(total, tolerance) {
                return Err(ReservationError::InvalidInput(format!(
                    "total {supplied} does not match computed total {total}"
                )));
            }
        }

        Ok(ReservationPlan {
            request,
            demand,
            subtotal,
            shipping_cost,
            total,
        })
    }

    async fn attempt(&self, plan: &ReservationPlan, attempt: u32) -> Result<Order, ReservationError> {
        let store = self.engine.store();
        let mut batch = WriteBatch::atomic();

        for (product_id, &requested) in &plan.demand {
            let Some(current) = store
                .product(product_id)
                .await
                .map_err(ReservationError::Internal)?
            else {
                return Err(ReservationError::InvalidInput(format!(
                    "product {product_id} does not exist"
                )));
            };

            let available = current.document.available_stock;
            if available < requested {
                warn!(%product_id, requested, available, attempt, "Insufficient stock");
                return Err(ReservationError::OutOfStock {
                    product_id: product_id.clone(),
                    requested,
                    available,
                });
            }

            let mut product = current.document;
            product.available_stock = available - requested;
            batch = batch.put_product(product, ExpectedVersion::Exact(current.version));
        }

        let order = plan.build_order(OrderId::generate(), self.engine.now());
        batch = batch.put_order(order.clone(), ExpectedVersion::New);

        store.commit(batch).await.map_err(ReservationError::Internal)?;

        Ok(order)
    }
}
