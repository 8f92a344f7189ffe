//! Documents held by the order store.
//!
//! All documents serialize with camelCase field names so the JSON stored by
//! the PostgreSQL adapter and served over HTTP share one shape.

use crate::types::{
    Currency, CustomerId, Money, OrderId, PaymentId, ProductId, ProviderStatus, Quantity,
    StageName, Timestamp, TriggeredBy,
};
use serde::{Deserialize, Serialize};

/// An entry of the inventory ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Product {
    /// Product identifier
    pub id: ProductId,
    /// Units that can still be reserved
    pub available_stock: u64,
}

impl Product {
    /// Creates a product with the given stock level.
    pub const fn new(id: ProductId, available_stock: u64) -> Self {
        Self {
            id,
            available_stock,
        }
    }
}

/// Lifecycle status of an order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    /// Created, waiting for payment and shipment
    Pending,
    /// Payment captured
    Paid,
    /// Handed to the carrier
    Shipped,
    /// Paid and delivered
    Completed,
    /// Abandoned past the staleness threshold
    Expired,
    /// Cancelled by an operator or the customer
    Cancelled,
}

impl OrderStatus {
    /// Every status, in lifecycle order.
    pub const ALL: [Self; 6] = [
        Self::Pending,
        Self::Paid,
        Self::Shipped,
        Self::Completed,
        Self::Expired,
        Self::Cancelled,
    ];

    /// Terminal statuses admit no further transitions.
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Expired | Self::Cancelled)
    }

    /// Lower-case name, as stored and as used for stage entries.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Paid => "paid",
            Self::Shipped => "shipped",
            Self::Completed => "completed",
            Self::Expired => "expired",
            Self::Cancelled => "cancelled",
        }
    }

    /// Stage entry appended when an order enters this status.
    pub fn stage_name(self) -> StageName {
        StageName::try_new(self.as_str()).expect("status names are valid stage names")
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How the order is delivered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShippingMethod {
    /// Regular carrier delivery
    #[default]
    Standard,
    /// Expedited carrier delivery
    Express,
    /// Collected by the customer; never charged for shipping
    Pickup,
}

/// One line of an order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderItem {
    /// Product reserved by this line
    pub product_id: ProductId,
    /// Units reserved
    pub quantity: Quantity,
    /// Price of one unit
    pub unit_price: Money,
}

impl OrderItem {
    /// `unit_price × quantity`, or `None` when the product overflows.
    pub fn line_total(&self) -> Option<rust_decimal::Decimal> {
        let quantity: u32 = self.quantity.into();
        self.unit_price
            .amount()
            .checked_mul(rust_decimal::Decimal::from(quantity))
    }
}

/// An entry of an order's append-only audit trail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageEvent {
    /// What happened
    pub stage: StageName,
    /// When it was recorded
    pub timestamp: Timestamp,
    /// Who caused it, when known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub triggered_by: Option<TriggeredBy>,
}

/// A customer order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Order {
    /// Order identifier
    pub id: OrderId,
    /// Owner of the order
    pub customer_id: CustomerId,
    /// Lines in request order
    pub items: Vec<OrderItem>,
    /// Sum of line totals
    pub subtotal: Money,
    /// Shipping charge, zero for pickup
    pub shipping_cost: Money,
    /// Precomputed tax
    pub tax_amount: Money,
    /// Discount subtracted from the total
    pub discount_amount: Money,
    /// `max(0, subtotal + shipping + tax - discount)`
    pub total_amount: Money,
    /// Currency of every amount on the order
    pub currency: Currency,
    /// Delivery method
    pub shipping_method: ShippingMethod,
    /// Lifecycle status
    pub status: OrderStatus,
    /// Last status reported by the payment side
    pub payment_status: ProviderStatus,
    /// Last status reported by the shipping side
    pub shipping_status: ProviderStatus,
    /// Append-only audit trail
    pub stage_history: Vec<StageEvent>,
    /// Authenticated creator, when known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_by: Option<TriggeredBy>,
    /// Creation time
    pub created_at: Timestamp,
    /// Time of the last change
    pub updated_at: Timestamp,
}

impl Order {
    /// Whether the order has reached a terminal status.
    pub const fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// The most recent stage entry.
    pub fn last_stage(&self) -> Option<&StageEvent> {
        self.stage_history.last()
    }

    /// Names of all stage entries, oldest first.
    pub fn stage_names(&self) -> Vec<&str> {
        self.stage_history.iter().map(|event| event.stage.as_ref()).collect()
    }
}

/// A payment created by the checkout flow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Payment {
    /// Payment identifier
    pub id: PaymentId,
    /// Order the payment settles, if linked
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order_id: Option<OrderId>,
    /// Amount charged
    pub amount: Money,
    /// Provider status of the payment
    pub status: ProviderStatus,
}

/// Read-optimised copy of an order's shipping status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShippingRecord {
    /// Order the record belongs to
    pub order_id: OrderId,
    /// Mirrors `Order::shipping_status`
    pub status: ProviderStatus,
    /// When the projection last changed
    pub updated_at: Timestamp,
}

/// Which part of the engine produced a notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationKind {
    /// Payment webhook failure
    Payment,
    /// Shipping webhook failure
    Shipment,
    /// Status synchronization failure
    Sync,
    /// Reconciliation sweep failure
    Sweep,
}

impl std::fmt::Display for NotificationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Payment => "payment",
            Self::Shipment => "shipment",
            Self::Sync => "sync",
            Self::Sweep => "sweep",
        })
    }
}

/// Append-only audit record for failures that have no caller to report to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    /// Producer of the record
    #[serde(rename = "type")]
    pub kind: NotificationKind,
    /// Human readable description
    pub message: String,
    /// Order concerned, when there is one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order_id: Option<OrderId>,
    /// When the record was written
    pub created_at: Timestamp,
}

impl Notification {
    /// Creates a notification stamped with `at`.
    pub fn new(kind: NotificationKind, message: impl Into<String>, at: Timestamp) -> Self {
        Self {
            kind,
            message: message.into(),
            order_id: None,
            created_at: at,
        }
    }

    /// Attaches the concerned order.
    #[must_use]
    pub fn for_order(mut self, order_id: OrderId) -> Self {
        self.order_id = Some(order_id);
        self
    }
}
