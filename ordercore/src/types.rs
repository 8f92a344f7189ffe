//! Core types for the `OrderCore` engine.
//!
//! Identifiers, amounts and provider strings are all validated at
//! construction time. Once a value of one of these types exists it is known
//! to be well formed, so the services never re-check it.

use chrono::{DateTime, Duration, Utc};
use nutype::nutype;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifier of an order.
///
/// Generated identifiers have the form `ORD-<UPPERCASE HEX>`; identifiers
/// received from callers are only trimmed and length checked.
#[nutype(
    sanitize(trim),
    validate(not_empty, len_char_max = 64),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Hash,
        AsRef,
        Deref,
        Display,
        Serialize,
        Deserialize
    )
)]
pub struct OrderId(String);

impl OrderId {
    /// Generates a fresh, time ordered order identifier.
    pub fn generate() -> Self {
        let hex = Uuid::now_v7().simple().to_string().to_uppercase();
        Self::try_new(format!("ORD-{hex}")).expect("generated order id is always valid")
    }
}

/// Identifier of a product in the inventory ledger.
#[nutype(
    sanitize(trim),
    validate(not_empty, len_char_max = 255),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Hash,
        AsRef,
        Deref,
        Display,
        Serialize,
        Deserialize
    )
)]
pub struct ProductId(String);

/// Identifier of the customer an order belongs to.
#[nutype(
    sanitize(trim),
    validate(not_empty, len_char_max = 255),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        Hash,
        AsRef,
        Deref,
        Display,
        Serialize,
        Deserialize
    )
)]
pub struct CustomerId(String);

/// Identifier of a payment record.
#[nutype(
    sanitize(trim),
    validate(not_empty, len_char_max = 255),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Hash,
        AsRef,
        Deref,
        Display,
        Serialize,
        Deserialize
    )
)]
pub struct PaymentId(String);

/// Number of units of a product on an order line. Always at least one.
#[nutype(
    validate(greater_or_equal = 1),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Hash,
        Display,
        Into,
        Serialize,
        Deserialize
    )
)]
pub struct Quantity(u32);

/// A non-negative monetary amount.
#[nutype(
    validate(predicate = |amount: &Decimal| *amount >= Decimal::ZERO),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Hash,
        Display,
        Into,
        Serialize,
        Deserialize
    )
)]
pub struct Money(Decimal);

impl Money {
    /// The zero amount.
    pub fn zero() -> Self {
        Self::try_new(Decimal::ZERO).expect("zero is a valid amount")
    }

    /// Builds an amount from a decimal, clamping negative values to zero.
    pub fn saturating_from(amount: Decimal) -> Self {
        Self::try_new(amount.max(Decimal::ZERO)).expect("clamped amount is never negative")
    }

    /// Returns the underlying decimal value.
    pub fn amount(self) -> Decimal {
        self.into_inner()
    }

    /// Whether two amounts differ by no more than `tolerance`.
    pub fn approx_eq(self, other: Self, tolerance: Decimal) -> bool {
        (self.amount() - other.amount()).abs() <= tolerance
    }
}

/// A three letter ISO 4217 style currency code, stored upper-case.
#[nutype(
    sanitize(trim, uppercase),
    validate(
        len_char_min = 3,
        len_char_max = 3,
        predicate = |code: &str| code.chars().all(|c| c.is_ascii_uppercase())
    ),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        Hash,
        AsRef,
        Deref,
        Display,
        Serialize,
        Deserialize
    )
)]
pub struct Currency(String);

/// A status string reported by an external provider.
///
/// Provider statuses are open ended, so only the handful the engine reacts
/// to get helpers. Values are trimmed and lower-cased so `"Delivered "` and
/// `"delivered"` compare equal.
#[nutype(
    sanitize(trim, lowercase),
    validate(not_empty, len_char_max = 64),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        Hash,
        AsRef,
        Deref,
        Display,
        Serialize,
        Deserialize
    )
)]
pub struct ProviderStatus(String);

impl ProviderStatus {
    /// Status every new order starts with.
    pub fn pending() -> Self {
        Self::try_new("pending").expect("literal status is valid")
    }

    /// Payment provider status for a captured payment.
    pub fn succeeded() -> Self {
        Self::try_new("succeeded").expect("literal status is valid")
    }

    /// Shipping provider status for a delivered parcel.
    pub fn delivered() -> Self {
        Self::try_new("delivered").expect("literal status is valid")
    }

    /// Whether the payment has been captured.
    pub fn is_succeeded(&self) -> bool {
        self.as_ref() == "succeeded"
    }

    /// Whether the parcel has reached the customer.
    pub fn is_delivered(&self) -> bool {
        self.as_ref() == "delivered"
    }
}

/// Name of an entry in an order's stage history.
#[nutype(
    sanitize(trim, lowercase),
    validate(not_empty, len_char_max = 128),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        Hash,
        AsRef,
        Deref,
        Display,
        Serialize,
        Deserialize
    )
)]
pub struct StageName(String);

impl StageName {
    /// First stage of every order.
    pub fn ordered() -> Self {
        Self::try_new("ordered").expect("literal stage is valid")
    }

    /// Stage recorded for a payment callback, e.g. `payment_succeeded`.
    pub fn for_payment(status: &ProviderStatus) -> Self {
        Self::try_new(format!("payment_{status}")).expect("provider status fits a stage name")
    }

    /// Stage recorded for a shipping callback, e.g. `shipping_delivered`.
    pub fn for_shipping(status: &ProviderStatus) -> Self {
        Self::try_new(format!("shipping_{status}")).expect("provider status fits a stage name")
    }
}

/// Identity of whoever caused a change: an authenticated user, a provider,
/// or an engine component such as `system:reconciliation-sweep`.
#[nutype(
    sanitize(trim),
    validate(not_empty, len_char_max = 255),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        Hash,
        AsRef,
        Deref,
        Display,
        Serialize,
        Deserialize
    )
)]
pub struct TriggeredBy(String);

impl TriggeredBy {
    /// Identity used for changes made by an internal engine component.
    pub fn system(component: &str) -> Self {
        Self::try_new(format!("system:{component}")).expect("component names are short literals")
    }
}

/// Version of a stored document.
///
/// The first write of a document produces version 1 and every later write
/// increments it by one.
#[nutype(
    validate(greater_or_equal = 1),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Hash,
        Display,
        Into,
        Serialize,
        Deserialize
    )
)]
pub struct DocVersion(u64);

impl DocVersion {
    /// Version assigned by the first write of a document.
    pub fn initial() -> Self {
        Self::try_new(1).expect("1 is always a valid version")
    }

    /// Returns the next version after this one.
    #[must_use]
    pub fn next(self) -> Self {
        let current: u64 = self.into();
        Self::try_new(current + 1).expect("next version should always be valid")
    }
}

/// A UTC instant used for `createdAt`, `updatedAt` and stage entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Timestamp(DateTime<Utc>);

impl Timestamp {
    /// Creates a new timestamp from a UTC `DateTime`.
    pub const fn new(datetime: DateTime<Utc>) -> Self {
        Self(datetime)
    }

    /// Creates a timestamp representing the current moment.
    pub fn now() -> Self {
        Self(Utc::now())
    }

    /// Returns the underlying `DateTime`.
    pub const fn as_datetime(&self) -> &DateTime<Utc> {
        &self.0
    }

    /// Converts the timestamp into the underlying `DateTime`.
    pub const fn into_datetime(self) -> DateTime<Utc> {
        self.0
    }

    /// How long ago `earlier` was, seen from this instant. Negative when
    /// `earlier` is in the future.
    pub fn since(self, earlier: Self) -> Duration {
        self.0 - earlier.0
    }

    /// This instant shifted by `offset`.
    #[must_use]
    pub fn plus(self, offset: Duration) -> Self {
        Self(self.0 + offset)
    }
}

impl From<DateTime<Utc>> for Timestamp {
    fn from(datetime: DateTime<Utc>) -> Self {
        Self::new(datetime)
    }
}

impl From<Timestamp> for DateTime<Utc> {
    fn from(timestamp: Timestamp) -> Self {
        timestamp.into_datetime()
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}
