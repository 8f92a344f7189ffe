//! The `OrderStore` port.
//!
//! Products, orders, payments and shipping projections are versioned
//! documents. Writes are grouped into a [`WriteBatch`] which the adapter
//! commits either atomically or best-effort. Every committed document
//! change is published on a broadcast change feed carrying the before and
//! after snapshots; the status synchronization layer consumes it.

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::errors::{StoreError, StoreResult};
use crate::model::{Notification, Order, OrderStatus, Payment, Product, ShippingRecord};
use crate::types::{DocVersion, OrderId, PaymentId, ProductId};

/// Capacity of the change feed channel used by the bundled adapters.
pub const DEFAULT_CHANGE_FEED_CAPACITY: usize = 1024;

/// Expected version for optimistic concurrency control.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpectedVersion {
    /// The document must not exist
    New,
    /// The document must exist and have exactly this version
    Exact(DocVersion),
    /// Any version is acceptable (no concurrency control)
    Any,
}

impl ExpectedVersion {
    /// Whether a document currently at `current` satisfies this expectation.
    pub fn matches(self, current: Option<DocVersion>) -> bool {
        match self {
            Self::New => current.is_none(),
            Self::Exact(expected) => current == Some(expected),
            Self::Any => true,
        }
    }
}

impl std::fmt::Display for ExpectedVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::New => f.write_str("new"),
            Self::Exact(version) => write!(f, "version {version}"),
            Self::Any => f.write_str("any"),
        }
    }
}

/// Kinds of versioned document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKind {
    /// Inventory ledger entry
    Product,
    /// Customer order
    Order,
    /// Payment record
    Payment,
    /// Shipping projection
    Shipping,
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Product => "product",
            Self::Order => "order",
            Self::Payment => "payment",
            Self::Shipping => "shipping",
        })
    }
}

/// Address of a stored document.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DocumentKey {
    /// A product
    Product(ProductId),
    /// An order
    Order(OrderId),
    /// A payment
    Payment(PaymentId),
    /// The shipping projection of an order
    Shipping(OrderId),
}

impl DocumentKey {
    /// The kind of document addressed.
    pub const fn kind(&self) -> EntityKind {
        match self {
            Self::Product(_) => EntityKind::Product,
            Self::Order(_) => EntityKind::Order,
            Self::Payment(_) => EntityKind::Payment,
            Self::Shipping(_) => EntityKind::Shipping,
        }
    }

    /// The identifier part of the key.
    pub fn id(&self) -> &str {
        match self {
            Self::Product(id) => id.as_ref(),
            Self::Order(id) | Self::Shipping(id) => id.as_ref(),
            Self::Payment(id) => id.as_ref(),
        }
    }
}

impl std::fmt::Display for DocumentKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.kind(), self.id())
    }
}

/// A document together with the version it was read at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Versioned<T> {
    /// Current version of the document
    pub version: DocVersion,
    /// The document itself
    pub document: T,
}

impl<T> Versioned<T> {
    /// Pairs a document with its version.
    pub const fn new(version: DocVersion, document: T) -> Self {
        Self { version, document }
    }
}

/// Snapshot of any versioned document, as carried on the change feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Document {
    /// A product
    Product(Product),
    /// An order
    Order(Order),
    /// A payment
    Payment(Payment),
    /// A shipping projection
    Shipping(ShippingRecord),
}

impl Document {
    /// Key under which the document is stored.
    pub fn key(&self) -> DocumentKey {
        match self {
            Self::Product(product) => DocumentKey::Product(product.id.clone()),
            Self::Order(order) => DocumentKey::Order(order.id.clone()),
            Self::Payment(payment) => DocumentKey::Payment(payment.id.clone()),
            Self::Shipping(record) => DocumentKey::Shipping(record.order_id.clone()),
        }
    }

    /// Kind of the document.
    pub fn kind(&self) -> EntityKind {
        match self {
            Self::Product(_) => EntityKind::Product,
            Self::Order(_) => EntityKind::Order,
            Self::Payment(_) => EntityKind::Payment,
            Self::Shipping(_) => EntityKind::Shipping,
        }
    }

    /// The order, if this is one.
    pub const fn as_order(&self) -> Option<&Order> {
        match self {
            Self::Order(order) => Some(order),
            _ => None,
        }
    }

    /// The payment, if this is one.
    pub const fn as_payment(&self) -> Option<&Payment> {
        match self {
            Self::Payment(payment) => Some(payment),
            _ => None,
        }
    }
}

/// A committed document change published on the change feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Change {
    /// State before the write, `None` on creation
    pub before: Option<Document>,
    /// State after the write
    pub after: Document,
    /// Version produced by the write
    pub version: DocVersion,
}

impl Change {
    /// Kind of the changed document.
    pub fn kind(&self) -> EntityKind {
        self.after.kind()
    }
}

/// Receiving end of a store's change feed.
pub type ChangeFeed = broadcast::Receiver<Change>;

/// One staged write.
#[derive(Debug, Clone)]
pub enum Write {
    /// Create or replace a product.
    Product {
        /// New state
        product: Product,
        /// Concurrency expectation
        expected: ExpectedVersion,
    },
    /// Create or replace an order.
    Order {
        /// New state
        order: Order,
        /// Concurrency expectation
        expected: ExpectedVersion,
    },
    /// Create or replace a payment.
    Payment {
        /// New state
        payment: Payment,
        /// Concurrency expectation
        expected: ExpectedVersion,
    },
    /// Upsert a shipping projection (last writer wins).
    Shipping(ShippingRecord),
    /// Append an audit notification.
    Notification(Notification),
}

impl Write {
    /// Key of the document written, `None` for notifications.
    pub fn key(&self) -> Option<DocumentKey> {
        match self {
            Self::Product { product, .. } => Some(DocumentKey::Product(product.id.clone())),
            Self::Order { order, .. } => Some(DocumentKey::Order(order.id.clone())),
            Self::Payment { payment, .. } => Some(DocumentKey::Payment(payment.id.clone())),
            Self::Shipping(record) => Some(DocumentKey::Shipping(record.order_id.clone())),
            Self::Notification(_) => None,
        }
    }

    /// Concurrency expectation of the write.
    pub const fn expected(&self) -> ExpectedVersion {
        match self {
            Self::Product { expected, .. }
            | Self::Order { expected, .. }
            | Self::Payment { expected, .. } => *expected,
            Self::Shipping(_) | Self::Notification(_) => ExpectedVersion::Any,
        }
    }

    /// The document written, `None` for notifications.
    pub fn document(&self) -> Option<Document> {
        match self {
            Self::Product { product, .. } => Some(Document::Product(product.clone())),
            Self::Order { order, .. } => Some(Document::Order(order.clone())),
            Self::Payment { payment, .. } => Some(Document::Payment(payment.clone())),
            Self::Shipping(record) => Some(Document::Shipping(record.clone())),
            Self::Notification(_) => None,
        }
    }
}

/// How a batch is committed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitMode {
    /// Every write applies or none does; the first conflict fails the batch.
    Atomic,
    /// Each write is checked on its own; conflicting writes are skipped.
    BestEffort,
}

/// A group of writes committed together.
#[derive(Debug, Clone)]
pub struct WriteBatch {
    mode: CommitMode,
    writes: Vec<Write>,
}

impl WriteBatch {
    /// An all-or-nothing batch.
    pub const fn atomic() -> Self {
        Self {
            mode: CommitMode::Atomic,
            writes: Vec::new(),
        }
    }

    /// A batch whose writes succeed or fail individually.
    pub const fn best_effort() -> Self {
        Self {
            mode: CommitMode::BestEffort,
            writes: Vec::new(),
        }
    }

    /// Adds a product write.
    #[must_use]
    pub fn put_product(mut self, product: Product, expected: ExpectedVersion) -> Self {
        self.writes.push(Write::Product { product, expected });
        self
    }

    /// Adds an order write.
    #[must_use]
    pub fn put_order(mut self, order: Order, expected: ExpectedVersion) -> Self {
        self.writes.push(Write::Order { order, expected });
        self
    }

    /// Adds a payment write.
    #[must_use]
    pub fn put_payment(mut self, payment: Payment, expected: ExpectedVersion) -> Self {
        self.writes.push(Write::Payment { payment, expected });
        self
    }

    /// Adds a shipping projection upsert.
    #[must_use]
    pub fn upsert_shipping(mut self, record: ShippingRecord) -> Self {
        self.writes.push(Write::Shipping(record));
        self
    }

    /// Adds a notification.
    #[must_use]
    pub fn notify(mut self, notification: Notification) -> Self {
        self.writes.push(Write::Notification(notification));
        self
    }

    /// Commit mode of the batch.
    pub const fn mode(&self) -> CommitMode {
        self.mode
    }

    /// Staged writes, in order.
    pub fn writes(&self) -> &[Write] {
        &self.writes
    }

    /// Consumes the batch, returning its writes.
    pub fn into_writes(self) -> Vec<Write> {
        self.writes
    }

    /// Number of staged writes.
    pub fn len(&self) -> usize {
        self.writes.len()
    }

    /// Whether nothing is staged.
    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }
}

/// A write a best-effort commit did not apply.
#[derive(Debug, Clone)]
pub struct SkippedWrite {
    /// Document that was not written
    pub key: DocumentKey,
    /// Why it was skipped
    pub reason: StoreError,
}

/// Result of a commit.
#[derive(Debug, Clone, Default)]
pub struct CommitReceipt {
    /// Documents written and their new versions
    pub applied: Vec<(DocumentKey, DocVersion)>,
    /// Notifications appended
    pub notifications: usize,
    /// Writes skipped by a best-effort commit
    pub skipped: Vec<SkippedWrite>,
}

impl CommitReceipt {
    /// New version of `key`, if it was written.
    pub fn version_of(&self, key: &DocumentKey) -> Option<DocVersion> {
        self.applied
            .iter()
            .find_map(|(applied, version)| (applied == key).then_some(*version))
    }
}

/// Persistence port of the engine.
///
/// Adapters must guarantee that a version-checked write never overwrites a
/// document whose version moved since it was read, and that an atomic batch
/// is never partially visible. Change notifications are published only
/// after the writes they describe are durable.
#[async_trait]
pub trait OrderStore: Send + Sync {
    /// Reads a product.
    async fn product(&self, id: &ProductId) -> StoreResult<Option<Versioned<Product>>>;

    /// Reads an order.
    async fn order(&self, id: &OrderId) -> StoreResult<Option<Versioned<Order>>>;

    /// Reads a payment.
    async fn payment(&self, id: &PaymentId) -> StoreResult<Option<Versioned<Payment>>>;

    /// Reads the shipping projection of an order.
    async fn shipping(&self, order_id: &OrderId) -> StoreResult<Option<Versioned<ShippingRecord>>>;

    /// Reads every order currently in `status`.
    async fn orders_with_status(&self, status: OrderStatus) -> StoreResult<Vec<Versioned<Order>>>;

    /// Reads every notification, oldest first.
    async fn notifications(&self) -> StoreResult<Vec<Notification>>;

    /// Commits a batch.
    ///
    /// # Errors
    /// * `StoreError::VersionConflict` - an atomic batch failed a version check
    /// * `StoreError::Unavailable` - the backing store cannot be reached
    async fn commit(&self, batch: WriteBatch) -> StoreResult<CommitReceipt>;

    /// Subscribes to committed changes.
    fn subscribe(&self) -> ChangeFeed;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expected_version_matching() {
        let v1 = DocVersion::initial();
        assert!(ExpectedVersion::New.matches(None));
        assert!(!ExpectedVersion::New.matches(Some(v1)));
        assert!(ExpectedVersion::Exact(v1).matches(Some(v1)));
        assert!(!ExpectedVersion::Exact(v1).matches(Some(v1.next())));
        assert!(!ExpectedVersion::Exact(v1).matches(None));
        assert!(ExpectedVersion::Any.matches(None));
    }

    #[test]
    fn receipt_lookup() {
        let key = DocumentKey::Product(ProductId::try_new("sku").unwrap());
        let receipt = CommitReceipt {
            applied: vec![(key.clone(), DocVersion::initial())],
            ..CommitReceipt::default()
        };
        assert_eq!(receipt.version_of(&key), Some(DocVersion::initial()));
        assert_eq!(key.to_string(), "product sku");
    }
}
