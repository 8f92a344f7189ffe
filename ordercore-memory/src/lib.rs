//! In-memory adapter for the `OrderCore` engine
//!
//! This crate provides an in-memory implementation of the `OrderStore` port,
//! useful for tests, benchmarks and development servers where persistence is
//! not required. Commits are serialised by a single write lock, inside which
//! every expected version is verified before anything is applied.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;

use async_trait::async_trait;
use ordercore::errors::{StoreError, StoreResult};
use ordercore::model::{Notification, Order, OrderStatus, Payment, Product, ShippingRecord};
use ordercore::store::{
    Change, ChangeFeed, CommitMode, CommitReceipt, Document, DocumentKey, OrderStore,
    SkippedWrite, Versioned, Write, WriteBatch, DEFAULT_CHANGE_FEED_CAPACITY,
};
use ordercore::types::{DocVersion, OrderId, PaymentId, ProductId};
use parking_lot::RwLock;
use tokio::sync::broadcast;
use tracing::{debug, trace};

#[derive(Default)]
struct State {
    products: HashMap<ProductId, Versioned<Product>>,
    orders: HashMap<OrderId, Versioned<Order>>,
    payments: HashMap<PaymentId, Versioned<Payment>>,
    shipping: HashMap<OrderId, Versioned<ShippingRecord>>,
    notifications: Vec<Notification>,
}

impl State {
    fn version_of(&self, key: &DocumentKey) -> Option<DocVersion> {
        match key {
            DocumentKey::Product(id) => self.products.get(id).map(|v| v.version),
            DocumentKey::Order(id) => self.orders.get(id).map(|v| v.version),
            DocumentKey::Payment(id) => self.payments.get(id).map(|v| v.version),
            DocumentKey::Shipping(id) => self.shipping.get(id).map(|v| v.version),
        }
    }
}

/// Replaces the document under `id`, returning the previous document and the
/// new version.
fn replace<K, T>(map: &mut HashMap<K, Versioned<T>>, id: K, document: T) -> (Option<T>, DocVersion)
where
    K: Eq + Hash,
    T: Clone,
{
    let previous = map.get(&id).cloned();
    let version = previous
        .as_ref()
        .map_or_else(DocVersion::initial, |current| current.version.next());
    map.insert(id, Versioned::new(version, document));
    (previous.map(|current| current.document), version)
}

/// Thread-safe in-memory order store.
///
/// Clones share the same storage and change feed.
#[derive(Clone)]
pub struct InMemoryOrderStore {
    state: Arc<RwLock<State>>,
    changes: broadcast::Sender<Change>,
}

impl InMemoryOrderStore {
    /// Create a new empty store.
    pub fn new() -> Self {
        Self::with_change_capacity(DEFAULT_CHANGE_FEED_CAPACITY)
    }

    /// Create a new empty store whose change feed buffers `capacity` changes
    /// per subscriber before lagging.
    pub fn with_change_capacity(capacity: usize) -> Self {
        let (changes, _) = broadcast::channel(capacity.max(1));
        Self {
            state: Arc::new(RwLock::new(State::default())),
            changes,
        }
    }

    /// Number of orders currently stored.
    pub fn order_count(&self) -> usize {
        self.state.read().orders.len()
    }
}

impl Default for InMemoryOrderStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for InMemoryOrderStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.read();
        f.debug_struct("InMemoryOrderStore")
            .field("products", &state.products.len())
            .field("orders", &state.orders.len())
            .field("payments", &state.payments.len())
            .field("notifications", &state.notifications.len())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl OrderStore for InMemoryOrderStore {
    async fn product(&self, id: &ProductId) -> StoreResult<Option<Versioned<Product>>> {
        Ok(self.state.read().products.get(id).cloned())
    }

    async fn order(&self, id: &OrderId) -> StoreResult<Option<Versioned<Order>>> {
        Ok(self.state.read().orders.get(id).cloned())
    }

    async fn payment(&self, id: &PaymentId) -> StoreResult<Option<Versioned<Payment>>> {
        Ok(self.state.read().payments.get(id).cloned())
    }

    async fn shipping(&self, order_id: &OrderId) -> StoreResult<Option<Versioned<ShippingRecord>>> {
        Ok(self.state.read().shipping.get(order_id).cloned())
    }

    async fn orders_with_status(&self, status: OrderStatus) -> StoreResult<Vec<Versioned<Order>>> {
        let mut orders: Vec<_> = self
            .state
            .read()
            .orders
            .values()
            .filter(|order| order.document.status == status)
            .cloned()
            .collect();
        orders.sort_by(|a, b| {
            (a.document.created_at, &a.document.id).cmp(&(b.document.created_at, &b.document.id))
        });
        Ok(orders)
    }

    async fn notifications(&self) -> StoreResult<Vec<Notification>> {
        Ok(self.state.read().notifications.clone())
    }

    async fn commit(&self, batch: WriteBatch) -> StoreResult<CommitReceipt> {
        let mode = batch.mode();
        let mut state = self.state.write();

        // Verify every expected version against the state as it will be
        // after the earlier writes of this batch.
        let mut staged: HashMap<DocumentKey, Option<DocVersion>> = HashMap::new();
        let mut accepted = Vec::with_capacity(batch.len());
        let mut receipt = CommitReceipt::default();
        for write in batch.into_writes() {
            let Some(key) = write.key() else {
                accepted.push(write);
                continue;
            };
            let current = match staged.get(&key) {
                Some(version) => *version,
                None => state.version_of(&key),
            };
            let expected = write.expected();
            if expected.matches(current) {
                let next = current.map_or_else(DocVersion::initial, DocVersion::next);
                staged.insert(key, Some(next));
                accepted.push(write);
                continue;
            }

            let conflict = StoreError::VersionConflict {
                key: key.clone(),
                expected,
                current,
            };
            match mode {
                CommitMode::Atomic => {
                    debug!(document = %key, "[memory.commit] Rejecting batch on version conflict");
                    return Err(conflict);
                }
                CommitMode::BestEffort => {
                    trace!(document = %key, "[memory.commit] Skipping conflicting write");
                    receipt.skipped.push(SkippedWrite {
                        key,
                        reason: conflict,
                    });
                }
            }
        }

        for write in accepted {
            let (key, before, after, version) = match write {
                Write::Product { product, .. } => {
                    let (before, version) = replace(&mut state.products, product.id.clone(), product.clone());
                    (
                        DocumentKey::Product(product.id.clone()),
                        before.map(Document::Product),
                        Document::Product(product),
                        version,
                    )
                }
                Write::Order { order, .. } => {
                    let (before, version) = replace(&mut state.orders, order.id.clone(), order.clone());
                    (
                        DocumentKey::Order(order.id.clone()),
                        before.map(Document::Order),
                        Document::Order(order),
                        version,
                    )
                }
                Write::Payment { payment, .. } => {
                    let (before, version) = replace(&mut state.payments, payment.id.clone(), payment.clone());
                    (
                        DocumentKey::Payment(payment.id.clone()),
                        before.map(Document::Payment),
                        Document::Payment(payment),
                        version,
                    )
                }
                Write::Shipping(record) => {
                    let (before, version) =
                        replace(&mut state.shipping, record.order_id.clone(), record.clone());
                    (
                        DocumentKey::Shipping(record.order_id.clone()),
                        before.map(Document::Shipping),
                        Document::Shipping(record),
                        version,
                    )
                }
                Write::Notification(notification) => {
                    state.notifications.push(notification);
                    receipt.notifications += 1;
                    continue;
                }
            };

            receipt.applied.push((key, version));
            // Publishing under the lock keeps the feed in commit order.
            // A send error only means nobody is subscribed.
            let _ = self.changes.send(Change {
                before,
                after,
                version,
            });
        }

        Ok(receipt)
    }

    fn subscribe(&self) -> ChangeFeed {
        self.changes.subscribe()
    }
}
