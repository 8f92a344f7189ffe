//! Failure injection for `OrderStore` adapters.
//!
//! `ChaosOrderStore` wraps any store and turns a configurable share of
//! commits into version conflicts or outages. Batches that only append
//! notifications always pass through, so the engine's failure records stay
//! observable while everything else is failing.

use async_trait::async_trait;
use nutype::nutype;
use ordercore::errors::{StoreError, StoreResult};
use ordercore::model::{Notification, Order, OrderStatus, Payment, Product, ShippingRecord};
use ordercore::store::{
    ChangeFeed, CommitReceipt, DocumentKey, ExpectedVersion, OrderStore, Versioned, Write,
    WriteBatch,
};
use ordercore::types::{OrderId, PaymentId, ProductId};
use parking_lot::Mutex;
use rand::{random, rngs::StdRng, Rng, SeedableRng};

/// Probability value for failure injection rates.
///
/// Probability represents a value in the range [0.0, 1.0] where 0.0 means
/// never inject failures and 1.0 means always inject failures.
#[nutype(
    validate(greater_or_equal = 0.0, less_or_equal = 1.0),
    derive(Debug, Clone, Copy, PartialEq, PartialOrd, Display, Into)
)]
pub struct Probability(f64);

/// What to inject and how often.
#[derive(Debug, Clone)]
pub struct ChaosConfig {
    deterministic_seed: Option<u64>,
    read_failure_probability: Probability,
    commit_failure_probability: Probability,
    version_conflict_probability: Probability,
}

impl ChaosConfig {
    /// A configuration with a fixed RNG seed, for reproducible runs.
    pub fn deterministic() -> Self {
        Self {
            deterministic_seed: Some(0),
            ..Self::default()
        }
    }

    /// Share of reads that fail with `StoreError::Unavailable`.
    #[must_use]
    pub fn with_read_failure_probability(mut self, probability: f64) -> Self {
        self.read_failure_probability = clamp(probability);
        self
    }

    /// Share of commits that fail with `StoreError::Unavailable`.
    #[must_use]
    pub fn with_commit_failure_probability(mut self, probability: f64) -> Self {
        self.commit_failure_probability = clamp(probability);
        self
    }

    /// Share of commits that fail with a version conflict.
    #[must_use]
    pub fn with_version_conflict_probability(mut self, probability: f64) -> Self {
        self.version_conflict_probability = clamp(probability);
        self
    }
}

fn clamp(probability: f64) -> Probability {
    Probability::try_new(probability.clamp(0.0, 1.0)).expect("clamped value is always valid")
}

impl Default for ChaosConfig {
    fn default() -> Self {
        Self {
            deterministic_seed: None,
            read_failure_probability: clamp(0.0),
            commit_failure_probability: clamp(0.0),
            version_conflict_probability: clamp(0.0),
        }
    }
}

/// Wraps a store with failure injection.
pub trait ChaosOrderStoreExt: Sized {
    /// Wraps `self` using `config`.
    fn with_chaos(self, config: ChaosConfig) -> ChaosOrderStore<Self>;
}

impl<S> ChaosOrderStoreExt for S
where
    S: OrderStore,
{
    fn with_chaos(self, config: ChaosConfig) -> ChaosOrderStore<Self> {
        ChaosOrderStore::new(self, config)
    }
}

/// A store that fails on purpose.
pub struct ChaosOrderStore<S> {
    store: S,
    config: ChaosConfig,
    rng: Mutex<StdRng>,
}

impl<S> ChaosOrderStore<S> {
    /// Wraps `store`.
    pub fn new(store: S, config: ChaosConfig) -> Self {
        let rng = match config.deterministic_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::seed_from_u64(random()),
        };

        Self {
            store,
            config,
            rng: Mutex::new(rng),
        }
    }

    /// The wrapped store.
    pub const fn inner(&self) -> &S {
        &self.store
    }

    fn should_inject(&self, probability: Probability) -> bool {
        let probability: f64 = probability.into();

        if probability <= 0.0 {
            return false;
        }

        if probability >= 1.0 {
            return true;
        }

        self.rng.lock().random_bool(probability)
    }

    fn read_gate(&self, operation: &str) -> StoreResult<()> {
        if self.should_inject(self.config.read_failure_probability) {
            return Err(StoreError::Unavailable(format!("chaos: injected {operation} failure")));
        }
        Ok(())
    }
}

fn notifications_only(batch: &WriteBatch) -> bool {
    batch
        .writes()
        .iter()
        .all(|write| matches!(write, Write::Notification(_)))
}

#[async_trait]
impl<S> OrderStore for ChaosOrderStore<S>
where
    S: OrderStore,
{
    async fn product(&self, id: &ProductId) -> StoreResult<Option<Versioned<Product>>> {
        self.read_gate("product read")?;
        self.store.product(id).await
    }

    async fn order(&self, id: &OrderId) -> StoreResult<Option<Versioned<Order>>> {
        self.read_gate("order read")?;
        self.store.order(id).await
    }

    async fn payment(&self, id: &PaymentId) -> StoreResult<Option<Versioned<Payment>>> {
        self.read_gate("payment read")?;
        self.store.payment(id).await
    }

    async fn shipping(&self, order_id: &OrderId) -> StoreResult<Option<Versioned<ShippingRecord>>> {
        self.read_gate("shipping read")?;
        self.store.shipping(order_id).await
    }

    async fn orders_with_status(&self, status: OrderStatus) -> StoreResult<Vec<Versioned<Order>>> {
        self.read_gate("order scan")?;
        self.store.orders_with_status(status).await
    }

    async fn notifications(&self) -> StoreResult<Vec<Notification>> {
        self.store.notifications().await
    }

    async fn commit(&self, batch: WriteBatch) -> StoreResult<CommitReceipt> {
        if !notifications_only(&batch) {
            if self.should_inject(self.config.version_conflict_probability) {
                let key = batch
                    .writes()
                    .iter()
                    .find_map(Write::key)
                    .unwrap_or_else(|| DocumentKey::Order(OrderId::generate()));
                return Err(StoreError::VersionConflict {
                    key,
                    expected: ExpectedVersion::Any,
                    current: None,
                });
            }

            if self.should_inject(self.config.commit_failure_probability) {
                return Err(StoreError::Unavailable("chaos: injected commit failure".to_string()));
            }
        }

        self.store.commit(batch).await
    }

    fn subscribe(&self) -> ChangeFeed {
        self.store.subscribe()
    }
}
