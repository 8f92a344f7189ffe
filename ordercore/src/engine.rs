//! The engine context: store, clock and configuration, built once and
//! handed to every component.

use std::sync::Arc;

use crate::catalog::Catalog;
use crate::clock::{Clock, SystemClock};
use crate::config::EngineConfig;
use crate::reservation::StockReservationService;
use crate::store::OrderStore;
use crate::sweep::ReconciliationSweep;
use crate::sync::StatusSynchronizer;
use crate::types::Timestamp;
use crate::webhook::WebhookIngestion;

/// Shared dependencies of the engine components.
///
/// Cloning is cheap; all clones share the same store and clock.
#[derive(Clone)]
pub struct Engine {
    store: Arc<dyn OrderStore>,
    clock: Arc<dyn Clock>,
    catalog: Option<Arc<dyn Catalog>>,
    config: EngineConfig,
}

impl Engine {
    /// An engine over `store` using the wall clock and default configuration.
    pub fn new(store: Arc<dyn OrderStore>) -> Self {
        Self {
            store,
            clock: Arc::new(SystemClock),
            catalog: None,
            config: EngineConfig::default(),
        }
    }

    /// Replaces the clock.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Enables catalog price checks on order creation.
    #[must_use]
    pub fn with_catalog(mut self, catalog: Arc<dyn Catalog>) -> Self {
        self.catalog = Some(catalog);
        self
    }

    /// Replaces the configuration.
    #[must_use]
    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// The store.
    pub fn store(&self) -> &Arc<dyn OrderStore> {
        &self.store
    }

    /// The configured catalog, if any.
    pub fn catalog(&self) -> Option<&Arc<dyn Catalog>> {
        self.catalog.as_ref()
    }

    /// The configuration.
    pub const fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// The current instant according to the engine clock.
    pub fn now(&self) -> Timestamp {
        self.clock.now()
    }

    /// The stock reservation service.
    pub fn reservations(&self) -> StockReservationService {
        StockReservationService::new(self.clone())
    }

    /// The webhook ingestion service.
    pub fn webhooks(&self) -> WebhookIngestion {
        WebhookIngestion::new(self.clone())
    }

    /// The reconciliation sweep.
    pub fn sweep(&self) -> ReconciliationSweep {
        ReconciliationSweep::new(self.clone())
    }

    /// A status synchronizer with the payment and shipping rules registered.
    pub fn synchronizer(&self) -> StatusSynchronizer {
        StatusSynchronizer::with_default_rules(self.clone())
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("config", &self.config)
            .field("catalog", &self.catalog.is_some())
            .finish_non_exhaustive()
    }
}
