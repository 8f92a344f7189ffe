//! Catalog collaborator used to check submitted unit prices.

use std::collections::HashMap;

use async_trait::async_trait;

use crate::types::{Money, ProductId};

/// Source of authoritative product prices.
#[async_trait]
pub trait Catalog: Send + Sync {
    /// Current unit price of a product, `None` when the catalog does not
    /// list it.
    async fn unit_price(&self, product_id: &ProductId) -> Option<Money>;
}

/// A fixed price list.
#[derive(Debug, Clone, Default)]
pub struct StaticCatalog {
    prices: HashMap<ProductId, Money>,
}

impl StaticCatalog {
    /// An empty price list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces a price.
    #[must_use]
    pub fn with_price(mut self, product_id: ProductId, price: Money) -> Self {
        self.prices.insert(product_id, price);
        self
    }
}

#[async_trait]
impl Catalog for StaticCatalog {
    async fn unit_price(&self, product_id: &ProductId) -> Option<Money> {
        self.prices.get(product_id).copied()
    }
}
