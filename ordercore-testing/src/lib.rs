//! Test support for `OrderCore`.
//!
//! - [`contract`]: behavioural suite every `OrderStore` adapter must pass
//! - [`chaos`]: a store wrapper injecting conflicts and outages
//! - [`fixtures`]: builders and seeding helpers for tests and benchmarks

#![forbid(unsafe_code)]
#![deny(rust_2018_idioms, unused_imports, unused_must_use, unused_mut, unused_variables)]

pub mod chaos;
pub mod contract;
pub mod fixtures;

pub use chaos::{ChaosConfig, ChaosOrderStore, ChaosOrderStoreExt};
