//! `OrderCore` - order lifecycle and inventory consistency engine
//!
//! The engine keeps commerce orders consistent across three loosely coupled
//! signals: stock, payment and shipment.
//!
//! - [`reservation`] creates orders while atomically reserving stock, so
//!   concurrent buyers can never oversell a product.
//! - [`webhook`] turns provider callbacks into order mutations with an audit
//!   trail.
//! - [`sync`] propagates payment and shipping status changes.
//! - [`sweep`] periodically resolves orders left pending.
//!
//! All of them persist through the [`store::OrderStore`] port and share the
//! transition function in [`lifecycle`].

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod catalog;
pub mod clock;
pub mod config;
pub mod engine;
pub mod errors;
pub mod lifecycle;
pub mod model;
pub mod reservation;
pub mod retry;
pub mod store;
pub mod sweep;
pub mod sync;
pub mod types;
pub mod webhook;

pub use engine::Engine;
pub use errors::{ReservationError, StoreError, StoreResult, SweepError, SyncError, WebhookError};
pub use store::OrderStore;
