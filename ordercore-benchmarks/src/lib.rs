//! `OrderCore` benchmarks.
//!
//! The benchmarks live under `benches/`:
//!
//! - `reservation_contention`: order creation with and without buyers
//!   competing for the same product
//! - `lifecycle`: webhook ingestion and reconciliation sweeps over many orders
