//! Integration tests for `OrderCore`
//!
//! End-to-end scenarios running stock reservation, webhook ingestion, the
//! background status synchronizer and the reconciliation sweep against one
//! shared store.

// This is a test-only crate
#![cfg(test)]
