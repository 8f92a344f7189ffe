//! Error types for `OrderCore`.
//!
//! Every component has its own error enum and all of them wrap the
//! port-level [`StoreError`]. The split follows who can act on a failure:
//!
//! - **StoreError**: persistence failures reported by an `OrderStore` adapter
//! - **ReservationError**: order creation failures, returned to the caller
//! - **WebhookError**: callback failures, mapped to 400/500 by the server
//! - **SyncError**: propagation failures, logged and recorded as notifications
//! - **SweepError**: failures of a whole sweep run
//!
//! Each error exposes `is_retryable` so callers can tell transient conditions
//! from permanent ones without matching on variants.

use crate::store::{DocumentKey, ExpectedVersion};
use crate::types::{DocVersion, ProductId};
use thiserror::Error;

/// Errors reported by an `OrderStore` adapter.
///
/// # Common Scenarios
///
/// - **VersionConflict**: another writer got there first; re-read and retry
/// - **NotFound**: the document does not exist
/// - **Unavailable**: connection or pool problems, usually transient
/// - **Serialization**: a stored document could not be encoded or decoded
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    /// The document's current version does not match the expected one.
    #[error("Version conflict on {key}: expected {expected}, found {current:?}")]
    VersionConflict {
        /// The document that was written
        key: DocumentKey,
        /// What the writer expected
        expected: ExpectedVersion,
        /// The version actually stored, `None` when absent
        current: Option<DocVersion>,
    },

    /// The requested document does not exist.
    #[error("Document not found: {0}")]
    NotFound(DocumentKey),

    /// The backing store could not be reached.
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// A document could not be serialized or deserialized.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// An unexpected internal error occurred.
    #[error("Internal store error: {0}")]
    Internal(String),
}

impl StoreError {
    /// Whether retrying the same unit of work may succeed.
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::VersionConflict { .. } | Self::Unavailable(_))
    }

    /// Whether this is an optimistic concurrency conflict.
    pub const fn is_conflict(&self) -> bool {
        matches!(self, Self::VersionConflict { .. })
    }
}

/// Errors returned by the stock reservation service.
#[derive(Debug, Clone, Error)]
pub enum ReservationError {
    /// The request is malformed or inconsistent.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// A product does not have enough stock for the requested quantity.
    #[error("Out of stock: product {product_id} requested {requested}, available {available}")]
    OutOfStock {
        /// The product that ran out
        product_id: ProductId,
        /// Total quantity requested across all lines for the product
        requested: u64,
        /// Stock available when the request was checked
        available: u64,
    },

    /// Concurrent writers kept conflicting until the retry budget ran out.
    #[error("Contention: gave up after {attempts} attempts")]
    Contention {
        /// Number of attempts made
        attempts: u32,
    },

    /// Any other failure, including store outages.
    #[error("Internal error: {0}")]
    Internal(#[source] StoreError),
}

impl ReservationError {
    /// Whether the caller may resubmit the same request later.
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Contention { .. } => true,
            Self::Internal(store) => store.is_retryable(),
            Self::InvalidInput(_) | Self::OutOfStock { .. } => false,
        }
    }
}

/// Errors returned by webhook ingestion.
#[derive(Debug, Clone, Error)]
pub enum WebhookError {
    /// The payload is missing a required field. Nothing was written.
    #[error("Rejected callback: {0}")]
    Rejected(String),

    /// The callback was valid but could not be applied.
    #[error("Callback failed: {0}")]
    Failed(#[source] StoreError),
}

impl WebhookError {
    /// Whether the failure is the caller's fault.
    pub const fn is_client_error(&self) -> bool {
        matches!(self, Self::Rejected(_))
    }

    /// Whether the provider redelivering the callback may succeed.
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Failed(_))
    }
}

/// Errors raised while applying a synchronization action.
#[derive(Debug, Clone, Error)]
pub enum SyncError {
    /// The store failed, possibly after exhausting conflict retries.
    #[error("Sync store error: {0}")]
    Store(#[from] StoreError),

    /// The target of an action no longer exists.
    #[error("Sync target missing: {0}")]
    MissingTarget(DocumentKey),
}

impl SyncError {
    /// Whether the action may succeed when replayed.
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Store(store) => store.is_retryable(),
            Self::MissingTarget(_) => false,
        }
    }
}

/// Errors that abort a whole sweep run.
#[derive(Debug, Clone, Error)]
pub enum SweepError {
    /// Scanning or committing failed.
    #[error("Sweep store error: {0}")]
    Store(#[from] StoreError),
}

impl SweepError {
    /// Whether the next scheduled run may succeed.
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Store(store) => store.is_retryable(),
        }
    }
}

/// Result alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;
