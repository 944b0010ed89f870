//! Movement failure taxonomy.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Why a proposed movement was not recorded.
///
/// Every variant guarantees that no state changed. The first four are detected
/// before any mutation; `InsufficientStock` is detected under the product's
/// write lock; `Busy` and `Storage` come from the store.
#[derive(Debug, Error, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MovementError {
    /// Magnitude was zero, negative, unparsable or out of range.
    #[error("invalid quantity: {0}")]
    InvalidQuantity(String),

    /// Kind was neither a receipt nor an issue.
    #[error("invalid movement kind: {0}")]
    InvalidKind(String),

    /// Product does not exist, or was soft-deleted.
    #[error("product is inactive or missing")]
    ProductInactiveOrMissing,

    /// Actor does not exist, or was deactivated.
    #[error("actor is missing")]
    ActorMissing,

    /// Applying the movement would take the balance below zero.
    #[error("insufficient stock (available: {available}, requested: {requested})")]
    InsufficientStock { available: i64, requested: i64 },

    /// The product's write lock could not be acquired in time.
    #[error("product is busy: {0}")]
    Busy(String),

    /// The store failed; the transaction was rolled back.
    #[error("storage error: {0}")]
    Storage(String),
}

impl MovementError {
    pub fn invalid_quantity(msg: impl Into<String>) -> Self {
        Self::InvalidQuantity(msg.into())
    }

    pub fn invalid_kind(msg: impl Into<String>) -> Self {
        Self::InvalidKind(msg.into())
    }

    /// Failures detected from the request and catalog alone, before any
    /// transaction is opened.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::InvalidQuantity(_)
                | Self::InvalidKind(_)
                | Self::ProductInactiveOrMissing
                | Self::ActorMissing
        )
    }

    /// Transient failures a caller may retry unchanged.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Busy(_))
    }
}
