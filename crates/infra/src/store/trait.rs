use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use stockledger_core::{MovementId, ProductId, UserId};
use stockledger_inventory::{Movement, MovementError, NewMovement, Product, ProductFilter, User};

use super::query::LedgerFilter;

/// Storage operation error.
///
/// These are **infrastructure errors** (IO, constraints, lock contention) as
/// opposed to domain errors (validation, invariants).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("duplicate name: {0}")]
    DuplicateName(String),

    #[error("foreign key violation: {0}")]
    ForeignKey(String),

    /// A conditional write found state other than expected.
    #[error("conflict: {0}")]
    Conflict(String),

    /// A row lock (or pooled connection) could not be acquired in time.
    #[error("busy: {0}")]
    Busy(String),

    #[error("backend failure: {0}")]
    Backend(String),
}

impl From<StoreError> for MovementError {
    fn from(value: StoreError) -> Self {
        match value {
            StoreError::Busy(msg) => MovementError::Busy(msg),
            other => MovementError::Storage(other.to_string()),
        }
    }
}

/// A product row as read under its write lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockedProduct {
    pub product_id: ProductId,
    pub balance: i64,
    pub active: bool,
}

/// Grouped ledger sum for one product.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerTotal {
    pub sum: i64,
    pub movement_count: u64,
}

/// Products and users, the reference data movements point at.
///
/// Products are never hard-deleted; deactivation flips `active` and leaves
/// the balance and history untouched.
#[async_trait::async_trait]
pub trait ProductCatalog: Send + Sync {
    /// Insert a new product. Fails with `DuplicateName` when an active product
    /// already uses the name (case-insensitive).
    async fn insert_product(&self, product: &Product) -> Result<(), StoreError>;

    /// Overwrite name, unit, min stock and supplier. Never touches the balance
    /// or the active flag.
    async fn update_product_details(&self, product: &Product) -> Result<(), StoreError>;

    /// Soft-delete. Waits for any in-flight movement on the product to finish.
    async fn deactivate_product(&self, product_id: ProductId) -> Result<(), StoreError>;

    async fn get_product(&self, product_id: ProductId) -> Result<Option<Product>, StoreError>;

    /// Products matching the filter, ordered by name ascending.
    async fn list_products(&self, filter: &ProductFilter) -> Result<Vec<Product>, StoreError>;

    async fn insert_user(&self, user: &User) -> Result<(), StoreError>;

    async fn get_user(&self, user_id: UserId) -> Result<Option<User>, StoreError>;

    async fn find_user_by_username(&self, username: &str) -> Result<Option<User>, StoreError>;

    async fn deactivate_user(&self, user_id: UserId) -> Result<(), StoreError>;
}

/// Append-only ledger of movements (read side).
///
/// Appends only happen inside a [`StockTransaction`]; nothing here (or
/// anywhere) updates or deletes a committed movement.
#[async_trait::async_trait]
pub trait LedgerStore: Send + Sync {
    /// Movements matching the filter, bounded by its limit.
    ///
    /// Calling again with the same filter restarts from the beginning.
    async fn query(&self, filter: &LedgerFilter) -> Result<Vec<Movement>, StoreError>;

    /// Signed sums grouped by product. Every requested id is present in the
    /// result; products without movements total zero.
    async fn ledger_totals(
        &self,
        product_ids: &[ProductId],
    ) -> Result<HashMap<ProductId, LedgerTotal>, StoreError>;
}

/// Denormalized current stock per product.
#[async_trait::async_trait]
pub trait BalanceCache: Send + Sync {
    /// Current balance; `NotFound` if the product does not exist. Inactive
    /// products still report their balance.
    async fn read(&self, product_id: ProductId) -> Result<i64, StoreError>;

    /// Balances for the given products; unknown ids are omitted.
    async fn read_many(&self, product_ids: &[ProductId]) -> Result<HashMap<ProductId, i64>, StoreError>;
}

/// One atomic unit of work scoped to a single locked product.
///
/// The product's row lock is held from `begin` until `commit`/`rollback` (or
/// drop, which rolls back). Staged writes become visible to readers together
/// at commit, or not at all.
#[async_trait::async_trait]
pub trait StockTransaction: Send {
    /// The product row as read when the lock was acquired.
    fn locked(&self) -> &LockedProduct;

    /// Ledger append. Fails with `ForeignKey` if the product or actor does not
    /// exist.
    async fn append(&mut self, movement: NewMovement) -> Result<MovementId, StoreError>;

    /// Conditionally add `delta` to the balance. Fails with `Conflict` if the
    /// balance is not `expected_prior`.
    async fn apply_delta(
        &mut self,
        product_id: ProductId,
        delta: i64,
        expected_prior: i64,
    ) -> Result<i64, StoreError>;

    /// Ledger sum for the locked product, including anything staged here.
    async fn ledger_total(&mut self) -> Result<LedgerTotal, StoreError>;

    /// Overwrite the balance (reconciliation only).
    async fn reset_balance(&mut self, balance: i64) -> Result<(), StoreError>;

    async fn commit(&mut self) -> Result<(), StoreError>;

    /// Discard staged writes and release the lock. No-op once finished.
    async fn rollback(&mut self) -> Result<(), StoreError>;
}

/// Full storage boundary of the ledger.
#[async_trait::async_trait]
pub trait StockStore: ProductCatalog + LedgerStore + BalanceCache {
    /// Open a transaction holding the product's write lock.
    ///
    /// Waits at most `lock_wait` for the lock, then fails with `Busy`. Fails
    /// with `NotFound` if the product does not exist. Transactions on
    /// different products never wait on each other.
    async fn begin(
        &self,
        product_id: ProductId,
        lock_wait: Duration,
    ) -> Result<Box<dyn StockTransaction>, StoreError>;
}
