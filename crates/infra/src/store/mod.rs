//! Storage boundary of the stock ledger.
//!
//! The ledger (append-only movements) and the balance cache (current stock per
//! product) always live in the same backend so one transaction can cover both.

pub mod in_memory;
pub mod postgres;
pub mod query;
pub mod r#trait;

pub use in_memory::{FaultPoint, InMemoryStockStore};
pub use postgres::PostgresStockStore;
pub use query::{DEFAULT_LIMIT, LedgerFilter, LedgerOrder, MAX_LIMIT};
pub use r#trait::{
    BalanceCache, LedgerStore, LedgerTotal, LockedProduct, ProductCatalog, StockStore,
    StockTransaction, StoreError,
};
