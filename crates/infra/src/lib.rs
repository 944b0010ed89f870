//! Infrastructure layer: storage adapters, the movement transaction boundary,
//! catalog administration, dashboard reads, reconciliation and configuration.

pub mod bootstrap;
pub mod catalog;
pub mod config;
pub mod movement_service;
pub mod reconcile;
pub mod stock_levels;
pub mod store;

pub use catalog::{CatalogError, CatalogService};
pub use config::{ConfigError, LedgerConfig, StoreBackend};
pub use movement_service::{DEFAULT_LOCK_WAIT, MovementService, RecordedMovement};
pub use reconcile::{ReconciliationReport, Reconciler};
pub use stock_levels::{DEFAULT_RECENT_LIMIT, StockLevels, StockOverview};

#[cfg(test)]
mod integration_tests;
