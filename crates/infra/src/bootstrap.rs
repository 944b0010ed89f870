//! Store and service wiring from configuration.

use std::sync::Arc;

use tracing::info;

use crate::catalog::CatalogService;
use crate::config::{LedgerConfig, StoreBackend};
use crate::movement_service::MovementService;
use crate::reconcile::Reconciler;
use crate::stock_levels::StockLevels;
use crate::store::{InMemoryStockStore, PostgresStockStore, StockStore, StoreError};

/// Open the configured store. The Postgres path applies the schema.
pub async fn connect(config: &LedgerConfig) -> Result<Arc<dyn StockStore>, StoreError> {
    match &config.backend {
        StoreBackend::InMemory => {
            info!("using in-memory stock store");
            Ok(Arc::new(InMemoryStockStore::new()))
        }
        StoreBackend::Postgres {
            database_url,
            max_connections,
        } => {
            let store = PostgresStockStore::connect(database_url, *max_connections).await?;
            store.ensure_schema().await?;
            info!(max_connections, "using postgres stock store");
            Ok(Arc::new(store))
        }
    }
}

/// Every service over one shared store.
#[derive(Clone)]
pub struct Ledger {
    pub movements: MovementService<dyn StockStore>,
    pub catalog: CatalogService<dyn StockStore>,
    pub levels: StockLevels<dyn StockStore>,
    pub reconciler: Reconciler<dyn StockStore>,
}

impl Ledger {
    pub fn new(store: Arc<dyn StockStore>, config: &LedgerConfig) -> Self {
        Self {
            movements: MovementService::new(Arc::clone(&store)).with_lock_wait(config.lock_wait),
            catalog: CatalogService::new(Arc::clone(&store)),
            levels: StockLevels::new(Arc::clone(&store))
                .with_recent_limit(config.recent_movements_limit),
            reconciler: Reconciler::new(store).with_lock_wait(config.lock_wait),
        }
    }

    pub async fn connect(config: &LedgerConfig) -> Result<Self, StoreError> {
        let store = connect(config).await?;
        Ok(Self::new(store, config))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stockledger_inventory::{MovementRequest, NewProduct, ProductFilter};

    #[tokio::test]
    async fn in_memory_ledger_wires_services_to_one_store() {
        let ledger = Ledger::connect(&LedgerConfig::default()).await.unwrap();

        let product = ledger
            .catalog
            .create_product(NewProduct::new("Widget", "pcs"))
            .await
            .unwrap();
        let admin = ledger.catalog.ensure_admin("admin").await.unwrap();
        ledger
            .movements
            .record(&MovementRequest::receipt(product, admin, 3).unwrap())
            .await
            .unwrap();

        let overview = ledger.levels.overview(&ProductFilter::default(), 10).await.unwrap();
        assert_eq!(overview.levels[0].current_stock, 3);
        assert_eq!(overview.recent.len(), 1);
        assert!(ledger.reconciler.check(product).await.unwrap().is_consistent());
    }

    #[tokio::test]
    async fn recent_movements_limit_sizes_the_dashboard_window() {
        let config = LedgerConfig {
            recent_movements_limit: 2,
            ..LedgerConfig::default()
        };
        let ledger = Ledger::connect(&config).await.unwrap();
        assert_eq!(ledger.levels.recent_limit(), 2);

        let product = ledger
            .catalog
            .create_product(NewProduct::new("Widget", "pcs"))
            .await
            .unwrap();
        let admin = ledger.catalog.ensure_admin("admin").await.unwrap();
        for qty in 1..=4 {
            ledger
                .movements
                .record(&MovementRequest::receipt(product, admin, qty).unwrap())
                .await
                .unwrap();
        }

        let dashboard = ledger.levels.dashboard(&ProductFilter::default()).await.unwrap();
        let window: Vec<i64> = dashboard.recent.iter().map(|m| m.signed_quantity).collect();
        assert_eq!(window, vec![4, 3]);
        assert_eq!(dashboard.levels[0].current_stock, 10);
    }
}
