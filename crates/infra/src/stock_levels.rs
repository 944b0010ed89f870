//! Dashboard reads over the balance cache and the ledger.
//!
//! The fast path reads stored balances. The slow path sums the ledger grouped
//! by product and exists for verification; both agree whenever no movement is
//! in flight.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::instrument;

use stockledger_core::ProductId;
use stockledger_inventory::{Movement, ProductFilter, StockLevel};

use crate::store::{LedgerFilter, StockStore, StoreError};

/// Product rows plus the latest movements.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockOverview {
    pub levels: Vec<StockLevel>,
    pub recent: Vec<Movement>,
    /// Active products whose stock is strictly below their reorder threshold.
    pub low_stock: Vec<ProductId>,
}

/// Recent-movements window used by [`StockLevels::dashboard`] unless configured.
pub const DEFAULT_RECENT_LIMIT: u32 = 10;

#[derive(Debug)]
pub struct StockLevels<S: ?Sized> {
    store: Arc<S>,
    recent_limit: u32,
}

impl<S: ?Sized> Clone for StockLevels<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            recent_limit: self.recent_limit,
        }
    }
}

impl<S: StockStore + ?Sized> StockLevels<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self {
            store,
            recent_limit: DEFAULT_RECENT_LIMIT,
        }
    }

    pub fn with_recent_limit(mut self, recent_limit: u32) -> Self {
        self.recent_limit = recent_limit;
        self
    }

    pub fn recent_limit(&self) -> u32 {
        self.recent_limit
    }

    /// [`Self::overview`] with the configured recent-movements window.
    pub async fn dashboard(&self, filter: &ProductFilter) -> Result<StockOverview, StoreError> {
        self.overview(filter, self.recent_limit).await
    }

    /// Stock per product matching `filter`, and the `recent_limit` newest
    /// movements for the same text filter.
    #[instrument(skip(self, filter), err)]
    pub async fn overview(
        &self,
        filter: &ProductFilter,
        recent_limit: u32,
    ) -> Result<StockOverview, StoreError> {
        let products = self.store.list_products(filter).await?;
        let levels: Vec<StockLevel> = products.iter().map(StockLevel::from).collect();
        let low_stock = levels
            .iter()
            .filter(|l| l.active && l.below_min)
            .map(|l| l.product_id)
            .collect();

        let mut recent_filter = LedgerFilter::recent(recent_limit);
        recent_filter.product_text = filter.text.clone();
        let recent = self.store.query(&recent_filter).await?;

        Ok(StockOverview {
            levels,
            recent,
            low_stock,
        })
    }

    /// Fast path: stored balances. Unknown ids are omitted.
    pub async fn balances(&self, product_ids: &[ProductId]) -> Result<HashMap<ProductId, i64>, StoreError> {
        self.store.read_many(product_ids).await
    }

    /// Slow path: signed ledger sums. Products without movements total zero.
    pub async fn ledger_totals(
        &self,
        product_ids: &[ProductId],
    ) -> Result<HashMap<ProductId, i64>, StoreError> {
        let totals = self.store.ledger_totals(product_ids).await?;
        Ok(totals.into_iter().map(|(id, t)| (id, t.sum)).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{InMemoryStockStore, ProductCatalog};
    use chrono::Utc;
    use stockledger_inventory::{NewProduct, Product};

    #[tokio::test]
    async fn overview_flags_products_below_min() {
        let store = Arc::new(InMemoryStockStore::new());
        let low = Product::create(
            ProductId::new(),
            NewProduct::new("Gasket", "pcs").with_min_stock(2),
            Utc::now(),
        );
        let fine = Product::create(ProductId::new(), NewProduct::new("Hose", "m"), Utc::now());
        store.insert_product(&low).await.unwrap();
        store.insert_product(&fine).await.unwrap();

        let overview = StockLevels::new(store)
            .overview(&ProductFilter::default(), 10)
            .await
            .unwrap();

        assert_eq!(overview.levels.len(), 2);
        assert_eq!(overview.levels[0].name, "Gasket");
        assert_eq!(overview.low_stock, vec![low.id]);
        assert!(overview.recent.is_empty());
    }

    #[tokio::test]
    async fn products_without_movements_total_zero() {
        let store = Arc::new(InMemoryStockStore::new());
        let p = Product::create(ProductId::new(), NewProduct::new("Hose", "m"), Utc::now());
        store.insert_product(&p).await.unwrap();

        let levels = StockLevels::new(store);
        assert_eq!(levels.ledger_totals(&[p.id]).await.unwrap()[&p.id], 0);
        assert_eq!(levels.balances(&[p.id]).await.unwrap()[&p.id], 0);
        assert!(levels.balances(&[ProductId::new()]).await.unwrap().is_empty());
    }
}
