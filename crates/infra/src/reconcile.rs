//! Reconciliation: recompute a balance from the ledger and compare it with the
//! cache. The cache is derived data; `rebuild` overwrites it from the ledger.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{error, info, instrument, warn};

use stockledger_core::ProductId;
use stockledger_inventory::ProductFilter;

use crate::movement_service::DEFAULT_LOCK_WAIT;
use crate::store::{LedgerTotal, StockStore, StockTransaction, StoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconciliationReport {
    pub product_id: ProductId,
    pub cached: i64,
    pub ledger_sum: i64,
    pub movement_count: u64,
    pub consistent: bool,
}

impl ReconciliationReport {
    pub fn new(product_id: ProductId, cached: i64, total: LedgerTotal) -> Self {
        Self {
            product_id,
            cached,
            ledger_sum: total.sum,
            movement_count: total.movement_count,
            consistent: cached == total.sum,
        }
    }

    pub fn is_consistent(&self) -> bool {
        self.consistent
    }

    /// How far the cache is behind the ledger.
    pub fn drift(&self) -> i64 {
        self.ledger_sum - self.cached
    }
}

#[derive(Debug)]
pub struct Reconciler<S: ?Sized> {
    store: Arc<S>,
    lock_wait: Duration,
}

impl<S: ?Sized> Clone for Reconciler<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            lock_wait: self.lock_wait,
        }
    }
}

impl<S: StockStore + ?Sized> Reconciler<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self {
            store,
            lock_wait: DEFAULT_LOCK_WAIT,
        }
    }

    pub fn with_lock_wait(mut self, lock_wait: Duration) -> Self {
        self.lock_wait = lock_wait;
        self
    }

    /// Compare cache and ledger for one product.
    ///
    /// Taken under the product's write lock so no movement is half-applied.
    #[instrument(skip(self), fields(product_id = %product_id), err)]
    pub async fn check(&self, product_id: ProductId) -> Result<ReconciliationReport, StoreError> {
        let mut tx = self.store.begin(product_id, self.lock_wait).await?;
        let report = read_report(tx.as_mut()).await;
        release(tx.as_mut()).await;

        let report = report?;
        if !report.is_consistent() {
            warn!(
                cached = report.cached,
                ledger_sum = report.ledger_sum,
                drift = report.drift(),
                "balance drifted from ledger"
            );
        }
        Ok(report)
    }

    /// Check every product matching the filter, in name order.
    #[instrument(skip(self, filter), err)]
    pub async fn check_all(&self, filter: &ProductFilter) -> Result<Vec<ReconciliationReport>, StoreError> {
        let products = self.store.list_products(filter).await?;
        let mut reports = Vec::with_capacity(products.len());
        for product in &products {
            reports.push(self.check(product.id).await?);
        }

        let drifted = reports.iter().filter(|r| !r.is_consistent()).count();
        info!(checked = reports.len(), drifted, "reconciliation finished");
        Ok(reports)
    }

    /// Overwrite the cached balance with the ledger sum.
    ///
    /// Returns the report taken before the rebuild. A consistent product is
    /// left untouched.
    #[instrument(skip(self), fields(product_id = %product_id), err)]
    pub async fn rebuild(&self, product_id: ProductId) -> Result<ReconciliationReport, StoreError> {
        let mut tx = self.store.begin(product_id, self.lock_wait).await?;

        match rebuild_locked(tx.as_mut()).await {
            Ok(report) => {
                if !report.is_consistent() {
                    info!(from = report.cached, to = report.ledger_sum, "balance rebuilt from ledger");
                }
                Ok(report)
            }
            Err(err) => {
                release(tx.as_mut()).await;
                Err(err)
            }
        }
    }
}

async fn read_report(tx: &mut dyn StockTransaction) -> Result<ReconciliationReport, StoreError> {
    let locked = *tx.locked();
    let total = tx.ledger_total().await?;
    Ok(ReconciliationReport::new(locked.product_id, locked.balance, total))
}

async fn rebuild_locked(tx: &mut dyn StockTransaction) -> Result<ReconciliationReport, StoreError> {
    let report = read_report(tx).await?;
    if report.is_consistent() {
        tx.rollback().await?;
        return Ok(report);
    }
    if report.ledger_sum < 0 {
        return Err(StoreError::Conflict(format!(
            "ledger for {} sums to {}",
            report.product_id, report.ledger_sum
        )));
    }

    tx.reset_balance(report.ledger_sum).await?;
    tx.commit().await?;
    Ok(report)
}

async fn release(tx: &mut dyn StockTransaction) {
    if let Err(err) = tx.rollback().await {
        error!(error = %err, "rollback failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::movement_service::MovementService;
    use crate::store::{InMemoryStockStore, ProductCatalog};
    use chrono::Utc;
    use stockledger_core::UserId;
    use stockledger_inventory::{MovementRequest, NewProduct, NewUser, Product, User};

    #[tokio::test]
    async fn fresh_product_is_consistent() {
        let store = Arc::new(InMemoryStockStore::new());
        let p = Product::create(ProductId::new(), NewProduct::new("Valve", "pcs"), Utc::now());
        store.insert_product(&p).await.unwrap();

        let report = Reconciler::new(store).check(p.id).await.unwrap();
        assert!(report.is_consistent());
        assert_eq!(report.movement_count, 0);
        assert_eq!(report.drift(), 0);
    }

    #[tokio::test]
    async fn rebuild_of_consistent_product_changes_nothing() {
        let store = Arc::new(InMemoryStockStore::new());
        let p = Product::create(ProductId::new(), NewProduct::new("Valve", "pcs"), Utc::now());
        let u = User::create(UserId::new(), NewUser::staff("ops"), Utc::now());
        store.insert_product(&p).await.unwrap();
        store.insert_user(&u).await.unwrap();

        let service = MovementService::new(Arc::clone(&store));
        service.record(&MovementRequest::receipt(p.id, u.id, 9).unwrap()).await.unwrap();

        let reconciler = Reconciler::new(Arc::clone(&store));
        let report = reconciler.rebuild(p.id).await.unwrap();
        assert!(report.is_consistent());
        assert_eq!(report.ledger_sum, 9);
        assert_eq!(reconciler.check(p.id).await.unwrap(), report);
    }

    #[tokio::test]
    async fn unknown_product_is_not_found() {
        let reconciler = Reconciler::new(Arc::new(InMemoryStockStore::new()));
        assert!(matches!(
            reconciler.check(ProductId::new()).await,
            Err(StoreError::NotFound(_))
        ));
    }
}
