use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::OwnedMutexGuard;

use stockledger_core::{MovementId, ProductId, UserId};
use stockledger_inventory::{Movement, NewMovement, Product, ProductFilter, User, matches_text};

use super::query::{LedgerFilter, LedgerOrder};
use super::r#trait::{
    BalanceCache, LedgerStore, LedgerTotal, LockedProduct, ProductCatalog, StockStore,
    StockTransaction, StoreError,
};

/// Where an armed fault fires inside the next transaction.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum FaultPoint {
    /// After the ledger append was staged, before the balance update.
    BeforeBalanceUpdate,
    /// At commit, after both writes were staged.
    Commit,
}

#[derive(Debug, Default)]
struct State {
    products: HashMap<ProductId, Product>,
    users: HashMap<UserId, User>,
    /// Committed movements in commit order.
    ledger: Vec<Movement>,
    last_created_at: Option<DateTime<Utc>>,
}

impl State {
    fn name_taken(&self, name_key: &str, except: Option<ProductId>) -> bool {
        self.products
            .values()
            .any(|p| p.active && Some(p.id) != except && p.name_key() == name_key)
    }
}

#[derive(Debug, Default)]
struct Inner {
    state: RwLock<State>,
    row_locks: Mutex<HashMap<ProductId, Arc<tokio::sync::Mutex<()>>>>,
    next_movement: AtomicU64,
    fault: Mutex<Option<FaultPoint>>,
}

impl Inner {
    fn read_state(&self) -> Result<RwLockReadGuard<'_, State>, StoreError> {
        self.state
            .read()
            .map_err(|_| StoreError::Backend("state lock poisoned".to_string()))
    }

    fn write_state(&self) -> Result<RwLockWriteGuard<'_, State>, StoreError> {
        self.state
            .write()
            .map_err(|_| StoreError::Backend("state lock poisoned".to_string()))
    }

    fn row_lock(&self, product_id: ProductId) -> Result<Arc<tokio::sync::Mutex<()>>, StoreError> {
        let mut locks = self
            .row_locks
            .lock()
            .map_err(|_| StoreError::Backend("row lock table poisoned".to_string()))?;
        Ok(locks.entry(product_id).or_default().clone())
    }

    /// Disarm and report whether `point` was armed.
    fn take_fault(&self, point: FaultPoint) -> bool {
        match self.fault.lock() {
            Ok(mut armed) if *armed == Some(point) => {
                *armed = None;
                true
            }
            _ => false,
        }
    }
}

/// In-memory stock store.
///
/// Intended for tests/dev. Each product has its own async mutex standing in
/// for a row lock; the shared state lock is only held for short, non-async
/// critical sections, so it never serializes transactions on different
/// products.
#[derive(Debug, Clone, Default)]
pub struct InMemoryStockStore {
    inner: Arc<Inner>,
}

impl InMemoryStockStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm a one-shot failure for the next transaction reaching `point`.
    pub fn inject_fault(&self, point: FaultPoint) {
        if let Ok(mut armed) = self.inner.fault.lock() {
            *armed = Some(point);
        }
    }

    /// Number of committed movements across all products.
    pub fn ledger_len(&self) -> usize {
        self.inner.read_state().map(|s| s.ledger.len()).unwrap_or(0)
    }
}

#[async_trait::async_trait]
impl ProductCatalog for InMemoryStockStore {
    async fn insert_product(&self, product: &Product) -> Result<(), StoreError> {
        let mut state = self.inner.write_state()?;
        if state.products.contains_key(&product.id) {
            return Err(StoreError::Conflict(format!("product {} already exists", product.id)));
        }
        if product.active && state.name_taken(&product.name_key(), None) {
            return Err(StoreError::DuplicateName(product.name.clone()));
        }
        state.products.insert(product.id, product.clone());
        Ok(())
    }

    async fn update_product_details(&self, product: &Product) -> Result<(), StoreError> {
        let mut state = self.inner.write_state()?;
        let active = match state.products.get(&product.id) {
            Some(existing) => existing.active,
            None => return Err(StoreError::NotFound(format!("product {}", product.id))),
        };
        if active && state.name_taken(&product.name_key(), Some(product.id)) {
            return Err(StoreError::DuplicateName(product.name.clone()));
        }
        if let Some(existing) = state.products.get_mut(&product.id) {
            existing.name = product.name.clone();
            existing.unit = product.unit.clone();
            existing.min_stock = product.min_stock;
            existing.supplier = product.supplier.clone();
        }
        Ok(())
    }

    async fn deactivate_product(&self, product_id: ProductId) -> Result<(), StoreError> {
        let row = self.inner.row_lock(product_id)?;
        let _guard = row.lock().await;

        let mut state = self.inner.write_state()?;
        let product = state
            .products
            .get_mut(&product_id)
            .ok_or_else(|| StoreError::NotFound(format!("product {product_id}")))?;
        product.active = false;
        Ok(())
    }

    async fn get_product(&self, product_id: ProductId) -> Result<Option<Product>, StoreError> {
        Ok(self.inner.read_state()?.products.get(&product_id).cloned())
    }

    async fn list_products(&self, filter: &ProductFilter) -> Result<Vec<Product>, StoreError> {
        let state = self.inner.read_state()?;
        let mut products: Vec<Product> = state
            .products
            .values()
            .filter(|p| filter.matches(p))
            .cloned()
            .collect();
        products.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.id.as_uuid().cmp(b.id.as_uuid())));
        Ok(products)
    }

    async fn insert_user(&self, user: &User) -> Result<(), StoreError> {
        let mut state = self.inner.write_state()?;
        if state.users.contains_key(&user.id) {
            return Err(StoreError::Conflict(format!("user {} already exists", user.id)));
        }
        if state.users.values().any(|u| u.username == user.username) {
            return Err(StoreError::DuplicateName(user.username.clone()));
        }
        state.users.insert(user.id, user.clone());
        Ok(())
    }

    async fn get_user(&self, user_id: UserId) -> Result<Option<User>, StoreError> {
        Ok(self.inner.read_state()?.users.get(&user_id).cloned())
    }

    async fn find_user_by_username(&self, username: &str) -> Result<Option<User>, StoreError> {
        let state = self.inner.read_state()?;
        Ok(state.users.values().find(|u| u.username == username).cloned())
    }

    async fn deactivate_user(&self, user_id: UserId) -> Result<(), StoreError> {
        let mut state = self.inner.write_state()?;
        let user = state
            .users
            .get_mut(&user_id)
            .ok_or_else(|| StoreError::NotFound(format!("user {user_id}")))?;
        user.active = false;
        Ok(())
    }
}

#[async_trait::async_trait]
impl LedgerStore for InMemoryStockStore {
    async fn query(&self, filter: &LedgerFilter) -> Result<Vec<Movement>, StoreError> {
        let state = self.inner.read_state()?;
        let needle = filter.text_needle();

        let matching = |m: &&Movement| {
            filter.matches(m)
                && needle.as_deref().is_none_or(|n| {
                    state
                        .products
                        .get(&m.product_id)
                        .is_some_and(|p| matches_text(p, n))
                })
        };

        // Same order as the Postgres index: created_at, then id.
        let mut rows: Vec<&Movement> = state.ledger.iter().filter(matching).collect();
        rows.sort_by_key(|m| (m.created_at, m.id));
        if filter.order == LedgerOrder::NewestFirst {
            rows.reverse();
        }

        Ok(rows
            .into_iter()
            .take(filter.effective_limit())
            .cloned()
            .collect())
    }

    async fn ledger_totals(
        &self,
        product_ids: &[ProductId],
    ) -> Result<HashMap<ProductId, LedgerTotal>, StoreError> {
        let state = self.inner.read_state()?;
        let mut totals: HashMap<ProductId, LedgerTotal> = product_ids
            .iter()
            .map(|id| (*id, LedgerTotal::default()))
            .collect();

        for m in &state.ledger {
            if let Some(total) = totals.get_mut(&m.product_id) {
                total.sum += m.signed_quantity;
                total.movement_count += 1;
            }
        }
        Ok(totals)
    }
}

#[async_trait::async_trait]
impl BalanceCache for InMemoryStockStore {
    async fn read(&self, product_id: ProductId) -> Result<i64, StoreError> {
        self.inner
            .read_state()?
            .products
            .get(&product_id)
            .map(|p| p.current_stock)
            .ok_or_else(|| StoreError::NotFound(format!("product {product_id}")))
    }

    async fn read_many(&self, product_ids: &[ProductId]) -> Result<HashMap<ProductId, i64>, StoreError> {
        let state = self.inner.read_state()?;
        Ok(product_ids
            .iter()
            .filter_map(|id| state.products.get(id).map(|p| (*id, p.current_stock)))
            .collect())
    }
}

#[async_trait::async_trait]
impl StockStore for InMemoryStockStore {
    async fn begin(
        &self,
        product_id: ProductId,
        lock_wait: Duration,
    ) -> Result<Box<dyn StockTransaction>, StoreError> {
        if !self.inner.read_state()?.products.contains_key(&product_id) {
            return Err(StoreError::NotFound(format!("product {product_id}")));
        }

        let row = self.inner.row_lock(product_id)?;
        let guard = tokio::time::timeout(lock_wait, row.lock_owned())
            .await
            .map_err(|_| {
                StoreError::Busy(format!(
                    "product {product_id} still locked after {}ms",
                    lock_wait.as_millis()
                ))
            })?;

        // Re-read under the lock; this is the value the transaction builds on.
        let locked = {
            let state = self.inner.read_state()?;
            let product = state
                .products
                .get(&product_id)
                .ok_or_else(|| StoreError::NotFound(format!("product {product_id}")))?;
            LockedProduct {
                product_id,
                balance: product.current_stock,
                active: product.active,
            }
        };

        Ok(Box::new(InMemoryTransaction {
            inner: self.inner.clone(),
            locked,
            balance: locked.balance,
            balance_staged: false,
            staged: Vec::new(),
            guard: Some(guard),
        }))
    }
}

struct InMemoryTransaction {
    inner: Arc<Inner>,
    locked: LockedProduct,
    balance: i64,
    balance_staged: bool,
    staged: Vec<(MovementId, NewMovement)>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl InMemoryTransaction {
    fn ensure_open(&self) -> Result<(), StoreError> {
        if self.guard.is_none() {
            return Err(StoreError::Backend("transaction already finished".to_string()));
        }
        Ok(())
    }

    fn ensure_product(&self, product_id: ProductId) -> Result<(), StoreError> {
        if product_id != self.locked.product_id {
            return Err(StoreError::Conflict(format!(
                "transaction holds product {}, not {product_id}",
                self.locked.product_id
            )));
        }
        Ok(())
    }

    fn finish(&mut self) {
        self.staged.clear();
        self.balance_staged = false;
        self.guard = None;
    }

    fn publish(&self) -> Result<(), StoreError> {
        let mut state = self.inner.write_state()?;

        if !state.products.contains_key(&self.locked.product_id) {
            return Err(StoreError::NotFound(format!("product {}", self.locked.product_id)));
        }

        // Timestamps never run backwards relative to commit order.
        let mut created_at = Utc::now();
        if let Some(last) = state.last_created_at {
            created_at = created_at.max(last);
        }

        for (id, movement) in &self.staged {
            state
                .ledger
                .push(Movement::from_new(*id, movement.clone(), created_at));
        }
        if !self.staged.is_empty() {
            state.last_created_at = Some(created_at);
        }

        if self.balance_staged {
            if let Some(product) = state.products.get_mut(&self.locked.product_id) {
                product.current_stock = self.balance;
            }
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl StockTransaction for InMemoryTransaction {
    fn locked(&self) -> &LockedProduct {
        &self.locked
    }

    async fn append(&mut self, movement: NewMovement) -> Result<MovementId, StoreError> {
        self.ensure_open()?;
        self.ensure_product(movement.product_id)?;
        {
            let state = self.inner.read_state()?;
            if !state.users.contains_key(&movement.actor_id) {
                return Err(StoreError::ForeignKey(format!("actor {}", movement.actor_id)));
            }
        }
        if movement.signed_quantity == 0 {
            return Err(StoreError::Conflict("signed quantity cannot be zero".to_string()));
        }

        let id = MovementId::new(self.inner.next_movement.fetch_add(1, Ordering::SeqCst) + 1);
        self.staged.push((id, movement));
        Ok(id)
    }

    async fn apply_delta(
        &mut self,
        product_id: ProductId,
        delta: i64,
        expected_prior: i64,
    ) -> Result<i64, StoreError> {
        self.ensure_open()?;
        self.ensure_product(product_id)?;

        if self.inner.take_fault(FaultPoint::BeforeBalanceUpdate) {
            return Err(StoreError::Backend("injected fault before balance update".to_string()));
        }

        if self.balance != expected_prior {
            return Err(StoreError::Conflict(format!(
                "expected prior balance {expected_prior}, found {}",
                self.balance
            )));
        }
        let next = self
            .balance
            .checked_add(delta)
            .ok_or_else(|| StoreError::Conflict("balance overflow".to_string()))?;
        if next < 0 {
            return Err(StoreError::Conflict(format!("balance would become {next}")));
        }

        self.balance = next;
        self.balance_staged = true;
        Ok(next)
    }

    async fn ledger_total(&mut self) -> Result<LedgerTotal, StoreError> {
        self.ensure_open()?;
        let state = self.inner.read_state()?;
        let mut total = LedgerTotal::default();
        let committed = state.ledger.iter().filter(|m| m.product_id == self.locked.product_id);
        for m in committed {
            total.sum += m.signed_quantity;
            total.movement_count += 1;
        }
        for (_, m) in &self.staged {
            total.sum += m.signed_quantity;
            total.movement_count += 1;
        }
        Ok(total)
    }

    async fn reset_balance(&mut self, balance: i64) -> Result<(), StoreError> {
        self.ensure_open()?;
        self.balance = balance;
        self.balance_staged = true;
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), StoreError> {
        self.ensure_open()?;

        if self.inner.take_fault(FaultPoint::Commit) {
            self.finish();
            return Err(StoreError::Backend("injected fault at commit".to_string()));
        }

        let published = self.publish();
        self.finish();
        published
    }

    async fn rollback(&mut self) -> Result<(), StoreError> {
        self.finish();
        Ok(())
    }
}
