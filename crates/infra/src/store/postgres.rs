//! Postgres-backed stock store.
//!
//! The balance cache is the `products.current_stock` column and the ledger is
//! the `movements` table. A movement transaction takes the product row with
//! `SELECT ... FOR UPDATE` under a transaction-local `lock_timeout`, so writers
//! on the same product serialize while writers on other products proceed.
//!
//! ## Error Mapping
//!
//! | PostgreSQL Error Code | StoreError | Scenario |
//! |-----------------------|------------|----------|
//! | `23505` unique violation | `DuplicateName` / `Conflict` | Active product name or username already used |
//! | `23503` foreign key violation | `ForeignKey` | Movement references a missing product or user |
//! | `23514` check violation | `Conflict` | Negative balance, sign/kind mismatch |
//! | `55P03` lock not available | `Busy` | Row lock wait exceeded `lock_timeout` |
//! | `40001` / `40P01` | `Busy` | Serialization failure or deadlock victim |
//! | pool timeout | `Busy` | No connection available |
//! | anything else | `Backend` | Network, IO, closed pool |

use std::collections::HashMap;
use std::time::Duration;

use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Postgres, QueryBuilder, Row, Transaction};
use tracing::{Span, instrument};
use uuid::Uuid;

use stockledger_core::{MovementId, ProductId, UserId};
use stockledger_inventory::{Movement, MovementKind, NewMovement, Product, ProductFilter, User};

use super::query::{LedgerFilter, LedgerOrder};
use super::r#trait::{
    BalanceCache, LedgerStore, LedgerTotal, LockedProduct, ProductCatalog, StockStore,
    StockTransaction, StoreError,
};

const SCHEMA: &str = include_str!("schema.sql");

const PRODUCT_COLUMNS: &str =
    "id, name, unit, min_stock, supplier, current_stock, is_active, created_at";

const MOVEMENT_COLUMNS: &str =
    "m.id, m.product_id, m.actor_id, m.kind, m.qty, m.note, m.created_at";

const USER_COLUMNS: &str = "id, username, email, is_admin, is_active, created_at";

/// Postgres-backed stock store.
///
/// Uses the SQLx connection pool, which is `Send + Sync` and cheap to clone.
#[derive(Debug, Clone)]
pub struct PostgresStockStore {
    pool: PgPool,
}

impl PostgresStockStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;
        Ok(Self::new(pool))
    }

    /// Create tables, indexes and the append-only trigger if missing.
    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        sqlx::raw_sql(SCHEMA)
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("ensure_schema", e))?;
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait::async_trait]
impl ProductCatalog for PostgresStockStore {
    #[instrument(skip(self, product), fields(product_id = %product.id), err)]
    async fn insert_product(&self, product: &Product) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO products (id, name, unit, min_stock, supplier, current_stock, is_active, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(*product.id.as_uuid())
        .bind(&product.name)
        .bind(&product.unit)
        .bind(min_stock_to_db(product.min_stock)?)
        .bind(&product.supplier)
        .bind(product.current_stock)
        .bind(product.active)
        .bind(product.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| name_conflict(e, "insert_product", &product.name))?;
        Ok(())
    }

    #[instrument(skip(self, product), fields(product_id = %product.id), err)]
    async fn update_product_details(&self, product: &Product) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE products
            SET name = $2, unit = $3, min_stock = $4, supplier = $5
            WHERE id = $1
            "#,
        )
        .bind(*product.id.as_uuid())
        .bind(&product.name)
        .bind(&product.unit)
        .bind(min_stock_to_db(product.min_stock)?)
        .bind(&product.supplier)
        .execute(&self.pool)
        .await
        .map_err(|e| name_conflict(e, "update_product_details", &product.name))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("product {}", product.id)));
        }
        Ok(())
    }

    #[instrument(skip(self), fields(product_id = %product_id), err)]
    async fn deactivate_product(&self, product_id: ProductId) -> Result<(), StoreError> {
        // The UPDATE waits on any FOR UPDATE lock held by an in-flight movement.
        let result = sqlx::query("UPDATE products SET is_active = FALSE WHERE id = $1")
            .bind(*product_id.as_uuid())
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("deactivate_product", e))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("product {product_id}")));
        }
        Ok(())
    }

    async fn get_product(&self, product_id: ProductId) -> Result<Option<Product>, StoreError> {
        let row = sqlx::query(&format!("SELECT {PRODUCT_COLUMNS} FROM products WHERE id = $1"))
            .bind(*product_id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_product", e))?;
        row.as_ref().map(product_from_row).transpose()
    }

    #[instrument(skip(self, filter), err)]
    async fn list_products(&self, filter: &ProductFilter) -> Result<Vec<Product>, StoreError> {
        let mut qb = QueryBuilder::<Postgres>::new(format!(
            "SELECT {PRODUCT_COLUMNS} FROM products WHERE TRUE"
        ));
        if !filter.include_inactive {
            qb.push(" AND is_active");
        }
        if let Some(needle) = filter.needle() {
            let pattern = like_pattern(&needle);
            qb.push(" AND (lower(name) LIKE ")
                .push_bind(pattern.clone())
                .push(" OR lower(coalesce(supplier, '')) LIKE ")
                .push_bind(pattern)
                .push(")");
        }
        qb.push(" ORDER BY name ASC, id ASC");

        let rows = qb
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("list_products", e))?;
        rows.iter().map(product_from_row).collect()
    }

    #[instrument(skip(self, user), fields(user_id = %user.id), err)]
    async fn insert_user(&self, user: &User) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO users (id, username, email, is_admin, is_active, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(*user.id.as_uuid())
        .bind(&user.username)
        .bind(&user.email)
        .bind(user.is_admin)
        .bind(user.active)
        .bind(user.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| name_conflict(e, "insert_user", &user.username))?;
        Ok(())
    }

    async fn get_user(&self, user_id: UserId) -> Result<Option<User>, StoreError> {
        let row = sqlx::query(&format!("SELECT {USER_COLUMNS} FROM users WHERE id = $1"))
            .bind(*user_id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_user", e))?;
        row.as_ref().map(user_from_row).transpose()
    }

    async fn find_user_by_username(&self, username: &str) -> Result<Option<User>, StoreError> {
        let row = sqlx::query(&format!("SELECT {USER_COLUMNS} FROM users WHERE username = $1"))
            .bind(username)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("find_user_by_username", e))?;
        row.as_ref().map(user_from_row).transpose()
    }

    #[instrument(skip(self), fields(user_id = %user_id), err)]
    async fn deactivate_user(&self, user_id: UserId) -> Result<(), StoreError> {
        let result = sqlx::query("UPDATE users SET is_active = FALSE WHERE id = $1")
            .bind(*user_id.as_uuid())
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("deactivate_user", e))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("user {user_id}")));
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl LedgerStore for PostgresStockStore {
    #[instrument(skip(self, filter), fields(limit = filter.limit, rows = tracing::field::Empty), err)]
    async fn query(&self, filter: &LedgerFilter) -> Result<Vec<Movement>, StoreError> {
        let mut qb = QueryBuilder::<Postgres>::new(format!(
            "SELECT {MOVEMENT_COLUMNS} FROM movements m JOIN products p ON p.id = m.product_id WHERE TRUE"
        ));

        if let Some(product_id) = filter.product_id {
            qb.push(" AND m.product_id = ").push_bind(*product_id.as_uuid());
        }
        if let Some(kind) = filter.kind {
            qb.push(" AND m.kind = ").push_bind(kind.as_str());
        }
        if let Some(needle) = filter.text_needle() {
            let pattern = like_pattern(&needle);
            qb.push(" AND (lower(p.name) LIKE ")
                .push_bind(pattern.clone())
                .push(" OR lower(coalesce(p.supplier, '')) LIKE ")
                .push_bind(pattern)
                .push(")");
        }
        if let Some(after) = filter.created_after {
            qb.push(" AND m.created_at >= ").push_bind(after);
        }
        if let Some(before) = filter.created_before {
            qb.push(" AND m.created_at < ").push_bind(before);
        }

        qb.push(match filter.order {
            LedgerOrder::NewestFirst => " ORDER BY m.created_at DESC, m.id DESC",
            LedgerOrder::OldestFirst => " ORDER BY m.created_at ASC, m.id ASC",
        });
        qb.push(" LIMIT ").push_bind(filter.effective_limit() as i64);

        let rows = qb
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("query_movements", e))?;

        Span::current().record("rows", rows.len());
        rows.iter().map(movement_from_row).collect()
    }

    async fn ledger_totals(
        &self,
        product_ids: &[ProductId],
    ) -> Result<HashMap<ProductId, LedgerTotal>, StoreError> {
        let ids: Vec<Uuid> = product_ids.iter().map(|id| *id.as_uuid()).collect();
        let rows = sqlx::query(
            r#"
            SELECT product_id, COALESCE(SUM(qty), 0)::BIGINT AS total, COUNT(*) AS movement_count
            FROM movements
            WHERE product_id = ANY($1)
            GROUP BY product_id
            "#,
        )
        .bind(&ids)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("ledger_totals", e))?;

        let mut totals: HashMap<ProductId, LedgerTotal> = product_ids
            .iter()
            .map(|id| (*id, LedgerTotal::default()))
            .collect();
        for row in rows {
            let product_id = ProductId::from_uuid(row.try_get("product_id").map_err(decode_error)?);
            totals.insert(product_id, ledger_total_from_row(&row)?);
        }
        Ok(totals)
    }
}

#[async_trait::async_trait]
impl BalanceCache for PostgresStockStore {
    async fn read(&self, product_id: ProductId) -> Result<i64, StoreError> {
        let row = sqlx::query("SELECT current_stock FROM products WHERE id = $1")
            .bind(*product_id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("read_balance", e))?
            .ok_or_else(|| StoreError::NotFound(format!("product {product_id}")))?;
        row.try_get("current_stock").map_err(decode_error)
    }

    async fn read_many(&self, product_ids: &[ProductId]) -> Result<HashMap<ProductId, i64>, StoreError> {
        let ids: Vec<Uuid> = product_ids.iter().map(|id| *id.as_uuid()).collect();
        let rows = sqlx::query("SELECT id, current_stock FROM products WHERE id = ANY($1)")
            .bind(&ids)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("read_balances", e))?;

        rows.iter()
            .map(|row| {
                let id: Uuid = row.try_get("id").map_err(decode_error)?;
                let balance: i64 = row.try_get("current_stock").map_err(decode_error)?;
                Ok((ProductId::from_uuid(id), balance))
            })
            .collect()
    }
}

#[async_trait::async_trait]
impl StockStore for PostgresStockStore {
    #[instrument(skip(self), fields(product_id = %product_id, lock_wait_ms = lock_wait.as_millis() as u64), err)]
    async fn begin(
        &self,
        product_id: ProductId,
        lock_wait: Duration,
    ) -> Result<Box<dyn StockTransaction>, StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        sqlx::query("SELECT set_config('lock_timeout', $1, true)")
            .bind(format!("{}ms", lock_wait.as_millis().max(1)))
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("set_lock_timeout", e))?;

        let row = sqlx::query("SELECT current_stock, is_active FROM products WHERE id = $1 FOR UPDATE")
            .bind(*product_id.as_uuid())
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("lock_product", e))?;

        let Some(row) = row else {
            tx.rollback()
                .await
                .map_err(|e| map_sqlx_error("rollback", e))?;
            return Err(StoreError::NotFound(format!("product {product_id}")));
        };

        let locked = LockedProduct {
            product_id,
            balance: row.try_get("current_stock").map_err(decode_error)?,
            active: row.try_get("is_active").map_err(decode_error)?,
        };

        Ok(Box::new(PgStockTransaction {
            tx: Some(tx),
            locked,
        }))
    }
}

struct PgStockTransaction {
    tx: Option<Transaction<'static, Postgres>>,
    locked: LockedProduct,
}

impl PgStockTransaction {
    fn open(&mut self) -> Result<&mut Transaction<'static, Postgres>, StoreError> {
        self.tx
            .as_mut()
            .ok_or_else(|| StoreError::Backend("transaction already finished".to_string()))
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
}

#[async_trait::async_trait]
impl StockTransaction for PgStockTransaction {
    fn locked(&self) -> &LockedProduct {
        &self.locked
    }

    async fn append(&mut self, movement: NewMovement) -> Result<MovementId, StoreError> {
        self.ensure_product(movement.product_id)?;
        let tx = self.open()?;

        let row = sqlx::query(
            r#"
            INSERT INTO movements (product_id, actor_id, kind, qty, note)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING id
            "#,
        )
        .bind(*movement.product_id.as_uuid())
        .bind(*movement.actor_id.as_uuid())
        .bind(movement.kind.as_str())
        .bind(movement.signed_quantity)
        .bind(&movement.note)
        .fetch_one(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("append_movement", e))?;

        let id: i64 = row.try_get("id").map_err(decode_error)?;
        Ok(MovementId::new(id as u64))
    }

    async fn apply_delta(
        &mut self,
        product_id: ProductId,
        delta: i64,
        expected_prior: i64,
    ) -> Result<i64, StoreError> {
        self.ensure_product(product_id)?;
        let tx = self.open()?;

        let row = sqlx::query(
            r#"
            UPDATE products
            SET current_stock = current_stock + $2, stock_version = stock_version + 1
            WHERE id = $1 AND current_stock = $3
            RETURNING current_stock
            "#,
        )
        .bind(*product_id.as_uuid())
        .bind(delta)
        .bind(expected_prior)
        .fetch_optional(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("apply_delta", e))?
        .ok_or_else(|| {
            StoreError::Conflict(format!("balance of {product_id} is no longer {expected_prior}"))
        })?;

        row.try_get("current_stock").map_err(decode_error)
    }

    async fn ledger_total(&mut self) -> Result<LedgerTotal, StoreError> {
        let product_id = self.locked.product_id;
        let tx = self.open()?;
        let row = sqlx::query(
            r#"
            SELECT COALESCE(SUM(qty), 0)::BIGINT AS total, COUNT(*) AS movement_count
            FROM movements
            WHERE product_id = $1
            "#,
        )
        .bind(*product_id.as_uuid())
        .fetch_one(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("ledger_total", e))?;
        ledger_total_from_row(&row)
    }

    async fn reset_balance(&mut self, balance: i64) -> Result<(), StoreError> {
        let product_id = self.locked.product_id;
        let tx = self.open()?;
        sqlx::query(
            "UPDATE products SET current_stock = $2, stock_version = stock_version + 1 WHERE id = $1",
        )
        .bind(*product_id.as_uuid())
        .bind(balance)
        .execute(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("reset_balance", e))?;
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), StoreError> {
        let tx = self
            .tx
            .take()
            .ok_or_else(|| StoreError::Backend("transaction already finished".to_string()))?;
        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))
    }

    async fn rollback(&mut self) -> Result<(), StoreError> {
        match self.tx.take() {
            Some(tx) => tx.rollback().await.map_err(|e| map_sqlx_error("rollback", e)),
            None => Ok(()),
        }
    }
}

fn product_from_row(row: &PgRow) -> Result<Product, StoreError> {
    let id: Uuid = row.try_get("id").map_err(decode_error)?;
    let min_stock: i32 = row.try_get("min_stock").map_err(decode_error)?;
    Ok(Product {
        id: ProductId::from_uuid(id),
        name: row.try_get("name").map_err(decode_error)?,
        unit: row.try_get("unit").map_err(decode_error)?,
        min_stock: u32::try_from(min_stock)
            .map_err(|_| StoreError::Backend(format!("negative min_stock {min_stock}")))?,
        supplier: row.try_get("supplier").map_err(decode_error)?,
        current_stock: row.try_get("current_stock").map_err(decode_error)?,
        active: row.try_get("is_active").map_err(decode_error)?,
        created_at: row.try_get("created_at").map_err(decode_error)?,
    })
}

fn user_from_row(row: &PgRow) -> Result<User, StoreError> {
    let id: Uuid = row.try_get("id").map_err(decode_error)?;
    Ok(User {
        id: UserId::from_uuid(id),
        username: row.try_get("username").map_err(decode_error)?,
        email: row.try_get("email").map_err(decode_error)?,
        is_admin: row.try_get("is_admin").map_err(decode_error)?,
        active: row.try_get("is_active").map_err(decode_error)?,
        created_at: row.try_get("created_at").map_err(decode_error)?,
    })
}

fn movement_from_row(row: &PgRow) -> Result<Movement, StoreError> {
    let id: i64 = row.try_get("id").map_err(decode_error)?;
    let product_id: Uuid = row.try_get("product_id").map_err(decode_error)?;
    let actor_id: Uuid = row.try_get("actor_id").map_err(decode_error)?;
    let kind: String = row.try_get("kind").map_err(decode_error)?;
    let kind: MovementKind = kind
        .parse()
        .map_err(|_| StoreError::Backend(format!("unknown movement kind '{kind}' in ledger")))?;

    Ok(Movement {
        id: MovementId::new(id as u64),
        product_id: ProductId::from_uuid(product_id),
        actor_id: UserId::from_uuid(actor_id),
        kind,
        signed_quantity: row.try_get("qty").map_err(decode_error)?,
        note: row.try_get("note").map_err(decode_error)?,
        created_at: row.try_get("created_at").map_err(decode_error)?,
    })
}

fn ledger_total_from_row(row: &PgRow) -> Result<LedgerTotal, StoreError> {
    let sum: i64 = row.try_get("total").map_err(decode_error)?;
    let count: i64 = row.try_get("movement_count").map_err(decode_error)?;
    Ok(LedgerTotal {
        sum,
        movement_count: count as u64,
    })
}

fn min_stock_to_db(min_stock: u32) -> Result<i32, StoreError> {
    i32::try_from(min_stock)
        .map_err(|_| StoreError::Conflict(format!("min_stock {min_stock} out of range")))
}

/// `%needle%` with LIKE metacharacters escaped.
fn like_pattern(needle: &str) -> String {
    let escaped = needle
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_");
    format!("%{escaped}%")
}

fn decode_error(err: sqlx::Error) -> StoreError {
    StoreError::Backend(format!("failed to decode row: {err}"))
}

/// Unique violations on named rows surface as duplicate names.
fn name_conflict(err: sqlx::Error, operation: &str, name: &str) -> StoreError {
    let unique_violation = matches!(
        &err,
        sqlx::Error::Database(db_err) if db_err.code().as_deref() == Some("23505")
    );
    match map_sqlx_error(operation, err) {
        StoreError::Conflict(_) if unique_violation => StoreError::DuplicateName(name.to_string()),
        other => other,
    }
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                Some("23505") => StoreError::Conflict(msg),
                Some("23503") => StoreError::ForeignKey(msg),
                Some("23514") => StoreError::Conflict(msg),
                Some("55P03") | Some("40001") | Some("40P01") => StoreError::Busy(msg),
                _ => StoreError::Backend(msg),
            }
        }
        sqlx::Error::PoolTimedOut => {
            StoreError::Busy(format!("connection pool exhausted in {operation}"))
        }
        sqlx::Error::PoolClosed => {
            StoreError::Backend(format!("connection pool closed in {operation}"))
        }
        other => StoreError::Backend(format!("sqlx error in {operation}: {other}")),
    }
}
