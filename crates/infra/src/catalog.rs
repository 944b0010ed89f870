//! Product and user administration.
//!
//! Reference data the ledger points at. Products and users are never removed;
//! deactivation keeps their history readable.

use std::sync::Arc;

use chrono::Utc;
use thiserror::Error;
use tracing::{info, instrument};

use stockledger_core::{DomainError, ProductId, UserId};
use stockledger_inventory::{NewProduct, NewUser, Product, ProductFilter, ProductUpdate, User};

use crate::store::{StockStore, StoreError};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CatalogError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("name already in use: {0}")]
    DuplicateName(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("storage error: {0}")]
    Storage(String),
}

impl From<StoreError> for CatalogError {
    fn from(value: StoreError) -> Self {
        match value {
            StoreError::NotFound(msg) => CatalogError::NotFound(msg),
            StoreError::DuplicateName(name) => CatalogError::DuplicateName(name),
            other => CatalogError::Storage(other.to_string()),
        }
    }
}

impl From<DomainError> for CatalogError {
    fn from(value: DomainError) -> Self {
        match value {
            DomainError::Validation(msg) | DomainError::InvalidId(msg) => {
                CatalogError::Validation(msg)
            }
        }
    }
}

#[derive(Debug)]
pub struct CatalogService<S: ?Sized> {
    store: Arc<S>,
}

impl<S: ?Sized> Clone for CatalogService<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
        }
    }
}

impl<S: StockStore + ?Sized> CatalogService<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    /// New products start active with a zero balance.
    #[instrument(skip(self, draft), fields(name = %draft.name), err)]
    pub async fn create_product(&self, draft: NewProduct) -> Result<ProductId, CatalogError> {
        let draft = draft.validated()?;
        let product = Product::create(ProductId::new(), draft, Utc::now());
        self.store.insert_product(&product).await?;
        info!(product_id = %product.id, "product created");
        Ok(product.id)
    }

    /// Edit catalog attributes. The balance is never touched here.
    #[instrument(skip(self, update), fields(product_id = %product_id), err)]
    pub async fn update_product(
        &self,
        product_id: ProductId,
        update: ProductUpdate,
    ) -> Result<Product, CatalogError> {
        let current = self.get_product(product_id).await?;
        let edited = update.apply_to(&current)?;
        self.store.update_product_details(&edited).await?;
        // Re-read so the returned balance is the live one.
        self.get_product(product_id).await
    }

    /// Soft delete. Repeating it is harmless.
    #[instrument(skip(self), fields(product_id = %product_id), err)]
    pub async fn deactivate_product(&self, product_id: ProductId) -> Result<(), CatalogError> {
        self.store.deactivate_product(product_id).await?;
        info!("product deactivated");
        Ok(())
    }

    pub async fn get_product(&self, product_id: ProductId) -> Result<Product, CatalogError> {
        self.store
            .get_product(product_id)
            .await?
            .ok_or_else(|| CatalogError::NotFound(format!("product {product_id}")))
    }

    pub async fn list_products(&self, filter: &ProductFilter) -> Result<Vec<Product>, CatalogError> {
        Ok(self.store.list_products(filter).await?)
    }

    #[instrument(skip(self, draft), fields(username = %draft.username), err)]
    pub async fn create_user(&self, draft: NewUser) -> Result<UserId, CatalogError> {
        let draft = draft.validated()?;
        let user = User::create(UserId::new(), draft, Utc::now());
        self.store.insert_user(&user).await?;
        info!(user_id = %user.id, "user created");
        Ok(user.id)
    }

    /// The user stays referenced by past movements but can no longer act.
    #[instrument(skip(self), fields(user_id = %user_id), err)]
    pub async fn deactivate_user(&self, user_id: UserId) -> Result<(), CatalogError> {
        self.store.deactivate_user(user_id).await?;
        Ok(())
    }

    pub async fn get_user(&self, user_id: UserId) -> Result<User, CatalogError> {
        self.store
            .get_user(user_id)
            .await?
            .ok_or_else(|| CatalogError::NotFound(format!("user {user_id}")))
    }

    /// Return the named user, creating an administrator if none exists.
    #[instrument(skip(self), err)]
    pub async fn ensure_admin(&self, username: &str) -> Result<UserId, CatalogError> {
        let username = username.trim();
        if let Some(existing) = self.store.find_user_by_username(username).await? {
            return Ok(existing.id);
        }

        match self.create_user(NewUser::admin(username)).await {
            Ok(id) => Ok(id),
            // Lost a race with a concurrent bootstrap.
            Err(CatalogError::DuplicateName(_)) => self
                .store
                .find_user_by_username(username)
                .await?
                .map(|u| u.id)
                .ok_or_else(|| CatalogError::NotFound(format!("user {username}"))),
            Err(other) => Err(other),
        }
    }
}
