use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use stockledger_core::{DomainError, DomainResult, Entity, ProductId};

/// A stocked product as held by the store.
///
/// `current_stock` is the balance cache for this product. Only a store
/// transaction opened by the movement service writes it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Product {
    pub id: ProductId,
    pub name: String,
    pub unit: String,
    pub min_stock: u32,
    pub supplier: Option<String>,
    pub current_stock: i64,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

impl Product {
    /// A freshly created product: active, empty.
    pub fn create(id: ProductId, draft: NewProduct, created_at: DateTime<Utc>) -> Self {
        Self {
            id,
            name: draft.name,
            unit: draft.unit,
            min_stock: draft.min_stock,
            supplier: draft.supplier,
            current_stock: 0,
            active: true,
            created_at,
        }
    }

    /// Advisory reorder signal; never enforced as a floor. Stock equal to
    /// `min_stock` is not below it.
    pub fn is_below_min(&self) -> bool {
        self.current_stock < i64::from(self.min_stock)
    }

    /// Key used for name uniqueness among active products.
    pub fn name_key(&self) -> String {
        name_key(&self.name)
    }
}

impl Entity for Product {
    type Id = ProductId;

    fn id(&self) -> &Self::Id {
        &self.id
    }
}

/// Case- and whitespace-insensitive form of a product name.
pub fn name_key(name: &str) -> String {
    name.trim().to_lowercase()
}

/// Command: CreateProduct.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewProduct {
    pub name: String,
    pub unit: String,
    pub min_stock: u32,
    pub supplier: Option<String>,
}

impl NewProduct {
    pub fn new(name: impl Into<String>, unit: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            unit: unit.into(),
            min_stock: 0,
            supplier: None,
        }
    }

    pub fn with_min_stock(mut self, min_stock: u32) -> Self {
        self.min_stock = min_stock;
        self
    }

    pub fn with_supplier(mut self, supplier: impl Into<String>) -> Self {
        self.supplier = Some(supplier.into());
        self
    }

    /// Trim fields and reject blanks.
    pub fn validated(self) -> DomainResult<Self> {
        let name = self.name.trim().to_string();
        if name.is_empty() {
            return Err(DomainError::validation("name cannot be empty"));
        }
        let unit = self.unit.trim().to_string();
        if unit.is_empty() {
            return Err(DomainError::validation("unit cannot be empty"));
        }
        Ok(Self {
            name,
            unit,
            min_stock: self.min_stock,
            supplier: normalize_optional(self.supplier),
        })
    }
}

/// Command: edit catalog attributes of an existing product.
///
/// `supplier: Some(None)` clears the supplier. The balance is not editable here.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductUpdate {
    pub name: Option<String>,
    pub unit: Option<String>,
    pub min_stock: Option<u32>,
    pub supplier: Option<Option<String>>,
}

impl ProductUpdate {
    /// Produce the edited product, leaving balance, activity and history alone.
    pub fn apply_to(&self, product: &Product) -> DomainResult<Product> {
        let mut next = product.clone();

        if let Some(name) = &self.name {
            let name = name.trim();
            if name.is_empty() {
                return Err(DomainError::validation("name cannot be empty"));
            }
            next.name = name.to_string();
        }
        if let Some(unit) = &self.unit {
            let unit = unit.trim();
            if unit.is_empty() {
                return Err(DomainError::validation("unit cannot be empty"));
            }
            next.unit = unit.to_string();
        }
        if let Some(min_stock) = self.min_stock {
            next.min_stock = min_stock;
        }
        if let Some(supplier) = &self.supplier {
            next.supplier = normalize_optional(supplier.clone());
        }

        Ok(next)
    }
}

/// Catalog listing filter.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductFilter {
    /// Case-insensitive substring match against name or supplier.
    pub text: Option<String>,
    pub include_inactive: bool,
}

impl ProductFilter {
    pub fn search(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            include_inactive: false,
        }
    }

    pub fn all() -> Self {
        Self {
            text: None,
            include_inactive: true,
        }
    }

    /// Normalized search needle, `None` when blank.
    pub fn needle(&self) -> Option<String> {
        self.text
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_lowercase)
    }

    pub fn matches(&self, product: &Product) -> bool {
        if !self.include_inactive && !product.active {
            return false;
        }
        match self.needle() {
            None => true,
            Some(needle) => matches_text(product, &needle),
        }
    }
}

/// Substring match of a lowercase needle against name or supplier.
pub fn matches_text(product: &Product, needle: &str) -> bool {
    product.name.to_lowercase().contains(needle)
        || product
            .supplier
            .as_deref()
            .is_some_and(|s| s.to_lowercase().contains(needle))
}

/// Dashboard row: one product and its current balance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockLevel {
    pub product_id: ProductId,
    pub name: String,
    pub unit: String,
    pub supplier: Option<String>,
    pub min_stock: u32,
    pub current_stock: i64,
    pub active: bool,
    pub below_min: bool,
}

impl From<&Product> for StockLevel {
    fn from(p: &Product) -> Self {
        Self {
            product_id: p.id,
            name: p.name.clone(),
            unit: p.unit.clone(),
            supplier: p.supplier.clone(),
            min_stock: p.min_stock,
            current_stock: p.current_stock,
            active: p.active,
            below_min: p.is_below_min(),
        }
    }
}

fn normalize_optional(value: Option<String>) -> Option<String> {
    value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}
