//! Ledger query filters.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use stockledger_core::ProductId;
use stockledger_inventory::{Movement, MovementKind};

/// Default window when the caller does not ask for one.
pub const DEFAULT_LIMIT: u32 = 50;

/// Hard cap on a single query.
pub const MAX_LIMIT: u32 = 1000;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum LedgerOrder {
    #[default]
    NewestFirst,
    OldestFirst,
}

/// Filter criteria for ledger queries.
///
/// The time range is half-open: `created_after <= created_at < created_before`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerFilter {
    pub product_id: Option<ProductId>,
    pub kind: Option<MovementKind>,
    /// Case-insensitive match against the product's name or supplier.
    pub product_text: Option<String>,
    pub created_after: Option<DateTime<Utc>>,
    pub created_before: Option<DateTime<Utc>>,
    pub limit: u32,
    pub order: LedgerOrder,
}

impl Default for LedgerFilter {
    fn default() -> Self {
        Self {
            product_id: None,
            kind: None,
            product_text: None,
            created_after: None,
            created_before: None,
            limit: DEFAULT_LIMIT,
            order: LedgerOrder::NewestFirst,
        }
    }
}

impl LedgerFilter {
    /// The most recent movements across all products.
    pub fn recent(limit: u32) -> Self {
        Self {
            limit,
            ..Self::default()
        }
    }

    pub fn for_product(product_id: ProductId) -> Self {
        Self {
            product_id: Some(product_id),
            ..Self::default()
        }
    }

    pub fn with_kind(mut self, kind: MovementKind) -> Self {
        self.kind = Some(kind);
        self
    }

    pub fn with_product_text(mut self, text: impl Into<String>) -> Self {
        self.product_text = Some(text.into());
        self
    }

    pub fn between(mut self, after: Option<DateTime<Utc>>, before: Option<DateTime<Utc>>) -> Self {
        self.created_after = after;
        self.created_before = before;
        self
    }

    pub fn with_limit(mut self, limit: u32) -> Self {
        self.limit = limit;
        self
    }

    pub fn oldest_first(mut self) -> Self {
        self.order = LedgerOrder::OldestFirst;
        self
    }

    pub fn effective_limit(&self) -> usize {
        self.limit.min(MAX_LIMIT) as usize
    }

    pub fn text_needle(&self) -> Option<String> {
        self.product_text
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_lowercase)
    }

    /// Checks everything except `product_text`, which needs the product row.
    pub fn matches(&self, movement: &Movement) -> bool {
        if self.product_id.is_some_and(|id| id != movement.product_id) {
            return false;
        }
        if self.kind.is_some_and(|k| k != movement.kind) {
            return false;
        }
        if self.created_after.is_some_and(|t| movement.created_at < t) {
            return false;
        }
        if self.created_before.is_some_and(|t| movement.created_at >= t) {
            return false;
        }
        true
    }
}
