use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use stockledger_core::{Entity, MovementId, ProductId, UserId, ValueObject};

use crate::error::MovementError;

/// Direction of a movement.
///
/// Persisted as `IN` / `OUT`.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MovementKind {
    #[serde(rename = "IN")]
    Receipt,
    #[serde(rename = "OUT")]
    Issue,
}

impl MovementKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MovementKind::Receipt => "IN",
            MovementKind::Issue => "OUT",
        }
    }

    /// Sign a magnitude according to the direction.
    pub fn signed(&self, magnitude: Magnitude) -> i64 {
        match self {
            MovementKind::Receipt => magnitude.get(),
            MovementKind::Issue => -magnitude.get(),
        }
    }

    fn from_signed(signed_quantity: i64) -> Self {
        if signed_quantity < 0 {
            MovementKind::Issue
        } else {
            MovementKind::Receipt
        }
    }
}

impl core::fmt::Display for MovementKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl core::str::FromStr for MovementKind {
    type Err = MovementError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "in" | "receipt" => Ok(MovementKind::Receipt),
            "out" | "issue" => Ok(MovementKind::Issue),
            other => Err(MovementError::invalid_kind(format!(
                "expected IN or OUT, got '{other}'"
            ))),
        }
    }
}

/// Positive quantity of units moved.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "i64")]
pub struct Magnitude(i64);

impl Magnitude {
    /// Largest magnitude accepted for a single movement.
    pub const MAX: i64 = i32::MAX as i64;

    pub fn new(value: i64) -> Result<Self, MovementError> {
        if value <= 0 {
            return Err(MovementError::invalid_quantity(format!(
                "magnitude must be positive, got {value}"
            )));
        }
        if value > Self::MAX {
            return Err(MovementError::invalid_quantity(format!(
                "magnitude {value} exceeds {}",
                Self::MAX
            )));
        }
        Ok(Self(value))
    }

    pub fn get(&self) -> i64 {
        self.0
    }
}

impl TryFrom<i64> for Magnitude {
    type Error = MovementError;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Magnitude> for i64 {
    fn from(value: Magnitude) -> Self {
        value.0
    }
}

impl ValueObject for Magnitude {}

/// Loosely typed movement input as it arrives from a form or query string.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawMovementInput {
    pub product_id: String,
    pub actor_id: String,
    pub kind: String,
    pub quantity: String,
    pub note: Option<String>,
}

/// A validated request to record one movement.
///
/// The ledger core only accepts this type; holding one means the quantity is a
/// positive integer and the kind is known. Existence of the product and actor is
/// checked later against the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MovementRequest {
    product_id: ProductId,
    actor_id: UserId,
    kind: MovementKind,
    magnitude: Magnitude,
    note: Option<String>,
}

impl ValueObject for MovementRequest {}

impl MovementRequest {
    pub fn new(
        product_id: ProductId,
        actor_id: UserId,
        kind: MovementKind,
        magnitude: i64,
        note: Option<String>,
    ) -> Result<Self, MovementError> {
        let magnitude = Magnitude::new(magnitude)?;
        Ok(Self {
            product_id,
            actor_id,
            kind,
            magnitude,
            note: normalize_note(note),
        })
    }

    pub fn receipt(
        product_id: ProductId,
        actor_id: UserId,
        magnitude: i64,
    ) -> Result<Self, MovementError> {
        Self::new(product_id, actor_id, MovementKind::Receipt, magnitude, None)
    }

    pub fn issue(
        product_id: ProductId,
        actor_id: UserId,
        magnitude: i64,
    ) -> Result<Self, MovementError> {
        Self::new(product_id, actor_id, MovementKind::Issue, magnitude, None)
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.note = normalize_note(Some(note.into()));
        self
    }

    /// Validate raw boundary input.
    ///
    /// Checks run in a fixed order (quantity, kind, product, actor) so the first
    /// failing precondition is the one reported.
    pub fn parse(raw: &RawMovementInput) -> Result<Self, MovementError> {
        let quantity = raw.quantity.trim();
        let magnitude: i64 = quantity.parse().map_err(|_| {
            MovementError::invalid_quantity(format!("'{quantity}' is not an integer"))
        })?;
        let magnitude = Magnitude::new(magnitude)?;

        let kind: MovementKind = raw.kind.parse()?;

        let product_id: ProductId = raw
            .product_id
            .parse()
            .map_err(|_| MovementError::ProductInactiveOrMissing)?;
        let actor_id: UserId = raw
            .actor_id
            .parse()
            .map_err(|_| MovementError::ActorMissing)?;

        Ok(Self {
            product_id,
            actor_id,
            kind,
            magnitude,
            note: normalize_note(raw.note.clone()),
        })
    }

    pub fn product_id(&self) -> ProductId {
        self.product_id
    }

    pub fn actor_id(&self) -> UserId {
        self.actor_id
    }

    pub fn kind(&self) -> MovementKind {
        self.kind
    }

    pub fn magnitude(&self) -> Magnitude {
        self.magnitude
    }

    pub fn note(&self) -> Option<&str> {
        self.note.as_deref()
    }

    pub fn signed_quantity(&self) -> i64 {
        self.kind.signed(self.magnitude)
    }

    /// The ledger record this request becomes once admitted.
    pub fn to_new_movement(&self) -> NewMovement {
        NewMovement {
            product_id: self.product_id,
            actor_id: self.actor_id,
            kind: self.kind,
            signed_quantity: self.signed_quantity(),
            note: self.note.clone(),
        }
    }
}

fn normalize_note(note: Option<String>) -> Option<String> {
    note.map(|n| n.trim().to_string()).filter(|n| !n.is_empty())
}

/// A fully-populated movement ready to be appended (no id, no timestamp yet).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewMovement {
    pub product_id: ProductId,
    pub actor_id: UserId,
    pub kind: MovementKind,
    pub signed_quantity: i64,
    pub note: Option<String>,
}

/// An immutable ledger record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Movement {
    pub id: MovementId,
    pub product_id: ProductId,
    pub actor_id: UserId,
    pub kind: MovementKind,
    pub signed_quantity: i64,
    pub note: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Movement {
    pub fn from_new(id: MovementId, new: NewMovement, created_at: DateTime<Utc>) -> Self {
        Self {
            id,
            product_id: new.product_id,
            actor_id: new.actor_id,
            kind: new.kind,
            signed_quantity: new.signed_quantity,
            note: new.note,
            created_at,
        }
    }

    pub fn magnitude(&self) -> i64 {
        self.signed_quantity.abs()
    }

    /// Whether the stored sign agrees with the stored kind.
    pub fn is_well_formed(&self) -> bool {
        self.signed_quantity != 0 && MovementKind::from_signed(self.signed_quantity) == self.kind
    }
}

impl Entity for Movement {
    type Id = MovementId;

    fn id(&self) -> &Self::Id {
        &self.id
    }
}

/// Admission rule: the balance after applying `signed_quantity` to `current`.
///
/// Fails with `InsufficientStock` exactly when the result would be negative.
pub fn next_balance(current: i64, signed_quantity: i64) -> Result<i64, MovementError> {
    let candidate = current.checked_add(signed_quantity).ok_or_else(|| {
        MovementError::invalid_quantity(format!(
            "balance {current} cannot absorb {signed_quantity}"
        ))
    })?;

    if candidate < 0 {
        return Err(MovementError::InsufficientStock {
            available: current,
            requested: signed_quantity.saturating_abs(),
        });
    }

    Ok(candidate)
}

/// Sum of signed quantities; the balance a history implies.
pub fn ledger_sum<'a>(movements: impl IntoIterator<Item = &'a Movement>) -> i64 {
    movements.into_iter().map(|m| m.signed_quantity).sum()
}
