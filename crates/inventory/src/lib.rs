//! Inventory domain: products, users and the movements between them.
//!
//! This crate contains business rules for the stock ledger, implemented purely as
//! deterministic domain logic (no IO, no storage, no locking).

pub mod error;
pub mod movement;
pub mod product;
pub mod user;

pub use error::MovementError;
pub use movement::{
    Magnitude, Movement, MovementKind, MovementRequest, NewMovement, RawMovementInput,
    ledger_sum, next_balance,
};
pub use product::{
    NewProduct, Product, ProductFilter, ProductUpdate, StockLevel, matches_text, name_key,
};
pub use user::{NewUser, User};
