//! Entity trait: identity + continuity across state changes.

/// Entity marker + minimal interface.
///
/// Products and users are entities: their attributes change (a product is
/// renamed or deactivated) while the identity stays fixed. Movements are
/// entities too, although they never change after commit.
pub trait Entity {
    /// Strongly-typed entity identifier.
    type Id: Clone + Eq + core::hash::Hash + core::fmt::Debug;

    /// Returns the entity identifier.
    fn id(&self) -> &Self::Id;
}
