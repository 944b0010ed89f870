//! Value object trait: equality by value, not identity.

/// Marker trait for value objects.
///
/// Value objects are immutable and compared by their attribute values. In the
/// ledger, a validated movement request or a quantity magnitude is a value
/// object: two requests with the same fields describe the same intent.
///
/// Values that reach the ledger core are constructed through validating
/// constructors, so holding one is proof that validation already happened.
pub trait ValueObject: Clone + PartialEq + core::fmt::Debug {}
