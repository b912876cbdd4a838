//! Document identifier generation.

use nestdb_codec::Value;
use std::fmt;
use uuid::Uuid;

/// Produces identifiers for documents inserted without an `_id`.
///
/// The store checks every generated id against the `_id` index and asks for
/// another one on collision, so implementations only need to make
/// collisions unlikely.
pub trait IdGenerator: Send + Sync + fmt::Debug {
    /// Returns a fresh identifier (non-empty text or an integer).
    fn generate(&self) -> Value;
}

/// Random 128-bit identifiers rendered as 32 lowercase hex digits.
#[derive(Debug, Default, Clone, Copy)]
pub struct UuidIdGenerator;

impl IdGenerator for UuidIdGenerator {
    fn generate(&self) -> Value {
        Value::Text(Uuid::new_v4().simple().to_string())
    }
}
