//! Field indexes.
//!
//! Every store keeps one [`FieldIndex`] per indexed field, each backed by an
//! arena [`AvlTree`] mapping field values to the documents holding them.
//! The [`IndexEngine`] groups them and keeps them consistent:
//!
//! - The `_id` index always exists and is unique
//! - Mutations arrive as batches of [`Change`]s and are applied to every
//!   index or to none
//! - Queries are narrowed through the first usable index ([`AccessPath`])
//!
//! Index keys use [`Value`](nestdb_codec::Value) order, which ranks types
//! before values, so `1`, `"1"` and `true` are distinct keys.

mod engine;
mod field;
mod traits;
mod tree;

pub use engine::{AccessPath, Candidates, IndexEngine};
pub use field::{DocumentOrdering, FieldIndex};
pub use traits::{Change, IndexSpec, KeyOrdering, NaturalOrdering};
pub use tree::{AvlTree, DuplicateKey, Iter};
