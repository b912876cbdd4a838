//! Property-based test generators using proptest.
//!
//! Provides strategies for generating random test data
//! that maintains required invariants.

use nestdb_codec::{Map, Value};
use nestdb_core::{Document, ID_FIELD};
use proptest::prelude::*;

/// Strategy for field names the store accepts (no `$`, no `.`).
pub fn field_name_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[a-z][a-z0-9_]{0,11}").expect("Invalid regex")
}

/// Strategy for valid `_id` values: integers or non-empty text.
pub fn id_strategy() -> impl Strategy<Value = Value> {
    prop_oneof![
        any::<i64>().prop_map(Value::Integer),
        prop::string::string_regex("[a-f0-9]{1,32}")
            .expect("Invalid regex")
            .prop_map(Value::Text),
    ]
}

/// Strategy for scalar values of every type.
pub fn scalar_strategy() -> impl Strategy<Value = Value> {
    prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::Bool),
        any::<i64>().prop_map(Value::Integer),
        prop::string::string_regex("[a-zA-Z0-9 ]{0,16}")
            .expect("Invalid regex")
            .prop_map(Value::Text),
        prop::collection::vec(any::<u8>(), 0..16).prop_map(Value::Bytes),
    ]
}

/// Strategy for nested values with valid field names at every level.
pub fn value_strategy() -> impl Strategy<Value = Value> {
    scalar_strategy().prop_recursive(3, 32, 4, |inner| {
        prop_oneof![
            prop::collection::vec(inner.clone(), 0..4).prop_map(Value::Array),
            prop::collection::btree_map(field_name_strategy(), inner, 0..4).prop_map(Value::Map),
        ]
    })
}

/// Strategy for valid documents with up to `max_fields` fields besides `_id`.
pub fn document_strategy(max_fields: usize) -> impl Strategy<Value = Document> {
    (
        id_strategy(),
        prop::collection::btree_map(field_name_strategy(), value_strategy(), 0..=max_fields),
    )
        .prop_map(|(id, fields)| {
            let mut map: Map = fields;
            map.insert(ID_FIELD.to_string(), id);
            Document::try_from(map).expect("generated document is valid")
        })
}

/// Strategy for small integer keys, dense enough to collide often.
pub fn small_key_strategy(range: i64) -> impl Strategy<Value = i64> {
    0..range
}

/// A tree mutation.
#[derive(Debug, Clone)]
pub enum TreeOp {
    /// Add `value` under `key`.
    Insert {
        /// Key
        key: i64,
        /// Value
        value: u32,
    },
    /// Drop `key` and its bucket.
    Delete {
        /// Key
        key: i64,
    },
    /// Drop `value` from `key`'s bucket.
    DeleteValue {
        /// Key
        key: i64,
        /// Value
        value: u32,
    },
}

/// Strategy for tree mutations over keys in `0..key_range`.
pub fn tree_op_strategy(key_range: i64) -> impl Strategy<Value = TreeOp> {
    prop_oneof![
        4 => (small_key_strategy(key_range), 0u32..8)
            .prop_map(|(key, value)| TreeOp::Insert { key, value }),
        1 => small_key_strategy(key_range).prop_map(|key| TreeOp::Delete { key }),
        1 => (small_key_strategy(key_range), 0u32..8)
            .prop_map(|(key, value)| TreeOp::DeleteValue { key, value }),
    ]
}

/// Strategy for a sequence of tree mutations.
pub fn tree_op_sequence_strategy(
    key_range: i64,
    min_ops: usize,
    max_ops: usize,
) -> impl Strategy<Value = Vec<TreeOp>> {
    prop::collection::vec(tree_op_strategy(key_range), min_ops..max_ops)
}

/// Configuration for property tests.
#[derive(Debug, Clone)]
pub struct PropTestConfig {
    /// Number of test cases to run.
    pub cases: u32,
    /// Maximum shrink iterations.
    pub max_shrink_iters: u32,
}

impl Default for PropTestConfig {
    fn default() -> Self {
        Self {
            cases: 256,
            max_shrink_iters: 1000,
        }
    }
}

impl PropTestConfig {
    /// Creates a configuration for quick tests.
    #[must_use]
    pub fn quick() -> Self {
        Self {
            cases: 32,
            max_shrink_iters: 100,
        }
    }

    /// Creates a configuration for thorough tests.
    #[must_use]
    pub fn thorough() -> Self {
        Self {
            cases: 1024,
            max_shrink_iters: 10000,
        }
    }

    /// Converts to proptest config.
    #[must_use]
    pub fn to_proptest_config(&self) -> ProptestConfig {
        ProptestConfig {
            cases: self.cases,
            max_shrink_iters: self.max_shrink_iters,
            ..ProptestConfig::default()
        }
    }
}
