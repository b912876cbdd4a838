//! Benchmark utilities.

use nestdb_codec::Value;
use rand::seq::SliceRandom;
use rand::Rng;

/// Generate random payload bytes of the specified size.
pub fn random_data(size: usize) -> Vec<u8> {
    let mut rng = rand::thread_rng();
    (0..size).map(|_| rng.gen()).collect()
}

/// `0..count` in random order.
pub fn shuffled_keys(count: usize) -> Vec<i64> {
    let mut keys: Vec<i64> = (0..count as i64).collect();
    keys.shuffle(&mut rand::thread_rng());
    keys
}

/// A person-shaped document with `_id` `id`.
///
/// `age` cycles through 100 values and `tags` holds two of eight labels,
/// so both fields make selective but non-unique index keys.
pub fn person(id: usize) -> Value {
    let tags = vec![
        Value::Text(format!("tag{}", id % 8)),
        Value::Text(format!("tag{}", (id / 8) % 8)),
    ];
    vec![
        ("_id", Value::Integer(id as i64)),
        ("name", Value::Text(format!("person-{id}"))),
        ("age", Value::Integer((id % 100) as i64)),
        ("tags", Value::Array(tags)),
        ("bio", Value::Bytes(random_data(64))),
    ]
    .into_iter()
    .collect()
}

/// `count` person documents with ids `0..count`.
pub fn people(count: usize) -> Vec<Value> {
    (0..count).map(person).collect()
}

/// A single-field query `{field: value}`.
pub fn eq(field: &str, value: Value) -> Value {
    vec![(field, value)].into_iter().collect()
}

/// A single-operator query `{field: {op: value}}`.
pub fn op(field: &str, op: &str, value: Value) -> Value {
    eq(field, eq(op, value))
}
