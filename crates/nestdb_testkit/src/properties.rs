//! Property checks shared by the proptest suites and by downstream tests.
//!
//! Each check returns `Err` with a description of the first violation
//! instead of panicking, so it can run under `prop_assert!` as well as in
//! plain tests.

use crate::fixtures::{ids_of, TestStore};
use crate::generators::TreeOp;
use nestdb_codec::{Map, Value};
use nestdb_core::index::{AvlTree, FieldIndex};
use nestdb_core::{CborCodec, Document, DocumentCodec, IndexSpec, Store, StoreConfig};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Applies `ops` to a tree and to a `BTreeMap` model, checking the tree's
/// structural invariants after every step and its contents at the end.
pub fn check_tree_ops(ops: &[TreeOp]) -> Result<(), String> {
    let mut tree: AvlTree<i64, u32> = AvlTree::new();
    let mut model: BTreeMap<i64, Vec<u32>> = BTreeMap::new();

    for (step, op) in ops.iter().enumerate() {
        match *op {
            TreeOp::Insert { key, value } => {
                tree.insert(key, value)
                    .map_err(|e| format!("step {step}: {e}"))?;
                model.entry(key).or_default().push(value);
            }
            TreeOp::Delete { key } => {
                tree.delete(&key, None);
                model.remove(&key);
            }
            TreeOp::DeleteValue { key, value } => {
                tree.delete(&key, Some(&value));
                if let Some(bucket) = model.get_mut(&key) {
                    bucket.retain(|v| *v != value);
                    if bucket.is_empty() {
                        model.remove(&key);
                    }
                }
            }
        }
        tree.check_invariants()
            .map_err(|e| format!("step {step} ({op:?}): {e}"))?;
    }

    let contents: Vec<(i64, Vec<u32>)> = tree.iter().map(|(k, b)| (*k, b.to_vec())).collect();
    let expected: Vec<(i64, Vec<u32>)> = model.into_iter().collect();
    if contents != expected {
        return Err(format!("tree holds {contents:?}, expected {expected:?}"));
    }

    // AVL height never exceeds ~1.44 log2(n + 2).
    let n = tree.len() as f64;
    let bound = 1.45 * (n + 2.0).log2();
    if f64::from(tree.height()) > bound {
        return Err(format!("height {} exceeds {bound:.2} for {n} keys", tree.height()));
    }
    Ok(())
}

/// Indexes documents `{_id: i, k: keys[i]}` and checks that the inclusive
/// range `[low, high]` returns exactly the documents whose key lies in it,
/// in ascending key order.
pub fn check_range_query(keys: &[i64], low: i64, high: i64) -> Result<(), String> {
    let mut index = FieldIndex::new(IndexSpec::new("k"));
    for (i, key) in keys.iter().enumerate() {
        let fields: Map = [
            ("_id".to_string(), Value::Integer(i as i64)),
            ("k".to_string(), Value::Integer(*key)),
        ]
        .into_iter()
        .collect();
        let doc = Document::try_from(fields).map_err(|e| e.to_string())?;
        index.insert(&Arc::new(doc)).map_err(|e| e.to_string())?;
    }

    let range: Map = [
        ("$gte".to_string(), Value::Integer(low)),
        ("$lte".to_string(), Value::Integer(high)),
    ]
    .into_iter()
    .collect();
    let got: Vec<Value> = index
        .get_between_bounds(&range)
        .iter()
        .map(|d| d.id().clone())
        .collect();

    // Buckets keep insertion order, so ties come out by position.
    let mut expected: Vec<(i64, usize)> = keys
        .iter()
        .enumerate()
        .filter(|(_, k)| (low..=high).contains(*k))
        .map(|(i, k)| (*k, i))
        .collect();
    expected.sort();
    let expected: Vec<Value> = expected
        .into_iter()
        .map(|(_, i)| Value::Integer(i as i64))
        .collect();

    if got != expected {
        return Err(format!("range [{low}, {high}] returned {got:?}, expected {expected:?}"));
    }
    Ok(())
}

/// Checks `decode(encode(doc)) == doc` with the default codec, and that
/// encoding is deterministic.
pub fn check_codec_roundtrip(doc: &Document) -> Result<(), String> {
    let codec = CborCodec;
    let bytes = codec.encode(doc).map_err(|e| e.to_string())?;
    let again = codec.encode(doc).map_err(|e| e.to_string())?;
    if bytes != again {
        return Err("encoding is not deterministic".into());
    }
    let decoded = codec.decode(&bytes).map_err(|e| e.to_string())?;
    if &decoded != doc {
        return Err(format!("decoded {decoded} differs from {doc}"));
    }
    Ok(())
}

/// Snapshot of every built index of `store`, keyed by field.
pub async fn index_snapshot(store: &Store) -> Result<BTreeMap<String, Vec<(Value, Vec<Value>)>>, String> {
    let mut out = BTreeMap::new();
    for spec in store.list_indexes() {
        // Declared but not built (dropped by a load) is not part of the state.
        if let Ok(entries) = store.index_entries(&spec.field_name).await {
            out.insert(spec.field_name, entries);
        }
    }
    Ok(out)
}

/// Inserts `batch`, which must violate a unique index, and checks that the
/// failure left every index exactly as it was.
pub async fn check_failed_batch_is_atomic(store: &Store, batch: Vec<Value>) -> Result<(), String> {
    let before = index_snapshot(store).await?;
    match store.insert_many(batch).await {
        Ok(docs) => return Err(format!("batch of {} was accepted", docs.len())),
        Err(e) if e.is_unique_violation() => {}
        Err(e) => return Err(format!("unexpected error {e}")),
    }
    let after = index_snapshot(store).await?;
    if before != after {
        return Err(format!("indexes changed: {before:?} -> {after:?}"));
    }
    store.check_invariants()
}

/// Writes `docs`, reopens the store over the same backend and checks that
/// `find({})` returns the same documents.
pub async fn check_reopen_consistency(ts: TestStore, docs: Vec<Value>) -> Result<TestStore, String> {
    ts.store.insert_many(docs).await.map_err(|e| e.to_string())?;
    let everything = Value::Map(Map::new());
    let mut before = ts.store.find(&everything).await.map_err(|e| e.to_string())?;
    before.sort_by(|a, b| a.id().cmp(b.id()));

    let ts = ts.reopen(StoreConfig::new());
    let mut after = ts.store.find(&everything).await.map_err(|e| e.to_string())?;
    after.sort_by(|a, b| a.id().cmp(b.id()));

    if before != after {
        return Err(format!(
            "reopened store holds {:?}, expected {:?}",
            ids_of(&after),
            ids_of(&before)
        ));
    }
    ts.store.check_invariants()?;
    Ok(ts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::doc;
    use crate::generators::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn block_on<F: std::future::Future>(future: F) -> F::Output {
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap()
            .block_on(future)
    }

    proptest! {
        #![proptest_config(PropTestConfig::default().to_proptest_config())]

        #[test]
        fn tree_stays_balanced_and_ordered(ops in tree_op_sequence_strategy(64, 1, 400)) {
            prop_assert_eq!(check_tree_ops(&ops), Ok(()));
        }

        #[test]
        fn range_queries_return_exact_subsets(
            keys in prop::collection::vec(-50i64..50, 0..120),
            low in -60i64..60,
            width in 0i64..60,
        ) {
            prop_assert_eq!(check_range_query(&keys, low, low + width), Ok(()));
        }

        #[test]
        fn documents_round_trip(doc in document_strategy(6)) {
            prop_assert_eq!(check_codec_roundtrip(&doc), Ok(()));
        }
    }

    proptest! {
        #![proptest_config(PropTestConfig::quick().to_proptest_config())]

        #[test]
        fn unique_violation_anywhere_in_batch_changes_nothing(
            existing in 1usize..6,
            batch_len in 1usize..8,
            position in 0usize..8,
        ) {
            let position = position % batch_len;
            let result = block_on(async move {
                let ts = TestStore::memory(
                    StoreConfig::new()
                        .index(IndexSpec::new("u").unique())
                        .index(IndexSpec::new("tags")),
                );
                let seed = (0..existing)
                    .map(|i| doc(json!({"u": i, "tags": ["seed"]})))
                    .collect();
                ts.store.insert_many(seed).await.map_err(|e| e.to_string())?;

                let batch = (0..batch_len)
                    .map(|i| {
                        let u = if i == position { 0 } else { 1000 + i };
                        doc(json!({"u": u, "tags": ["new", i]}))
                    })
                    .collect();
                check_failed_batch_is_atomic(&ts.store, batch).await
            });
            prop_assert_eq!(result, Ok(()));
        }

        #[test]
        fn reopen_returns_same_documents(docs in prop::collection::vec(document_strategy(3), 0..20)) {
            let values: Vec<Value> = docs.into_iter().map(Document::into_value).collect();
            // Generated ids may repeat; keep the first of each.
            let mut seen = std::collections::HashSet::new();
            let values: Vec<Value> = values
                .into_iter()
                .filter(|v| v.get("_id").is_some_and(|id| seen.insert(id.clone())))
                .collect();
            let result = block_on(async move {
                check_reopen_consistency(TestStore::memory(StoreConfig::new()), values)
                    .await
                    .map(|_| ())
            });
            prop_assert_eq!(result, Ok(()));
        }
    }

    #[test]
    fn tree_handles_insert_then_drain() {
        let mut ops: Vec<TreeOp> = (0..100)
            .map(|key| TreeOp::Insert { key, value: 0 })
            .collect();
        ops.extend((0..100).rev().map(|key| TreeOp::Delete { key }));
        assert_eq!(check_tree_ops(&ops), Ok(()));
    }

    #[tokio::test]
    async fn file_store_reopen_consistency() {
        let docs = (0..25).map(|i| doc(json!({"_id": i, "sq": i * i}))).collect();
        let ts = check_reopen_consistency(TestStore::file(StoreConfig::new()), docs)
            .await
            .unwrap();
        assert_eq!(ts.store.count(&doc(json!({}))).await.unwrap(), 25);
    }
}
