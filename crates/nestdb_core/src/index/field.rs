//! Single-field index over documents.

use super::traits::{Change, IndexSpec, KeyOrdering};
use super::tree::AvlTree;
use crate::document::Document;
use crate::error::{CoreError, CoreResult};
use nestdb_codec::{Map, Value};
use std::cmp::Ordering;
use std::collections::{BTreeSet, HashSet};
use std::ops::Bound;
use std::sync::Arc;
use tracing::error;

/// Orders keys by [`Value`] order and identifies documents by `_id`.
#[derive(Debug, Default, Clone, Copy)]
pub struct DocumentOrdering;

impl KeyOrdering<Value, Arc<Document>> for DocumentOrdering {
    fn compare_keys(&self, a: &Value, b: &Value) -> Ordering {
        a.cmp(b)
    }

    fn values_equal(&self, a: &Arc<Document>, b: &Arc<Document>) -> bool {
        a.id() == b.id()
    }
}

/// Index of one document field.
///
/// Array values fan out: the document is stored under each distinct
/// element. A document lacking the field is stored under `null` unless the
/// index is sparse, in which case it is skipped.
///
/// Every mutating method is all-or-nothing: when an insert fails on a
/// unique key, whatever the call already inserted is taken out again before
/// the error is returned.
#[derive(Debug, Clone)]
pub struct FieldIndex {
    spec: IndexSpec,
    tree: AvlTree<Value, Arc<Document>, DocumentOrdering>,
}

impl FieldIndex {
    /// Creates an empty index.
    pub fn new(spec: IndexSpec) -> Self {
        let tree = AvlTree::with_ordering(DocumentOrdering, spec.unique);
        Self { spec, tree }
    }

    /// The index declaration.
    #[must_use]
    pub fn spec(&self) -> &IndexSpec {
        &self.spec
    }

    /// The indexed field.
    #[must_use]
    pub fn field_name(&self) -> &str {
        &self.spec.field_name
    }

    /// Number of distinct keys.
    #[must_use]
    pub fn key_count(&self) -> usize {
        self.tree.len()
    }

    /// Drops every entry.
    pub fn reset(&mut self) {
        self.tree.clear();
    }

    /// Keys under which `doc` is indexed.
    #[must_use]
    pub fn keys_for(&self, doc: &Document) -> Vec<Value> {
        match doc.lookup(&self.spec.field_name) {
            None if self.spec.sparse => Vec::new(),
            None => vec![Value::Null],
            Some(Value::Array(items)) => {
                // Value order is type-tagged, so 1, "1" and true stay distinct.
                let distinct: BTreeSet<Value> = items.into_iter().collect();
                distinct.into_iter().collect()
            }
            Some(value) => vec![value],
        }
    }

    /// Indexes one document.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::UniqueViolation`] if a key is taken; the index
    /// is left unchanged.
    pub fn insert(&mut self, doc: &Arc<Document>) -> CoreResult<()> {
        let keys = self.keys_for(doc);
        for (i, key) in keys.iter().enumerate() {
            if let Err(dup) = self.tree.insert(key.clone(), Arc::clone(doc)) {
                for done in &keys[..i] {
                    self.tree.delete(done, Some(doc));
                }
                return Err(CoreError::unique_violation(&self.spec.field_name, dup.key));
            }
        }
        Ok(())
    }

    /// Indexes a batch of documents.
    ///
    /// # Errors
    ///
    /// On failure at document `i`, documents `0..i` are removed again.
    pub fn insert_many(&mut self, docs: &[Arc<Document>]) -> CoreResult<()> {
        for (i, doc) in docs.iter().enumerate() {
            if let Err(err) = self.insert(doc) {
                self.remove_many(&docs[..i]);
                return Err(err);
            }
        }
        Ok(())
    }

    /// Removes one document.
    pub fn remove(&mut self, doc: &Arc<Document>) {
        for key in self.keys_for(doc) {
            self.tree.delete(&key, Some(doc));
        }
    }

    /// Removes a batch of documents.
    pub fn remove_many(&mut self, docs: &[Arc<Document>]) {
        for doc in docs {
            self.remove(doc);
        }
    }

    /// Replaces `old` by `new`.
    ///
    /// # Errors
    ///
    /// If `new` cannot be indexed, `old` is restored and the error returned.
    pub fn update(&mut self, old: &Arc<Document>, new: &Arc<Document>) -> CoreResult<()> {
        self.apply(&[Change::update(Arc::clone(old), Arc::clone(new))])
    }

    /// Replaces each `old` by its `new`.
    ///
    /// # Errors
    ///
    /// On failure the index is restored to its state before the call.
    pub fn update_many(&mut self, pairs: &[(Arc<Document>, Arc<Document>)]) -> CoreResult<()> {
        let changes: Vec<Change> = pairs
            .iter()
            .map(|(old, new)| Change::update(Arc::clone(old), Arc::clone(new)))
            .collect();
        self.apply(&changes)
    }

    /// Undoes a successful [`update_many`](Self::update_many).
    pub fn revert_update_many(&mut self, pairs: &[(Arc<Document>, Arc<Document>)]) {
        let changes: Vec<Change> = pairs
            .iter()
            .map(|(old, new)| Change::update(Arc::clone(old), Arc::clone(new)))
            .collect();
        self.revert(&changes);
    }

    /// Applies a mixed batch: all pre-images are removed, then all
    /// post-images inserted.
    ///
    /// # Errors
    ///
    /// On an insert failure the post-images inserted so far are removed and
    /// every pre-image is re-inserted.
    pub fn apply(&mut self, changes: &[Change]) -> CoreResult<()> {
        for old in changes.iter().filter_map(|c| c.old.as_ref()) {
            self.remove(old);
        }
        for (i, change) in changes.iter().enumerate() {
            let Some(new) = &change.new else {
                continue;
            };
            if let Err(err) = self.insert(new) {
                for done in changes[..i].iter().filter_map(|c| c.new.as_ref()) {
                    self.remove(done);
                }
                self.restore(changes);
                return Err(err);
            }
        }
        Ok(())
    }

    /// Undoes a successful [`apply`](Self::apply).
    pub fn revert(&mut self, changes: &[Change]) {
        for new in changes.iter().filter_map(|c| c.new.as_ref()) {
            self.remove(new);
        }
        self.restore(changes);
    }

    fn restore(&mut self, changes: &[Change]) {
        for old in changes.iter().filter_map(|c| c.old.as_ref()) {
            if let Err(err) = self.insert(old) {
                // Pre-images were indexed before the batch, so this only
                // fires if the caller broke the batch contract.
                error!(field = %self.spec.field_name, id = %old.id(), %err, "failed to restore document");
            }
        }
    }

    /// Documents indexed under `value`. An array value matches any of its
    /// elements; the union holds each document once.
    #[must_use]
    pub fn get_matching(&self, value: &Value) -> Vec<Arc<Document>> {
        match value {
            Value::Array(items) => {
                let mut seen = HashSet::new();
                let mut out = Vec::new();
                for item in items {
                    for doc in self.tree.search(item) {
                        if seen.insert(doc.id().clone()) {
                            out.push(Arc::clone(doc));
                        }
                    }
                }
                out
            }
            _ => self.tree.search(value).to_vec(),
        }
    }

    /// Documents whose key satisfies the `$gt`, `$gte`, `$lt` and `$lte`
    /// entries of `range`, in ascending key order. Other entries are
    /// ignored. A document appears once per matching key.
    #[must_use]
    pub fn get_between_bounds(&self, range: &Map) -> Vec<Arc<Document>> {
        let mut lower = Bound::Unbounded;
        let mut upper = Bound::Unbounded;
        for (op, operand) in range {
            match op.as_str() {
                "$gt" => lower = tighter_lower(lower, Bound::Excluded(operand)),
                "$gte" => lower = tighter_lower(lower, Bound::Included(operand)),
                "$lt" => upper = tighter_upper(upper, Bound::Excluded(operand)),
                "$lte" => upper = tighter_upper(upper, Bound::Included(operand)),
                _ => {}
            }
        }
        self.tree
            .between_bounds(lower, upper)
            .into_iter()
            .cloned()
            .collect()
    }

    /// Every indexed document in key order, once each.
    #[must_use]
    pub fn get_all(&self) -> Vec<Arc<Document>> {
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for (_, bucket) in self.tree.iter() {
            for doc in bucket {
                if seen.insert(doc.id().clone()) {
                    out.push(Arc::clone(doc));
                }
            }
        }
        out
    }

    /// `(key, ids)` pairs in key order, for comparing index contents.
    #[must_use]
    pub fn entries(&self) -> Vec<(Value, Vec<Value>)> {
        self.tree
            .iter()
            .map(|(key, bucket)| {
                let mut ids: Vec<Value> = bucket.iter().map(|d| d.id().clone()).collect();
                ids.sort();
                (key.clone(), ids)
            })
            .collect()
    }

    /// Checks the underlying tree.
    ///
    /// # Errors
    ///
    /// See [`AvlTree::check_invariants`].
    pub fn check_invariants(&self) -> Result<(), String> {
        self.tree.check_invariants()
    }
}

fn tighter_lower<'a>(current: Bound<&'a Value>, candidate: Bound<&'a Value>) -> Bound<&'a Value> {
    match (current, candidate) {
        (Bound::Unbounded, c) => c,
        (Bound::Included(a) | Bound::Excluded(a), Bound::Included(b) | Bound::Excluded(b)) => {
            match a.cmp(b) {
                Ordering::Less => candidate,
                Ordering::Greater => current,
                Ordering::Equal if matches!(candidate, Bound::Excluded(_)) => candidate,
                Ordering::Equal => current,
            }
        }
        (c, Bound::Unbounded) => c,
    }
}

fn tighter_upper<'a>(current: Bound<&'a Value>, candidate: Bound<&'a Value>) -> Bound<&'a Value> {
    match (current, candidate) {
        (Bound::Unbounded, c) => c,
        (Bound::Included(a) | Bound::Excluded(a), Bound::Included(b) | Bound::Excluded(b)) => {
            match a.cmp(b) {
                Ordering::Greater => candidate,
                Ordering::Less => current,
                Ordering::Equal if matches!(candidate, Bound::Excluded(_)) => candidate,
                Ordering::Equal => current,
            }
        }
        (c, Bound::Unbounded) => c,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(id: &str, field: &str, value: Value) -> Arc<Document> {
        let fields: Map = [("_id".to_string(), Value::from(id)), (field.to_string(), value)]
            .into_iter()
            .collect();
        Arc::new(Document::try_from(fields).unwrap())
    }

    fn bare(id: &str) -> Arc<Document> {
        let fields: Map = [("_id".to_string(), Value::from(id))].into_iter().collect();
        Arc::new(Document::try_from(fields).unwrap())
    }

    fn ids(docs: &[Arc<Document>]) -> Vec<String> {
        docs.iter()
            .map(|d| d.id().as_text().unwrap_or_default().to_string())
            .collect()
    }

    fn range(pairs: Vec<(&str, Value)>) -> Map {
        pairs.into_iter().map(|(k, v)| (k.to_string(), v)).collect()
    }

    #[test]
    fn array_fan_out() {
        let mut index = FieldIndex::new(IndexSpec::new("tags"));
        let a = doc("a", "tags", Value::from(vec!["x", "y"]));
        let b = doc("b", "tags", Value::from(vec!["y", "z"]));
        index.insert_many(&[a, b]).unwrap();

        assert_eq!(ids(&index.get_matching(&Value::from("y"))), vec!["a", "b"]);
        assert_eq!(ids(&index.get_matching(&Value::from("x"))), vec!["a"]);
        assert_eq!(
            ids(&index.get_matching(&Value::from(vec!["x", "y"]))),
            vec!["a", "b"]
        );
    }

    #[test]
    fn duplicate_elements_are_indexed_once() {
        let mut index = FieldIndex::new(IndexSpec::new("tags").unique());
        let a = doc("a", "tags", Value::from(vec!["x", "x"]));
        index.insert(&a).unwrap();
        assert_eq!(index.get_matching(&Value::from("x")).len(), 1);
    }

    #[test]
    fn type_tagged_elements_do_not_collide() {
        let mut index = FieldIndex::new(IndexSpec::new("v").unique());
        let a = doc(
            "a",
            "v",
            Value::Array(vec![Value::Integer(1), Value::from("1"), Value::Bool(true)]),
        );
        index.insert(&a).unwrap();
        assert_eq!(index.key_count(), 3);
    }

    #[test]
    fn unique_array_violation_rolls_back_document() {
        let mut index = FieldIndex::new(IndexSpec::new("tags").unique());
        index.insert(&doc("a", "tags", Value::from("m"))).unwrap();
        let before = index.entries();

        // "b" sorts before "m", so it is inserted before the conflict.
        let b = doc("b", "tags", Value::from(vec!["b", "m"]));
        let err = index.insert(&b).unwrap_err();
        assert!(matches!(
            err,
            CoreError::UniqueViolation { ref field, ref key } if field == "tags" && *key == Value::from("m")
        ));
        assert_eq!(index.entries(), before);
    }

    #[test]
    fn batch_insert_rolls_back_earlier_documents() {
        let mut index = FieldIndex::new(IndexSpec::new("n").unique());
        index.insert(&doc("x", "n", Value::Integer(3))).unwrap();
        let before = index.entries();

        let batch = vec![
            doc("a", "n", Value::Integer(1)),
            doc("b", "n", Value::Integer(2)),
            doc("c", "n", Value::Integer(3)),
        ];
        assert!(index.insert_many(&batch).is_err());
        assert_eq!(index.entries(), before);
    }

    #[test]
    fn missing_field_indexes_null_unless_sparse() {
        let mut dense = FieldIndex::new(IndexSpec::new("age"));
        let mut sparse = FieldIndex::new(IndexSpec::new("age").sparse());
        let d = bare("a");
        dense.insert(&d).unwrap();
        sparse.insert(&d).unwrap();
        assert_eq!(ids(&dense.get_matching(&Value::Null)), vec!["a"]);
        assert_eq!(sparse.key_count(), 0);
    }

    #[test]
    fn sparse_unique_allows_many_missing() {
        let mut index = FieldIndex::new(IndexSpec::new("email").unique().sparse());
        index.insert_many(&[bare("a"), bare("b")]).unwrap();
        let mut dense = FieldIndex::new(IndexSpec::new("email").unique());
        assert!(dense.insert_many(&[bare("a"), bare("b")]).is_err());
        assert_eq!(dense.key_count(), 0);
    }

    #[test]
    fn update_restores_old_on_failure() {
        let mut index = FieldIndex::new(IndexSpec::new("n").unique());
        let a = doc("a", "n", Value::Integer(1));
        let b = doc("b", "n", Value::Integer(2));
        index.insert_many(&[Arc::clone(&a), Arc::clone(&b)]).unwrap();
        let before = index.entries();

        let a2 = doc("a", "n", Value::Integer(2));
        assert!(index.update(&a, &a2).is_err());
        assert_eq!(index.entries(), before);

        let a3 = doc("a", "n", Value::Integer(5));
        index.update(&a, &a3).unwrap();
        assert_eq!(ids(&index.get_matching(&Value::Integer(5))), vec!["a"]);
        assert!(index.get_matching(&Value::Integer(1)).is_empty());
    }

    #[test]
    fn update_many_swaps_keys() {
        let mut index = FieldIndex::new(IndexSpec::new("n").unique());
        let a = doc("a", "n", Value::Integer(1));
        let b = doc("b", "n", Value::Integer(2));
        index.insert_many(&[Arc::clone(&a), Arc::clone(&b)]).unwrap();

        // Swapping two unique keys only works because removals go first.
        let pairs = vec![
            (Arc::clone(&a), doc("a", "n", Value::Integer(2))),
            (Arc::clone(&b), doc("b", "n", Value::Integer(1))),
        ];
        index.update_many(&pairs).unwrap();
        assert_eq!(ids(&index.get_matching(&Value::Integer(1))), vec!["b"]);

        index.revert_update_many(&pairs);
        assert_eq!(ids(&index.get_matching(&Value::Integer(1))), vec!["a"]);
    }

    #[test]
    fn update_many_failure_is_full_rollback() {
        let mut index = FieldIndex::new(IndexSpec::new("n").unique());
        let a = doc("a", "n", Value::Integer(1));
        let b = doc("b", "n", Value::Integer(2));
        let c = doc("c", "n", Value::Integer(3));
        index
            .insert_many(&[Arc::clone(&a), Arc::clone(&b), Arc::clone(&c)])
            .unwrap();
        let before = index.entries();

        let pairs = vec![
            (Arc::clone(&a), doc("a", "n", Value::Integer(10))),
            (Arc::clone(&b), doc("b", "n", Value::Integer(3))),
        ];
        assert!(index.update_many(&pairs).is_err());
        assert_eq!(index.entries(), before);
    }

    #[test]
    fn between_bounds_uses_range_operators_only() {
        let mut index = FieldIndex::new(IndexSpec::new("n"));
        for i in 0..10 {
            index
                .insert(&doc(&format!("d{i}"), "n", Value::Integer(i)))
                .unwrap();
        }
        let hits = index.get_between_bounds(&range(vec![
            ("$gte", Value::Integer(3)),
            ("$lt", Value::Integer(6)),
            ("$ne", Value::Integer(4)),
        ]));
        assert_eq!(ids(&hits), vec!["d3", "d4", "d5"]);

        let tight = index.get_between_bounds(&range(vec![
            ("$gt", Value::Integer(2)),
            ("$gte", Value::Integer(5)),
            ("$lte", Value::Integer(6)),
        ]));
        assert_eq!(ids(&tight), vec!["d5", "d6"]);
    }

    #[test]
    fn get_all_dedupes_fanned_out_documents() {
        let mut index = FieldIndex::new(IndexSpec::new("tags"));
        index
            .insert(&doc("a", "tags", Value::from(vec!["x", "y", "z"])))
            .unwrap();
        assert_eq!(index.get_all().len(), 1);
        index.reset();
        assert!(index.get_all().is_empty());
    }

    #[test]
    fn nested_path_projection() {
        let mut index = FieldIndex::new(IndexSpec::new("address.city"));
        let address: Value = vec![("city", Value::from("Lyon"))].into_iter().collect();
        index.insert(&doc("a", "address", address)).unwrap();
        assert_eq!(ids(&index.get_matching(&Value::from("Lyon"))), vec!["a"]);
    }
}
