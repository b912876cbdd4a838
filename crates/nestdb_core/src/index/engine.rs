//! Index engine - the set of field indexes of one store.
//!
//! The engine owns the mandatory `_id` index plus every built secondary
//! index, applies mutation batches to all of them atomically and picks the
//! access path for a query.
//!
//! # Invariants
//!
//! - The `_id` index always exists, is unique and not sparse
//! - Every index holds exactly the documents of the `_id` index (minus
//!   those a sparse index skips)
//! - A failed batch leaves every index as it was before the call

use super::field::FieldIndex;
use super::traits::{Change, IndexSpec};
use crate::document::{Document, ID_FIELD};
use crate::error::{CoreError, CoreResult};
use crate::query::operator_object;
use nestdb_codec::{Map, Value};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// How a query's candidate documents were found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccessPath {
    /// Exact value on an indexed field.
    Exact {
        /// Indexed field.
        field: String,
    },
    /// `$in` list on an indexed field.
    In {
        /// Indexed field.
        field: String,
    },
    /// Range operators on an indexed field.
    Range {
        /// Indexed field.
        field: String,
    },
    /// Every document, in `_id` order.
    FullScan,
}

impl fmt::Display for AccessPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exact { field } => write!(f, "exact({field})"),
            Self::In { field } => write!(f, "in({field})"),
            Self::Range { field } => write!(f, "range({field})"),
            Self::FullScan => f.write_str("full-scan"),
        }
    }
}

/// Superset of the documents matching a query.
#[derive(Debug, Clone)]
pub struct Candidates {
    /// Candidate documents, each at most once.
    pub docs: Vec<Arc<Document>>,
    /// Access path used.
    pub path: AccessPath,
}

/// All field indexes of a store.
#[derive(Debug, Clone)]
pub struct IndexEngine {
    indexes: BTreeMap<String, FieldIndex>,
}

impl Default for IndexEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl IndexEngine {
    /// Creates an engine holding only the empty `_id` index.
    #[must_use]
    pub fn new() -> Self {
        let mut indexes = BTreeMap::new();
        indexes.insert(ID_FIELD.to_string(), FieldIndex::new(IndexSpec::id()));
        Self { indexes }
    }

    /// Returns the index on `field`, if built.
    #[must_use]
    pub fn get(&self, field: &str) -> Option<&FieldIndex> {
        self.indexes.get(field)
    }

    /// Returns true if `field` is indexed.
    #[must_use]
    pub fn contains(&self, field: &str) -> bool {
        self.indexes.contains_key(field)
    }

    /// Specifications of every index, `_id` included.
    #[must_use]
    pub fn specs(&self) -> Vec<IndexSpec> {
        self.indexes.values().map(|i| i.spec().clone()).collect()
    }

    /// Number of stored documents.
    #[must_use]
    pub fn document_count(&self) -> usize {
        self.id_index().key_count()
    }

    /// Looks a document up by `_id`.
    #[must_use]
    pub fn document(&self, id: &Value) -> Option<Arc<Document>> {
        self.id_index().get_matching(id).into_iter().next()
    }

    /// Returns true if a document with this `_id` exists.
    #[must_use]
    pub fn contains_id(&self, id: &Value) -> bool {
        self.document(id).is_some()
    }

    /// Every document in `_id` order.
    #[must_use]
    pub fn all_documents(&self) -> Vec<Arc<Document>> {
        self.id_index().get_all()
    }

    /// Applies a batch to every index.
    ///
    /// # Errors
    ///
    /// If index `j` rejects the batch, indexes `0..j` are reverted and the
    /// error is returned; no index changes.
    pub fn apply(&mut self, changes: &[Change]) -> CoreResult<()> {
        let mut failure = None;
        for (j, index) in self.indexes.values_mut().enumerate() {
            if let Err(err) = index.apply(changes) {
                failure = Some((j, err));
                break;
            }
        }
        let Some((failed_at, err)) = failure else {
            return Ok(());
        };
        for index in self.indexes.values_mut().take(failed_at) {
            index.revert(changes);
        }
        debug!(changes = changes.len(), %err, "rolled back index batch");
        Err(err)
    }

    /// Undoes a successfully applied batch.
    pub fn revert(&mut self, changes: &[Change]) {
        for index in self.indexes.values_mut() {
            index.revert(changes);
        }
    }

    /// Builds and installs an index over the current documents.
    ///
    /// Returns `false` if the field was already indexed.
    ///
    /// # Errors
    ///
    /// A uniqueness violation leaves the engine without the new index.
    pub fn ensure(&mut self, spec: IndexSpec) -> CoreResult<bool> {
        if self.indexes.contains_key(&spec.field_name) {
            return Ok(false);
        }
        let mut index = FieldIndex::new(spec);
        index.insert_many(&self.all_documents())?;
        Ok(self.install(index))
    }

    /// Installs an index built elsewhere over the current documents.
    ///
    /// Returns `false`, leaving the existing index, if the field was
    /// already indexed.
    pub fn install(&mut self, index: FieldIndex) -> bool {
        if self.indexes.contains_key(index.field_name()) {
            return false;
        }
        self.indexes.insert(index.field_name().to_string(), index);
        true
    }

    /// Drops the index on `field`. Returns `false` if there was none.
    ///
    /// # Errors
    ///
    /// The `_id` index cannot be dropped.
    pub fn drop_index(&mut self, field: &str) -> CoreResult<bool> {
        if field == ID_FIELD {
            return Err(CoreError::validation("the _id index cannot be removed"));
        }
        Ok(self.indexes.remove(field).is_some())
    }

    /// Empties every index, keeping the declarations.
    pub fn reset(&mut self) {
        for index in self.indexes.values_mut() {
            index.reset();
        }
    }

    /// Picks candidates for `query`.
    ///
    /// Tries, in order: an exact value on an indexed field, a `$in` list on
    /// an indexed field, range operators on an indexed field. Falls back to
    /// every document.
    ///
    /// Array-valued fields are indexed per element, so a `$in` member or a
    /// range bound that is itself an array or a map never uses the index.
    #[must_use]
    pub fn candidates(&self, query: &Value) -> Candidates {
        let Some(query) = query.as_map() else {
            return self.full_scan();
        };
        let indexed = || {
            query
                .iter()
                .filter(|(field, _)| !field.starts_with('$'))
                .filter_map(|(field, cond)| Some((field, cond, self.indexes.get(field)?)))
        };

        for (field, cond, index) in indexed() {
            let plain = !matches!(cond, Value::Array(_)) && operator_object(cond).is_none();
            let skipped_by_sparse = cond.is_null() && index.spec().sparse;
            if plain && !skipped_by_sparse {
                return Candidates {
                    docs: index.get_matching(cond),
                    path: AccessPath::Exact {
                        field: field.clone(),
                    },
                };
            }
        }

        for (field, cond, index) in indexed() {
            let Some(Value::Array(items)) = operator_object(cond).and_then(|ops| ops.get("$in"))
            else {
                continue;
            };
            if items.iter().any(is_compound) {
                continue;
            }
            if index.spec().sparse && items.iter().any(Value::is_null) {
                continue;
            }
            return Candidates {
                docs: index.get_matching(&Value::Array(items.clone())),
                path: AccessPath::In {
                    field: field.clone(),
                },
            };
        }

        for (field, cond, index) in indexed() {
            let Some(ops) = operator_object(cond) else {
                continue;
            };
            let bounds: Vec<&Value> = RANGE_OPERATORS
                .iter()
                .filter_map(|op| ops.get(*op))
                .collect();
            if bounds.is_empty() || bounds.iter().any(|b| is_compound(b)) {
                continue;
            }
            let lower = bound_side(ops, &["$gt", "$gte"]);
            let upper = bound_side(ops, &["$lt", "$lte"]);
            let mut seen = HashSet::new();
            let docs = if lower.is_empty() || upper.is_empty() {
                index
                    .get_between_bounds(ops)
                    .into_iter()
                    .filter(|d| seen.insert(d.id().clone()))
                    .collect()
            } else {
                // One array element may satisfy the lower bound and another
                // the upper one, so each side is looked up on its own.
                let below: HashSet<Value> = index
                    .get_between_bounds(&upper)
                    .iter()
                    .map(|d| d.id().clone())
                    .collect();
                index
                    .get_between_bounds(&lower)
                    .into_iter()
                    .filter(|d| below.contains(d.id()) && seen.insert(d.id().clone()))
                    .collect()
            };
            return Candidates {
                docs,
                path: AccessPath::Range {
                    field: field.clone(),
                },
            };
        }

        self.full_scan()
    }

    /// Checks every index tree.
    ///
    /// # Errors
    ///
    /// Names the first index whose tree is inconsistent.
    pub fn check_invariants(&self) -> Result<(), String> {
        for (field, index) in &self.indexes {
            index
                .check_invariants()
                .map_err(|e| format!("index `{field}`: {e}"))?;
        }
        Ok(())
    }

    fn full_scan(&self) -> Candidates {
        Candidates {
            docs: self.all_documents(),
            path: AccessPath::FullScan,
        }
    }

    fn id_index(&self) -> &FieldIndex {
        // Present from construction; drop_index refuses to remove it.
        &self.indexes[ID_FIELD]
    }
}

const RANGE_OPERATORS: [&str; 4] = ["$gt", "$gte", "$lt", "$lte"];

fn bound_side(ops: &Map, side: &[&str]) -> Map {
    ops.iter()
        .filter(|(op, _)| side.contains(&op.as_str()))
        .map(|(op, bound)| (op.clone(), bound.clone()))
        .collect()
}

fn is_compound(value: &Value) -> bool {
    matches!(value, Value::Array(_) | Value::Map(_))
}
