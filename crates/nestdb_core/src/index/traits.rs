//! Index specifications, key orderings and change records.

use crate::document::{Document, ID_FIELD};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::sync::Arc;

/// Ordering and equality capability injected into an [`AvlTree`].
///
/// Keys are ordered with `compare_keys`; `values_equal` decides which
/// bucket entry a targeted delete removes.
///
/// [`AvlTree`]: crate::index::AvlTree
pub trait KeyOrdering<K, V> {
    /// Total order over keys.
    fn compare_keys(&self, a: &K, b: &K) -> Ordering;

    /// Equality over bucket values.
    fn values_equal(&self, a: &V, b: &V) -> bool;
}

/// Uses `Ord` for keys and `PartialEq` for values.
#[derive(Debug, Default, Clone, Copy)]
pub struct NaturalOrdering;

impl<K: Ord, V: PartialEq> KeyOrdering<K, V> for NaturalOrdering {
    fn compare_keys(&self, a: &K, b: &K) -> Ordering {
        a.cmp(b)
    }

    fn values_equal(&self, a: &V, b: &V) -> bool {
        a == b
    }
}

/// Declaration of a field index.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IndexSpec {
    /// Indexed field, dot paths address nested fields.
    #[serde(rename = "fieldName")]
    pub field_name: String,
    /// Reject two documents with an equal key.
    #[serde(default)]
    pub unique: bool,
    /// Skip documents lacking the field.
    #[serde(default)]
    pub sparse: bool,
}

impl IndexSpec {
    /// Creates a non-unique, non-sparse index specification.
    pub fn new(field_name: impl Into<String>) -> Self {
        Self {
            field_name: field_name.into(),
            unique: false,
            sparse: false,
        }
    }

    /// The mandatory identifier index.
    #[must_use]
    pub fn id() -> Self {
        Self::new(ID_FIELD).unique()
    }

    /// Makes this a unique index.
    #[must_use]
    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    /// Makes this a sparse index.
    #[must_use]
    pub fn sparse(mut self) -> Self {
        self.sparse = true;
        self
    }
}

/// One document's transition within a mutation batch.
///
/// Inserts carry only `new`, removals only `old`, updates both.
#[derive(Debug, Clone)]
pub struct Change {
    /// Pre-image.
    pub old: Option<Arc<Document>>,
    /// Post-image.
    pub new: Option<Arc<Document>>,
}

impl Change {
    /// An insertion.
    #[must_use]
    pub fn insert(doc: Arc<Document>) -> Self {
        Self {
            old: None,
            new: Some(doc),
        }
    }

    /// A removal.
    #[must_use]
    pub fn remove(doc: Arc<Document>) -> Self {
        Self {
            old: Some(doc),
            new: None,
        }
    }

    /// A replacement of `old` by `new`.
    #[must_use]
    pub fn update(old: Arc<Document>, new: Arc<Document>) -> Self {
        Self {
            old: Some(old),
            new: Some(new),
        }
    }
}
