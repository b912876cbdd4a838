//! Options and results of store operations.

use crate::document::Document;
use nestdb_codec::Value;
use serde::Serialize;
use std::cmp::Ordering;
use std::fmt;

/// Store lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum StoreState {
    /// Nothing loaded from the backend yet.
    Uninitialized,
    /// Loading documents and building indexes; operations queue.
    IndexesBuilding,
    /// Serving operations.
    Ready,
}

impl fmt::Display for StoreState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Uninitialized => "uninitialized",
            Self::IndexesBuilding => "indexes-building",
            Self::Ready => "ready",
        })
    }
}

/// Options for [`Store::update`](super::Store::update).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpdateOptions {
    /// Update every match instead of the first one.
    pub multi: bool,
    /// Insert a document when nothing matches.
    pub upsert: bool,
}

impl UpdateOptions {
    /// Single-document update without upsert.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets `multi`.
    #[must_use]
    pub const fn multi(mut self, value: bool) -> Self {
        self.multi = value;
        self
    }

    /// Sets `upsert`.
    #[must_use]
    pub const fn upsert(mut self, value: bool) -> Self {
        self.upsert = value;
        self
    }
}

/// Outcome of [`Store::update`](super::Store::update).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct UpdateResult {
    /// Documents updated or inserted.
    pub count: usize,
    /// The inserted document, when the update turned into an insert.
    pub upserted: Option<Document>,
}

/// Options for [`Store::remove`](super::Store::remove).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RemoveOptions {
    /// Remove every match instead of the first one.
    pub multi: bool,
}

impl RemoveOptions {
    /// Removes every match.
    #[must_use]
    pub const fn all() -> Self {
        Self { multi: true }
    }

    /// Removes the first match only.
    #[must_use]
    pub const fn one() -> Self {
        Self { multi: false }
    }
}

/// Per-kind counts of [`Store::save_many`](super::Store::save_many).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SaveCounts {
    /// Documents that did not exist before.
    pub inserted: usize,
    /// Documents that replaced an existing one.
    pub updated: usize,
}

/// What a load found.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LoadReport {
    /// Documents loaded.
    pub documents: usize,
    /// Declared indexes that could not be built (uniqueness violated).
    pub dropped_indexes: Vec<String>,
}

/// Sort direction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Direction {
    /// Smallest first.
    #[default]
    Ascending,
    /// Largest first.
    Descending,
}

/// Post-match shaping for [`Store::find_with`](super::Store::find_with).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FindOptions {
    /// Field and direction to sort by. Missing fields sort first.
    pub sort: Option<(String, Direction)>,
    /// Results to skip.
    pub skip: usize,
    /// Maximum results.
    pub limit: Option<usize>,
}

impl FindOptions {
    /// No sorting, skipping or limit.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sorts by `field`.
    #[must_use]
    pub fn sort(mut self, field: impl Into<String>, direction: Direction) -> Self {
        self.sort = Some((field.into(), direction));
        self
    }

    /// Skips the first `n` results.
    #[must_use]
    pub const fn skip(mut self, n: usize) -> Self {
        self.skip = n;
        self
    }

    /// Returns at most `n` results.
    #[must_use]
    pub const fn limit(mut self, n: usize) -> Self {
        self.limit = Some(n);
        self
    }

    pub(crate) fn apply(&self, mut docs: Vec<Document>) -> Vec<Document> {
        if let Some((field, direction)) = &self.sort {
            let key = |d: &Document| -> Option<Value> { d.lookup(field) };
            docs.sort_by(|a, b| {
                let ord: Ordering = key(a).cmp(&key(b));
                match direction {
                    Direction::Ascending => ord,
                    Direction::Descending => ord.reverse(),
                }
            });
        }
        docs.into_iter()
            .skip(self.skip)
            .take(self.limit.unwrap_or(usize::MAX))
            .collect()
    }
}
