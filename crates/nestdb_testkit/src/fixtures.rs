//! Store fixtures.
//!
//! Store constructors start an autoload, so fixtures must be created inside
//! a tokio runtime (`#[tokio::test]`).

use nestdb_codec::Value;
use nestdb_core::{Document, Store, StoreConfig};
use nestdb_storage::{FileBackend, InMemoryBackend, KvBackend};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;

/// A test store together with the backend it writes to.
pub struct TestStore {
    /// The store instance.
    pub store: Store,
    backend: Arc<dyn KvBackend>,
    path: Option<PathBuf>,
    /// The temporary directory (kept alive to prevent cleanup).
    _temp_dir: Option<TempDir>,
}

impl TestStore {
    /// Creates a store over a fresh in-memory backend.
    pub fn memory(config: StoreConfig) -> Self {
        Self::over(config, Arc::new(InMemoryBackend::new()))
    }

    /// Creates a store over `backend`.
    pub fn over(config: StoreConfig, backend: Arc<dyn KvBackend>) -> Self {
        let store =
            Store::open(config, Arc::clone(&backend)).expect("Failed to open in-memory store");
        Self {
            store,
            backend,
            path: None,
            _temp_dir: None,
        }
    }

    /// Creates a store over a log file in a temporary directory.
    pub fn file(config: StoreConfig) -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let path = temp_dir.path().join("store.log");
        let backend: Arc<dyn KvBackend> =
            Arc::new(FileBackend::open(&path).expect("Failed to create file backend"));
        let store = Store::open(config, Arc::clone(&backend)).expect("Failed to open file store");
        Self {
            store,
            backend,
            path: Some(path),
            _temp_dir: Some(temp_dir),
        }
    }

    /// The backend under the store.
    pub fn backend(&self) -> &Arc<dyn KvBackend> {
        &self.backend
    }

    /// Returns the log path if file-based, None if in-memory.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Closes the store and opens a new one against the same data.
    ///
    /// File stores reopen the log from disk, so only what was flushed
    /// survives. Clones of the old [`Store`] must be dropped first.
    pub fn reopen(self, config: StoreConfig) -> Self {
        let Self {
            store,
            backend,
            path,
            _temp_dir,
        } = self;
        drop(store);
        backend.flush().expect("Failed to flush backend");

        let backend = match &path {
            Some(path) => {
                drop(backend);
                Arc::new(FileBackend::open(path).expect("Failed to reopen file backend"))
                    as Arc<dyn KvBackend>
            }
            None => backend,
        };
        let store = Store::open(config, Arc::clone(&backend)).expect("Failed to reopen store");
        Self {
            store,
            backend,
            path,
            _temp_dir,
        }
    }
}

impl std::ops::Deref for TestStore {
    type Target = Store;

    fn deref(&self) -> &Self::Target {
        &self.store
    }
}

/// Converts a JSON literal into a document value.
///
/// # Panics
///
/// Panics on JSON the value model cannot hold (floats).
pub fn doc(json: serde_json::Value) -> Value {
    Value::try_from(json).expect("JSON is not a valid NestDB value")
}

/// Sorted `_id`s of `docs`, for order-independent comparisons.
pub fn ids_of(docs: &[Document]) -> Vec<Value> {
    let mut ids: Vec<Value> = docs.iter().map(|d| d.id().clone()).collect();
    ids.sort();
    ids
}

/// Canned stores.
pub mod scenarios {
    use super::*;
    use nestdb_core::IndexSpec;
    use serde_json::json;

    /// A store with `count` documents `{_id: i, n: i, group: i % 4}` and an
    /// index on `group`.
    pub async fn populated_store(count: usize) -> TestStore {
        let ts = TestStore::memory(StoreConfig::new().index(IndexSpec::new("group")));
        let docs = (0..count)
            .map(|i| doc(json!({"_id": i, "n": i, "group": i % 4})))
            .collect();
        ts.store
            .insert_many(docs)
            .await
            .expect("Failed to populate store");
        ts
    }

    /// A store of people with a unique index on `name` and a non-unique
    /// index on `tags`.
    pub async fn people_store() -> TestStore {
        let config = StoreConfig::new()
            .index(IndexSpec::new("name").unique())
            .index(IndexSpec::new("tags"));
        let ts = TestStore::memory(config);
        ts.store
            .insert_many(vec![
                doc(json!({"name": "ada", "age": 36, "tags": ["math", "code"]})),
                doc(json!({"name": "alan", "age": 41, "tags": ["code", "crypto"]})),
                doc(json!({"name": "grace", "age": 85, "tags": ["navy", "code"]})),
            ])
            .await
            .expect("Failed to populate store");
        ts
    }
}
