//! The document store.
//!
//! A [`Store`] keeps every document of one namespace in memory, indexed by
//! `_id` and by each declared secondary field, and mirrors mutations to a
//! [`KvBackend`]. Indexes are rebuilt from the backend on load.
//!
//! # Lifecycle
//!
//! ```text
//! Uninitialized --load--> IndexesBuilding --ok--> Ready
//!       ^                       |
//!       +--------fail-----------+
//! ```
//!
//! Operations issued before `Ready` wait on the load gate and run one at a
//! time, in arrival order, once the load completes. An operation that finds
//! the store `Uninitialized` starts the load itself and runs first.
//!
//! # Mutations
//!
//! Inserts, updates and saves change every index as one batch, then write
//! the new records to the backend. Every `_id` a batch touches stays locked
//! until its write finishes, so no other mutation acts on a document that
//! is indexed but not yet durable. If any index rejects the batch, nothing
//! changes. If the backend write fails, the index batch is reverted and the
//! records already written are restored, so the caller sees no change.
//!
//! Removal is the exception: documents leave the indexes before they are
//! deleted from the backend, and a backend failure at that point is
//! reported as [`CoreError::PartialRemoval`] without restoring them.
//!
//! # Keys
//!
//! Records live under `namespace 0x00 cbor(_id)`, so stores with different
//! namespaces can share a backend.

mod locks;
mod options;

pub use options::{
    Direction, FindOptions, LoadReport, RemoveOptions, SaveCounts, StoreState, UpdateOptions,
    UpdateResult,
};

use crate::config::StoreConfig;
use crate::document::{set_path, validate_id, Document, ID_FIELD};
use crate::error::{CoreError, CoreResult};
use crate::index::{AccessPath, Candidates, Change, FieldIndex, IndexEngine, IndexSpec};
use crate::query::has_operators;
use crate::stats::{StatsSnapshot, StoreStats};
use crate::throttle::{Permit, Throttle};
use locks::{DocumentGuard, DocumentLocks};
use nestdb_codec::{to_cbor, Map, Value};
use nestdb_storage::{InMemoryBackend, KvBackend, StorageResult};
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Attempts at generating an unused `_id` before giving up.
const MAX_ID_ATTEMPTS: usize = 32;

/// A backend write and how to undo it.
struct WriteOp {
    key: Vec<u8>,
    value: Vec<u8>,
    /// Previous record, `None` if the key was new.
    undo: Option<Vec<u8>>,
}

struct Inner {
    config: StoreConfig,
    prefix: Vec<u8>,
    backend: Arc<dyn KvBackend>,
    state: Mutex<StoreState>,
    engine: RwLock<IndexEngine>,
    /// Secondary indexes rebuilt on every load.
    declared: Mutex<Vec<IndexSpec>>,
    /// Holds operations while a load runs.
    load_gate: Throttle,
    /// Bounds concurrent backend calls.
    io_gate: Throttle,
    /// Mutations hold it shared from index change to backend write;
    /// loads and index builds hold it exclusively.
    commit: tokio::sync::RwLock<()>,
    locks: DocumentLocks,
    stats: StoreStats,
}

/// An indexed document collection backed by a key-value store.
///
/// Cloning yields another handle to the same store.
///
/// # Example
///
/// ```rust
/// use nestdb_codec::Value;
/// use nestdb_core::{IndexSpec, Store, StoreConfig};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> Result<(), nestdb_core::CoreError> {
/// let store = Store::in_memory(StoreConfig::new().index(IndexSpec::new("name").unique()))?;
///
/// let doc = store
///     .insert(vec![("name", Value::from("ada"))].into_iter().collect())
///     .await?;
/// let found = store
///     .find_one(&vec![("name", Value::from("ada"))].into_iter().collect())
///     .await?;
/// assert_eq!(found, Some(doc));
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Store {
    inner: Arc<Inner>,
}

impl fmt::Debug for Store {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Store")
            .field("namespace", &self.inner.config.namespace)
            .field("state", &*self.inner.state.lock())
            .finish_non_exhaustive()
    }
}

impl Store {
    /// Opens a store over `backend`.
    ///
    /// With `autoload` set and a tokio runtime available, the load starts
    /// in the background right away; otherwise it starts with the first
    /// operation.
    ///
    /// # Errors
    ///
    /// Returns a validation error for an empty namespace, one containing a
    /// NUL byte, or a malformed index declaration.
    pub fn open(config: StoreConfig, backend: Arc<dyn KvBackend>) -> CoreResult<Self> {
        if config.namespace.is_empty() || config.namespace.contains('\0') {
            return Err(CoreError::validation(format!(
                "invalid namespace {:?}",
                config.namespace
            )));
        }
        let mut declared: Vec<IndexSpec> = Vec::new();
        for spec in &config.indexes {
            validate_index_field(&spec.field_name)?;
            if spec.field_name != ID_FIELD
                && !declared.iter().any(|d| d.field_name == spec.field_name)
            {
                declared.push(spec.clone());
            }
        }

        let mut prefix = config.namespace.as_bytes().to_vec();
        prefix.push(0);
        let io_gate = Throttle::new(config.io_concurrency);
        let autoload = config.autoload;

        let store = Self {
            inner: Arc::new(Inner {
                config,
                prefix,
                backend,
                state: Mutex::new(StoreState::Uninitialized),
                engine: RwLock::new(IndexEngine::new()),
                declared: Mutex::new(declared),
                load_gate: Throttle::new(1),
                io_gate,
                commit: tokio::sync::RwLock::new(()),
                locks: DocumentLocks::new(),
                stats: StoreStats::new(),
            }),
        };

        if autoload && tokio::runtime::Handle::try_current().is_ok() && store.begin_initial_load() {
            // Failures are logged by the load itself and reported to queued callers.
            drop(store.spawn_load());
        }
        Ok(store)
    }

    /// Opens a store over a fresh [`InMemoryBackend`].
    ///
    /// # Errors
    ///
    /// See [`Store::open`].
    pub fn in_memory(config: StoreConfig) -> CoreResult<Self> {
        Self::open(config, Arc::new(InMemoryBackend::new()))
    }

    /// The store namespace.
    #[must_use]
    pub fn namespace(&self) -> &str {
        &self.inner.config.namespace
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> StoreState {
        *self.inner.state.lock()
    }

    /// Counter snapshot.
    #[must_use]
    pub fn stats(&self) -> StatsSnapshot {
        self.inner.stats.snapshot()
    }

    /// Reloads every document from the backend and rebuilds all indexes.
    ///
    /// Waits for a load already in progress, then starts a new one.
    ///
    /// # Errors
    ///
    /// Fails on backend errors, undecodable records or records stored under
    /// a key that does not match their `_id`. The store is left
    /// `Uninitialized`.
    pub async fn load(&self) -> CoreResult<LoadReport> {
        loop {
            if self.begin_load() {
                return self.spawn_load().await.map_err(CoreError::task)?;
            }
            drop(self.inner.load_gate.acquire().await);
        }
    }

    // ------------------------------------------------------------------
    // Mutations
    // ------------------------------------------------------------------

    /// Inserts one document, assigning an `_id` if it has none.
    ///
    /// # Errors
    ///
    /// See [`Store::insert_many`].
    pub async fn insert(&self, doc: Value) -> CoreResult<Document> {
        let mut docs = self.insert_many(vec![doc]).await?;
        docs.pop()
            .ok_or_else(|| CoreError::task("insert produced no document"))
    }

    /// Inserts documents as one batch.
    ///
    /// # Errors
    ///
    /// Returns a validation error for a malformed document, a unique
    /// violation from any index (including duplicate `_id`s), or a backend
    /// error. On error nothing is inserted.
    pub async fn insert_many(&self, docs: Vec<Value>) -> CoreResult<Vec<Document>> {
        let _admitted = self.ready().await?;
        if docs.is_empty() {
            return Ok(Vec::new());
        }
        let _commit = self.inner.commit.read().await;

        let prepared = self.prepare_new(docs)?;
        let _guards = self.lock_new(&prepared).await;
        let changes: Vec<Change> = prepared.iter().cloned().map(Change::insert).collect();
        self.commit(&changes).await?;

        self.inner.stats.record_inserts(prepared.len());
        debug!(namespace = %self.namespace(), count = prepared.len(), "inserted documents");
        Ok(prepared.iter().map(|d| Document::clone(d)).collect())
    }

    /// Updates the documents matching `query`.
    ///
    /// Each matched document is locked while it is rewritten, so concurrent
    /// updates of one document apply one after the other. With
    /// `multi = false` the first document that still matches once locked
    /// is updated. With `upsert` and no match, a document is inserted:
    /// for an operator update it starts from the query's plain fields,
    /// otherwise it is the replacement document itself.
    ///
    /// # Errors
    ///
    /// Returns validation errors for malformed queries, update errors from
    /// the applier, unique violations and backend errors. On error no
    /// document changes.
    pub async fn update(
        &self,
        query: &Value,
        update: &Value,
        options: UpdateOptions,
    ) -> CoreResult<UpdateResult> {
        let _admitted = self.ready().await?;
        check_query(query)?;
        let _commit = self.inner.commit.read().await;

        let (targets, _guards) = self.lock_matches(query, options.multi).await?;

        if targets.is_empty() {
            if !options.upsert {
                return Ok(UpdateResult::default());
            }
            let base = self.upsert_base(query, update)?;
            let prepared = self.prepare_new(vec![base])?;
            let _new_guards = self.lock_new(&prepared).await;
            let changes: Vec<Change> = prepared.iter().cloned().map(Change::insert).collect();
            self.commit(&changes).await?;
            self.inner.stats.record_inserts(prepared.len());
            debug!(namespace = %self.namespace(), "upserted document");
            return Ok(UpdateResult {
                count: prepared.len(),
                upserted: prepared.first().map(|d| Document::clone(d)),
            });
        }

        let mut changes = Vec::with_capacity(targets.len());
        for old in targets {
            let value = self.inner.config.updater.apply(&old, update)?;
            let new = Document::try_from(value)?;
            changes.push(Change::update(old, Arc::new(new)));
        }
        self.commit(&changes).await?;

        self.inner.stats.record_updates(changes.len());
        debug!(namespace = %self.namespace(), count = changes.len(), "updated documents");
        Ok(UpdateResult {
            count: changes.len(),
            upserted: None,
        })
    }

    /// Inserts or replaces one document by `_id`.
    ///
    /// # Errors
    ///
    /// See [`Store::save_many`].
    pub async fn save(&self, doc: Value) -> CoreResult<(Document, SaveCounts)> {
        let (mut docs, counts) = self.save_many(vec![doc]).await?;
        let doc = docs
            .pop()
            .ok_or_else(|| CoreError::task("save produced no document"))?;
        Ok((doc, counts))
    }

    /// Inserts or replaces documents by `_id` as one batch.
    ///
    /// Documents whose `_id` exists replace the stored version; the others
    /// are inserted (with a generated `_id` if they have none).
    ///
    /// # Errors
    ///
    /// Same as [`Store::insert_many`]; on error nothing changes.
    pub async fn save_many(&self, docs: Vec<Value>) -> CoreResult<(Vec<Document>, SaveCounts)> {
        let _admitted = self.ready().await?;
        if docs.is_empty() {
            return Ok((Vec::new(), SaveCounts::default()));
        }
        let _commit = self.inner.commit.read().await;

        let ids: BTreeSet<Value> = docs
            .iter()
            .filter_map(|d| d.get(ID_FIELD).cloned())
            .collect();
        let _guards = self.inner.locks.acquire_many(ids.iter().cloned()).await;

        let (changes, counts) = self.plan_save(docs)?;
        // Generated ids are unseen by anyone else until the batch applies.
        let generated: Vec<Value> = changes
            .iter()
            .filter_map(|c| c.new.as_ref())
            .map(|d| d.id().clone())
            .filter(|id| !ids.contains(id))
            .collect();
        let _generated_guards = self.inner.locks.acquire_many(generated).await;
        self.commit(&changes).await?;

        self.inner.stats.record_inserts(counts.inserted);
        self.inner.stats.record_updates(counts.updated);
        debug!(
            namespace = %self.namespace(),
            inserted = counts.inserted,
            updated = counts.updated,
            "saved documents"
        );
        let saved = changes
            .iter()
            .filter_map(|c| c.new.as_deref().cloned())
            .collect();
        Ok((saved, counts))
    }

    /// Removes the documents matching `query` and returns how many.
    ///
    /// # Errors
    ///
    /// Returns validation errors for malformed queries. If the backend
    /// fails after the documents left the indexes, returns
    /// [`CoreError::PartialRemoval`] with the number deleted durably; the
    /// indexes are not restored.
    pub async fn remove(&self, query: &Value, options: RemoveOptions) -> CoreResult<usize> {
        let _admitted = self.ready().await?;
        check_query(query)?;
        let _commit = self.inner.commit.read().await;

        let (targets, _guards) = self.lock_matches(query, options.multi).await?;
        if targets.is_empty() {
            return Ok(0);
        }
        let keys = targets
            .iter()
            .map(|d| self.key_for(d.id()))
            .collect::<CoreResult<Vec<_>>>()?;

        let changes: Vec<Change> = targets.into_iter().map(Change::remove).collect();
        let applied = self.inner.engine.write().apply(&changes);
        applied?;
        let requested = changes.len();
        self.inner.stats.record_removes(requested);

        let outcome = self
            .blocking(move |backend| {
                let mut durable = 0;
                for key in &keys {
                    if let Err(err) = backend.delete(key) {
                        let err = CoreError::backend("delete", Some(key.as_slice()), err);
                        return Ok((durable, Some(err)));
                    }
                    durable += 1;
                }
                Ok((durable, None))
            })
            .await;
        let (durable, failure) = match outcome {
            Ok(done) => done,
            Err(err) => (0, Some(err)),
        };
        if let Some(source) = failure {
            self.inner.stats.record_backend_error();
            warn!(
                namespace = %self.namespace(),
                requested,
                durable,
                error = %source,
                "documents removed from indexes but not from the backend"
            );
            return Err(CoreError::PartialRemoval {
                requested,
                durable,
                source: Box::new(source),
            });
        }

        debug!(namespace = %self.namespace(), count = requested, "removed documents");
        Ok(requested)
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    /// Returns every document matching `query`, in access-path order.
    ///
    /// # Errors
    ///
    /// Returns a validation error for a malformed query.
    pub async fn find(&self, query: &Value) -> CoreResult<Vec<Document>> {
        self.find_with(query, &FindOptions::default()).await
    }

    /// Returns the matching documents sorted, skipped and limited per
    /// `options`.
    ///
    /// # Errors
    ///
    /// Returns a validation error for a malformed query.
    pub async fn find_with(&self, query: &Value, options: &FindOptions) -> CoreResult<Vec<Document>> {
        let _admitted = self.ready().await?;
        check_query(query)?;
        let docs = self
            .matching(query)?
            .iter()
            .map(|d| Document::clone(d))
            .collect();
        Ok(options.apply(docs))
    }

    /// Returns the first matching document.
    ///
    /// # Errors
    ///
    /// Returns a validation error for a malformed query.
    pub async fn find_one(&self, query: &Value) -> CoreResult<Option<Document>> {
        let _admitted = self.ready().await?;
        check_query(query)?;
        let candidates = self.candidates(query);
        for doc in candidates.docs {
            if self.inner.config.matcher.matches(&doc, query)? {
                return Ok(Some(Document::clone(&doc)));
            }
        }
        Ok(None)
    }

    /// Counts the matching documents.
    ///
    /// # Errors
    ///
    /// Returns a validation error for a malformed query.
    pub async fn count(&self, query: &Value) -> CoreResult<usize> {
        let _admitted = self.ready().await?;
        check_query(query)?;
        Ok(self.matching(query)?.len())
    }

    /// Reads one document straight from the backend, bypassing the indexes.
    ///
    /// # Errors
    ///
    /// Returns backend and decoding errors.
    pub async fn fetch_durable(&self, id: &Value) -> CoreResult<Option<Document>> {
        let key = self.key_for(id)?;
        let read = self
            .blocking(move |backend| {
                backend
                    .get(&key)
                    .map_err(|err| CoreError::backend("get", Some(key.as_slice()), err))
            })
            .await?;
        let Some(bytes) = read else {
            return Ok(None);
        };
        self.inner.stats.record_read(bytes.len());
        Ok(Some(self.inner.config.codec.decode(&bytes)?))
    }

    // ------------------------------------------------------------------
    // Indexes
    // ------------------------------------------------------------------

    /// Declares an index on `spec.field_name`. Declaring an indexed field
    /// again does nothing.
    ///
    /// On a ready store the index is built right away from the documents
    /// in memory; existing indexes stay queryable meanwhile. Before the
    /// first load the declaration is recorded and built by the load.
    ///
    /// # Errors
    ///
    /// Returns a validation error for a malformed field name, or the unique
    /// violation that prevented the build. A failed build installs nothing.
    pub async fn ensure_index(&self, spec: IndexSpec) -> CoreResult<()> {
        validate_index_field(&spec.field_name)?;
        if spec.field_name == ID_FIELD {
            return Ok(());
        }
        {
            let state = self.inner.state.lock();
            if *state == StoreState::Uninitialized {
                self.declare(spec);
                return Ok(());
            }
        }

        let _admitted = self.ready().await?;
        let _commit = self.inner.commit.write().await;
        let docs = {
            let engine = self.inner.engine.read();
            if engine.contains(&spec.field_name) {
                return Ok(());
            }
            engine.all_documents()
        };

        let mut index = FieldIndex::new(spec.clone());
        if let Err(err) = index.insert_many(&docs) {
            warn!(
                namespace = %self.namespace(),
                field = %spec.field_name,
                error = %err,
                "index build failed, not installed"
            );
            return Err(err);
        }
        let installed = self.inner.engine.write().install(index);
        self.declare(spec.clone());
        if installed {
            info!(
                namespace = %self.namespace(),
                field = %spec.field_name,
                unique = spec.unique,
                sparse = spec.sparse,
                documents = docs.len(),
                "index built"
            );
        }
        Ok(())
    }

    /// Drops the index on `field`.
    ///
    /// # Errors
    ///
    /// The `_id` index cannot be removed; an unknown field is
    /// [`CoreError::IndexNotFound`].
    pub async fn remove_index(&self, field: &str) -> CoreResult<()> {
        if field == ID_FIELD {
            return Err(CoreError::validation("the _id index cannot be removed"));
        }
        let uninitialized = *self.inner.state.lock() == StoreState::Uninitialized;
        let _admitted = if uninitialized {
            None
        } else {
            self.ready().await?
        };
        let _commit = self.inner.commit.write().await;

        let was_declared = {
            let mut declared = self.inner.declared.lock();
            let before = declared.len();
            declared.retain(|s| s.field_name != field);
            declared.len() != before
        };
        let was_built = self.inner.engine.write().drop_index(field)?;
        if !was_declared && !was_built {
            return Err(CoreError::index_not_found(field));
        }
        info!(namespace = %self.namespace(), field, "index removed");
        Ok(())
    }

    /// Declared indexes, `_id` first, then by field name.
    #[must_use]
    pub fn list_indexes(&self) -> Vec<IndexSpec> {
        let mut secondary = self.inner.declared.lock().clone();
        secondary.sort_by(|a, b| a.field_name.cmp(&b.field_name));
        let mut specs = vec![IndexSpec::id()];
        specs.extend(secondary);
        specs
    }

    /// Contents of the index on `field` as `(key, [_id])` pairs in key
    /// order.
    ///
    /// # Errors
    ///
    /// [`CoreError::IndexNotFound`] if `field` has no built index.
    pub async fn index_entries(&self, field: &str) -> CoreResult<Vec<(Value, Vec<Value>)>> {
        let _admitted = self.ready().await?;
        self.inner
            .engine
            .read()
            .get(field)
            .map(FieldIndex::entries)
            .ok_or_else(|| CoreError::index_not_found(field))
    }

    /// Verifies the ordering and balance of every index tree.
    ///
    /// # Errors
    ///
    /// Describes the first inconsistency found.
    pub fn check_invariants(&self) -> Result<(), String> {
        self.inner.engine.read().check_invariants()
    }

    // ------------------------------------------------------------------
    // Loading
    // ------------------------------------------------------------------

    /// Waits until the store is ready, starting the load if nobody has.
    ///
    /// An operation that had to wait gets the load gate's permit back and
    /// holds it for its whole body, so queued operations run one at a time
    /// in arrival order. `None` means the store was already ready.
    async fn ready(&self) -> CoreResult<Option<Permit>> {
        loop {
            let waited_for_load = match self.state() {
                StoreState::Ready => return Ok(None),
                StoreState::IndexesBuilding => true,
                StoreState::Uninitialized => false,
            };
            let permit = self.inner.load_gate.acquire().await;
            match self.state() {
                StoreState::Ready => return Ok(Some(permit)),
                StoreState::Uninitialized if waited_for_load => {
                    return Err(CoreError::load_failed(
                        "the load this operation waited for failed",
                    ));
                }
                StoreState::Uninitialized => {
                    if self.begin_initial_load() {
                        self.spawn_load().await.map_err(CoreError::task)??;
                        return Ok(Some(permit));
                    }
                }
                // An explicit reload started after admission.
                StoreState::IndexesBuilding => {}
            }
        }
    }

    /// Moves to `IndexesBuilding` and pauses the load gate. Returns false if
    /// a load is already running.
    fn begin_load(&self) -> bool {
        self.begin_load_from(|state| state != StoreState::IndexesBuilding)
    }

    /// Like [`begin_load`](Self::begin_load), but only from `Uninitialized`.
    fn begin_initial_load(&self) -> bool {
        self.begin_load_from(|state| state == StoreState::Uninitialized)
    }

    fn begin_load_from(&self, allowed: impl Fn(StoreState) -> bool) -> bool {
        let mut state = self.inner.state.lock();
        if !allowed(*state) {
            return false;
        }
        *state = StoreState::IndexesBuilding;
        self.inner.load_gate.pause();
        true
    }

    /// Runs the load on its own task so that it completes even if the
    /// caller stops waiting.
    fn spawn_load(&self) -> JoinHandle<CoreResult<LoadReport>> {
        let store = self.clone();
        tokio::spawn(async move { store.run_load().await })
    }

    async fn run_load(&self) -> CoreResult<LoadReport> {
        info!(namespace = %self.namespace(), "loading store");
        let result = {
            let _commit = self.inner.commit.write().await;
            self.rebuild().await
        };

        {
            let mut state = self.inner.state.lock();
            match &result {
                Ok(report) => {
                    *state = StoreState::Ready;
                    self.inner.stats.record_load();
                    info!(
                        namespace = %self.namespace(),
                        documents = report.documents,
                        dropped_indexes = report.dropped_indexes.len(),
                        "store ready"
                    );
                }
                Err(err) => {
                    *state = StoreState::Uninitialized;
                    warn!(namespace = %self.namespace(), error = %err, "store load failed");
                }
            }
        }
        self.inner.load_gate.resume();
        result
    }

    async fn rebuild(&self) -> CoreResult<LoadReport> {
        let prefix = self.inner.prefix.clone();
        let records = self
            .blocking(move |backend| {
                let scan = |err| CoreError::backend("scan", Some(prefix.as_slice()), err);
                backend
                    .scan(&prefix)
                    .map_err(scan)?
                    .collect::<StorageResult<Vec<_>>>()
                    .map_err(scan)
            })
            .await?;

        let mut docs = Vec::with_capacity(records.len());
        for (key, bytes) in records {
            self.inner.stats.record_read(bytes.len());
            let doc = self.inner.config.codec.decode(&bytes).map_err(|err| {
                CoreError::load_failed(format!("undecodable record {}: {err}", hex(&key)))
            })?;
            if self.key_for(doc.id())? != key {
                return Err(CoreError::load_failed(format!(
                    "record {} holds _id {}",
                    hex(&key),
                    doc.id()
                )));
            }
            docs.push(Arc::new(doc));
        }

        let mut engine = IndexEngine::new();
        let changes: Vec<Change> = docs.into_iter().map(Change::insert).collect();
        engine
            .apply(&changes)
            .map_err(|err| CoreError::load_failed(err.to_string()))?;

        let declared = self.inner.declared.lock().clone();
        let mut dropped_indexes = Vec::new();
        for spec in declared {
            match engine.ensure(spec.clone()) {
                Ok(_) => {}
                Err(err) if err.is_unique_violation() => {
                    warn!(
                        namespace = %self.namespace(),
                        field = %spec.field_name,
                        error = %err,
                        "declared index violates uniqueness, not installed"
                    );
                    dropped_indexes.push(spec.field_name);
                }
                Err(err) => return Err(err),
            }
        }
        if !dropped_indexes.is_empty() {
            self.inner
                .declared
                .lock()
                .retain(|s| !dropped_indexes.contains(&s.field_name));
        }

        let documents = engine.document_count();
        *self.inner.engine.write() = engine;
        Ok(LoadReport {
            documents,
            dropped_indexes,
        })
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn declare(&self, spec: IndexSpec) {
        let mut declared = self.inner.declared.lock();
        if !declared.iter().any(|s| s.field_name == spec.field_name) {
            declared.push(spec);
        }
    }

    fn key_for(&self, id: &Value) -> CoreResult<Vec<u8>> {
        let mut key = self.inner.prefix.clone();
        key.extend(to_cbor(id)?);
        Ok(key)
    }

    fn candidates(&self, query: &Value) -> Candidates {
        let candidates = self.inner.engine.read().candidates(query);
        match &candidates.path {
            AccessPath::FullScan => {
                self.inner.stats.record_scan();
                if candidates.docs.len() > self.inner.config.scan_warning_threshold {
                    warn!(
                        namespace = %self.namespace(),
                        documents = candidates.docs.len(),
                        "full scan, consider an index"
                    );
                }
            }
            path => {
                self.inner.stats.record_index_lookup();
                debug!(%path, candidates = candidates.docs.len(), "index lookup");
            }
        }
        candidates
    }

    fn matching(&self, query: &Value) -> CoreResult<Vec<Arc<Document>>> {
        let matcher = &self.inner.config.matcher;
        let mut out = Vec::new();
        for doc in self.candidates(query).docs {
            if matcher.matches(&doc, query)? {
                out.push(doc);
            }
        }
        Ok(out)
    }

    /// The stored version of `id`, if it still matches `query`.
    fn current_match(&self, id: &Value, query: &Value) -> CoreResult<Option<Arc<Document>>> {
        let current = self.inner.engine.read().document(id);
        match current {
            Some(doc) if self.inner.config.matcher.matches(&doc, query)? => Ok(Some(doc)),
            _ => Ok(None),
        }
    }

    /// Locks the matches of `query` and returns their current versions.
    async fn lock_matches(
        &self,
        query: &Value,
        multi: bool,
    ) -> CoreResult<(Vec<Arc<Document>>, Vec<DocumentGuard>)> {
        let candidates = self.matching(query)?;

        if multi {
            let guards = self
                .inner
                .locks
                .acquire_many(candidates.iter().map(|d| d.id().clone()))
                .await;
            let mut targets = Vec::with_capacity(candidates.len());
            for doc in &candidates {
                if let Some(current) = self.current_match(doc.id(), query)? {
                    targets.push(current);
                }
            }
            return Ok((targets, guards));
        }

        for doc in &candidates {
            let guard = self.inner.locks.acquire(doc.id().clone()).await;
            if let Some(current) = self.current_match(doc.id(), query)? {
                return Ok((vec![current], vec![guard]));
            }
        }
        Ok((Vec::new(), Vec::new()))
    }

    /// Locks the `_id`s of documents about to be created. They become
    /// visible when the batch applies, before their backend write.
    async fn lock_new(&self, docs: &[Arc<Document>]) -> Vec<DocumentGuard> {
        self.inner
            .locks
            .acquire_many(docs.iter().map(|d| d.id().clone()))
            .await
    }

    /// Validates new documents and assigns missing `_id`s.
    fn prepare_new(&self, values: Vec<Value>) -> CoreResult<Vec<Arc<Document>>> {
        let engine = self.inner.engine.read();
        let mut taken = BTreeSet::new();
        let mut docs = Vec::with_capacity(values.len());
        for value in values {
            let doc = self.new_document(value, &engine, &taken)?;
            taken.insert(doc.id().clone());
            docs.push(Arc::new(doc));
        }
        Ok(docs)
    }

    fn new_document(
        &self,
        value: Value,
        engine: &IndexEngine,
        taken: &BTreeSet<Value>,
    ) -> CoreResult<Document> {
        let Value::Map(mut fields) = value else {
            return Err(CoreError::validation(format!(
                "document must be a map, got {}",
                value.type_name()
            )));
        };
        if !fields.contains_key(ID_FIELD) {
            fields.insert(ID_FIELD.to_string(), self.generate_id(engine, taken)?);
        }
        Document::try_from(fields)
    }

    fn generate_id(&self, engine: &IndexEngine, taken: &BTreeSet<Value>) -> CoreResult<Value> {
        for _ in 0..MAX_ID_ATTEMPTS {
            let id = self.inner.config.id_generator.generate();
            if !engine.contains_id(&id) && !taken.contains(&id) {
                validate_id(&id)?;
                return Ok(id);
            }
            debug!(%id, "generated _id already taken, retrying");
        }
        Err(CoreError::validation(format!(
            "no unused _id after {MAX_ID_ATTEMPTS} attempts"
        )))
    }

    fn plan_save(&self, values: Vec<Value>) -> CoreResult<(Vec<Change>, SaveCounts)> {
        let engine = self.inner.engine.read();
        let mut taken = BTreeSet::new();
        let mut counts = SaveCounts::default();
        let mut changes = Vec::with_capacity(values.len());
        for value in values {
            let doc = Arc::new(self.new_document(value, &engine, &taken)?);
            taken.insert(doc.id().clone());
            match engine.document(doc.id()) {
                Some(old) => {
                    counts.updated += 1;
                    changes.push(Change::update(old, doc));
                }
                None => {
                    counts.inserted += 1;
                    changes.push(Change::insert(doc));
                }
            }
        }
        Ok((changes, counts))
    }

    /// Builds the document an upsert inserts.
    fn upsert_base(&self, query: &Value, update: &Value) -> CoreResult<Value> {
        if !has_operators(update) {
            return Ok(update.clone());
        }
        let mut fields = Map::new();
        if let Some(query) = query.as_map() {
            for (path, cond) in query {
                if path.starts_with('$') || has_operators(cond) {
                    continue;
                }
                set_path(&mut fields, path, cond.clone()).map_err(CoreError::validation)?;
            }
        }
        if !fields.contains_key(ID_FIELD) {
            let id = self.generate_id(&self.inner.engine.read(), &BTreeSet::new())?;
            fields.insert(ID_FIELD.to_string(), id);
        }
        let base = Document::try_from(fields)?;
        self.inner.config.updater.apply(&base, update)
    }

    /// Applies `changes` to the indexes and writes them to the backend.
    ///
    /// The caller holds the commit lock shared.
    async fn commit(&self, changes: &[Change]) -> CoreResult<()> {
        let writes = self.plan_writes(changes)?;
        let bytes: usize = writes.iter().map(|w| w.value.len()).sum();

        let applied = self.inner.engine.write().apply(changes);
        if let Err(err) = applied {
            self.inner.stats.record_rollback();
            return Err(err);
        }

        if let Err(err) = self.persist(writes).await {
            self.inner.engine.write().revert(changes);
            self.inner.stats.record_rollback();
            warn!(
                namespace = %self.namespace(),
                changes = changes.len(),
                error = %err,
                "backend write failed, index changes reverted"
            );
            return Err(err);
        }
        self.inner.stats.record_write(bytes);
        Ok(())
    }

    fn plan_writes(&self, changes: &[Change]) -> CoreResult<Vec<WriteOp>> {
        let codec = &self.inner.config.codec;
        let mut writes = Vec::with_capacity(changes.len());
        for change in changes {
            let Some(new) = &change.new else {
                continue;
            };
            writes.push(WriteOp {
                key: self.key_for(new.id())?,
                value: codec.encode(new)?,
                undo: change.old.as_ref().map(|old| codec.encode(old)).transpose()?,
            });
        }
        Ok(writes)
    }

    /// Writes the records in order. On failure, earlier writes are undone
    /// as far as the backend allows.
    async fn persist(&self, writes: Vec<WriteOp>) -> CoreResult<()> {
        self.blocking(move |backend| {
            for (i, write) in writes.iter().enumerate() {
                if let Err(err) = backend.put(&write.key, &write.value) {
                    for done in writes[..i].iter().rev() {
                        let undone = match &done.undo {
                            Some(old) => backend.put(&done.key, old),
                            None => backend.delete(&done.key),
                        };
                        if let Err(undo_err) = undone {
                            warn!(key = %hex(&done.key), error = %undo_err, "could not undo backend write");
                        }
                    }
                    return Err(CoreError::backend("put", Some(write.key.as_slice()), err));
                }
            }
            Ok(())
        })
        .await
    }

    /// Runs a backend call on the blocking pool, behind the I/O gate.
    async fn blocking<T, F>(&self, call: F) -> CoreResult<T>
    where
        F: FnOnce(&dyn KvBackend) -> CoreResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let backend = Arc::clone(&self.inner.backend);
        let result = self
            .inner
            .io_gate
            .push(async move { tokio::task::spawn_blocking(move || call(backend.as_ref())).await })
            .await
            .map_err(CoreError::task)?;
        if let Err(err @ CoreError::Backend { .. }) = &result {
            self.inner.stats.record_backend_error();
            warn!(namespace = %self.namespace(), error = %err, "backend call failed");
        }
        result
    }
}

fn check_query(query: &Value) -> CoreResult<()> {
    if query.as_map().is_none() {
        return Err(CoreError::validation(format!(
            "query must be a map, got {}",
            query.type_name()
        )));
    }
    Ok(())
}

fn validate_index_field(field: &str) -> CoreResult<()> {
    if field.split('.').any(|part| part.is_empty() || part.starts_with('$')) {
        return Err(CoreError::validation(format!(
            "invalid index field {field:?}"
        )));
    }
    Ok(())
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests;
