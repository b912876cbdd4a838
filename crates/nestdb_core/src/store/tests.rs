use super::*;
use crate::document::IdGenerator;
use nestdb_storage::StorageError;
use serde_json::json;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc;

fn v(j: serde_json::Value) -> Value {
    Value::try_from(j).unwrap()
}

fn store_with(indexes: Vec<IndexSpec>) -> Store {
    let config = indexes
        .into_iter()
        .fold(StoreConfig::new(), StoreConfig::index);
    Store::in_memory(config).unwrap()
}

fn field_values(docs: &[Document], field: &str) -> Vec<Value> {
    let mut out: Vec<Value> = docs.iter().filter_map(|d| d.get(field).cloned()).collect();
    out.sort();
    out
}

/// Wraps an in-memory backend with injectable failures.
struct FlakyBackend {
    inner: InMemoryBackend,
    puts_left: AtomicUsize,
    fail_deletes: AtomicBool,
    hold_scan: Mutex<Option<mpsc::Receiver<()>>>,
    hold_put: Mutex<Option<mpsc::Receiver<()>>>,
    put_log: Mutex<Vec<Vec<u8>>>,
}

impl FlakyBackend {
    fn new() -> Self {
        Self {
            inner: InMemoryBackend::new(),
            puts_left: AtomicUsize::new(usize::MAX),
            fail_deletes: AtomicBool::new(false),
            hold_scan: Mutex::new(None),
            hold_put: Mutex::new(None),
            put_log: Mutex::new(Vec::new()),
        }
    }

    /// Makes the next put block until the returned sender fires.
    fn hold_next_put(&self) -> mpsc::Sender<()> {
        let (tx, rx) = mpsc::channel();
        *self.hold_put.lock() = Some(rx);
        tx
    }

    fn put_keys(&self) -> Vec<Vec<u8>> {
        self.put_log.lock().clone()
    }

    /// Makes the next scan block until the returned sender fires.
    fn hold_next_scan(&self) -> mpsc::Sender<()> {
        let (tx, rx) = mpsc::channel();
        *self.hold_scan.lock() = Some(rx);
        tx
    }
}

impl KvBackend for FlakyBackend {
    fn get(&self, key: &[u8]) -> StorageResult<Option<Vec<u8>>> {
        self.inner.get(key)
    }

    fn put(&self, key: &[u8], value: &[u8]) -> StorageResult<()> {
        let held = self.hold_put.lock().take();
        if let Some(rx) = held {
            let _ = rx.recv();
        }
        let allowed = self
            .puts_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if !allowed {
            return Err(StorageError::other("injected put failure"));
        }
        self.put_log.lock().push(key.to_vec());
        self.inner.put(key, value)
    }

    fn delete(&self, key: &[u8]) -> StorageResult<()> {
        if self.fail_deletes.load(Ordering::SeqCst) {
            return Err(StorageError::other("injected delete failure"));
        }
        self.inner.delete(key)
    }

    fn scan(&self, prefix: &[u8]) -> StorageResult<nestdb_storage::KvIter<'_>> {
        let held = self.hold_scan.lock().take();
        if let Some(rx) = held {
            let _ = rx.recv();
        }
        self.inner.scan(prefix)
    }
}

#[derive(Debug)]
struct ScriptedIds(Mutex<VecDeque<&'static str>>);

impl ScriptedIds {
    fn new(ids: &[&'static str]) -> Self {
        Self(Mutex::new(ids.iter().copied().collect()))
    }
}

impl IdGenerator for ScriptedIds {
    fn generate(&self) -> Value {
        Value::from(self.0.lock().pop_front().unwrap_or("x"))
    }
}

#[tokio::test]
async fn duplicate_unique_key_is_rejected() {
    let store = store_with(vec![IndexSpec::new("name").unique()]);
    store.insert(v(json!({"name": "a"}))).await.unwrap();
    store.insert(v(json!({"name": "b"}))).await.unwrap();

    let err = store.insert(v(json!({"name": "a"}))).await.unwrap_err();
    match err {
        CoreError::UniqueViolation { field, key } => {
            assert_eq!(field, "name");
            assert_eq!(key, Value::from("a"));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(store.count(&v(json!({}))).await.unwrap(), 2);
    store.check_invariants().unwrap();
}

#[tokio::test]
async fn failed_batch_leaves_indexes_and_backend_untouched() {
    let backend = Arc::new(InMemoryBackend::new());
    let store = Store::open(
        StoreConfig::new().index(IndexSpec::new("name").unique()),
        backend.clone(),
    )
    .unwrap();
    store
        .insert_many(vec![v(json!({"name": "a"})), v(json!({"name": "b"}))])
        .await
        .unwrap();

    let ids_before = store.index_entries("_id").await.unwrap();
    let names_before = store.index_entries("name").await.unwrap();
    let stats_before = store.stats();

    let err = store
        .insert_many(vec![
            v(json!({"name": "c"})),
            v(json!({"name": "d"})),
            v(json!({"name": "a"})),
        ])
        .await
        .unwrap_err();
    assert!(err.is_unique_violation());

    assert_eq!(store.index_entries("_id").await.unwrap(), ids_before);
    assert_eq!(store.index_entries("name").await.unwrap(), names_before);
    assert_eq!(backend.len(), 2);
    assert_eq!(store.stats().rollbacks, stats_before.rollbacks + 1);
}

#[tokio::test]
async fn duplicate_ids_within_a_batch_are_rejected() {
    let store = store_with(vec![]);
    let err = store
        .insert_many(vec![v(json!({"_id": 1})), v(json!({"_id": 1}))])
        .await
        .unwrap_err();
    assert!(err.is_unique_violation());
    assert_eq!(store.count(&v(json!({}))).await.unwrap(), 0);
}

#[tokio::test]
async fn array_fields_fan_out() {
    let store = store_with(vec![IndexSpec::new("tags")]);
    store
        .insert_many(vec![
            v(json!({"_id": 1, "tags": ["x", "y"]})),
            v(json!({"_id": 2, "tags": ["y", "z"]})),
        ])
        .await
        .unwrap();

    let y = store.find(&v(json!({"tags": "y"}))).await.unwrap();
    assert_eq!(field_values(&y, "_id"), vec![Value::Integer(1), Value::Integer(2)]);

    let x = store.find(&v(json!({"tags": "x"}))).await.unwrap();
    assert_eq!(field_values(&x, "_id"), vec![Value::Integer(1)]);

    let keys: Vec<Value> = store
        .index_entries("tags")
        .await
        .unwrap()
        .into_iter()
        .map(|(k, _)| k)
        .collect();
    assert_eq!(keys, vec![Value::from("x"), Value::from("y"), Value::from("z")]);
    assert!(store.stats().index_lookups >= 2);
}

#[tokio::test]
async fn single_update_touches_one_match() {
    let store = store_with(vec![IndexSpec::new("name")]);
    store
        .insert_many(vec![v(json!({"name": "a"})), v(json!({"name": "a"}))])
        .await
        .unwrap();

    let result = store
        .update(
            &v(json!({"name": "a"})),
            &v(json!({"$set": {"age": 30}})),
            UpdateOptions::new(),
        )
        .await
        .unwrap();
    assert_eq!(result.count, 1);
    assert!(result.upserted.is_none());
    assert_eq!(store.count(&v(json!({"age": 30}))).await.unwrap(), 1);

    let all = store
        .update(
            &v(json!({"name": "a"})),
            &v(json!({"$inc": {"age": 1}})),
            UpdateOptions::new().multi(true),
        )
        .await
        .unwrap();
    assert_eq!(all.count, 2);
    let docs = store.find(&v(json!({"name": "a"}))).await.unwrap();
    assert_eq!(field_values(&docs, "age"), vec![Value::Integer(1), Value::Integer(31)]);
}

#[tokio::test]
async fn updates_are_persisted() {
    let backend = Arc::new(InMemoryBackend::new());
    let store = Store::open(StoreConfig::new(), backend.clone()).unwrap();
    let doc = store.insert(v(json!({"n": 1}))).await.unwrap();

    let by_id: Value = vec![("_id", doc.id().clone())].into_iter().collect();
    store
        .update(&by_id, &v(json!({"$set": {"n": 2}})), UpdateOptions::new())
        .await
        .unwrap();

    let durable = store.fetch_durable(doc.id()).await.unwrap().unwrap();
    assert_eq!(durable.get("n"), Some(&Value::Integer(2)));
}

#[tokio::test]
async fn failed_update_changes_nothing() {
    let store = store_with(vec![IndexSpec::new("name").unique()]);
    store
        .insert_many(vec![v(json!({"_id": 1, "name": "a"})), v(json!({"_id": 2, "name": "b"}))])
        .await
        .unwrap();

    let err = store
        .update(
            &v(json!({"name": "b"})),
            &v(json!({"$set": {"name": "a"}})),
            UpdateOptions::new(),
        )
        .await
        .unwrap_err();
    assert!(err.is_unique_violation());

    let err = store
        .update(
            &v(json!({"name": "b"})),
            &v(json!({"$set": {"_id": 9}})),
            UpdateOptions::new(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::Update { .. }));

    let b = store.find_one(&v(json!({"name": "b"}))).await.unwrap().unwrap();
    assert_eq!(b.id(), &Value::Integer(2));
    let durable = store.fetch_durable(&Value::Integer(2)).await.unwrap().unwrap();
    assert_eq!(durable.get("name"), Some(&Value::from("b")));
}

#[tokio::test]
async fn remove_clears_indexes_and_backend() {
    let backend = Arc::new(InMemoryBackend::new());
    let store = Store::open(
        StoreConfig::new().index(IndexSpec::new("name")),
        backend.clone(),
    )
    .unwrap();
    let docs = store
        .insert_many(vec![
            v(json!({"name": "a"})),
            v(json!({"name": "b"})),
            v(json!({"name": "b"})),
        ])
        .await
        .unwrap();

    let removed = store
        .remove(&v(json!({"name": "b"})), RemoveOptions::all())
        .await
        .unwrap();
    assert_eq!(removed, 2);
    assert!(store.find(&v(json!({"name": "b"}))).await.unwrap().is_empty());
    assert_eq!(backend.len(), 1);
    for doc in &docs[1..] {
        assert!(store.fetch_durable(doc.id()).await.unwrap().is_none());
    }
    let name_keys: Vec<Value> = store
        .index_entries("name")
        .await
        .unwrap()
        .into_iter()
        .map(|(k, _)| k)
        .collect();
    assert_eq!(name_keys, vec![Value::from("a")]);

    assert_eq!(
        store.remove(&v(json!({"name": "a"})), RemoveOptions::one()).await.unwrap(),
        1
    );
    assert_eq!(
        store.remove(&v(json!({"name": "a"})), RemoveOptions::one()).await.unwrap(),
        0
    );
}

#[tokio::test]
async fn unique_index_on_duplicates_is_not_installed() {
    let store = store_with(vec![IndexSpec::new("name")]);
    store
        .insert_many(vec![
            v(json!({"name": "a", "age": 30})),
            v(json!({"name": "b", "age": 30})),
        ])
        .await
        .unwrap();

    let err = store
        .ensure_index(IndexSpec::new("age").unique())
        .await
        .unwrap_err();
    assert!(err.is_unique_violation());

    let fields: Vec<String> = store.list_indexes().into_iter().map(|s| s.field_name).collect();
    assert_eq!(fields, vec!["_id".to_string(), "name".to_string()]);
    assert!(matches!(
        store.index_entries("age").await,
        Err(CoreError::IndexNotFound { .. })
    ));
    assert_eq!(store.count(&v(json!({"age": 30}))).await.unwrap(), 2);
    assert_eq!(store.count(&v(json!({"name": "a"}))).await.unwrap(), 1);
}

#[tokio::test]
async fn ensure_and_remove_index_on_ready_store() {
    let store = store_with(vec![]);
    store
        .insert_many((0..10).map(|i| v(json!({"n": i}))).collect())
        .await
        .unwrap();

    store.ensure_index(IndexSpec::new("n")).await.unwrap();
    store.ensure_index(IndexSpec::new("n").unique()).await.unwrap();
    let specs = store.list_indexes();
    assert_eq!(specs.len(), 2);
    assert!(!specs[1].unique);

    let before = store.stats();
    let hits = store.find(&v(json!({"n": {"$gte": 7}}))).await.unwrap();
    assert_eq!(hits.len(), 3);
    assert_eq!(store.stats().index_lookups, before.index_lookups + 1);

    store.remove_index("n").await.unwrap();
    assert!(matches!(
        store.remove_index("n").await,
        Err(CoreError::IndexNotFound { .. })
    ));
    assert!(matches!(
        store.remove_index("_id").await,
        Err(CoreError::Validation { .. })
    ));

    let before = store.stats();
    assert_eq!(store.find(&v(json!({"n": {"$gte": 7}}))).await.unwrap().len(), 3);
    assert_eq!(store.stats().scans, before.scans + 1);
}

#[tokio::test]
async fn index_declared_before_load_is_built_by_it() {
    let backend = Arc::new(InMemoryBackend::new());
    let writer = Store::open(StoreConfig::new(), backend.clone()).unwrap();
    writer
        .insert_many(vec![v(json!({"k": 1})), v(json!({"k": 2}))])
        .await
        .unwrap();

    let store = Store::open(StoreConfig::new().autoload(false), backend).unwrap();
    assert_eq!(store.state(), StoreState::Uninitialized);
    store.ensure_index(IndexSpec::new("k").unique()).await.unwrap();
    assert_eq!(store.state(), StoreState::Uninitialized);

    let report = store.load().await.unwrap();
    assert_eq!(report.documents, 2);
    assert!(report.dropped_indexes.is_empty());
    assert_eq!(store.index_entries("k").await.unwrap().len(), 2);
}

#[tokio::test]
async fn load_drops_declared_index_that_violates_uniqueness() {
    let backend = Arc::new(InMemoryBackend::new());
    let writer = Store::open(StoreConfig::new(), backend.clone()).unwrap();
    writer
        .insert_many(vec![v(json!({"age": 1})), v(json!({"age": 1}))])
        .await
        .unwrap();

    let store = Store::open(
        StoreConfig::new()
            .autoload(false)
            .index(IndexSpec::new("age").unique()),
        backend,
    )
    .unwrap();
    let report = store.load().await.unwrap();
    assert_eq!(report.documents, 2);
    assert_eq!(report.dropped_indexes, vec!["age".to_string()]);
    assert_eq!(store.list_indexes(), vec![IndexSpec::id()]);
    assert_eq!(store.state(), StoreState::Ready);
}

#[tokio::test]
async fn reopen_sees_the_same_documents() {
    let backend = Arc::new(InMemoryBackend::new());
    let first = Store::open(StoreConfig::new(), backend.clone()).unwrap();
    let written = first
        .insert_many((0..20).map(|i| v(json!({"i": i, "tags": ["t"]}))).collect())
        .await
        .unwrap();
    first
        .remove(&v(json!({"i": {"$lt": 5}})), RemoveOptions::all())
        .await
        .unwrap();

    let second = Store::open(StoreConfig::new(), backend).unwrap();
    let mut expected: Vec<Document> = written
        .into_iter()
        .filter(|d| d.get("i").and_then(Value::as_integer).unwrap_or(0) >= 5)
        .collect();
    let mut found = second.find(&v(json!({}))).await.unwrap();
    expected.sort_by(|a, b| a.id().cmp(b.id()));
    found.sort_by(|a, b| a.id().cmp(b.id()));
    assert_eq!(found, expected);
    assert_eq!(second.stats().loads, 1);
}

#[tokio::test]
async fn namespaces_share_a_backend() {
    let backend = Arc::new(InMemoryBackend::new());
    let users = Store::open(StoreConfig::new().namespace("users"), backend.clone()).unwrap();
    let posts = Store::open(StoreConfig::new().namespace("posts"), backend.clone()).unwrap();
    users.insert(v(json!({"_id": 1}))).await.unwrap();
    posts.insert(v(json!({"_id": 1}))).await.unwrap();
    posts.insert(v(json!({"_id": 2}))).await.unwrap();

    assert_eq!(backend.len(), 3);
    let reopened = Store::open(StoreConfig::new().namespace("users"), backend).unwrap();
    assert_eq!(reopened.count(&v(json!({}))).await.unwrap(), 1);
    assert!(Store::in_memory(StoreConfig::new().namespace("")).is_err());
}

#[tokio::test]
async fn generated_ids_skip_taken_values() {
    let store = Store::in_memory(
        StoreConfig::new().id_generator(Arc::new(ScriptedIds::new(&["a", "a", "b"]))),
    )
    .unwrap();
    store.insert(v(json!({"_id": "a"}))).await.unwrap();

    let doc = store.insert(v(json!({"n": 1}))).await.unwrap();
    assert_eq!(doc.id(), &Value::from("b"));

    // The scripted generator now only yields taken ids.
    store.insert(v(json!({"_id": "x"}))).await.unwrap();
    let err = store.insert(v(json!({"n": 2}))).await.unwrap_err();
    assert!(matches!(err, CoreError::Validation { .. }));
}

#[tokio::test]
async fn default_ids_are_hex_uuids() {
    let store = store_with(vec![]);
    let doc = store.insert(v(json!({"n": 1}))).await.unwrap();
    let id = doc.id().as_text().unwrap();
    assert_eq!(id.len(), 32);
    assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
}

#[tokio::test]
async fn save_inserts_and_replaces() {
    let store = store_with(vec![IndexSpec::new("name")]);
    let a = store.insert(v(json!({"name": "a"}))).await.unwrap();
    let a_id = a.id().as_text().unwrap().to_string();

    let (saved, counts) = store
        .save_many(vec![
            v(json!({"_id": a_id, "name": "a2"})),
            v(json!({"name": "new"})),
        ])
        .await
        .unwrap();
    assert_eq!(counts, SaveCounts { inserted: 1, updated: 1 });
    assert_eq!(saved.len(), 2);
    assert!(store.find(&v(json!({"name": "a"}))).await.unwrap().is_empty());
    assert_eq!(store.count(&v(json!({}))).await.unwrap(), 2);

    let (doc, counts) = store.save(v(json!({"_id": a_id, "name": "a3"}))).await.unwrap();
    assert_eq!(counts.updated, 1);
    assert_eq!(doc.get("name"), Some(&Value::from("a3")));
    assert_eq!(store.stats().updates, 2);
}

#[tokio::test]
async fn upsert_inserts_when_nothing_matches() {
    let store = store_with(vec![]);

    let result = store
        .update(
            &v(json!({"name": "z", "age": {"$gt": 1}})),
            &v(json!({"$set": {"age": 5}})),
            UpdateOptions::new().upsert(true),
        )
        .await
        .unwrap();
    assert_eq!(result.count, 1);
    let doc = result.upserted.unwrap();
    assert_eq!(doc.get("name"), Some(&Value::from("z")));
    assert_eq!(doc.get("age"), Some(&Value::Integer(5)));

    let replaced = store
        .update(
            &v(json!({"name": "q"})),
            &v(json!({"name": "q", "kind": "replacement"})),
            UpdateOptions::new().upsert(true),
        )
        .await
        .unwrap();
    assert!(replaced.upserted.is_some());

    let matched = store
        .update(
            &v(json!({"name": "z"})),
            &v(json!({"$set": {"age": 6}})),
            UpdateOptions::new().upsert(true),
        )
        .await
        .unwrap();
    assert!(matched.upserted.is_none());
    assert_eq!(store.count(&v(json!({}))).await.unwrap(), 2);
}

#[tokio::test]
async fn backend_write_failure_reverts_everything() {
    let backend = Arc::new(FlakyBackend::new());
    let store = Store::open(
        StoreConfig::new().index(IndexSpec::new("n")),
        backend.clone(),
    )
    .unwrap();
    store.insert(v(json!({"_id": 0, "n": 0}))).await.unwrap();

    backend.puts_left.store(1, Ordering::SeqCst);
    let err = store
        .insert_many((1..4).map(|i| v(json!({"_id": i, "n": i}))).collect())
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::Backend { operation: "put", .. }));
    assert_eq!(store.count(&v(json!({}))).await.unwrap(), 1);
    assert_eq!(backend.inner.len(), 1);
    assert_eq!(store.index_entries("n").await.unwrap().len(), 1);

    backend.puts_left.store(0, Ordering::SeqCst);
    assert!(store
        .update(&v(json!({"_id": 0})), &v(json!({"$set": {"n": 9}})), UpdateOptions::new())
        .await
        .is_err());
    let doc = store.find_one(&v(json!({"_id": 0}))).await.unwrap().unwrap();
    assert_eq!(doc.get("n"), Some(&Value::Integer(0)));

    let stats = store.stats();
    assert_eq!(stats.rollbacks, 2);
    assert_eq!(stats.backend_errors, 2);
}

#[tokio::test]
async fn failed_backend_delete_is_a_partial_removal() {
    let backend = Arc::new(FlakyBackend::new());
    let store = Store::open(StoreConfig::new(), backend.clone()).unwrap();
    store
        .insert_many(vec![v(json!({"_id": 1, "k": 1})), v(json!({"_id": 2, "k": 1}))])
        .await
        .unwrap();

    backend.fail_deletes.store(true, Ordering::SeqCst);
    let err = store
        .remove(&v(json!({"k": 1})), RemoveOptions::all())
        .await
        .unwrap_err();
    match err {
        CoreError::PartialRemoval {
            requested, durable, ..
        } => {
            assert_eq!(requested, 2);
            assert_eq!(durable, 0);
        }
        other => panic!("unexpected error: {other}"),
    }
    // Index removal stands; the backend still has the records.
    assert_eq!(store.count(&v(json!({}))).await.unwrap(), 0);
    assert!(store.fetch_durable(&Value::Integer(1)).await.unwrap().is_some());
}

#[tokio::test]
async fn operations_queue_behind_the_load() {
    let backend = Arc::new(FlakyBackend::new());
    backend
        .inner
        .put(b"default\0\x01", &nestdb_codec::to_cbor(&v(json!({"_id": 1}))).unwrap())
        .unwrap();
    let release = backend.hold_next_scan();
    let store = Store::open(StoreConfig::new().autoload(false), backend).unwrap();

    let loader = {
        let store = store.clone();
        tokio::spawn(async move { store.count(&v(json!({}))).await })
    };
    while store.state() != StoreState::IndexesBuilding {
        tokio::task::yield_now().await;
    }

    let mut queued = Vec::new();
    for i in 0..3 {
        let store = store.clone();
        queued.push(tokio::spawn(async move {
            store.insert(v(json!({"_id": 10 + i}))).await
        }));
    }
    while store.inner.load_gate.queued() < 3 {
        tokio::task::yield_now().await;
    }
    assert_eq!(store.state(), StoreState::IndexesBuilding);

    release.send(()).unwrap();
    assert_eq!(loader.await.unwrap().unwrap(), 1);
    for task in queued {
        task.await.unwrap().unwrap();
    }
    assert_eq!(store.state(), StoreState::Ready);
    assert_eq!(store.count(&v(json!({}))).await.unwrap(), 4);
    assert_eq!(store.stats().loads, 1);
}

#[tokio::test]
async fn queued_operations_run_one_at_a_time_in_order() {
    let backend = Arc::new(FlakyBackend::new());
    let release_scan = backend.hold_next_scan();
    let store = Store::open(StoreConfig::new().autoload(false), backend.clone()).unwrap();

    let loader = {
        let store = store.clone();
        tokio::spawn(async move { store.load().await })
    };
    while store.state() != StoreState::IndexesBuilding {
        tokio::task::yield_now().await;
    }

    let mut queued = Vec::new();
    for i in 0..3usize {
        let task_store = store.clone();
        queued.push(tokio::spawn(async move {
            task_store.insert(v(json!({"_id": 10 + i}))).await
        }));
        while store.inner.load_gate.queued() < i + 1 {
            tokio::task::yield_now().await;
        }
    }

    // The first queued insert stalls in its backend write; the others must
    // not overtake it.
    let release_put = backend.hold_next_put();
    release_scan.send(()).unwrap();
    loader.await.unwrap().unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    assert!(backend.put_keys().is_empty());
    assert_eq!(store.inner.load_gate.queued(), 2);

    release_put.send(()).unwrap();
    for task in queued {
        task.await.unwrap().unwrap();
    }
    let expected: Vec<Vec<u8>> = [10, 11, 12]
        .iter()
        .map(|id| store.key_for(&Value::Integer(*id)).unwrap())
        .collect();
    assert_eq!(backend.put_keys(), expected);
}

#[tokio::test]
async fn racing_first_operations_load_once() {
    let store = Store::in_memory(StoreConfig::new().autoload(false)).unwrap();
    let mut readers = Vec::new();
    for _ in 0..4 {
        let store = store.clone();
        readers.push(tokio::spawn(async move { store.count(&v(json!({}))).await }));
    }
    for reader in readers {
        assert_eq!(reader.await.unwrap().unwrap(), 0);
    }
    store.insert(v(json!({"_id": 1}))).await.unwrap();
    assert_eq!(store.stats().loads, 1);
    assert_eq!(store.state(), StoreState::Ready);
}

#[tokio::test]
async fn remove_waits_for_a_pending_insert_write() {
    let backend = Arc::new(FlakyBackend::new());
    let store = Store::open(StoreConfig::new(), backend.clone()).unwrap();
    store.load().await.unwrap();

    let release_put = backend.hold_next_put();
    let insert = {
        let store = store.clone();
        tokio::spawn(async move { store.insert(v(json!({"_id": "x"}))).await })
    };
    // Indexed before its write lands.
    while store.count(&v(json!({"_id": "x"}))).await.unwrap() != 1 {
        tokio::task::yield_now().await;
    }
    let remove = {
        let store = store.clone();
        tokio::spawn(async move { store.remove(&v(json!({"_id": "x"})), RemoveOptions::all()).await })
    };
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    assert!(!remove.is_finished());

    release_put.send(()).unwrap();
    insert.await.unwrap().unwrap();
    assert_eq!(remove.await.unwrap().unwrap(), 1);

    assert_eq!(store.count(&v(json!({}))).await.unwrap(), 0);
    assert!(store.fetch_durable(&Value::from("x")).await.unwrap().is_none());
    store.load().await.unwrap();
    assert_eq!(store.count(&v(json!({}))).await.unwrap(), 0);
}

#[tokio::test]
async fn array_operands_give_the_same_result_with_an_index() {
    let plain = store_with(vec![]);
    let indexed = store_with(vec![IndexSpec::new("tags")]);
    for store in [&plain, &indexed] {
        store
            .insert_many(vec![
                v(json!({"_id": 1, "tags": ["x", "y"]})),
                v(json!({"_id": 2, "tags": ["b"]})),
                v(json!({"_id": 3, "tags": "x"})),
            ])
            .await
            .unwrap();
    }

    for query in [
        json!({"tags": {"$in": [["x", "y"]]}}),
        json!({"tags": {"$in": [["x", "y"], "b"]}}),
        json!({"tags": {"$gte": ["a"]}}),
        json!({"tags": {"$lt": {"k": 1}}}),
        json!({"tags": {"$in": ["x"]}}),
        json!({"tags": {"$gte": "c"}}),
        json!({"tags": ["x", "y"]}),
    ] {
        let query = v(query);
        let expected = plain.find(&query).await.unwrap();
        let mut actual = indexed.find(&query).await.unwrap();
        actual.sort_by(|a, b| a.id().cmp(b.id()));
        let mut expected = expected;
        expected.sort_by(|a, b| a.id().cmp(b.id()));
        assert_eq!(actual, expected, "query {query}");
    }
}

#[tokio::test]
async fn queued_operations_fail_with_the_load() {
    let backend = Arc::new(FlakyBackend::new());
    backend.inner.put(b"default\0\x01", b"\xff\xff").unwrap();
    let release = backend.hold_next_scan();
    let store = Store::open(StoreConfig::new().autoload(false), backend.clone()).unwrap();

    let loader = {
        let store = store.clone();
        tokio::spawn(async move { store.load().await })
    };
    while store.state() != StoreState::IndexesBuilding {
        tokio::task::yield_now().await;
    }
    let waiter = {
        let store = store.clone();
        tokio::spawn(async move { store.find(&v(json!({}))).await })
    };
    while store.inner.load_gate.queued() < 1 {
        tokio::task::yield_now().await;
    }

    release.send(()).unwrap();
    assert!(matches!(
        loader.await.unwrap(),
        Err(CoreError::LoadFailed { .. })
    ));
    assert!(matches!(
        waiter.await.unwrap(),
        Err(CoreError::LoadFailed { .. })
    ));
    assert_eq!(store.state(), StoreState::Uninitialized);

    // Fixing the backend lets the next operation load.
    backend.inner.delete(b"default\0\x01").unwrap();
    assert_eq!(store.count(&v(json!({}))).await.unwrap(), 0);
    assert_eq!(store.state(), StoreState::Ready);
}

#[tokio::test]
async fn record_under_foreign_key_fails_the_load() {
    let backend = Arc::new(InMemoryBackend::new());
    let bytes = nestdb_codec::to_cbor(&v(json!({"_id": "a"}))).unwrap();
    let mut key = b"default\0".to_vec();
    key.extend(nestdb_codec::to_cbor(&Value::from("b")).unwrap());
    backend.put(&key, &bytes).unwrap();

    let store = Store::open(StoreConfig::new().autoload(false), backend).unwrap();
    assert!(matches!(store.load().await, Err(CoreError::LoadFailed { .. })));
}

#[tokio::test]
async fn autoload_starts_on_open() {
    let backend = Arc::new(InMemoryBackend::new());
    let writer = Store::open(StoreConfig::new(), backend.clone()).unwrap();
    writer.insert(v(json!({"_id": 1}))).await.unwrap();

    let store = Store::open(StoreConfig::new(), backend).unwrap();
    assert_ne!(store.state(), StoreState::Uninitialized);
    store.insert(v(json!({"_id": 2}))).await.unwrap();
    assert_eq!(store.count(&v(json!({}))).await.unwrap(), 2);
    assert_eq!(store.stats().loads, 1);
}

#[tokio::test]
async fn explicit_reload_rebuilds_from_backend() {
    let backend = Arc::new(InMemoryBackend::new());
    let store = Store::open(StoreConfig::new(), backend.clone()).unwrap();
    store.insert(v(json!({"_id": 1}))).await.unwrap();

    let other = Store::open(StoreConfig::new(), backend).unwrap();
    other.insert(v(json!({"_id": 2}))).await.unwrap();

    assert_eq!(store.count(&v(json!({}))).await.unwrap(), 1);
    let report = store.load().await.unwrap();
    assert_eq!(report.documents, 2);
    assert_eq!(store.count(&v(json!({}))).await.unwrap(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_updates_of_one_document_serialize() {
    let store = store_with(vec![]);
    store.insert(v(json!({"_id": "c", "n": 0}))).await.unwrap();

    let mut handles = Vec::new();
    for _ in 0..20 {
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            store
                .update(
                    &v(json!({"_id": "c"})),
                    &v(json!({"$inc": {"n": 1}})),
                    UpdateOptions::new(),
                )
                .await
        }));
    }
    for h in handles {
        assert_eq!(h.await.unwrap().unwrap().count, 1);
    }
    let doc = store.find_one(&v(json!({"_id": "c"}))).await.unwrap().unwrap();
    assert_eq!(doc.get("n"), Some(&Value::Integer(20)));
    let durable = store.fetch_durable(&Value::from("c")).await.unwrap().unwrap();
    assert_eq!(durable, doc);
}

#[tokio::test]
async fn find_options_and_validation() {
    let store = store_with(vec![IndexSpec::new("n")]);
    store
        .insert_many((0..6).map(|i| v(json!({"_id": i, "n": i % 3}))).collect())
        .await
        .unwrap();

    let page = store
        .find_with(
            &v(json!({})),
            &FindOptions::new().sort("n", Direction::Descending).limit(2),
        )
        .await
        .unwrap();
    assert_eq!(field_values(&page, "n"), vec![Value::Integer(2), Value::Integer(2)]);

    let one = store.find_one(&v(json!({"n": 1}))).await.unwrap().unwrap();
    assert_eq!(one.get("n"), Some(&Value::Integer(1)));
    assert!(store.find_one(&v(json!({"n": 7}))).await.unwrap().is_none());

    assert!(matches!(
        store.find(&Value::Integer(1)).await,
        Err(CoreError::Validation { .. })
    ));
    assert!(matches!(
        store.insert(Value::from("doc")).await,
        Err(CoreError::Validation { .. })
    ));
    assert!(matches!(
        store.insert(v(json!({"$bad": 1}))).await,
        Err(CoreError::Validation { .. })
    ));
    assert!(matches!(
        store.ensure_index(IndexSpec::new("a..b")).await,
        Err(CoreError::Validation { .. })
    ));
}

#[tokio::test]
async fn file_backend_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("store.log");
    {
        let backend = Arc::new(nestdb_storage::FileBackend::open(&path).unwrap());
        let store = Store::open(StoreConfig::new(), backend).unwrap();
        store
            .insert_many(vec![v(json!({"_id": 1, "a": {"b": [1, 2]}})), v(json!({"_id": 2}))])
            .await
            .unwrap();
        store
            .remove(&v(json!({"_id": 2})), RemoveOptions::one())
            .await
            .unwrap();
    }

    let backend = Arc::new(nestdb_storage::FileBackend::open(&path).unwrap());
    let store = Store::open(StoreConfig::new(), backend).unwrap();
    let docs = store.find(&v(json!({}))).await.unwrap();
    assert_eq!(docs.len(), 1);
    assert_eq!(docs[0].lookup("a.b"), Some(Value::from(vec![1, 2])));
}
