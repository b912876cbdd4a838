//! Fuzz testing harnesses for NestDB.
//!
//! This module provides fuzz targets that can be used with cargo-fuzz
//! or other fuzzing frameworks. Targets panic only on real bugs: inputs
//! that are merely invalid must come back as errors.

use nestdb_codec::{from_cbor, to_cbor, Map, Value};
use nestdb_core::{CborCodec, DocumentCodec, IndexSpec, RemoveOptions, Store, StoreConfig, UpdateOptions};
use nestdb_storage::{FileBackend, InMemoryBackend, KvBackend};
use std::sync::Arc;

/// Fuzz target for CBOR decoding.
///
/// Tests that arbitrary byte sequences either:
/// - Decode successfully to a valid Value, or
/// - Return a proper error (no panics)
pub fn fuzz_cbor_decode(data: &[u8]) {
    let _ = from_cbor(data);
}

/// Fuzz target for CBOR roundtrip.
///
/// Whatever decodes must re-encode and decode to the same value.
pub fn fuzz_cbor_roundtrip(data: &[u8]) {
    if let Ok(value) = from_cbor(data) {
        if let Ok(encoded) = to_cbor(&value) {
            let decoded = from_cbor(&encoded).expect("canonical encoding must decode");
            assert_eq!(value, decoded, "Roundtrip mismatch");
        }
    }
}

/// Fuzz target for document decoding through the store codec.
pub fn fuzz_document_decode(data: &[u8]) {
    if let Ok(doc) = CborCodec.decode(data) {
        let bytes = CborCodec.encode(&doc).expect("decoded document must encode");
        assert_eq!(CborCodec.decode(&bytes).ok(), Some(doc));
    }
}

/// Fuzz target for log replay.
///
/// Opening a log file with arbitrary contents must either succeed or fail
/// with an error, never panic.
pub fn fuzz_log_replay(data: &[u8]) {
    let Ok(dir) = tempfile::tempdir() else {
        return;
    };
    let path = dir.path().join("fuzz.log");
    if std::fs::write(&path, data).is_err() {
        return;
    }
    if let Ok(backend) = FileBackend::open(&path) {
        if let Ok(iter) = backend.scan(b"") {
            for entry in iter {
                let _ = entry;
            }
        }
    }
}

fn map(pairs: Vec<(&str, Value)>) -> Value {
    pairs.into_iter().collect()
}

/// Fuzz target for store operations.
///
/// Interprets `data` as a sequence of inserts, updates, removes and finds
/// against a store with a secondary index, then checks that every index
/// tree is consistent and that the backend holds exactly the documents the
/// store serves.
pub fn fuzz_store_operations(data: &[u8]) {
    let Ok(runtime) = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    else {
        return;
    };

    runtime.block_on(async {
        let backend = Arc::new(InMemoryBackend::new());
        let Ok(store) = Store::open(
            StoreConfig::new().index(IndexSpec::new("k")),
            Arc::clone(&backend) as Arc<dyn KvBackend>,
        ) else {
            return;
        };

        for chunk in data.chunks_exact(3) {
            let (op, a, b) = (chunk[0], i64::from(chunk[1] % 16), i64::from(chunk[2] % 8));
            match op % 4 {
                0 => {
                    let _ = store
                        .insert(map(vec![("_id", Value::Integer(a)), ("k", Value::Integer(b))]))
                        .await;
                }
                1 => {
                    let update = map(vec![("$inc", map(vec![("k", Value::Integer(b))]))]);
                    let _ = store
                        .update(
                            &map(vec![("_id", Value::Integer(a))]),
                            &update,
                            UpdateOptions::new().upsert(b % 2 == 0),
                        )
                        .await;
                }
                2 => {
                    let options = if a % 2 == 0 {
                        RemoveOptions::all()
                    } else {
                        RemoveOptions::one()
                    };
                    let _ = store.remove(&map(vec![("k", Value::Integer(b))]), options).await;
                }
                _ => {
                    let _ = store
                        .find(&map(vec![("k", map(vec![("$gte", Value::Integer(b))]))]))
                        .await;
                }
            }
        }

        store.check_invariants().expect("index invariants violated");
        let served = store
            .count(&Value::Map(Map::new()))
            .await
            .expect("count on a healthy store");
        assert_eq!(served, backend.len(), "store and backend disagree");
    });
}
