//! # NestDB Core
//!
//! Embedded document store for NestDB.
//!
//! This crate provides:
//! - An arena-backed AVL tree with per-key buckets
//! - Field indexes with unique, sparse and array fan-out semantics and
//!   all-or-nothing batch mutation
//! - A FIFO concurrency throttle
//! - The [`Store`]: CRUD and Mongo-style queries over indexed documents,
//!   persisted to a [`KvBackend`](nestdb_storage::KvBackend)
//!
//! ## Example
//!
//! ```rust
//! use nestdb_codec::Value;
//! use nestdb_core::{IndexSpec, RemoveOptions, Store, StoreConfig, UpdateOptions};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> nestdb_core::CoreResult<()> {
//! let store = Store::in_memory(StoreConfig::new().index(IndexSpec::new("age")))?;
//!
//! let query = |pairs: Vec<(&str, Value)>| pairs.into_iter().collect::<Value>();
//! store
//!     .insert_many(vec![
//!         query(vec![("name", Value::from("ada")), ("age", Value::Integer(36))]),
//!         query(vec![("name", Value::from("alan")), ("age", Value::Integer(41))]),
//!     ])
//!     .await?;
//!
//! let over_40 = query(vec![("age", query(vec![("$gt", Value::Integer(40))]))]);
//! assert_eq!(store.count(&over_40).await?, 1);
//!
//! store
//!     .update(
//!         &query(vec![("name", Value::from("ada"))]),
//!         &query(vec![("$inc", query(vec![("age", Value::Integer(5))]))]),
//!         UpdateOptions::new(),
//!     )
//!     .await?;
//! assert_eq!(store.count(&over_40).await?, 2);
//!
//! assert_eq!(store.remove(&over_40, RemoveOptions::all()).await?, 2);
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod config;
pub mod document;
mod error;
pub mod index;
pub mod query;
mod stats;
mod store;
mod throttle;

pub use config::{StoreConfig, DEFAULT_IO_CONCURRENCY, DEFAULT_SCAN_WARNING_THRESHOLD};
pub use document::{CborCodec, Document, DocumentCodec, IdGenerator, UuidIdGenerator, ID_FIELD};
pub use error::{CoreError, CoreResult};
pub use index::{AccessPath, AvlTree, Change, FieldIndex, IndexEngine, IndexSpec};
pub use query::{BasicMatcher, BasicUpdater, QueryMatcher, UpdateApplier};
pub use stats::{StatsSnapshot, StoreStats};
pub use store::{
    Direction, FindOptions, LoadReport, RemoveOptions, SaveCounts, Store, StoreState,
    UpdateOptions, UpdateResult,
};
pub use throttle::{Permit, Throttle};
