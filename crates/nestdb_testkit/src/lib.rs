//! # NestDB Testkit
//!
//! Test utilities for NestDB.
//!
//! This crate provides:
//! - Store fixtures over in-memory and file backends
//! - Property-based test generators using proptest
//! - A fault-injecting backend wrapper
//! - Property checks for the tree, the indexes and the store
//! - Fuzz harnesses and stress runners
//! - A tracing subscriber for tests, filtered through `RUST_LOG`
//!
//! ## Usage
//!
//! ```rust,ignore
//! use nestdb_testkit::prelude::*;
//!
//! #[tokio::test]
//! async fn finds_what_it_inserted() {
//!     init_test_tracing();
//!     let ts = TestStore::memory(StoreConfig::new());
//!     ts.store.insert(doc(json!({"name": "a"}))).await.unwrap();
//!     assert_eq!(ts.store.count(&doc(json!({}))).await.unwrap(), 1);
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod faulty;
pub mod fixtures;
pub mod fuzz;
pub mod generators;
pub mod logging;
pub mod properties;
pub mod stress;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::faulty::*;
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::logging::*;
    pub use crate::properties::*;
    pub use nestdb_core::{IndexSpec, Store, StoreConfig};
    pub use serde_json::json;
}

pub use faulty::*;
pub use fixtures::*;
pub use fuzz::*;
pub use generators::*;
pub use logging::*;
pub use properties::*;
pub use stress::*;
