//! # NestDB Storage
//!
//! Durable key-value backend trait and implementations for NestDB.
//!
//! This crate is the lowest layer of NestDB. Backends are **opaque byte
//! stores** addressed by key: they do not interpret documents, identifiers
//! or namespaces.
//!
//! ## Design Principles
//!
//! - Backends expose get / put / delete / prefix scan
//! - No knowledge of document encoding or index layout
//! - Must be `Send + Sync`; one backend may be shared by several stores
//! - Retry policy, if any, belongs to the backend, not to callers
//!
//! ## Available Backends
//!
//! - [`InMemoryBackend`] - For testing and ephemeral storage
//! - [`FileBackend`] - Append-only log file with compaction
//!
//! ## Example
//!
//! ```rust
//! use nestdb_storage::{InMemoryBackend, KvBackend};
//!
//! let backend = InMemoryBackend::new();
//! backend.put(b"hello", b"world").unwrap();
//! assert_eq!(backend.get(b"hello").unwrap(), Some(b"world".to_vec()));
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
mod checksum;
mod error;
mod file;
mod memory;
mod registry;

pub use backend::{KvBackend, KvIter};
pub use checksum::crc32;
pub use error::{StorageError, StorageResult};
pub use file::{CompactionStats, FileBackend, FileBackendConfig};
pub use memory::InMemoryBackend;
pub use registry::BackendRegistry;
