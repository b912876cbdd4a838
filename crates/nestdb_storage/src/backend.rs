//! Key-value backend trait definition.

use crate::error::StorageResult;

/// A lazily evaluated sequence of `(key, value)` pairs returned by [`KvBackend::scan`].
pub type KvIter<'a> = Box<dyn Iterator<Item = StorageResult<(Vec<u8>, Vec<u8>)>> + Send + 'a>;

/// A durable key-value store consumed by NestDB.
///
/// Backends are **opaque byte stores**. They know nothing about documents,
/// indexes or namespaces; NestDB owns key layout and payload encoding.
///
/// # Invariants
///
/// - `get` returns exactly the bytes of the last successful `put` for a key
/// - `delete` of an absent key succeeds
/// - `scan` covers every live key starting with the prefix; ordering is not
///   relied upon by callers
/// - Backends must be `Send + Sync`; one instance may serve several stores
///
/// All methods take `&self`: implementations use interior locking so a
/// single `Arc<dyn KvBackend>` can be shared between stores and blocking
/// worker threads.
pub trait KvBackend: Send + Sync {
    /// Reads the value stored under `key`.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying medium cannot be read.
    fn get(&self, key: &[u8]) -> StorageResult<Option<Vec<u8>>>;

    /// Stores `value` under `key`, replacing any previous value.
    ///
    /// # Errors
    ///
    /// Returns an error if the write cannot be made durable.
    fn put(&self, key: &[u8], value: &[u8]) -> StorageResult<()>;

    /// Removes `key`. Absent keys are not an error.
    ///
    /// # Errors
    ///
    /// Returns an error if the deletion cannot be made durable.
    fn delete(&self, key: &[u8]) -> StorageResult<()>;

    /// Iterates over all entries whose key starts with `prefix`.
    ///
    /// # Errors
    ///
    /// Returns an error if the scan cannot be started. Errors hit while
    /// iterating are yielded as items.
    fn scan(&self, prefix: &[u8]) -> StorageResult<KvIter<'_>>;

    /// Flushes buffered writes to durable storage.
    ///
    /// # Errors
    ///
    /// Returns an error if the flush fails.
    fn flush(&self) -> StorageResult<()> {
        Ok(())
    }
}
