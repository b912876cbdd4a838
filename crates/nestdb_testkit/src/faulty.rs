//! A backend wrapper that fails on demand.

use nestdb_storage::{KvBackend, KvIter, StorageError, StorageResult};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

/// Forwards to an inner backend until told to fail.
///
/// Injected failures are `StorageError::Other` and never reach the inner
/// backend, so its contents show exactly what was durably written.
pub struct FaultyBackend {
    inner: Arc<dyn KvBackend>,
    puts_left: AtomicUsize,
    fail_deletes: AtomicBool,
    fail_reads: AtomicBool,
    injected: AtomicUsize,
}

impl FaultyBackend {
    /// Wraps `inner` with no failures armed.
    pub fn wrap(inner: Arc<dyn KvBackend>) -> Self {
        Self {
            inner,
            puts_left: AtomicUsize::new(usize::MAX),
            fail_deletes: AtomicBool::new(false),
            fail_reads: AtomicBool::new(false),
            injected: AtomicUsize::new(0),
        }
    }

    /// Lets `n` more puts through, then fails every put.
    pub fn fail_puts_after(&self, n: usize) {
        self.puts_left.store(n, Ordering::SeqCst);
    }

    /// Fails every delete while set.
    pub fn fail_deletes(&self, fail: bool) {
        self.fail_deletes.store(fail, Ordering::SeqCst);
    }

    /// Fails every get and scan while set.
    pub fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    /// Disarms every failure.
    pub fn heal(&self) {
        self.puts_left.store(usize::MAX, Ordering::SeqCst);
        self.fail_deletes(false);
        self.fail_reads(false);
    }

    /// Number of failures injected so far.
    pub fn injected(&self) -> usize {
        self.injected.load(Ordering::SeqCst)
    }

    /// The wrapped backend.
    pub fn inner(&self) -> &Arc<dyn KvBackend> {
        &self.inner
    }

    fn inject(&self, what: &str) -> StorageError {
        self.injected.fetch_add(1, Ordering::SeqCst);
        StorageError::other(format!("injected {what} failure"))
    }
}

impl std::fmt::Debug for FaultyBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FaultyBackend")
            .field("puts_left", &self.puts_left.load(Ordering::SeqCst))
            .field("fail_deletes", &self.fail_deletes.load(Ordering::SeqCst))
            .field("fail_reads", &self.fail_reads.load(Ordering::SeqCst))
            .field("injected", &self.injected())
            .finish_non_exhaustive()
    }
}

impl KvBackend for FaultyBackend {
    fn get(&self, key: &[u8]) -> StorageResult<Option<Vec<u8>>> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(self.inject("get"));
        }
        self.inner.get(key)
    }

    fn put(&self, key: &[u8], value: &[u8]) -> StorageResult<()> {
        let allowed = self
            .puts_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if !allowed {
            return Err(self.inject("put"));
        }
        self.inner.put(key, value)
    }

    fn delete(&self, key: &[u8]) -> StorageResult<()> {
        if self.fail_deletes.load(Ordering::SeqCst) {
            return Err(self.inject("delete"));
        }
        self.inner.delete(key)
    }

    fn scan(&self, prefix: &[u8]) -> StorageResult<KvIter<'_>> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(self.inject("scan"));
        }
        self.inner.scan(prefix)
    }

    fn flush(&self) -> StorageResult<()> {
        self.inner.flush()
    }
}
