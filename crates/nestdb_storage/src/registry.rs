//! Process-wide registry of open file backends.
//!
//! Opening the same log path twice would give two independent in-memory
//! key sets over one file and corrupt it. The registry hands out one shared
//! [`FileBackend`] per path and counts handles; the backend is dropped from
//! the registry when the last handle is released.

use crate::error::StorageResult;
use crate::file::{FileBackend, FileBackendConfig};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

#[derive(Debug)]
struct Entry {
    backend: Arc<FileBackend>,
    handles: usize,
}

/// Refcounted cache of [`FileBackend`]s keyed by path.
#[derive(Debug, Default)]
pub struct BackendRegistry {
    config: FileBackendConfig,
    entries: Mutex<HashMap<PathBuf, Entry>>,
}

impl BackendRegistry {
    /// Creates an empty registry opening backends with default options.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an empty registry opening backends with `config`.
    #[must_use]
    pub fn with_config(config: FileBackendConfig) -> Self {
        Self {
            config,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the backend for `path`, opening it on first acquisition.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend has to be opened and that fails.
    pub fn acquire(&self, path: &Path) -> StorageResult<Arc<FileBackend>> {
        let mut entries = self.entries.lock();
        if let Some(entry) = entries.get_mut(path) {
            entry.handles += 1;
            return Ok(Arc::clone(&entry.backend));
        }

        let backend = Arc::new(FileBackend::open_with_config(path, self.config.clone())?);
        entries.insert(
            path.to_path_buf(),
            Entry {
                backend: Arc::clone(&backend),
                handles: 1,
            },
        );
        debug!(path = %path.display(), "backend opened");
        Ok(backend)
    }

    /// Releases one handle on `path`.
    ///
    /// Returns `true` if this was the last handle and the backend was evicted.
    /// Releasing an unknown path is a no-op returning `false`.
    pub fn release(&self, path: &Path) -> bool {
        let mut entries = self.entries.lock();
        let Some(entry) = entries.get_mut(path) else {
            return false;
        };
        entry.handles -= 1;
        if entry.handles > 0 {
            return false;
        }
        entries.remove(path);
        debug!(path = %path.display(), "backend released");
        true
    }

    /// Returns the number of outstanding handles for `path`.
    #[must_use]
    pub fn handles(&self, path: &Path) -> usize {
        self.entries.lock().get(path).map_or(0, |e| e.handles)
    }

    /// Returns the number of distinct open backends.
    #[must_use]
    pub fn open_count(&self) -> usize {
        self.entries.lock().len()
    }
}
