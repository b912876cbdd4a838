//! Store configuration.

use crate::document::{CborCodec, DocumentCodec, IdGenerator, UuidIdGenerator};
use crate::index::IndexSpec;
use crate::query::{BasicMatcher, BasicUpdater, QueryMatcher, UpdateApplier};
use std::fmt;
use std::sync::Arc;

/// Default number of backend calls a store runs concurrently.
pub const DEFAULT_IO_CONCURRENCY: usize = 8;

/// Full scans over more documents than this are logged as warnings.
pub const DEFAULT_SCAN_WARNING_THRESHOLD: usize = 1000;

/// Configuration for opening a store.
#[derive(Clone)]
pub struct StoreConfig {
    /// Key prefix isolating this store's records in a shared backend.
    pub namespace: String,

    /// Whether to load documents from the backend as soon as the store opens.
    pub autoload: bool,

    /// Secondary indexes built during load.
    pub indexes: Vec<IndexSpec>,

    /// Maximum concurrent backend calls.
    pub io_concurrency: usize,

    /// Full scans over more documents than this emit a warning.
    pub scan_warning_threshold: usize,

    /// Query predicate.
    pub matcher: Arc<dyn QueryMatcher>,

    /// Update applier.
    pub updater: Arc<dyn UpdateApplier>,

    /// Backend (de)serialization.
    pub codec: Arc<dyn DocumentCodec>,

    /// Source of `_id`s for documents inserted without one.
    pub id_generator: Arc<dyn IdGenerator>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            namespace: "default".to_string(),
            autoload: true,
            indexes: Vec::new(),
            io_concurrency: DEFAULT_IO_CONCURRENCY,
            scan_warning_threshold: DEFAULT_SCAN_WARNING_THRESHOLD,
            matcher: Arc::new(BasicMatcher),
            updater: Arc::new(BasicUpdater),
            codec: Arc::new(CborCodec),
            id_generator: Arc::new(UuidIdGenerator),
        }
    }
}

impl StoreConfig {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the namespace.
    #[must_use]
    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    /// Sets whether the store loads on open.
    #[must_use]
    pub fn autoload(mut self, value: bool) -> Self {
        self.autoload = value;
        self
    }

    /// Declares a secondary index.
    #[must_use]
    pub fn index(mut self, spec: IndexSpec) -> Self {
        self.indexes.push(spec);
        self
    }

    /// Sets the backend concurrency limit. Zero is treated as one.
    #[must_use]
    pub fn io_concurrency(mut self, limit: usize) -> Self {
        self.io_concurrency = limit.max(1);
        self
    }

    /// Sets the full-scan warning threshold.
    #[must_use]
    pub fn scan_warning_threshold(mut self, threshold: usize) -> Self {
        self.scan_warning_threshold = threshold;
        self
    }

    /// Replaces the query matcher.
    #[must_use]
    pub fn matcher(mut self, matcher: Arc<dyn QueryMatcher>) -> Self {
        self.matcher = matcher;
        self
    }

    /// Replaces the update applier.
    #[must_use]
    pub fn updater(mut self, updater: Arc<dyn UpdateApplier>) -> Self {
        self.updater = updater;
        self
    }

    /// Replaces the document codec.
    #[must_use]
    pub fn codec(mut self, codec: Arc<dyn DocumentCodec>) -> Self {
        self.codec = codec;
        self
    }

    /// Replaces the id generator.
    #[must_use]
    pub fn id_generator(mut self, generator: Arc<dyn IdGenerator>) -> Self {
        self.id_generator = generator;
        self
    }
}

impl fmt::Debug for StoreConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreConfig")
            .field("namespace", &self.namespace)
            .field("autoload", &self.autoload)
            .field("indexes", &self.indexes)
            .field("io_concurrency", &self.io_concurrency)
            .field("scan_warning_threshold", &self.scan_warning_threshold)
            .field("matcher", &self.matcher)
            .field("updater", &self.updater)
            .field("codec", &self.codec)
            .field("id_generator", &self.id_generator)
            .finish()
    }
}
