//! Error types for NestDB core.

use nestdb_codec::Value;
use nestdb_storage::StorageError;
use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors that can occur in NestDB core operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Malformed document or query: not a map, bad `_id`, reserved field names.
    #[error("validation error: {message}")]
    Validation {
        /// Description of the problem.
        message: String,
    },

    /// A unique index already holds the key.
    #[error("unique constraint violated on field `{field}` for key {key}")]
    UniqueViolation {
        /// Indexed field name.
        field: String,
        /// Offending key.
        key: Value,
    },

    /// A durable backend call failed.
    #[error("backend {operation} failed: {source}")]
    Backend {
        /// Backend operation (`get`, `put`, `delete`, `scan`, `flush`).
        operation: &'static str,
        /// Storage key involved, if any.
        key: Option<Vec<u8>>,
        /// Underlying storage error.
        #[source]
        source: StorageError,
    },

    /// The update applier rejected an update.
    #[error("update error: {reason}")]
    Update {
        /// Reason given by the applier.
        reason: String,
    },

    /// Document (de)serialization failed.
    #[error("codec error: {0}")]
    Codec(#[from] nestdb_codec::CodecError),

    /// Documents left every index but not all were deleted from the backend.
    #[error("removed {durable} of {requested} documents durably: {source}")]
    PartialRemoval {
        /// Documents removed from the indexes.
        requested: usize,
        /// Documents confirmed deleted from the backend.
        durable: usize,
        /// First backend failure.
        #[source]
        source: Box<CoreError>,
    },

    /// The store could not load its documents from the backend.
    #[error("store load failed: {reason}")]
    LoadFailed {
        /// Description of the failure.
        reason: String,
    },

    /// A blocking backend task panicked or was cancelled.
    #[error("background task failed: {message}")]
    Task {
        /// Description of the failure.
        message: String,
    },

    /// No index is declared on the field.
    #[error("no index on field `{field}`")]
    IndexNotFound {
        /// Field name.
        field: String,
    },
}

impl CoreError {
    /// Creates a validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    /// Creates a unique constraint violation.
    pub fn unique_violation(field: impl Into<String>, key: Value) -> Self {
        Self::UniqueViolation {
            field: field.into(),
            key,
        }
    }

    /// Creates a backend error.
    pub fn backend(operation: &'static str, key: Option<&[u8]>, source: StorageError) -> Self {
        Self::Backend {
            operation,
            key: key.map(<[u8]>::to_vec),
            source,
        }
    }

    /// Creates an update error.
    pub fn update(reason: impl Into<String>) -> Self {
        Self::Update {
            reason: reason.into(),
        }
    }

    /// Creates a load failure.
    pub fn load_failed(reason: impl Into<String>) -> Self {
        Self::LoadFailed {
            reason: reason.into(),
        }
    }

    /// Creates a task failure.
    pub fn task(message: impl std::fmt::Display) -> Self {
        Self::Task {
            message: message.to_string(),
        }
    }

    /// Creates an index-not-found error.
    pub fn index_not_found(field: impl Into<String>) -> Self {
        Self::IndexNotFound {
            field: field.into(),
        }
    }

    /// Returns true for unique constraint violations.
    #[must_use]
    pub fn is_unique_violation(&self) -> bool {
        matches!(self, Self::UniqueViolation { .. })
    }
}
