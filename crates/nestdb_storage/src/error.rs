//! Error types for storage operations.

use std::io;
use thiserror::Error;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A log record failed validation while replaying.
    #[error("corrupted record at offset {offset}: {message}")]
    CorruptRecord {
        /// Offset of the record in the log file.
        offset: u64,
        /// Description of the corruption.
        message: String,
    },

    /// Checksum mismatch on a log record.
    #[error("checksum mismatch at offset {offset}: expected {expected:08x}, got {actual:08x}")]
    ChecksumMismatch {
        /// Offset of the record in the log file.
        offset: u64,
        /// Checksum stored in the record.
        expected: u32,
        /// Checksum computed from the record bytes.
        actual: u32,
    },

    /// A key or value exceeds the encodable size.
    #[error("entry too large: {len} bytes")]
    EntryTooLarge {
        /// Size of the offending key or value.
        len: usize,
    },

    /// The backend does not exist and creation was not requested.
    #[error("backend not found: {path}")]
    NotFound {
        /// Path that was looked up.
        path: String,
    },

    /// The backend has been closed.
    #[error("backend is closed")]
    Closed,

    /// A failure injected or reported by a wrapping backend.
    #[error("backend failure: {0}")]
    Other(String),
}

impl StorageError {
    /// Creates a corrupted record error.
    pub fn corrupt_record(offset: u64, message: impl Into<String>) -> Self {
        Self::CorruptRecord {
            offset,
            message: message.into(),
        }
    }

    /// Creates a free-form backend failure.
    pub fn other(message: impl Into<String>) -> Self {
        Self::Other(message.into())
    }
}
