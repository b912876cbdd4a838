//! Error types for the codec crate.

use thiserror::Error;

/// Result type for codec operations.
pub type CodecResult<T> = Result<T, CodecError>;

/// Errors that can occur during encoding or decoding.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// Float values are not part of the document model.
    #[error("float values are not supported")]
    FloatForbidden,

    /// Indefinite-length items are forbidden.
    #[error("indefinite-length items are forbidden")]
    IndefiniteLength,

    /// Invalid UTF-8 string.
    #[error("invalid UTF-8 string")]
    InvalidUtf8,

    /// Unexpected end of input.
    #[error("unexpected end of input")]
    UnexpectedEof,

    /// Bytes remain after the top-level value.
    #[error("{remaining} trailing bytes after value")]
    TrailingBytes {
        /// Number of unconsumed bytes.
        remaining: usize,
    },

    /// Integer was not encoded in its shortest form.
    #[error("non-canonical integer encoding")]
    NonCanonicalInteger,

    /// Integer outside the `i64` range.
    #[error("integer overflow")]
    IntegerOverflow,

    /// Map key is not a text string.
    #[error("map keys must be text strings")]
    NonTextKey,

    /// The same key appears twice in one map.
    #[error("duplicate map key: {key}")]
    DuplicateKey {
        /// The repeated key.
        key: String,
    },

    /// Nesting exceeds [`crate::MAX_DEPTH`].
    #[error("nesting deeper than {max} levels")]
    TooDeep {
        /// Configured maximum depth.
        max: usize,
    },

    /// Declared length exceeds the decoder limits.
    #[error("declared length {len} exceeds limit")]
    LengthLimit {
        /// Declared length.
        len: u64,
    },

    /// CBOR construct not used by the document model (tags, undefined, ...).
    #[error("unsupported CBOR item: {what}")]
    Unsupported {
        /// Description of the item.
        what: String,
    },
}

impl CodecError {
    /// Create an unsupported item error.
    pub fn unsupported(what: impl Into<String>) -> Self {
        Self::Unsupported { what: what.into() }
    }
}
