//! # NestDB Codec
//!
//! Document value model and canonical CBOR encoding for NestDB.
//!
//! Every document the store persists goes through this crate. Encoding is
//! deterministic, so equal documents produce identical bytes and encoded
//! `_id` values can be used directly as storage keys.
//!
//! ## Canonical CBOR Rules
//!
//! - Map keys are text and sorted by encoded bytes (length first)
//! - Integers use shortest encoding
//! - No floats, tags or indefinite-length items
//! - Strings must be UTF-8
//! - Nesting is bounded by [`MAX_DEPTH`]
//!
//! ## Usage
//!
//! ```
//! use nestdb_codec::{from_cbor, to_cbor, Value};
//!
//! let value: Value = vec![("_id", Value::from("a1")), ("n", Value::Integer(42))]
//!     .into_iter()
//!     .collect();
//! let bytes = to_cbor(&value).unwrap();
//! assert_eq!(from_cbor(&bytes).unwrap(), value);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod decoder;
mod encoder;
mod error;
#[cfg(feature = "json")]
mod json;
mod value;

pub use decoder::{from_cbor, Decoder};
pub use encoder::{to_cbor, Encoder};
pub use error::{CodecError, CodecResult};
#[cfg(feature = "json")]
pub use json::to_json;
pub use value::{Map, Value};

/// Maximum nesting depth accepted by the encoder and decoder.
pub const MAX_DEPTH: usize = 256;

/// Types that can be encoded to canonical CBOR.
pub trait Encode {
    /// Encode this value to canonical CBOR bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the value cannot be represented.
    fn encode(&self) -> CodecResult<Vec<u8>>;
}

/// Types that can be decoded from CBOR.
pub trait Decode: Sized {
    /// Decode a value from CBOR bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the bytes are malformed or non-canonical.
    fn decode(bytes: &[u8]) -> CodecResult<Self>;
}

impl Encode for Value {
    fn encode(&self) -> CodecResult<Vec<u8>> {
        to_cbor(self)
    }
}

impl Decode for Value {
    fn decode(bytes: &[u8]) -> CodecResult<Self> {
        from_cbor(bytes)
    }
}
