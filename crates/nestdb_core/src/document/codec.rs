//! Document (de)serialization at the backend boundary.

use super::Document;
use crate::error::CoreResult;
use nestdb_codec::{from_cbor, to_cbor, Value};
use std::fmt;

/// Converts documents to and from the bytes stored in the backend.
///
/// Implementations must round-trip: `decode(encode(d)) == d`. Encoding
/// should be deterministic so that re-encoding a stored document yields the
/// bytes that were written.
///
/// # Example
///
/// ```rust
/// use nestdb_core::{CborCodec, Document, DocumentCodec};
/// use nestdb_codec::Value;
///
/// let doc = Document::try_from(
///     vec![("_id", Value::from("a")), ("n", Value::Integer(1))]
///         .into_iter()
///         .collect::<Value>(),
/// )
/// .unwrap();
/// let bytes = CborCodec.encode(&doc).unwrap();
/// assert_eq!(CborCodec.decode(&bytes).unwrap(), doc);
/// ```
pub trait DocumentCodec: Send + Sync + fmt::Debug {
    /// Serializes a document.
    ///
    /// # Errors
    ///
    /// Returns an error if the document cannot be represented.
    fn encode(&self, doc: &Document) -> CoreResult<Vec<u8>>;

    /// Deserializes a document.
    ///
    /// # Errors
    ///
    /// Returns an error for malformed bytes or an invalid document.
    fn decode(&self, bytes: &[u8]) -> CoreResult<Document>;
}

/// Canonical CBOR, the default codec.
#[derive(Debug, Default, Clone, Copy)]
pub struct CborCodec;

impl DocumentCodec for CborCodec {
    fn encode(&self, doc: &Document) -> CoreResult<Vec<u8>> {
        Ok(to_cbor(&Value::Map(doc.fields().clone()))?)
    }

    fn decode(&self, bytes: &[u8]) -> CoreResult<Document> {
        Document::try_from(from_cbor(bytes)?)
    }
}
