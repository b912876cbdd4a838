//! Canonical CBOR encoder.

use crate::error::{CodecError, CodecResult};
use crate::value::{Map, Value};
use crate::MAX_DEPTH;

/// Encode a value to canonical CBOR bytes.
///
/// Output is deterministic (RFC 8949 §4.2.1): integers and lengths use the
/// shortest form, map keys are ordered by their encoded bytes (shorter
/// first, then bytewise), and no indefinite-length items are produced.
///
/// # Errors
///
/// Returns [`CodecError::TooDeep`] if the value nests deeper than
/// [`MAX_DEPTH`].
pub fn to_cbor(value: &Value) -> CodecResult<Vec<u8>> {
    let mut encoder = Encoder::default();
    encoder.value(value, 0)?;
    Ok(encoder.out)
}

/// Streaming canonical CBOR writer.
#[derive(Debug, Default)]
pub struct Encoder {
    out: Vec<u8>,
}

impl Encoder {
    /// Creates an encoder with a preallocated buffer.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            out: Vec::with_capacity(capacity),
        }
    }

    /// Appends one value.
    ///
    /// # Errors
    ///
    /// Returns an error if the value nests too deeply.
    pub fn encode(&mut self, value: &Value) -> CodecResult<()> {
        self.value(value, 0)
    }

    /// Returns the bytes written so far.
    #[must_use]
    pub fn into_bytes(self) -> Vec<u8> {
        self.out
    }

    fn value(&mut self, value: &Value, depth: usize) -> CodecResult<()> {
        if depth > MAX_DEPTH {
            return Err(CodecError::TooDeep { max: MAX_DEPTH });
        }
        match value {
            Value::Null => self.out.push(0xf6),
            Value::Bool(false) => self.out.push(0xf4),
            Value::Bool(true) => self.out.push(0xf5),
            Value::Integer(n) => self.integer(*n),
            Value::Bytes(b) => {
                self.head(2, b.len() as u64);
                self.out.extend_from_slice(b);
            }
            Value::Text(s) => self.text(s),
            Value::Array(items) => {
                self.head(4, items.len() as u64);
                for item in items {
                    self.value(item, depth + 1)?;
                }
            }
            Value::Map(m) => self.map(m, depth)?,
        }
        Ok(())
    }

    #[allow(clippy::cast_sign_loss)]
    fn integer(&mut self, n: i64) {
        if n >= 0 {
            self.head(0, n as u64);
        } else {
            // Major type 1 carries -1 - n, which is non-negative for any negative i64.
            self.head(1, (-1 - n) as u64);
        }
    }

    fn text(&mut self, s: &str) {
        self.head(3, s.len() as u64);
        self.out.extend_from_slice(s.as_bytes());
    }

    fn map(&mut self, m: &Map, depth: usize) -> CodecResult<()> {
        let mut keyed: Vec<(Vec<u8>, &Value)> = m
            .iter()
            .map(|(k, v)| {
                let mut key = Encoder::with_capacity(k.len() + 9);
                key.text(k);
                (key.out, v)
            })
            .collect();
        keyed.sort_by(|a, b| a.0.len().cmp(&b.0.len()).then_with(|| a.0.cmp(&b.0)));

        self.head(5, keyed.len() as u64);
        for (key, v) in keyed {
            self.out.extend_from_slice(&key);
            self.value(v, depth + 1)?;
        }
        Ok(())
    }

    #[allow(clippy::cast_possible_truncation)]
    fn head(&mut self, major: u8, arg: u64) {
        let mt = major << 5;
        match arg {
            0..=23 => self.out.push(mt | arg as u8),
            24..=0xFF => {
                self.out.push(mt | 24);
                self.out.push(arg as u8);
            }
            0x100..=0xFFFF => {
                self.out.push(mt | 25);
                self.out.extend_from_slice(&(arg as u16).to_be_bytes());
            }
            0x1_0000..=0xFFFF_FFFF => {
                self.out.push(mt | 26);
                self.out.extend_from_slice(&(arg as u32).to_be_bytes());
            }
            _ => {
                self.out.push(mt | 27);
                self.out.extend_from_slice(&arg.to_be_bytes());
            }
        }
    }
}
