//! Canonical CBOR decoder.

use crate::error::{CodecError, CodecResult};
use crate::value::{Map, Value};
use crate::MAX_DEPTH;

/// Upper bound on declared array/map element counts.
const MAX_ITEMS: u64 = 16 * 1024 * 1024;

/// Upper bound on declared text/byte string lengths.
const MAX_BYTES: u64 = 256 * 1024 * 1024;

/// Decode exactly one value from `bytes`.
///
/// # Errors
///
/// Returns an error if the bytes are not well-formed CBOR, use constructs
/// outside the document model (floats, tags, indefinite lengths, non-text
/// map keys), are not in shortest form, or carry trailing bytes.
pub fn from_cbor(bytes: &[u8]) -> CodecResult<Value> {
    let mut decoder = Decoder::new(bytes);
    let value = decoder.decode()?;
    match decoder.remaining() {
        0 => Ok(value),
        remaining => Err(CodecError::TrailingBytes { remaining }),
    }
}

/// Cursor-based CBOR reader.
#[derive(Debug)]
pub struct Decoder<'a> {
    input: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    /// Creates a decoder over `input`.
    #[must_use]
    pub fn new(input: &'a [u8]) -> Self {
        Self { input, pos: 0 }
    }

    /// Number of bytes not yet consumed.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.input.len() - self.pos
    }

    /// Decodes the next value.
    ///
    /// # Errors
    ///
    /// See [`from_cbor`].
    pub fn decode(&mut self) -> CodecResult<Value> {
        self.value(0)
    }

    fn value(&mut self, depth: usize) -> CodecResult<Value> {
        if depth > MAX_DEPTH {
            return Err(CodecError::TooDeep { max: MAX_DEPTH });
        }
        let initial = self.byte()?;
        let major = initial >> 5;
        let info = initial & 0x1f;

        match major {
            0 => {
                let n = self.argument(info)?;
                i64::try_from(n)
                    .map(Value::Integer)
                    .map_err(|_| CodecError::IntegerOverflow)
            }
            1 => {
                let n = self.argument(info)?;
                let n = i64::try_from(n).map_err(|_| CodecError::IntegerOverflow)?;
                Ok(Value::Integer(-1 - n))
            }
            2 => {
                let len = self.length(info, MAX_BYTES)?;
                Ok(Value::Bytes(self.take(len)?.to_vec()))
            }
            3 => {
                let len = self.length(info, MAX_BYTES)?;
                let raw = self.take(len)?;
                let s = std::str::from_utf8(raw).map_err(|_| CodecError::InvalidUtf8)?;
                Ok(Value::Text(s.to_string()))
            }
            4 => {
                let len = self.length(info, MAX_ITEMS)?;
                let mut items = Vec::with_capacity(len.min(1024));
                for _ in 0..len {
                    items.push(self.value(depth + 1)?);
                }
                Ok(Value::Array(items))
            }
            5 => {
                let len = self.length(info, MAX_ITEMS)?;
                let mut map = Map::new();
                for _ in 0..len {
                    let Value::Text(key) = self.value(depth + 1)? else {
                        return Err(CodecError::NonTextKey);
                    };
                    let value = self.value(depth + 1)?;
                    if map.contains_key(&key) {
                        return Err(CodecError::DuplicateKey { key });
                    }
                    map.insert(key, value);
                }
                Ok(Value::Map(map))
            }
            6 => Err(CodecError::unsupported("tag")),
            _ => match info {
                20 => Ok(Value::Bool(false)),
                21 => Ok(Value::Bool(true)),
                22 => Ok(Value::Null),
                25..=27 => Err(CodecError::FloatForbidden),
                31 => Err(CodecError::IndefiniteLength),
                other => Err(CodecError::unsupported(format!("simple value {other}"))),
            },
        }
    }

    fn length(&mut self, info: u8, limit: u64) -> CodecResult<usize> {
        if info == 31 {
            return Err(CodecError::IndefiniteLength);
        }
        let len = self.argument(info)?;
        if len > limit {
            return Err(CodecError::LengthLimit { len });
        }
        usize::try_from(len).map_err(|_| CodecError::LengthLimit { len })
    }

    fn argument(&mut self, info: u8) -> CodecResult<u64> {
        let (value, min) = match info {
            0..=23 => return Ok(u64::from(info)),
            24 => (u64::from(self.byte()?), 24),
            25 => (u64::from(u16::from_be_bytes(self.array()?)), 0x100),
            26 => (u64::from(u32::from_be_bytes(self.array()?)), 0x1_0000),
            27 => (u64::from_be_bytes(self.array()?), 0x1_0000_0000),
            31 => return Err(CodecError::IndefiniteLength),
            other => return Err(CodecError::unsupported(format!("additional info {other}"))),
        };
        if value < min {
            return Err(CodecError::NonCanonicalInteger);
        }
        Ok(value)
    }

    fn byte(&mut self) -> CodecResult<u8> {
        let b = *self.input.get(self.pos).ok_or(CodecError::UnexpectedEof)?;
        self.pos += 1;
        Ok(b)
    }

    fn take(&mut self, len: usize) -> CodecResult<&'a [u8]> {
        let end = self.pos.checked_add(len).ok_or(CodecError::UnexpectedEof)?;
        let slice = self
            .input
            .get(self.pos..end)
            .ok_or(CodecError::UnexpectedEof)?;
        self.pos = end;
        Ok(slice)
    }

    fn array<const N: usize>(&mut self) -> CodecResult<[u8; N]> {
        let mut buf = [0u8; N];
        buf.copy_from_slice(self.take(N)?);
        Ok(buf)
    }
}
