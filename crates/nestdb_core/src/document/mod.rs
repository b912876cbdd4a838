//! Documents and their validation rules.
//!
//! A [`Document`] is a map value with a valid `_id`. Field names may not
//! start with `$` (reserved for operators) or contain `.` (reserved for
//! paths), at any nesting level.

mod codec;
mod id;

pub use codec::{CborCodec, DocumentCodec};
pub use id::{IdGenerator, UuidIdGenerator};

use crate::error::{CoreError, CoreResult};
use nestdb_codec::{Map, Value};
use std::fmt;

/// Name of the identifier field.
pub const ID_FIELD: &str = "_id";

static NULL: Value = Value::Null;

/// An immutable document snapshot.
///
/// Field values are [`Value`]s, which have no floating-point variant:
/// fractional numbers such as `9.99` cannot be stored, and `$inc` only
/// adds integers. Store them scaled to integers (cents, basis points) or
/// as text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Document(Map);

impl Document {
    /// The document's `_id`.
    #[must_use]
    pub fn id(&self) -> &Value {
        self.0.get(ID_FIELD).unwrap_or(&NULL)
    }

    /// Direct field access.
    #[must_use]
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.0.get(field)
    }

    /// Dot-path projection, see [`Value::lookup`].
    #[must_use]
    pub fn lookup(&self, path: &str) -> Option<Value> {
        match path.split_once('.') {
            None => self.0.get(path).cloned(),
            Some((head, rest)) => self.0.get(head)?.lookup(rest),
        }
    }

    /// The fields of the document.
    #[must_use]
    pub fn fields(&self) -> &Map {
        &self.0
    }

    /// Unwraps the document into its field map.
    #[must_use]
    pub fn into_fields(self) -> Map {
        self.0
    }

    /// Unwraps the document into a map value.
    #[must_use]
    pub fn into_value(self) -> Value {
        Value::Map(self.0)
    }
}

impl TryFrom<Map> for Document {
    type Error = CoreError;

    fn try_from(fields: Map) -> CoreResult<Self> {
        validate_fields(&fields)?;
        match fields.get(ID_FIELD) {
            Some(id) => validate_id(id)?,
            None => return Err(CoreError::validation("document has no _id")),
        }
        Ok(Self(fields))
    }
}

impl TryFrom<Value> for Document {
    type Error = CoreError;

    fn try_from(value: Value) -> CoreResult<Self> {
        match value {
            Value::Map(fields) => Self::try_from(fields),
            other => Err(CoreError::validation(format!(
                "document must be a map, got {}",
                other.type_name()
            ))),
        }
    }
}

impl From<Document> for Value {
    fn from(doc: Document) -> Self {
        Value::Map(doc.0)
    }
}

impl fmt::Display for Document {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Value::Map(self.0.clone()).fmt(f)
    }
}

/// Checks that `id` is usable as a document identifier.
///
/// # Errors
///
/// Identifiers must be non-empty text or integers.
pub fn validate_id(id: &Value) -> CoreResult<()> {
    match id {
        Value::Text(s) if !s.is_empty() => Ok(()),
        Value::Integer(_) => Ok(()),
        Value::Text(_) => Err(CoreError::validation("_id must not be empty")),
        other => Err(CoreError::validation(format!(
            "_id must be text or integer, got {}",
            other.type_name()
        ))),
    }
}

/// Checks field names recursively, descending into maps and arrays.
///
/// # Errors
///
/// Returns a validation error for names starting with `$` or containing `.`.
pub fn validate_fields(fields: &Map) -> CoreResult<()> {
    for (name, value) in fields {
        if name.starts_with('$') {
            return Err(CoreError::validation(format!(
                "field names cannot begin with '$': {name}"
            )));
        }
        if name.contains('.') {
            return Err(CoreError::validation(format!(
                "field names cannot contain '.': {name}"
            )));
        }
        validate_value(value)?;
    }
    Ok(())
}

fn validate_value(value: &Value) -> CoreResult<()> {
    match value {
        Value::Map(m) => validate_fields(m),
        Value::Array(items) => items.iter().try_for_each(validate_value),
        _ => Ok(()),
    }
}

/// Sets `value` at a dot path, creating intermediate maps as needed.
///
/// Numeric segments index into existing arrays.
///
/// # Errors
///
/// Returns a description of the conflict when the path crosses a scalar or
/// an out-of-range array index.
pub fn set_path(fields: &mut Map, path: &str, value: Value) -> Result<(), String> {
    let (head, rest) = match path.split_once('.') {
        Some((head, rest)) => (head, Some(rest)),
        None => (path, None),
    };
    let Some(rest) = rest else {
        fields.insert(head.to_string(), value);
        return Ok(());
    };
    let slot = fields
        .entry(head.to_string())
        .or_insert_with(Value::empty_map);
    set_in_value(slot, rest, value).map_err(|e| format!("{head}.{e}"))
}

fn set_in_value(target: &mut Value, path: &str, value: Value) -> Result<(), String> {
    match target {
        Value::Map(m) => set_path(m, path, value),
        Value::Array(items) => {
            let (head, rest) = match path.split_once('.') {
                Some((head, rest)) => (head, Some(rest)),
                None => (path, None),
            };
            let index: usize = head
                .parse()
                .map_err(|_| format!("{head}: cannot index array with a field name"))?;
            let slot = items
                .get_mut(index)
                .ok_or_else(|| format!("{head}: array index out of range"))?;
            match rest {
                None => {
                    *slot = value;
                    Ok(())
                }
                Some(rest) => set_in_value(slot, rest, value),
            }
        }
        other => Err(format!("{path}: cannot set a field on {}", other.type_name())),
    }
}

/// Removes the value at a dot path, returning it if present.
pub fn unset_path(fields: &mut Map, path: &str) -> Option<Value> {
    match path.split_once('.') {
        None => fields.remove(path),
        Some((head, rest)) => match fields.get_mut(head)? {
            Value::Map(m) => unset_path(m, rest),
            _ => None,
        },
    }
}
