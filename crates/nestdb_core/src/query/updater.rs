//! Update specs: modifier operators or whole-document replacement.

use super::{has_operators, operator_object};
use crate::document::{set_path, unset_path, Document, ID_FIELD};
use crate::error::{CoreError, CoreResult};
use nestdb_codec::{Map, Value};
use std::fmt;

/// Builds the post-image of a document from an update spec.
pub trait UpdateApplier: Send + Sync + fmt::Debug {
    /// Returns the updated document value. Must keep `_id` unchanged.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Update`] when the spec cannot be applied.
    fn apply(&self, doc: &Document, update: &Value) -> CoreResult<Value>;
}

/// Default update applier.
///
/// A spec whose keys are all operators modifies the document with `$set`,
/// `$unset`, `$inc`, `$push`, `$addToSet`, `$pop` and `$pull` (paths may
/// be dotted; `$push` and `$addToSet` accept `{"$each": [...]}`). Any other
/// spec replaces the document, keeping its `_id`.
#[derive(Debug, Default, Clone, Copy)]
pub struct BasicUpdater;

impl UpdateApplier for BasicUpdater {
    fn apply(&self, doc: &Document, update: &Value) -> CoreResult<Value> {
        let Some(spec) = update.as_map() else {
            return Err(CoreError::update(format!(
                "update must be a map, got {}",
                update.type_name()
            )));
        };
        let id = doc.id();

        let fields = if has_operators(update) {
            if operator_object(update).is_none() {
                return Err(CoreError::update(
                    "cannot mix modifiers and replacement fields",
                ));
            }
            let mut fields = doc.fields().clone();
            for (op, args) in spec {
                apply_modifier(&mut fields, op, args)?;
            }
            fields
        } else {
            let mut fields = spec.clone();
            fields
                .entry(ID_FIELD.to_string())
                .or_insert_with(|| id.clone());
            fields
        };

        if fields.get(ID_FIELD) != Some(id) {
            return Err(CoreError::update("cannot change _id"));
        }
        Ok(Value::Map(fields))
    }
}

fn apply_modifier(fields: &mut Map, op: &str, args: &Value) -> CoreResult<()> {
    let args = args
        .as_map()
        .ok_or_else(|| CoreError::update(format!("{op} expects a map of paths")))?;

    for (path, arg) in args {
        match op {
            "$set" => set_path(fields, path, arg.clone()).map_err(CoreError::update)?,
            "$unset" => {
                unset_path(fields, path);
            }
            "$inc" => {
                let delta = arg
                    .as_integer()
                    .ok_or_else(|| CoreError::update("$inc expects an integer"))?;
                let next = match get_path(fields, path) {
                    None => delta,
                    Some(Value::Integer(n)) => n
                        .checked_add(delta)
                        .ok_or_else(|| CoreError::update(format!("$inc overflows {path}")))?,
                    Some(other) => {
                        return Err(CoreError::update(format!(
                            "cannot $inc {} at {path}",
                            other.type_name()
                        )))
                    }
                };
                set_path(fields, path, Value::Integer(next)).map_err(CoreError::update)?;
            }
            "$push" => {
                let mut items = array_at(fields, path, op)?.unwrap_or_default();
                items.extend(each(arg, op)?);
                set_path(fields, path, Value::Array(items)).map_err(CoreError::update)?;
            }
            "$addToSet" => {
                let mut items = array_at(fields, path, op)?.unwrap_or_default();
                for item in each(arg, op)? {
                    if !items.contains(&item) {
                        items.push(item);
                    }
                }
                set_path(fields, path, Value::Array(items)).map_err(CoreError::update)?;
            }
            "$pop" => {
                let direction = arg
                    .as_integer()
                    .filter(|d| *d != 0)
                    .ok_or_else(|| CoreError::update("$pop expects 1 or -1"))?;
                if let Some(mut items) = array_at(fields, path, op)? {
                    if direction > 0 {
                        items.pop();
                    } else if !items.is_empty() {
                        items.remove(0);
                    }
                    set_path(fields, path, Value::Array(items)).map_err(CoreError::update)?;
                }
            }
            "$pull" => {
                if let Some(mut items) = array_at(fields, path, op)? {
                    items.retain(|item| item != arg);
                    set_path(fields, path, Value::Array(items)).map_err(CoreError::update)?;
                }
            }
            other => return Err(CoreError::update(format!("unknown modifier {other}"))),
        }
    }
    Ok(())
}

/// Resolves a dot path through maps and array indices without fan-out.
fn get_path<'a>(fields: &'a Map, path: &str) -> Option<&'a Value> {
    let mut parts = path.split('.');
    let mut cur = fields.get(parts.next()?)?;
    for part in parts {
        cur = match cur {
            Value::Map(m) => m.get(part)?,
            Value::Array(items) => items.get(part.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(cur)
}

fn array_at(fields: &Map, path: &str, op: &str) -> CoreResult<Option<Vec<Value>>> {
    match get_path(fields, path) {
        None => Ok(None),
        Some(Value::Array(items)) => Ok(Some(items.clone())),
        Some(other) => Err(CoreError::update(format!(
            "{op} needs an array at {path}, found {}",
            other.type_name()
        ))),
    }
}

fn each(arg: &Value, op: &str) -> CoreResult<Vec<Value>> {
    match arg.as_map().and_then(|m| m.get("$each")) {
        Some(Value::Array(items)) => Ok(items.clone()),
        Some(_) => Err(CoreError::update(format!("{op} $each expects an array"))),
        None => Ok(vec![arg.clone()]),
    }
}
