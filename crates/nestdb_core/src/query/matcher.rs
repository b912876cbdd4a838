//! Mongo-style query predicate.

use super::{has_operators, operator_object};
use crate::document::Document;
use crate::error::{CoreError, CoreResult};
use nestdb_codec::Value;
use std::cmp::Ordering;
use std::fmt;

/// Decides whether a document satisfies a query.
pub trait QueryMatcher: Send + Sync + fmt::Debug {
    /// Tests `doc` against `query`.
    ///
    /// # Errors
    ///
    /// Returns a validation error for malformed queries.
    fn matches(&self, doc: &Document, query: &Value) -> CoreResult<bool>;
}

/// Default matcher.
///
/// Queries are maps from dot paths to conditions. A plain condition tests
/// equality (an array field also matches when one element is equal, a
/// missing field matches `null`). Operator conditions support `$eq`, `$ne`,
/// `$gt`, `$gte`, `$lt`, `$lte`, `$in`, `$nin`, `$exists` and `$not`;
/// top-level `$and`, `$or` and `$not` combine sub-queries. Ordering
/// operators only compare values of the same type.
#[derive(Debug, Default, Clone, Copy)]
pub struct BasicMatcher;

impl QueryMatcher for BasicMatcher {
    fn matches(&self, doc: &Document, query: &Value) -> CoreResult<bool> {
        match_query(doc, query)
    }
}

fn match_query(doc: &Document, query: &Value) -> CoreResult<bool> {
    let Some(query) = query.as_map() else {
        return Err(CoreError::validation(format!(
            "query must be a map, got {}",
            query.type_name()
        )));
    };
    for (key, cond) in query {
        let ok = match key.as_str() {
            "$and" => {
                let mut all = true;
                for clause in clauses(cond, key)? {
                    if !match_query(doc, clause)? {
                        all = false;
                        break;
                    }
                }
                all
            }
            "$or" => {
                let mut any = false;
                for clause in clauses(cond, key)? {
                    if match_query(doc, clause)? {
                        any = true;
                        break;
                    }
                }
                any
            }
            "$not" => !match_query(doc, cond)?,
            op if op.starts_with('$') => {
                return Err(CoreError::validation(format!("unknown operator {op}")))
            }
            path => match_condition(doc.lookup(path).as_ref(), cond)?,
        };
        if !ok {
            return Ok(false);
        }
    }
    Ok(true)
}

fn clauses<'a>(cond: &'a Value, op: &str) -> CoreResult<&'a [Value]> {
    cond.as_array()
        .ok_or_else(|| CoreError::validation(format!("{op} expects an array of queries")))
}

fn match_condition(value: Option<&Value>, cond: &Value) -> CoreResult<bool> {
    if let Some(ops) = operator_object(cond) {
        for (op, operand) in ops {
            if !match_operator(value, op, operand)? {
                return Ok(false);
            }
        }
        return Ok(true);
    }
    if has_operators(cond) {
        return Err(CoreError::validation(
            "cannot mix operators and fields in one condition",
        ));
    }
    Ok(equals(value, cond))
}

fn match_operator(value: Option<&Value>, op: &str, operand: &Value) -> CoreResult<bool> {
    Ok(match op {
        "$eq" => equals(value, operand),
        "$ne" => !equals(value, operand),
        "$gt" => compare(value, operand, |o| o == Ordering::Greater),
        "$gte" => compare(value, operand, |o| o != Ordering::Less),
        "$lt" => compare(value, operand, |o| o == Ordering::Less),
        "$lte" => compare(value, operand, |o| o != Ordering::Greater),
        "$in" => list(operand, op)?.iter().any(|t| equals(value, t)),
        "$nin" => !list(operand, op)?.iter().any(|t| equals(value, t)),
        "$exists" => {
            let wanted = operand
                .as_bool()
                .ok_or_else(|| CoreError::validation("$exists expects a boolean"))?;
            value.is_some() == wanted
        }
        "$not" => !match_condition(value, operand)?,
        other => return Err(CoreError::validation(format!("unknown operator {other}"))),
    })
}

fn list<'a>(operand: &'a Value, op: &str) -> CoreResult<&'a [Value]> {
    operand
        .as_array()
        .ok_or_else(|| CoreError::validation(format!("{op} expects an array")))
}

fn equals(value: Option<&Value>, target: &Value) -> bool {
    match value {
        None => target.is_null(),
        Some(v) if v == target => true,
        Some(Value::Array(items)) => items.iter().any(|item| item == target),
        Some(_) => false,
    }
}

fn compare(value: Option<&Value>, operand: &Value, accept: impl Fn(Ordering) -> bool) -> bool {
    let hit = |v: &Value| v.type_rank() == operand.type_rank() && accept(v.cmp(operand));
    match value {
        None => false,
        Some(Value::Array(items)) if !matches!(operand, Value::Array(_)) => items.iter().any(hit),
        Some(v) => hit(v),
    }
}
