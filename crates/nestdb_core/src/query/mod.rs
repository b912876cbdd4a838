//! Query matching and update application.
//!
//! The store treats both as injected collaborators: it never inspects a
//! query beyond choosing an access path, and it hands update specs to the
//! [`UpdateApplier`] verbatim. [`BasicMatcher`] and [`BasicUpdater`] are the
//! defaults.

mod matcher;
mod updater;

pub use matcher::{BasicMatcher, QueryMatcher};
pub use updater::{BasicUpdater, UpdateApplier};

use nestdb_codec::{Map, Value};

/// Returns the map if `value` is a non-empty map whose keys are all
/// operators (`$`-prefixed).
#[must_use]
pub fn operator_object(value: &Value) -> Option<&Map> {
    let map = value.as_map()?;
    (!map.is_empty() && map.keys().all(|k| k.starts_with('$'))).then_some(map)
}

/// Returns true if any key of the map value is an operator.
#[must_use]
pub fn has_operators(value: &Value) -> bool {
    value
        .as_map()
        .is_some_and(|m| m.keys().any(|k| k.starts_with('$')))
}
