//! Dotted field-path access into JSON payloads.
//!
//! Shared by the priority engine (rule conditions) and conflict detection
//! (critical-field comparison). Payloads are open objects; a missing segment
//! is never an error, it simply yields `None`.

use serde_json::Value;

/// Look up a dotted path (e.g. `location.region`) in a JSON value.
///
/// Returns `None` when any segment is missing or a non-object is traversed.
pub fn get<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = value;
    for segment in path.split('.') {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

/// Structural equality of two optional field values.
///
/// Missing on exactly one side counts as unequal; missing on both sides is
/// equal. `serde_json::Value` equality is structural for objects and
/// order-sensitive for arrays, which is the comparison we want.
pub fn field_equal(a: Option<&Value>, b: Option<&Value>) -> bool {
    match (a, b) {
        (None, None) => true,
        (Some(x), Some(y)) => x == y,
        _ => false,
    }
}
