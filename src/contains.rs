use serde::Serialize;
use serde_json::Value;

/// Checks whether `want` is structurally contained in `got`.
///
/// The comparison runs over the serialized view of the two objects, so it
/// works for any pair of API types. The admission machinery injects defaults
/// into every object after creation; a plain equality check would fight
/// those defaults forever, while containment accepts them and only pins the
/// fields the generated object actually sets:
///
/// - empty desired values (null, false, zero, empty string, empty sequence
///   or mapping) are unconstrained;
/// - mappings require every non-empty desired key to be present and
///   contained, extra keys in the current object are fine;
/// - sequences require the same length and element-wise containment;
/// - scalars require equality;
/// - values of different kinds never contain one another.
pub fn deep_contains<G, W>(got: &G, want: &W) -> bool
where
    G: Serialize,
    W: Serialize,
{
    match (serde_json::to_value(got), serde_json::to_value(want)) {
        (Ok(got), Ok(want)) => value_contains(&got, &want),
        _ => false,
    }
}

fn value_contains(got: &Value, want: &Value) -> bool {
    if is_empty_value(want) {
        return true;
    }

    match (got, want) {
        (Value::Object(got), Value::Object(want)) => want.iter().all(|(key, value)| {
            is_empty_value(value) || got.get(key).is_some_and(|g| value_contains(g, value))
        }),
        (Value::Array(got), Value::Array(want)) => {
            got.len() == want.len()
                && got.iter().zip(want).all(|(g, w)| value_contains(g, w))
        }
        (Value::String(got), Value::String(want)) => got == want,
        (Value::Number(got), Value::Number(want)) => got == want,
        (Value::Bool(got), Value::Bool(want)) => got == want,
        _ => false,
    }
}

/// The empty-value predicate deciding which desired fields are
/// unconstrained.
fn is_empty_value(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Bool(b) => !b,
        Value::Number(n) => n.as_f64() == Some(0.0),
        Value::String(s) => s.is_empty(),
        Value::Array(a) => a.is_empty(),
        Value::Object(m) => m.is_empty(),
    }
}
