//! Structured values flowing through queries.
//!
//! Documents, parameter bindings and result columns all use `serde_json::Value`.
//! The absence of a value (MISSING) is distinct from JSON `null` and is modelled
//! as `Option::None` throughout the crate.

use std::cmp::Ordering;

use serde_json::{Map, Value};

/// Ordered mapping from parameter name to bound value.
pub type Parameters = Map<String, Value>;

/// Rank of a value's type in the collation order.
///
/// MISSING sorts before everything, then null, booleans, numbers, strings,
/// arrays and objects.
const fn type_rank(value: Option<&Value>) -> u8 {
    match value {
        None => 0,
        Some(Value::Null) => 1,
        Some(Value::Bool(_)) => 2,
        Some(Value::Number(_)) => 3,
        Some(Value::String(_)) => 4,
        Some(Value::Array(_)) => 5,
        Some(Value::Object(_)) => 6,
    }
}

/// Total collation used by ORDER BY.
#[must_use]
pub fn collate(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    let rank = type_rank(a).cmp(&type_rank(b));
    if rank != Ordering::Equal {
        return rank;
    }
    match (a, b) {
        (Some(Value::Bool(x)), Some(Value::Bool(y))) => x.cmp(y),
        (Some(Value::Number(x)), Some(Value::Number(y))) => compare_numbers(x, y),
        (Some(Value::String(x)), Some(Value::String(y))) => x.cmp(y),
        (Some(Value::Array(x)), Some(Value::Array(y))) => {
            for (l, r) in x.iter().zip(y.iter()) {
                let ord = collate(Some(l), Some(r));
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            x.len().cmp(&y.len())
        }
        (Some(Value::Object(x)), Some(Value::Object(y))) => {
            for ((lk, lv), (rk, rv)) in x.iter().zip(y.iter()) {
                let ord = lk.cmp(rk).then_with(|| collate(Some(lv), Some(rv)));
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            x.len().cmp(&y.len())
        }
        _ => Ordering::Equal,
    }
}

/// Compares two present, non-null values of the same type.
///
/// Returns `None` when the values are not comparable (null involved or
/// mismatched types); comparison operators then yield MISSING.
#[must_use]
pub fn compare(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Null, _) | (_, Value::Null) => None,
        _ if type_rank(Some(a)) != type_rank(Some(b)) => None,
        _ => Some(collate(Some(a), Some(b))),
    }
}

/// Value equality used by `=`: numbers compare numerically, everything else
/// structurally.
#[must_use]
pub fn loosely_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(_), Value::Number(_)) => compare(a, b) == Some(Ordering::Equal),
        _ => a == b,
    }
}

/// Truthiness for WHERE and the logical operators: only `true` counts.
#[must_use]
pub const fn is_truthy(value: Option<&Value>) -> bool {
    matches!(value, Some(Value::Bool(true)))
}

/// Reads a nested property from a JSON object.
#[must_use]
pub fn lookup_path<'a>(root: &'a Value, path: &[String]) -> Option<&'a Value> {
    let mut current = root;
    for key in path {
        current = match current {
            Value::Object(map) => map.get(key)?,
            Value::Array(items) => items.get(key.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Integers compare exactly; anything involving a float compares as `f64`.
fn compare_numbers(x: &serde_json::Number, y: &serde_json::Number) -> Ordering {
    match (x.as_i64(), y.as_i64(), x.as_u64(), y.as_u64()) {
        (Some(a), Some(b), _, _) => a.cmp(&b),
        (_, _, Some(a), Some(b)) => a.cmp(&b),
        // One side is above i64::MAX, the other is a negative i64.
        (Some(_), None, _, Some(_)) => Ordering::Less,
        (None, Some(_), Some(_), _) => Ordering::Greater,
        _ => {
            let x = x.as_f64().unwrap_or(f64::NAN);
            let y = y.as_f64().unwrap_or(f64::NAN);
            x.total_cmp(&y)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn collation_orders_types() {
        let values = [
            None,
            Some(json!(null)),
            Some(json!(false)),
            Some(json!(true)),
            Some(json!(-3)),
            Some(json!(2.5)),
            Some(json!("a")),
            Some(json!([1])),
            Some(json!({"a": 1})),
        ];
        for pair in values.windows(2) {
            assert_eq!(
                collate(pair[0].as_ref(), pair[1].as_ref()),
                Ordering::Less,
                "{:?} < {:?}",
                pair[0],
                pair[1]
            );
        }
    }

    #[test]
    fn numbers_compare_across_representations() {
        assert!(loosely_equal(&json!(1), &json!(1.0)));
        assert!(!loosely_equal(&json!(1), &json!("1")));
        assert_eq!(compare(&json!(2), &json!(10.5)), Some(Ordering::Less));
    }

    #[test]
    fn large_integers_compare_exactly() {
        let big = json!(9_007_199_254_740_993_u64);
        let near = json!(9_007_199_254_740_992_u64);
        assert!(!loosely_equal(&big, &near));
        assert_eq!(compare(&near, &big), Some(Ordering::Less));
        assert_eq!(compare(&json!(i64::MAX - 1), &json!(i64::MAX)), Some(Ordering::Less));
        assert_eq!(compare(&json!(-1), &json!(u64::MAX)), Some(Ordering::Less));
        assert_eq!(compare(&json!(u64::MAX), &json!(i64::MIN)), Some(Ordering::Greater));
        assert_eq!(compare(&json!(u64::MAX), &json!(u64::MAX)), Some(Ordering::Equal));
    }

    #[test]
    fn null_and_mismatched_types_are_unordered() {
        assert_eq!(compare(&json!(null), &json!(null)), None);
        assert_eq!(compare(&json!(1), &json!("1")), None);
    }

    #[test]
    fn only_true_is_truthy() {
        assert!(is_truthy(Some(&json!(true))));
        assert!(!is_truthy(Some(&json!(1))));
        assert!(!is_truthy(Some(&json!("true"))));
        assert!(!is_truthy(None));
    }

    #[test]
    fn lookup_nested_paths() {
        let doc = json!({"address": {"city": "Oslo"}, "tags": ["a", "b"]});
        let path = |p: &[&str]| p.iter().map(|s| (*s).to_string()).collect::<Vec<_>>();
        assert_eq!(lookup_path(&doc, &path(&["address", "city"])), Some(&json!("Oslo")));
        assert_eq!(lookup_path(&doc, &path(&["tags", "1"])), Some(&json!("b")));
        assert_eq!(lookup_path(&doc, &path(&["address", "zip"])), None);
        assert_eq!(lookup_path(&doc, &path(&["tags", "x"])), None);
    }
}
