//! Removing entries addressed by display-style key paths.
//!
//! Paths are sequences of segments. Mapping segments are keys, sequence
//! segments are decimal indices. Keys that look like `<base>_<n>` may
//! address a whole enumerated family (`base`, `base_1`, `base_2`, ...), which
//! is how the flattener names repeated entries.
//!
//! Unresolvable paths are not errors: the functions return `false` and leave
//! the container untouched.

use crate::{Mapping, Value};

/// Remove `key` from a single-level mapping.
///
/// An exact match removes that key. Otherwise, when `key` looks like
/// `<base>_<n>` and `base` is itself a key, every key starting with `base`
/// is removed.
pub fn remove_key(mapping: &mut Mapping, key: &str) -> bool {
    remove_from_mapping(mapping, key, None)
}

/// Remove the entry addressed by `path` from a checkpoint.
pub fn remove_nested_key<S: AsRef<str>>(checkpoint: &mut Mapping, path: &[S]) -> bool {
    descend_mapping(checkpoint, path, None)
}

/// Remove the entry addressed by `path` below an arbitrary value.
pub fn remove_nested_value<S: AsRef<str>>(value: &mut Value, path: &[S]) -> bool {
    descend(value, path, None)
}

fn descend<S: AsRef<str>>(value: &mut Value, path: &[S], addressed_by: Option<&str>) -> bool {
    match value {
        Value::Mapping(map) => descend_mapping(map, path, addressed_by),
        Value::Sequence(items) => descend_sequence(items, path),
        Value::Tensor(_) | Value::Scalar(_) => false,
    }
}

fn descend_mapping<S: AsRef<str>>(map: &mut Mapping, path: &[S], addressed_by: Option<&str>) -> bool {
    let Some((segment, rest)) = path.split_first() else {
        return false;
    };
    let segment = segment.as_ref();
    if rest.is_empty() {
        return remove_from_mapping(map, segment, addressed_by);
    }
    match map.get_mut(segment) {
        Some(child) => descend(child, rest, Some(segment)),
        None => false,
    }
}

fn descend_sequence<S: AsRef<str>>(items: &mut Vec<Value>, path: &[S]) -> bool {
    let Some((segment, rest)) = path.split_first() else {
        return false;
    };
    let segment = segment.as_ref();
    let Ok(index) = segment.parse::<usize>() else {
        return false;
    };
    if index >= items.len() {
        return false;
    }
    if rest.is_empty() {
        items.remove(index);
        return true;
    }
    descend(&mut items[index], rest, Some(segment))
}

fn remove_from_mapping(map: &mut Mapping, key: &str, addressed_by: Option<&str>) -> bool {
    let base = enumerated_base(key);

    // A family member addressed under its own base drops the whole family.
    if let (Some(base), Some(parent)) = (base, addressed_by) {
        if base == parent {
            return remove_prefixed(map, base);
        }
    }

    if map.remove(key).is_some() {
        return true;
    }

    match base {
        Some(base) if map.contains_key(base) => remove_prefixed(map, base),
        _ => false,
    }
}

/// Split `name_3` into `name`; `None` unless the suffix is all digits.
fn enumerated_base(key: &str) -> Option<&str> {
    let (base, suffix) = key.rsplit_once('_')?;
    let numeric = !suffix.is_empty() && suffix.bytes().all(|b| b.is_ascii_digit());
    (numeric && !base.is_empty()).then_some(base)
}

fn remove_prefixed(map: &mut Mapping, prefix: &str) -> bool {
    let before = map.len();
    map.retain(|k, _| !k.starts_with(prefix));
    map.len() < before
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Scalar;

    fn int(v: i64) -> Value {
        Value::Scalar(Scalar::Int(v))
    }

    fn map<const N: usize>(entries: [(&str, Value); N]) -> Mapping {
        entries.into_iter().collect()
    }

    fn keys(map: &Mapping) -> Vec<&str> {
        map.keys().collect()
    }

    #[test]
    fn test_remove_exact_key() {
        let mut m = map([("a", int(1)), ("b", int(2))]);
        assert!(remove_key(&mut m, "a"));
        assert_eq!(keys(&m), vec!["b"]);
    }

    #[test]
    fn test_exact_match_wins_over_family() {
        let mut m = map([("a", int(1)), ("a_1", int(2)), ("a_2", int(3))]);
        assert!(remove_key(&mut m, "a_1"));
        assert_eq!(keys(&m), vec!["a", "a_2"]);
    }

    #[test]
    fn test_enumerated_key_removes_family_when_base_present() {
        let mut m = map([("w", int(1)), ("w_2", int(2)), ("bias", int(3))]);
        assert!(remove_key(&mut m, "w_1"));
        assert_eq!(keys(&m), vec!["bias"]);
    }

    #[test]
    fn test_missing_key_is_noop() {
        let mut m = map([("a", int(1))]);
        assert!(!remove_key(&mut m, "b"));
        assert!(!remove_key(&mut m, "b_1"));
        assert!(!remove_key(&mut m, "a_x"));
        assert_eq!(keys(&m), vec!["a"]);
    }

    #[test]
    fn test_family_removal_under_enumerated_base() {
        let mut m = map([("a", Value::Mapping(map([("a_1", int(1)), ("a_2", int(2)), ("b", int(3))])))]);
        assert!(remove_nested_key(&mut m, &["a", "a_1"]));
        let inner = m.get("a").and_then(Value::as_mapping).unwrap();
        assert_eq!(keys(inner), vec!["b"]);
    }

    #[test]
    fn test_nested_exact_removal() {
        let mut m = map([(
            "state_dict",
            Value::Mapping(map([("layer.weight", int(1)), ("layer.bias", int(2))])),
        )]);
        assert!(remove_nested_key(&mut m, &["state_dict", "layer.bias"]));
        let inner = m.get("state_dict").and_then(Value::as_mapping).unwrap();
        assert_eq!(keys(inner), vec!["layer.weight"]);
    }

    #[test]
    fn test_sequence_index_removal() {
        let mut m = map([("xs", Value::Sequence(vec![int(10), int(20), int(30)]))]);
        assert!(remove_nested_key(&mut m, &["xs", "1"]));
        assert_eq!(m.get("xs"), Some(&Value::Sequence(vec![int(10), int(30)])));
    }

    #[test]
    fn test_descend_through_sequence() {
        let mut m = map([(
            "layers",
            Value::Sequence(vec![Value::Mapping(map([("w", int(1)), ("b", int(2))]))]),
        )]);
        assert!(remove_nested_key(&mut m, &["layers", "0", "b"]));
        let layer = match m.get("layers") {
            Some(Value::Sequence(items)) => items[0].as_mapping().unwrap(),
            other => panic!("unexpected {other:?}"),
        };
        assert_eq!(keys(layer), vec!["w"]);
    }

    #[test]
    fn test_unresolvable_paths_are_noops() {
        let original = map([
            ("xs", Value::Sequence(vec![int(1)])),
            ("leaf", int(2)),
            ("m", Value::Mapping(map([("k", int(3))]))),
        ]);
        let mut m = original.clone();
        let empty: [&str; 0] = [];
        assert!(!remove_nested_key(&mut m, &empty));
        assert!(!remove_nested_key(&mut m, &["missing", "k"]));
        assert!(!remove_nested_key(&mut m, &["xs", "one"]));
        assert!(!remove_nested_key(&mut m, &["xs", "5"]));
        assert!(!remove_nested_key(&mut m, &["leaf", "k"]));
        assert!(!remove_nested_key(&mut m, &["m", "nope"]));
        assert_eq!(m, original);
    }

    #[test]
    fn test_remove_nested_value_on_sequence_root() {
        let mut v = Value::Sequence(vec![int(1), int(2)]);
        assert!(remove_nested_value(&mut v, &["0"]));
        assert_eq!(v, Value::Sequence(vec![int(2)]));
    }

    #[test]
    fn test_enumerated_base() {
        assert_eq!(enumerated_base("a_1"), Some("a"));
        assert_eq!(enumerated_base("layer_norm_12"), Some("layer_norm"));
        assert_eq!(enumerated_base("layer_norm"), None);
        assert_eq!(enumerated_base("_3"), None);
        assert_eq!(enumerated_base("x_"), None);
    }
}
