//! Event name and payload normalization
//!
//! The collector accepts names of at most [`MAX_NAME_LENGTH`] characters from
//! `[A-Za-z0-9_]` and flat parameter maps of scalars. Everything else is
//! coerced here; nothing in this module fails.

use crate::types::{ParamValue, Payload};
use serde_json::{Map, Value};

pub const MAX_NAME_LENGTH: usize = 40;
pub const MAX_PARAMS: usize = 25;
pub const MAX_VALUE_LENGTH: usize = 100;
/// Arrays up to this many primitives collapse to a delimited string
pub const MAX_ARRAY_ITEMS: usize = 10;
/// Nesting kept when serializing complex values
pub const MAX_DEPTH: usize = 3;

const ARRAY_DELIMITER: &str = ",";
const DEPTH_MARKER: &str = "[…]";

/// Trim, replace disallowed characters with `_`, and truncate.
///
/// Returns `None` when nothing is left.
pub fn sanitize_event_name(name: &str) -> Option<String> {
    let cleaned: String = name
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' {
                c
            } else {
                '_'
            }
        })
        .take(MAX_NAME_LENGTH)
        .collect();

    if cleaned.is_empty() {
        None
    } else {
        Some(cleaned)
    }
}

/// Flatten a raw JSON object into collector parameters.
///
/// Keys are sanitized like event names (invalid keys dropped, first key wins
/// on collision); nulls and non-finite numbers are dropped; at most
/// [`MAX_PARAMS`] entries are kept in key order.
pub fn sanitize_payload(raw: &Map<String, Value>) -> Payload {
    let mut keys: Vec<&String> = raw.keys().collect();
    keys.sort();

    let mut out = Payload::new();
    for key in keys {
        if out.len() >= MAX_PARAMS {
            break;
        }
        let Some(clean_key) = sanitize_event_name(key) else {
            continue;
        };
        let Some(value) = sanitize_value(&raw[key.as_str()]) else {
            continue;
        };
        out.entry(clean_key).or_insert(value);
    }
    out
}

fn sanitize_value(value: &Value) -> Option<ParamValue> {
    match value {
        Value::Null => None,
        Value::Bool(b) => Some(ParamValue::Bool(*b)),
        Value::Number(n) => n
            .as_f64()
            .filter(|f| f.is_finite())
            .map(ParamValue::Number),
        Value::String(s) => Some(ParamValue::Text(truncate(s, MAX_VALUE_LENGTH))),
        Value::Array(items) => {
            let present: Vec<&Value> = items.iter().filter(|v| !v.is_null()).collect();
            if present.len() <= MAX_ARRAY_ITEMS && present.iter().all(|v| is_primitive(v)) {
                let joined = present
                    .iter()
                    .map(|v| primitive_to_string(v))
                    .collect::<Vec<_>>()
                    .join(ARRAY_DELIMITER);
                Some(ParamValue::Text(truncate(&joined, MAX_VALUE_LENGTH)))
            } else {
                Some(ParamValue::Text(serialize_bounded(value)))
            }
        }
        Value::Object(_) => Some(ParamValue::Text(serialize_bounded(value))),
    }
}

fn is_primitive(value: &Value) -> bool {
    matches!(value, Value::Bool(_) | Value::Number(_) | Value::String(_))
}

fn primitive_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// JSON-serialize with nesting cut at [`MAX_DEPTH`], capped in length.
fn serialize_bounded(value: &Value) -> String {
    let bounded = limit_depth(value, 0);
    truncate(&bounded.to_string(), MAX_VALUE_LENGTH)
}

fn limit_depth(value: &Value, depth: usize) -> Value {
    match value {
        Value::Array(_) | Value::Object(_) if depth >= MAX_DEPTH => {
            Value::String(DEPTH_MARKER.to_string())
        }
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|item| limit_depth(item, depth + 1))
                .collect(),
        ),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), limit_depth(v, depth + 1)))
                .collect(),
        ),
        other => other.clone(),
    }
}

fn truncate(s: &str, max_chars: usize) -> String {
    s.chars().take(max_chars).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sanitize(value: Value) -> Payload {
        sanitize_payload(value.as_object().unwrap())
    }

    #[test]
    fn test_name_sanitization() {
        assert_eq!(sanitize_event_name("  sign up!  ").as_deref(), Some("sign_up_"));
        assert_eq!(sanitize_event_name("page-view").as_deref(), Some("page_view"));
        assert_eq!(sanitize_event_name("ok_name_1").as_deref(), Some("ok_name_1"));
        assert_eq!(sanitize_event_name(""), None);
        assert_eq!(sanitize_event_name("   \t "), None);
    }

    #[test]
    fn test_name_truncated_to_max() {
        let long = "a".repeat(100);
        assert_eq!(sanitize_event_name(&long).unwrap().len(), MAX_NAME_LENGTH);
    }

    #[test]
    fn test_scalars_pass_through() {
        let payload = sanitize(json!({"s": "text", "n": 4.5, "b": false}));
        assert_eq!(payload["s"], ParamValue::Text("text".to_string()));
        assert_eq!(payload["n"], ParamValue::Number(4.5));
        assert_eq!(payload["b"], ParamValue::Bool(false));
    }

    #[test]
    fn test_nulls_and_bad_keys_dropped() {
        let payload = sanitize(json!({"gone": null, "  ": 1, "kept": 2}));
        assert_eq!(payload.len(), 1);
        assert!(payload.contains_key("kept"));
    }

    #[test]
    fn test_short_primitive_array_joined() {
        let payload = sanitize(json!({"tags": ["a", "b", 3, true, null]}));
        assert_eq!(payload["tags"], ParamValue::Text("a,b,3,true".to_string()));
    }

    #[test]
    fn test_long_or_complex_array_serialized() {
        let payload = sanitize(json!({"many": (0..20).collect::<Vec<_>>()}));
        let ParamValue::Text(s) = &payload["many"] else {
            panic!("expected text");
        };
        assert!(s.starts_with("[0,1,2"));

        let payload = sanitize(json!({"mixed": [1, {"x": 1}]}));
        assert_eq!(payload["mixed"], ParamValue::Text("[1,{\"x\":1}]".to_string()));
    }

    #[test]
    fn test_deep_object_cut_and_capped() {
        let payload = sanitize(json!({"deep": {"a": {"b": {"c": {"d": 1}}}}}));
        let ParamValue::Text(s) = &payload["deep"] else {
            panic!("expected text");
        };
        assert!(s.contains(DEPTH_MARKER));
        assert!(!s.contains("\"d\""));

        let big = "x".repeat(500);
        let payload = sanitize(json!({"obj": {"v": big}, "s": big}));
        for value in payload.values() {
            let ParamValue::Text(s) = value else {
                panic!("expected text");
            };
            assert_eq!(s.chars().count(), MAX_VALUE_LENGTH);
        }
    }

    #[test]
    fn test_property_count_bounded() {
        let mut raw = Map::new();
        for i in 0..60 {
            raw.insert(format!("k{:02}", i), json!(i));
        }
        let payload = sanitize_payload(&raw);
        assert_eq!(payload.len(), MAX_PARAMS);
        assert!(payload.contains_key("k00"));
        assert!(!payload.contains_key("k59"));
    }

    #[test]
    fn test_key_collision_keeps_first() {
        let payload = sanitize(json!({"a b": 1, "a-b": 2}));
        assert_eq!(payload.len(), 1);
        // "a b" sorts before "a-b".
        assert_eq!(payload["a_b"], ParamValue::Number(1.0));
    }
}
