//! JSON value helpers shared by condition evaluation, expressions and actions.
//!
//! Records are plain `serde_json::Value` trees addressed with dot paths
//! (`order.customer.email`, `items.0.price`). Comparisons are loose: numeric
//! strings compare as numbers and booleans coerce to `1`/`0`.

use serde_json::{Map, Number, Value};

/// Resolve a dot path against a record. Numeric segments index into arrays.
pub fn get_path<'a>(record: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = record;
    for segment in path.split('.') {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Assign `value` at a dot path, creating intermediate objects as needed.
///
/// `null` intermediates are replaced by empty objects; descending into a
/// scalar is an error and leaves the record untouched.
pub fn set_path(record: &mut Value, path: &str, value: Value) -> Result<(), String> {
    let segments: Vec<&str> = path.split('.').collect();
    if segments.iter().any(|s| s.trim().is_empty()) {
        return Err(format!("invalid field path '{}'", path));
    }
    let Some((last, parents)) = segments.split_last() else {
        return Err(format!("invalid field path '{}'", path));
    };

    let mut current = record;
    for segment in parents {
        if current.is_null() {
            *current = Value::Object(Map::new());
        }
        current = match current {
            Value::Object(map) => map
                .entry(segment.to_string())
                .or_insert_with(|| Value::Object(Map::new())),
            Value::Array(items) => {
                let index = segment
                    .parse::<usize>()
                    .map_err(|_| format!("'{}' is not an array index in '{}'", segment, path))?;
                items
                    .get_mut(index)
                    .ok_or_else(|| format!("index {} out of bounds in '{}'", index, path))?
            }
            other => {
                return Err(format!(
                    "cannot set '{}': '{}' is a {}",
                    path,
                    segment,
                    type_name(other)
                ));
            }
        };
    }

    if current.is_null() {
        *current = Value::Object(Map::new());
    }
    match current {
        Value::Object(map) => {
            map.insert(last.to_string(), value);
            Ok(())
        }
        Value::Array(items) => {
            let index = last
                .parse::<usize>()
                .map_err(|_| format!("'{}' is not an array index in '{}'", last, path))?;
            let slot = items
                .get_mut(index)
                .ok_or_else(|| format!("index {} out of bounds in '{}'", index, path))?;
            *slot = value;
            Ok(())
        }
        other => Err(format!(
            "cannot set '{}': parent is a {}",
            path,
            type_name(other)
        )),
    }
}

/// Parse a bare DSL word into a literal: booleans, `null`, numbers, else a string.
pub fn parse_literal(word: &str) -> Value {
    match word.to_ascii_lowercase().as_str() {
        "true" => return Value::Bool(true),
        "false" => return Value::Bool(false),
        "null" => return Value::Null,
        _ => {}
    }
    if let Ok(n) = word.parse::<i64>() {
        return Value::Number(Number::from(n));
    }
    if let Ok(f) = word.parse::<f64>() {
        if f.is_finite() {
            return number_value(f);
        }
    }
    Value::String(word.to_string())
}

/// Coerce to a number. `null`, objects, arrays and non-numeric strings have none.
pub fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => {
            let s = s.trim();
            if s.is_empty() {
                Some(0.0)
            } else {
                s.parse().ok()
            }
        }
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        _ => None,
    }
}

/// Build a JSON number, keeping integral results as integers (`550`, not `550.0`).
pub fn number_value(f: f64) -> Value {
    const MAX_SAFE: f64 = 9_007_199_254_740_992.0;
    if f.is_finite() && f.fract() == 0.0 && f.abs() < MAX_SAFE {
        Value::Number(Number::from(f as i64))
    } else {
        Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null)
    }
}

/// Loose equality: numbers compare numerically against numeric strings and
/// booleans, `null` equals only `null`.
pub fn loose_eq(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Null, Value::Null) => true,
        (Value::Null, _) | (_, Value::Null) => false,
        (Value::String(a), Value::String(b)) => a == b,
        (Value::Bool(a), Value::Bool(b)) => a == b,
        (Value::Array(_), _) | (_, Value::Array(_)) | (Value::Object(_), _) | (_, Value::Object(_)) => {
            left == right
        }
        _ => match (as_number(left), as_number(right)) {
            (Some(a), Some(b)) => (a - b).abs() < f64::EPSILON,
            _ => false,
        },
    }
}

/// Display form used for string concatenation, `CONTAINS` and templates.
pub fn to_display(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        other => other.to_string(),
    }
}

/// Truthiness for bare field references in conditions.
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map_or(false, |f| f != 0.0 && !f.is_nan()),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

pub fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_get_path() {
        let record = json!({"order": {"total": 600, "items": [{"sku": "a"}]}});
        assert_eq!(get_path(&record, "order.total"), Some(&json!(600)));
        assert_eq!(get_path(&record, "order.items.0.sku"), Some(&json!("a")));
        assert_eq!(get_path(&record, "order.missing"), None);
        assert_eq!(get_path(&record, "order.total.deeper"), None);
    }

    #[test]
    fn test_set_path_creates_intermediates() {
        let mut record = json!({"order": {"total": 600}});
        set_path(&mut record, "order.meta.flag", json!(true)).unwrap();
        set_path(&mut record, "customer.tier", json!("gold")).unwrap();
        assert_eq!(record["order"]["meta"]["flag"], json!(true));
        assert_eq!(record["customer"]["tier"], json!("gold"));
    }

    #[test]
    fn test_set_path_rejects_scalar_parent() {
        let mut record = json!({"order": {"total": 600}});
        assert!(set_path(&mut record, "order.total.cents", json!(1)).is_err());
        assert_eq!(record, json!({"order": {"total": 600}}));
        assert!(set_path(&mut record, "order..x", json!(1)).is_err());
    }

    #[test]
    fn test_parse_literal() {
        assert_eq!(parse_literal("42"), json!(42));
        assert_eq!(parse_literal("2.5"), json!(2.5));
        assert_eq!(parse_literal("TRUE"), json!(true));
        assert_eq!(parse_literal("null"), Value::Null);
        assert_eq!(parse_literal("gold"), json!("gold"));
    }

    #[test]
    fn test_loose_eq() {
        assert!(loose_eq(&json!(500), &json!("500")));
        assert!(loose_eq(&json!(1), &json!(true)));
        assert!(loose_eq(&json!(2.0), &json!(2)));
        assert!(!loose_eq(&Value::Null, &json!(0)));
        assert!(loose_eq(&Value::Null, &Value::Null));
        assert!(!loose_eq(&json!("US"), &json!("FR")));
    }

    #[test]
    fn test_number_value_keeps_integers() {
        assert_eq!(number_value(550.0), json!(550));
        assert_eq!(number_value(0.5), json!(0.5));
        assert_eq!(number_value(f64::NAN), Value::Null);
    }

    #[test]
    fn test_truthiness_and_display() {
        assert!(is_truthy(&json!("x")));
        assert!(!is_truthy(&json!(0)));
        assert!(!is_truthy(&Value::Null));
        assert_eq!(to_display(&json!(12)), "12");
        assert_eq!(to_display(&Value::Null), "");
    }
}
