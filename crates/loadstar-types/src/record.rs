//! Row representation exchanged between source and target connectors.

use std::cmp::Ordering;

use serde_json::Value;

/// One row: column name to JSON value.
pub type Record = serde_json::Map<String, Value>;

/// Serialized size of a record in bytes, used for byte counters.
#[must_use]
pub fn record_size(record: &Record) -> u64 {
    serde_json::to_vec(record).map_or(0, |bytes| bytes.len() as u64)
}

/// Render a column value the way it is stored as an incremental checkpoint.
///
/// Strings are taken verbatim, numbers and booleans use their JSON text.
/// Nulls, arrays and objects cannot bound a read.
#[must_use]
pub fn cursor_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Null | Value::Array(_) | Value::Object(_) => None,
    }
}

/// Order a column value against a checkpoint rendered by [`cursor_text`].
///
/// Numbers compare numerically when the checkpoint parses as a number,
/// everything else compares as text (ISO-8601 timestamps sort correctly).
#[must_use]
pub fn compare_to_cursor(value: &Value, cursor: &str) -> Option<Ordering> {
    match value {
        Value::Number(n) => match (n.as_f64(), cursor.parse::<f64>()) {
            (Some(lhs), Ok(rhs)) => lhs.partial_cmp(&rhs),
            _ => Some(n.to_string().as_str().cmp(cursor)),
        },
        other => cursor_text(other).map(|text| text.as_str().cmp(cursor)),
    }
}

/// Order two checkpoint texts, numerically when both parse as numbers.
#[must_use]
pub fn compare_cursor_text(lhs: &str, rhs: &str) -> Ordering {
    match (lhs.parse::<f64>(), rhs.parse::<f64>()) {
        (Ok(a), Ok(b)) => a.partial_cmp(&b).unwrap_or(Ordering::Equal),
        _ => lhs.cmp(rhs),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn record_size_matches_json_length() {
        let mut record = Record::new();
        record.insert("id".into(), json!(1));
        assert_eq!(record_size(&record), br#"{"id":1}"#.len() as u64);
    }

    #[test]
    fn cursor_text_skips_nulls() {
        assert_eq!(cursor_text(&json!("2023-01-01")), Some("2023-01-01".into()));
        assert_eq!(cursor_text(&json!(42)), Some("42".into()));
        assert_eq!(cursor_text(&Value::Null), None);
    }

    #[test]
    fn numbers_compare_numerically() {
        assert_eq!(compare_to_cursor(&json!(10), "9"), Some(Ordering::Greater));
        assert_eq!(compare_cursor_text("10", "9"), Ordering::Greater);
    }

    #[test]
    fn timestamps_compare_as_text() {
        assert_eq!(
            compare_to_cursor(&json!("2023-01-02T00:00:00Z"), "2023-01-01T00:00:00Z"),
            Some(Ordering::Greater)
        );
        assert_eq!(
            compare_cursor_text("2023-01-01T00:00:00Z", "2023-01-01T00:00:00Z"),
            Ordering::Equal
        );
        assert_eq!(compare_to_cursor(&Value::Null, "x"), None);
    }
}
