// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Guard for text headed into JSON-typed columns.
//!
//! Upstream APIs occasionally return a plain string where a JSON document was
//! expected. Text that is not valid JSON is encoded as a JSON string instead
//! of being sent as-is, so the store never rejects the batch as malformed.

use serde_json::Value;

use crate::sql_value::SqlValue;

/// Cheap structural check: does the trimmed text open and close with a
/// matching `{}`, `[]` or `""` pair?
#[must_use]
pub fn looks_like_json(text: &str) -> bool {
    let trimmed = text.trim();
    let bytes = trimmed.as_bytes();
    if bytes.len() < 2 {
        return false;
    }
    matches!(
        (bytes[0], bytes[bytes.len() - 1]),
        (b'{', b'}') | (b'[', b']') | (b'"', b'"')
    )
}

/// Turn arbitrary text into a JSON value: parsed when it is valid JSON,
/// otherwise the text itself as a JSON string.
///
/// ```
/// use replica_sync::upsert::json_guard::guard_json_text;
/// use serde_json::json;
///
/// assert_eq!(guard_json_text(r#"{"a":1}"#), json!({"a": 1}));
/// assert_eq!(guard_json_text("hello"), json!("hello"));
/// ```
#[must_use]
pub fn guard_json_text(text: &str) -> Value {
    if looks_like_json(text) {
        if let Ok(value) = serde_json::from_str::<Value>(text.trim()) {
            return value;
        }
    }
    Value::String(text.to_string())
}

/// Normalise a value bound for a JSON column. `Null` stays SQL NULL.
#[must_use]
pub fn guard_value(value: SqlValue) -> SqlValue {
    match value {
        SqlValue::Null => SqlValue::Null,
        SqlValue::Json(v) => SqlValue::Json(v),
        SqlValue::Text(s) => SqlValue::Json(guard_json_text(&s)),
        SqlValue::Bool(b) => SqlValue::Json(Value::Bool(b)),
        SqlValue::Int(i) => SqlValue::Json(Value::from(i)),
        SqlValue::Float(f) => SqlValue::Json(
            serde_json::Number::from_f64(f)
                .map(Value::Number)
                .unwrap_or(Value::Null),
        ),
        SqlValue::Timestamp(t) => SqlValue::Json(Value::String(t.to_rfc3339())),
    }
}
