use std::fmt;
use std::sync::OnceLock;

use anyhow::{Result, anyhow};
use chrono::{DateTime, NaiveDateTime};
use regex::Regex;
use rusqlite::types::Value as SqlValue;
use serde_json::Value as JsonValue;

use crate::infer::ColumnType;

/// A single field value as delivered by the upstream source.
///
/// The source contract admits exactly five shapes: string, number, boolean,
/// list-of-string, and null. Nested objects are rejected at decode time.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Text(String),
    Number(f64),
    Boolean(bool),
    TextList(Vec<String>),
    Null,
}

impl FieldValue {
    pub fn from_json(value: &JsonValue) -> Result<FieldValue> {
        match value {
            JsonValue::Null => Ok(FieldValue::Null),
            JsonValue::Bool(flag) => Ok(FieldValue::Boolean(*flag)),
            JsonValue::Number(number) => number
                .as_f64()
                .map(FieldValue::Number)
                .ok_or_else(|| anyhow!("Numeric value '{number}' does not fit a 64-bit float")),
            JsonValue::String(text) => Ok(FieldValue::Text(text.clone())),
            JsonValue::Array(items) => {
                let mut texts = Vec::with_capacity(items.len());
                for item in items {
                    match item {
                        JsonValue::String(text) => texts.push(text.clone()),
                        JsonValue::Number(number) => texts.push(number.to_string()),
                        JsonValue::Bool(flag) => texts.push(flag.to_string()),
                        other => {
                            return Err(anyhow!(
                                "List values must contain scalars, found {}",
                                json_shape(other)
                            ));
                        }
                    }
                }
                Ok(FieldValue::TextList(texts))
            }
            JsonValue::Object(_) => Err(anyhow!("Nested object values are not supported")),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, FieldValue::Null)
    }

    /// The plain-text rendering used when a value must be coerced into a
    /// column whose declared type it does not match.
    pub fn as_text(&self) -> String {
        match self {
            FieldValue::Text(text) => text.clone(),
            FieldValue::Number(number) => {
                if number.fract() == 0.0 && number.abs() < i64::MAX as f64 {
                    (*number as i64).to_string()
                } else {
                    number.to_string()
                }
            }
            FieldValue::Boolean(flag) => flag.to_string(),
            FieldValue::TextList(items) => {
                serde_json::to_string(items).unwrap_or_else(|_| String::new())
            }
            FieldValue::Null => String::new(),
        }
    }

    /// Converts the value into an SQL parameter for a column of `column_type`.
    ///
    /// The declared type never changes once inferred; values observed later
    /// that do not match it are coerced (scalar into a single-element array
    /// for `TextArray`, anything into its text form for `Text`).
    pub fn bind(&self, column_type: ColumnType) -> SqlValue {
        if self.is_null() {
            return SqlValue::Null;
        }
        match column_type {
            ColumnType::Text | ColumnType::Timestamp => SqlValue::Text(self.as_text()),
            ColumnType::Number => match self {
                FieldValue::Number(number) => SqlValue::Real(*number),
                FieldValue::Boolean(flag) => SqlValue::Real(if *flag { 1.0 } else { 0.0 }),
                other => SqlValue::Text(other.as_text()),
            },
            ColumnType::Boolean => match self {
                FieldValue::Boolean(flag) => SqlValue::Integer(i64::from(*flag)),
                other => SqlValue::Text(other.as_text()),
            },
            ColumnType::TextArray => {
                let items: Vec<String> = match self {
                    FieldValue::TextList(items) => items.clone(),
                    other => vec![other.as_text()],
                };
                SqlValue::Text(serde_json::to_string(&items).unwrap_or_else(|_| "[]".to_string()))
            }
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_text())
    }
}

fn json_shape(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "boolean",
        JsonValue::Number(_) => "number",
        JsonValue::String(_) => "string",
        JsonValue::Array(_) => "array",
        JsonValue::Object(_) => "object",
    }
}

static TIMESTAMP_PATTERN: OnceLock<Regex> = OnceLock::new();

fn timestamp_pattern() -> &'static Regex {
    TIMESTAMP_PATTERN.get_or_init(|| {
        Regex::new(r"^\d{4}-\d{2}-\d{2}[T ]\d{2}:\d{2}:\d{2}(?:\.\d{1,9})?(?:Z|[+-]\d{2}:?\d{2})?$")
            .expect("timestamp pattern compiles")
    })
}

/// Strict ISO-8601 detection: the shape must match and the parts must form a
/// real instant. Bare dates deliberately do not qualify.
pub fn is_timestamp_literal(value: &str) -> bool {
    timestamp_pattern().is_match(value) && parse_timestamp(value).is_ok()
}

pub fn parse_timestamp(value: &str) -> Result<NaiveDateTime> {
    if let Ok(parsed) = DateTime::parse_from_rfc3339(value) {
        return Ok(parsed.naive_utc());
    }
    const NAIVE_FORMATS: &[&str] = &["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"];
    for fmt in NAIVE_FORMATS {
        if let Ok(parsed) = NaiveDateTime::parse_from_str(value, fmt) {
            return Ok(parsed);
        }
    }
    const OFFSET_FORMATS: &[&str] = &["%Y-%m-%d %H:%M:%S%.f%:z", "%Y-%m-%d %H:%M:%S%.f%z"];
    for fmt in OFFSET_FORMATS {
        if let Ok(parsed) = DateTime::parse_from_str(value, fmt) {
            return Ok(parsed.naive_utc());
        }
    }
    Err(anyhow!("Failed to parse '{value}' as ISO-8601 timestamp"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn from_json_decodes_all_supported_shapes() {
        assert_eq!(
            FieldValue::from_json(&json!("hi")).unwrap(),
            FieldValue::Text("hi".to_string())
        );
        assert_eq!(
            FieldValue::from_json(&json!(4.5)).unwrap(),
            FieldValue::Number(4.5)
        );
        assert_eq!(
            FieldValue::from_json(&json!(true)).unwrap(),
            FieldValue::Boolean(true)
        );
        assert_eq!(FieldValue::from_json(&json!(null)).unwrap(), FieldValue::Null);
        assert_eq!(
            FieldValue::from_json(&json!(["a", 2, false])).unwrap(),
            FieldValue::TextList(vec!["a".to_string(), "2".to_string(), "false".to_string()])
        );
    }

    #[test]
    fn from_json_rejects_objects_and_nested_lists() {
        assert!(FieldValue::from_json(&json!({"k": 1})).is_err());
        assert!(FieldValue::from_json(&json!([["nested"]])).is_err());
        assert!(FieldValue::from_json(&json!([{"k": 1}])).is_err());
    }

    #[test]
    fn timestamp_literal_requires_full_instant() {
        assert!(is_timestamp_literal("2024-01-01T08:30:00Z"));
        assert!(is_timestamp_literal("2024-01-01 08:30:00"));
        assert!(is_timestamp_literal("2024-01-01T08:30:00.250+02:00"));
        assert!(!is_timestamp_literal("2024-01-01"));
        assert!(!is_timestamp_literal("08:30:00"));
        assert!(!is_timestamp_literal("2024-13-01T08:30:00Z"));
        assert!(!is_timestamp_literal("not a date"));
    }

    #[test]
    fn bind_matches_declared_type() {
        assert_eq!(
            FieldValue::Number(2.0).bind(ColumnType::Number),
            SqlValue::Real(2.0)
        );
        assert_eq!(
            FieldValue::Boolean(true).bind(ColumnType::Boolean),
            SqlValue::Integer(1)
        );
        assert_eq!(FieldValue::Null.bind(ColumnType::Text), SqlValue::Null);
    }

    #[test]
    fn bind_coerces_mismatched_values() {
        // First-sample-wins: a later scalar lands in an array column as a
        // single-element array, and any value lands in a text column as text.
        assert_eq!(
            FieldValue::Number(42.0).bind(ColumnType::TextArray),
            SqlValue::Text("[\"42\"]".to_string())
        );
        assert_eq!(
            FieldValue::TextList(vec!["a".to_string()]).bind(ColumnType::Text),
            SqlValue::Text("[\"a\"]".to_string())
        );
        assert_eq!(
            FieldValue::Text("n/a".to_string()).bind(ColumnType::Number),
            SqlValue::Text("n/a".to_string())
        );
    }

    #[test]
    fn as_text_renders_whole_floats_without_fraction() {
        assert_eq!(FieldValue::Number(7.0).as_text(), "7");
        assert_eq!(FieldValue::Number(7.25).as_text(), "7.25");
    }
}
