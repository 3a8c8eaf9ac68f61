//! Sample-based column type inference.
//!
//! The type lattice is deliberately small: `Text`, `Number`, `Boolean`,
//! `Timestamp`, `TextArray`. There is no JSON/object type; any list-shaped
//! value maps to `TextArray` by fixed policy regardless of element types.
//! The first non-null sample decides; later inconsistent samples are not
//! reconciled.

use std::fmt;
use std::str::FromStr;

use anyhow::anyhow;
use log::warn;
use serde::{Deserialize, Serialize};

use crate::value::{FieldValue, is_timestamp_literal};

/// Upper bound on the number of samples examined per field.
pub const SAMPLE_LIMIT: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ColumnType {
    #[serde(rename = "text")]
    Text,
    #[serde(rename = "number")]
    Number,
    #[serde(rename = "boolean")]
    Boolean,
    #[serde(rename = "timestamp")]
    Timestamp,
    #[serde(rename = "textArray")]
    TextArray,
}

impl ColumnType {
    pub fn token(self) -> &'static str {
        match self {
            ColumnType::Text => "text",
            ColumnType::Number => "number",
            ColumnType::Boolean => "boolean",
            ColumnType::Timestamp => "timestamp",
            ColumnType::TextArray => "textArray",
        }
    }

    /// The storage type used in DDL. Timestamps are stored as RFC 3339 text;
    /// text arrays as a JSON array in a text column.
    pub fn sql_type(self) -> &'static str {
        match self {
            ColumnType::Text | ColumnType::Timestamp | ColumnType::TextArray => "TEXT",
            ColumnType::Number => "REAL",
            ColumnType::Boolean => "INTEGER",
        }
    }
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.token())
    }
}

impl FromStr for ColumnType {
    type Err = anyhow::Error;

    fn from_str(token: &str) -> Result<Self, Self::Err> {
        match token {
            "text" => Ok(ColumnType::Text),
            "number" => Ok(ColumnType::Number),
            "boolean" => Ok(ColumnType::Boolean),
            "timestamp" => Ok(ColumnType::Timestamp),
            "textArray" => Ok(ColumnType::TextArray),
            other => Err(anyhow!("Unknown column type token '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Inference {
    pub column_type: ColumnType,
    pub nullable: bool,
    /// Set when no non-null sample was available and the default applied.
    pub low_confidence: bool,
}

/// Decides a column type from a bounded prefix of observed values.
///
/// Discovered columns are always nullable: the source is free to omit any
/// field from any record.
pub fn infer(field: &str, samples: &[FieldValue]) -> Inference {
    for sample in samples.iter().take(SAMPLE_LIMIT) {
        let column_type = match sample {
            FieldValue::Null => continue,
            FieldValue::TextList(_) => ColumnType::TextArray,
            FieldValue::Boolean(_) => ColumnType::Boolean,
            FieldValue::Number(_) => ColumnType::Number,
            FieldValue::Text(text) => {
                if is_timestamp_literal(text) {
                    ColumnType::Timestamp
                } else {
                    ColumnType::Text
                }
            }
        };
        return Inference {
            column_type,
            nullable: true,
            low_confidence: false,
        };
    }
    warn!("Field '{field}' had no non-null sample; defaulting to nullable text");
    Inference {
        column_type: ColumnType::Text,
        nullable: true,
        low_confidence: true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_non_null_sample_decides() {
        let samples = vec![
            FieldValue::Null,
            FieldValue::Number(3.0),
            FieldValue::Text("later".to_string()),
        ];
        let inference = infer("amount", &samples);
        assert_eq!(inference.column_type, ColumnType::Number);
        assert!(!inference.low_confidence);
    }

    #[test]
    fn lists_always_infer_text_array() {
        let samples = vec![
            FieldValue::TextList(vec!["a".to_string(), "b".to_string()]),
            FieldValue::Number(42.0),
        ];
        assert_eq!(infer("tags", &samples).column_type, ColumnType::TextArray);
    }

    #[test]
    fn strict_timestamps_infer_timestamp_and_loose_strings_do_not() {
        let stamped = vec![FieldValue::Text("2024-03-01T10:00:00Z".to_string())];
        assert_eq!(infer("seen_at", &stamped).column_type, ColumnType::Timestamp);

        let date_only = vec![FieldValue::Text("2024-03-01".to_string())];
        assert_eq!(infer("seen_on", &date_only).column_type, ColumnType::Text);
    }

    #[test]
    fn all_null_samples_default_to_low_confidence_text() {
        let samples = vec![FieldValue::Null, FieldValue::Null];
        let inference = infer("ghost", &samples);
        assert_eq!(inference.column_type, ColumnType::Text);
        assert!(inference.nullable);
        assert!(inference.low_confidence);
    }

    #[test]
    fn empty_sample_set_defaults_to_text() {
        let inference = infer("unseen", &[]);
        assert_eq!(inference.column_type, ColumnType::Text);
        assert!(inference.low_confidence);
    }

    #[test]
    fn tokens_round_trip_through_from_str() {
        for column_type in [
            ColumnType::Text,
            ColumnType::Number,
            ColumnType::Boolean,
            ColumnType::Timestamp,
            ColumnType::TextArray,
        ] {
            assert_eq!(
                column_type.token().parse::<ColumnType>().unwrap(),
                column_type
            );
        }
        assert!("json".parse::<ColumnType>().is_err());
    }
}
