//! Upstream record source boundary.
//!
//! The engine only depends on the record shape — a flat map from raw field
//! name to string, number, boolean, list-of-string, or null — and on
//! cursor-based pagination, not on any transport. [`JsonlSource`] reads one
//! JSON object per line from a file and plays the upstream API for the CLI
//! and the tests.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use serde_json::Value as JsonValue;

use crate::value::FieldValue;

pub const DEFAULT_ID_FIELD: &str = "id";

/// One upstream record: its external identifier plus the raw fields.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub external_id: String,
    pub fields: BTreeMap<String, FieldValue>,
}

#[derive(Debug, Default)]
pub struct RecordPage {
    pub records: Vec<Record>,
    /// Opaque cursor for the next page; `None` when exhausted.
    pub next_cursor: Option<String>,
}

pub trait RecordSource {
    /// The upstream collection this source reads; used as the table name
    /// unless the caller overrides it.
    fn collection(&self) -> &str;

    /// Fetches up to `limit` records starting at `cursor` (`None` for the
    /// first page).
    fn fetch_page(&mut self, cursor: Option<&str>, limit: usize) -> Result<RecordPage>;
}

/// File-backed source: one JSON object per line, paginated by line offset.
#[derive(Debug)]
pub struct JsonlSource {
    path: PathBuf,
    collection: String,
    id_field: String,
}

impl JsonlSource {
    pub fn new(path: &Path, collection: &str, id_field: &str) -> Self {
        Self {
            path: path.to_path_buf(),
            collection: collection.to_string(),
            id_field: id_field.to_string(),
        }
    }

    fn decode_line(&self, line: &str, line_number: usize) -> Result<Record> {
        let parsed: JsonValue = serde_json::from_str(line)
            .with_context(|| format!("Parsing record on line {line_number}"))?;
        let JsonValue::Object(object) = parsed else {
            return Err(anyhow!("Record on line {line_number} is not a JSON object"));
        };

        let mut external_id = None;
        let mut fields = BTreeMap::new();
        for (raw_name, value) in object {
            if raw_name == self.id_field {
                external_id = Some(match &value {
                    JsonValue::String(text) => text.clone(),
                    JsonValue::Number(number) => number.to_string(),
                    other => {
                        return Err(anyhow!(
                            "Record on line {line_number} has a non-scalar '{}' field: {other}",
                            self.id_field
                        ));
                    }
                });
                continue;
            }
            let decoded = FieldValue::from_json(&value).with_context(|| {
                format!("Decoding field '{raw_name}' on line {line_number}")
            })?;
            fields.insert(raw_name, decoded);
        }

        let external_id = external_id.ok_or_else(|| {
            anyhow!(
                "Record on line {line_number} is missing the '{}' field",
                self.id_field
            )
        })?;
        Ok(Record {
            external_id,
            fields,
        })
    }
}

impl RecordSource for JsonlSource {
    fn collection(&self) -> &str {
        &self.collection
    }

    fn fetch_page(&mut self, cursor: Option<&str>, limit: usize) -> Result<RecordPage> {
        let offset: usize = match cursor {
            Some(cursor) => cursor
                .parse()
                .with_context(|| format!("Invalid cursor '{cursor}'"))?,
            None => 0,
        };
        let file = File::open(&self.path)
            .with_context(|| format!("Opening record file {:?}", self.path))?;
        let reader = BufReader::new(file);

        let mut records = Vec::new();
        let mut consumed = 0usize;
        let mut exhausted = true;
        for (index, line) in reader.lines().enumerate() {
            let line = line.with_context(|| format!("Reading line {} of {:?}", index + 1, self.path))?;
            if line.trim().is_empty() {
                continue;
            }
            if consumed < offset {
                consumed += 1;
                continue;
            }
            if records.len() == limit {
                exhausted = false;
                break;
            }
            records.push(self.decode_line(line.trim(), index + 1)?);
            consumed += 1;
        }

        let next_cursor = if exhausted {
            None
        } else {
            Some(consumed.to_string())
        };
        Ok(RecordPage {
            records,
            next_cursor,
        })
    }
}
