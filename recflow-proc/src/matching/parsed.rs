//! Field view of a record's payload
//!
//! Payloads carry extracted bibliographic fields as
//! `{"fields": {"020a": ["0306406152"], "245a": ["Title"]}}`, keyed by tag plus subfield
//! code. A scalar string is accepted in place of a one-element list.

use recflow_common::{Record, Result};
use serde_json::Value;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedRecord {
    pub id: i64,
    fields: BTreeMap<String, Vec<String>>,
}

impl ParsedRecord {
    pub fn new(id: i64) -> Self {
        Self {
            id,
            fields: BTreeMap::new(),
        }
    }

    pub fn with_field(mut self, field: &str, value: impl Into<String>) -> Self {
        self.fields
            .entry(field.to_string())
            .or_default()
            .push(value.into());
        self
    }

    pub fn from_record(record: &Record) -> Result<Self> {
        let mut parsed = Self::new(record.require_id()?);
        let Some(Value::Object(fields)) = record.payload.get("fields") else {
            return Ok(parsed);
        };

        for (field, value) in fields {
            let values: Vec<String> = match value {
                Value::String(s) => vec![s.clone()],
                Value::Array(items) => items
                    .iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect(),
                _ => continue,
            };
            if !values.is_empty() {
                parsed.fields.insert(field.clone(), values);
            }
        }
        Ok(parsed)
    }

    /// Values of `field` in document order
    pub fn values(&self, field: &str) -> &[String] {
        self.fields.get(field).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}
