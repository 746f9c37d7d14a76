//! One-to-one cleanup of extracted field values
//!
//! Values are trimmed with inner whitespace collapsed; values left empty are dropped and
//! counted as warnings. Each input keeps a single output, rewritten on reprocessing.

use async_trait::async_trait;
use recflow_common::{Error, Record, RecordStatus, Result};
use serde_json::{Map, Value};

use super::{MetadataService, ProcessContext};

pub const KIND: &str = "normalization";

#[derive(Debug, Clone)]
pub struct NormalizationService {
    name: String,
}

impl NormalizationService {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

fn clean(value: &str) -> Option<String> {
    let words: Vec<&str> = value.split_whitespace().collect();
    (!words.is_empty()).then(|| words.join(" "))
}

/// Normalized copy of `payload`; the second element counts dropped values
fn normalize_payload(payload: &Value) -> Option<(Value, u64)> {
    let object = payload.as_object()?;
    let mut normalized = object.clone();
    let mut dropped = 0;

    if let Some(Value::Object(fields)) = object.get("fields") {
        let mut cleaned = Map::new();
        for (field, value) in fields {
            let raw: Vec<&str> = match value {
                Value::String(s) => vec![s.as_str()],
                Value::Array(items) => items.iter().filter_map(Value::as_str).collect(),
                _ => Vec::new(),
            };
            let values: Vec<Value> = raw
                .iter()
                .filter_map(|v| clean(v))
                .map(Value::String)
                .collect();
            dropped += (raw.len() - values.len()) as u64;
            if !values.is_empty() {
                cleaned.insert(field.clone(), Value::Array(values));
            }
        }
        normalized.insert("fields".to_string(), Value::Object(cleaned));
    }

    Some((Value::Object(normalized), dropped))
}

#[async_trait]
impl MetadataService for NormalizationService {
    fn name(&self) -> &str {
        &self.name
    }

    async fn process(&mut self, ctx: &mut ProcessContext<'_>, record: &Record) -> Result<Vec<Record>> {
        let input_id = record.require_id()?;
        let existing = ctx.existing_successors(input_id).await?;

        if record.is_deleted() {
            return Ok(existing
                .into_iter()
                .filter(|r| !r.is_deleted())
                .map(|mut r| {
                    r.status = RecordStatus::Deleted;
                    r
                })
                .collect());
        }

        let (payload, dropped) = normalize_payload(&record.payload)
            .ok_or_else(|| Error::record(record.oai_id.clone(), "payload is not a JSON object"))?;
        for _ in 0..dropped {
            ctx.stats.warn();
        }

        let mut output = match existing.into_iter().next() {
            Some(mut previous) => {
                previous.status = RecordStatus::Active;
                previous.format = record.format.clone();
                previous.payload = payload;
                previous
            }
            None => Record::new(ctx.oai_ids.next_id(), record.format.clone()).with_payload(payload),
        };
        output.record_type = record.record_type.clone();
        Ok(vec![output])
    }
}
