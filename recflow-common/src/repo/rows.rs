//! Row mapping for record queries

use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use std::collections::BTreeSet;

use crate::models::Record;
use crate::{time, Error, Result};

/// Record columns plus aggregated sets, predecessors and service marks.
/// Expects the records table aliased as `r`.
pub(crate) const RECORD_COLUMNS: &str = r#"
    r.id, r.oai_id, r.format, r.record_type, r.status, r.payload, r.updated_at,
    (SELECT group_concat(set_spec, char(31)) FROM record_sets WHERE record_id = r.id) AS sets,
    (SELECT group_concat(predecessor_id) FROM record_lineage WHERE successor_id = r.id) AS predecessors,
    (SELECT group_concat(service_id) FROM record_processed_by WHERE record_id = r.id) AS processed_by,
    (SELECT group_concat(service_id) FROM record_input_for WHERE record_id = r.id) AS input_for
"#;

const SET_SEPARATOR: char = '\u{1f}';

pub(crate) fn record_from_row(row: &SqliteRow) -> Result<Record> {
    let status: String = row.get("status");
    let payload: String = row.get("payload");
    let sets: Option<String> = row.get("sets");
    let predecessors: Option<String> = row.get("predecessors");
    let processed_by: Option<String> = row.get("processed_by");
    let input_for: Option<String> = row.get("input_for");

    Ok(Record {
        id: Some(row.get("id")),
        oai_id: row.get("oai_id"),
        format: row.get("format"),
        sets: split_sets(sets.as_deref()),
        record_type: row.get("record_type"),
        status: status.parse()?,
        payload: serde_json::from_str(&payload)?,
        predecessors: parse_id_list(predecessors.as_deref())?,
        successors: BTreeSet::new(),
        processed_by: parse_id_list(processed_by.as_deref())?,
        input_for: parse_id_list(input_for.as_deref())?,
        updated_at: time::from_millis(row.get("updated_at")),
    })
}

pub(crate) fn split_sets(joined: Option<&str>) -> BTreeSet<String> {
    joined
        .map(|s| s.split(SET_SEPARATOR).map(str::to_string).collect())
        .unwrap_or_default()
}

/// Parse a `group_concat` of integer ids
pub(crate) fn parse_id_list(joined: Option<&str>) -> Result<BTreeSet<i64>> {
    let Some(joined) = joined else {
        return Ok(BTreeSet::new());
    };
    joined
        .split(',')
        .map(|id| {
            id.trim()
                .parse::<i64>()
                .map_err(|e| Error::Internal(format!("Failed to parse id list '{}': {}", joined, e)))
        })
        .collect()
}
