//! Service input queries
//!
//! A service's pending input is every visible record marked input for it and not yet
//! processed by it, wherever the record lives. Resumption after a crash is a re-query.

use sqlx::SqlitePool;

use super::{record_from_row, RECORD_COLUMNS};
use crate::models::Record;
use crate::Result;

/// Which record types a pending-input query covers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeSelector<'a> {
    Only(&'a str),
    Any,
}

impl<'a> TypeSelector<'a> {
    fn as_option(&self) -> Option<&'a str> {
        match self {
            TypeSelector::Only(name) => Some(name),
            TypeSelector::Any => None,
        }
    }
}

const PENDING_CLAUSE: &str = r#"
    FROM records r
    JOIN record_input_for i ON i.record_id = r.id AND i.service_id = ?
    WHERE r.visible = 1
      AND r.id > ?
      AND NOT EXISTS (
          SELECT 1 FROM record_processed_by p WHERE p.record_id = r.id AND p.service_id = ?
      )
      AND (? IS NULL OR r.record_type = ?)
"#;

/// One id-ordered page of pending input for `service_id`
pub async fn pending_input(
    pool: &SqlitePool,
    service_id: i64,
    selector: TypeSelector<'_>,
    after_id: i64,
    limit: i64,
) -> Result<Vec<Record>> {
    let sql = format!(
        "SELECT {} {} ORDER BY r.id ASC LIMIT ?",
        RECORD_COLUMNS, PENDING_CLAUSE
    );
    let record_type = selector.as_option();
    let rows = sqlx::query(&sql)
        .bind(service_id)
        .bind(after_id)
        .bind(service_id)
        .bind(record_type)
        .bind(record_type)
        .bind(limit)
        .fetch_all(pool)
        .await?;

    rows.iter().map(record_from_row).collect()
}

/// Number of records still pending for `service_id`
pub async fn count_pending_input(
    pool: &SqlitePool,
    service_id: i64,
    selector: TypeSelector<'_>,
) -> Result<i64> {
    let sql = format!("SELECT COUNT(*) {}", PENDING_CLAUSE);
    let record_type = selector.as_option();
    let count = sqlx::query_scalar(&sql)
        .bind(service_id)
        .bind(0_i64)
        .bind(service_id)
        .bind(record_type)
        .bind(record_type)
        .fetch_one(pool)
        .await?;
    Ok(count)
}

/// Visible record by id in any repository
pub async fn get_record_any(pool: &SqlitePool, id: i64) -> Result<Option<Record>> {
    let sql = format!(
        "SELECT {} FROM records r WHERE r.id = ? AND r.visible = 1",
        RECORD_COLUMNS
    );
    let row = sqlx::query(&sql).bind(id).fetch_optional(pool).await?;
    row.as_ref().map(record_from_row).transpose()
}

/// Ids of records processed by `service_id`, in any repository
pub async fn processed_by_service(pool: &SqlitePool, service_id: i64) -> Result<Vec<i64>> {
    let ids = sqlx::query_scalar(
        "SELECT record_id FROM record_processed_by WHERE service_id = ? ORDER BY record_id",
    )
    .bind(service_id)
    .fetch_all(pool)
    .await?;
    Ok(ids)
}
