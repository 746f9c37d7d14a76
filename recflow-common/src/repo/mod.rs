//! Record repository
//!
//! A [`Repository`] is a named view over the shared record store: one per provider and one
//! per service output. Ids are global across repositories, so lineage edges and service
//! input marks may cross repository boundaries.
//!
//! Writes made inside a [`Batch`] are staged invisible and become visible together when the
//! batch ends. Readers paging through `get_records` never observe a half-written batch.

mod batch;
pub mod input;
mod lineage;
mod rows;

pub use batch::{purge_abandoned_batches, Batch, BatchSummary};

use chrono::{DateTime, Utc};
use futures::Stream;
use sqlx::sqlite::{Sqlite, SqliteArguments, SqliteConnection};
use sqlx::query::Query;
use sqlx::{Row, SqlitePool};
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

use crate::db::retry_on_lock;
use crate::index::SearchIndex;
use crate::models::{Record, RecordHeader, RecordStatus};
use crate::{time, Error, Result};

pub(crate) use rows::{record_from_row, RECORD_COLUMNS};

/// Default number of records per page
pub const DEFAULT_PAGE_SIZE: i64 = 1_000;

/// Range and classification filter for paged record queries
///
/// The id bound is exclusive; the time window is inclusive at both ends.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecordFilter {
    pub from: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub starting_id: i64,
    pub format: Option<String>,
    pub set_spec: Option<String>,
}

impl RecordFilter {
    pub fn starting_after(mut self, id: i64) -> Self {
        self.starting_id = id;
        self
    }

    pub fn in_window(mut self, from: Option<DateTime<Utc>>, until: Option<DateTime<Utc>>) -> Self {
        self.from = from;
        self.until = until;
        self
    }

    pub fn with_format(mut self, format: impl Into<String>) -> Self {
        self.format = Some(format.into());
        self
    }

    pub fn with_set(mut self, set_spec: impl Into<String>) -> Self {
        self.set_spec = Some(set_spec.into());
        self
    }
}

const FILTER_CLAUSE: &str = r#"
    r.repo_name = ? AND r.visible = 1 AND r.id > ?
    AND (? IS NULL OR r.updated_at >= ?)
    AND (? IS NULL OR r.updated_at <= ?)
    AND (? IS NULL OR r.format = ?)
    AND (? IS NULL OR EXISTS (
        SELECT 1 FROM record_sets s WHERE s.record_id = r.id AND s.set_spec = ?
    ))
"#;

/// Bind values in `FILTER_CLAUSE` order; nullable filters are bound twice
fn bind_filter<'q>(
    query: Query<'q, Sqlite, SqliteArguments<'q>>,
    repo_name: &str,
    filter: &RecordFilter,
) -> Query<'q, Sqlite, SqliteArguments<'q>> {
    let from = filter.from.map(time::to_millis);
    let until = filter.until.map(time::to_millis);
    query
        .bind(repo_name.to_string())
        .bind(filter.starting_id)
        .bind(from)
        .bind(from)
        .bind(until)
        .bind(until)
        .bind(filter.format.clone())
        .bind(filter.format.clone())
        .bind(filter.set_spec.clone())
        .bind(filter.set_spec.clone())
}

/// Durable, queryable store of records for one provider or service
#[derive(Clone)]
pub struct Repository {
    pool: SqlitePool,
    name: String,
    index: Arc<dyn SearchIndex>,
    page_size: i64,
    max_lock_wait_ms: u64,
}

impl std::fmt::Debug for Repository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Repository")
            .field("name", &self.name)
            .field("page_size", &self.page_size)
            .finish()
    }
}

impl Repository {
    pub fn new(pool: SqlitePool, name: impl Into<String>, index: Arc<dyn SearchIndex>) -> Self {
        Self {
            pool,
            name: name.into(),
            index,
            page_size: DEFAULT_PAGE_SIZE,
            max_lock_wait_ms: 5_000,
        }
    }

    pub fn with_page_size(mut self, page_size: i64) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub fn with_max_lock_wait_ms(mut self, max_lock_wait_ms: u64) -> Self {
        self.max_lock_wait_ms = max_lock_wait_ms;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn index(&self) -> &Arc<dyn SearchIndex> {
        &self.index
    }

    pub fn page_size(&self) -> i64 {
        self.page_size
    }

    pub(crate) fn max_lock_wait_ms(&self) -> u64 {
        self.max_lock_wait_ms
    }

    /// Insert a visible record and assign its id
    ///
    /// A duplicate `oai_id` within this repository fails with `Error::Storage`.
    pub async fn add_record(&self, record: &mut Record) -> Result<i64> {
        let id = self.insert(record, None).await?;
        record.id = Some(id);
        Ok(id)
    }

    /// Insert several records in one transaction
    pub async fn add_records(&self, records: &mut [Record]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let now = time::now();
        let mut ids = Vec::with_capacity(records.len());
        for record in records.iter_mut() {
            record.updated_at = now;
            ids.push(insert_record(&mut *tx, &self.name, record, None).await?);
        }
        touch_last_modified(&mut *tx, &self.name).await?;
        tx.commit().await?;

        for (record, id) in records.iter_mut().zip(ids) {
            record.id = Some(id);
        }
        Ok(())
    }

    /// Insert `record`, staged invisible under `batch_id` when one is given
    pub(crate) async fn insert(&self, record: &mut Record, batch_id: Option<&str>) -> Result<i64> {
        record.updated_at = time::now();
        let record: &Record = record;
        let mut tx = self.pool.begin().await?;
        let id = insert_record(&mut *tx, &self.name, record, batch_id).await?;
        touch_last_modified(&mut *tx, &self.name).await?;
        tx.commit().await?;
        debug!(repo = %self.name, id, oai_id = %record.oai_id, staged = batch_id.is_some(), "Inserted record");
        Ok(id)
    }

    /// Rewrite a stored record
    ///
    /// Replaces sets, `processed_by` and `input_for`. Lineage edges named in
    /// `predecessors` and `successors` are added; existing edges are never removed here.
    pub async fn update_record(&self, record: &mut Record) -> Result<()> {
        let id = record.require_id()?;
        record.updated_at = time::now();
        let payload = serde_json::to_string(&record.payload)?;

        let mut tx = self.pool.begin().await?;
        let result = sqlx::query(
            r#"
            UPDATE records
            SET format = ?, record_type = ?, status = ?, payload = ?, updated_at = ?
            WHERE id = ? AND repo_name = ?
            "#,
        )
        .bind(&record.format)
        .bind(&record.record_type)
        .bind(record.status.as_str())
        .bind(&payload)
        .bind(time::to_millis(record.updated_at))
        .bind(id)
        .bind(&self.name)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(Error::NotFound(format!("record {} in {}", id, self.name)));
        }

        for table in ["record_sets", "record_processed_by", "record_input_for"] {
            sqlx::query(&format!("DELETE FROM {} WHERE record_id = ?", table))
                .bind(id)
                .execute(&mut *tx)
                .await?;
        }
        write_relations(&mut *tx, id, record).await?;
        touch_last_modified(&mut *tx, &self.name).await?;
        tx.commit().await?;

        Ok(())
    }

    /// Tombstone a record; it stays retrievable with status DELETED
    pub async fn mark_deleted(&self, id: i64) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let result = sqlx::query(
            "UPDATE records SET status = ?, updated_at = ? WHERE id = ? AND repo_name = ?",
        )
        .bind(RecordStatus::Deleted.as_str())
        .bind(time::to_millis(time::now()))
        .bind(id)
        .bind(&self.name)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(Error::NotFound(format!("record {} in {}", id, self.name)));
        }
        touch_last_modified(&mut *tx, &self.name).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Point lookup by id; `None` when absent or still staged
    pub async fn get_record(&self, id: i64) -> Result<Option<Record>> {
        Ok(self
            .load_by_id(id)
            .await?
            .and_then(|(record, visible)| visible.then_some(record)))
    }

    /// Point lookup by OAI identifier; `None` when absent or still staged
    pub async fn get_record_by_oai_id(&self, oai_id: &str) -> Result<Option<Record>> {
        Ok(self
            .load_by_oai_id(oai_id)
            .await?
            .and_then(|(record, visible)| visible.then_some(record)))
    }

    pub(crate) async fn load_by_id(&self, id: i64) -> Result<Option<(Record, bool)>> {
        let sql = format!(
            "SELECT {}, r.visible FROM records r WHERE r.id = ? AND r.repo_name = ?",
            RECORD_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(id)
            .bind(&self.name)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|row| Ok((record_from_row(&row)?, row.get::<i64, _>("visible") != 0)))
            .transpose()
    }

    pub(crate) async fn load_by_oai_id(&self, oai_id: &str) -> Result<Option<(Record, bool)>> {
        let sql = format!(
            "SELECT {}, r.visible FROM records r WHERE r.oai_id = ? AND r.repo_name = ?",
            RECORD_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(oai_id)
            .bind(&self.name)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|row| Ok((record_from_row(&row)?, row.get::<i64, _>("visible") != 0)))
            .transpose()
    }

    /// One page of visible records matching `filter`, ordered by id ascending
    ///
    /// Callers resume by passing the largest id seen as the next `starting_id` until an
    /// empty page comes back.
    pub async fn get_records(&self, filter: &RecordFilter) -> Result<Vec<Record>> {
        let sql = format!(
            "SELECT {} FROM records r WHERE {} ORDER BY r.id ASC LIMIT ?",
            RECORD_COLUMNS, FILTER_CLAUSE
        );
        let rows = bind_filter(sqlx::query(&sql), &self.name, filter)
            .bind(self.page_size)
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(record_from_row).collect()
    }

    /// Lazily walk every page of `filter`
    pub fn record_stream(&self, filter: RecordFilter) -> impl Stream<Item = Result<Record>> + '_ {
        async_stream::try_stream! {
            let mut filter = filter;
            loop {
                let page = self.get_records(&filter).await?;
                let Some(last_id) = page.last().and_then(|r| r.id) else {
                    break;
                };
                filter.starting_id = last_id;
                for record in page {
                    yield record;
                }
            }
        }
    }

    /// Count of visible records matching `filter` (ignores paging)
    pub async fn get_record_count(&self, filter: &RecordFilter) -> Result<i64> {
        let sql = format!("SELECT COUNT(*) FROM records r WHERE {}", FILTER_CLAUSE);
        let count: i64 = bind_filter(sqlx::query(&sql), &self.name, filter)
            .fetch_one(&self.pool)
            .await?
            .get(0);
        Ok(count)
    }

    /// Header-only page for the same filter as `get_records`
    pub async fn get_record_header(&self, filter: &RecordFilter) -> Result<Vec<RecordHeader>> {
        let sql = format!(
            r#"
            SELECT r.id, r.oai_id, r.format, r.status, r.updated_at,
                   (SELECT group_concat(set_spec, char(31)) FROM record_sets WHERE record_id = r.id) AS sets
            FROM records r
            WHERE {}
            ORDER BY r.id ASC
            LIMIT ?
            "#,
            FILTER_CLAUSE
        );
        let rows = bind_filter(sqlx::query(&sql), &self.name, filter)
            .bind(self.page_size)
            .fetch_all(&self.pool)
            .await?;

        rows.iter()
            .map(|row| {
                let status: String = row.get("status");
                let sets: Option<String> = row.get("sets");
                Ok(RecordHeader {
                    id: row.get("id"),
                    oai_id: row.get("oai_id"),
                    format: row.get("format"),
                    status: status.parse()?,
                    sets: rows::split_sets(sets.as_deref()),
                    updated_at: time::from_millis(row.get("updated_at")),
                })
            })
            .collect()
    }

    /// Make a staged record visible to readers
    pub async fn activate_record(&self, id: i64) -> Result<()> {
        sqlx::query("UPDATE records SET visible = 1, batch_id = NULL WHERE id = ? AND repo_name = ?")
            .bind(id)
            .bind(&self.name)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Open a write batch
    ///
    /// Staged rows of other open batches are left alone. Rows whose batch is no longer
    /// registered as open are purged first.
    pub async fn begin_batch(&self) -> Result<Batch> {
        let batch_id = Uuid::new_v4().to_string();
        let purged = retry_on_lock("begin_batch", self.max_lock_wait_ms, || async {
            let mut tx = self.pool.begin().await?;
            let result = sqlx::query(
                r#"
                DELETE FROM records
                WHERE repo_name = ? AND visible = 0
                  AND (batch_id IS NULL OR batch_id NOT IN (SELECT batch_id FROM open_batches))
                "#,
            )
            .bind(&self.name)
            .execute(&mut *tx)
            .await?;

            sqlx::query("INSERT INTO open_batches (batch_id, repo_name, opened_at) VALUES (?, ?, ?)")
                .bind(&batch_id)
                .bind(&self.name)
                .bind(time::to_millis(time::now()))
                .execute(&mut *tx)
                .await?;
            tx.commit().await?;
            Ok(result.rows_affected())
        })
        .await?;

        if purged > 0 {
            tracing::warn!(repo = %self.name, purged, "Purged records from an unfinished batch");
        }

        Ok(Batch::new(self.clone(), batch_id))
    }

    /// The owning service finished a pass: commit deferred index work
    pub async fn process_complete(&self) -> Result<()> {
        self.index.commit_index().await?;
        let mut conn = self.pool.acquire().await?;
        touch_last_modified(&mut *conn, &self.name).await?;
        Ok(())
    }

    /// Time of the last mutation, if any
    pub async fn last_modified(&self) -> Result<Option<DateTime<Utc>>> {
        let millis: Option<i64> =
            sqlx::query_scalar("SELECT last_modified FROM repositories WHERE name = ?")
                .bind(&self.name)
                .fetch_optional(&self.pool)
                .await?;
        Ok(millis.map(time::from_millis))
    }
}

async fn insert_record(
    conn: &mut SqliteConnection,
    repo_name: &str,
    record: &Record,
    batch_id: Option<&str>,
) -> Result<i64> {
    let payload = serde_json::to_string(&record.payload)?;
    let result = sqlx::query(
        r#"
        INSERT INTO records (repo_name, oai_id, format, record_type, status, payload, visible, batch_id, updated_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(repo_name)
    .bind(&record.oai_id)
    .bind(&record.format)
    .bind(&record.record_type)
    .bind(record.status.as_str())
    .bind(&payload)
    .bind(batch_id.is_none() as i64)
    .bind(batch_id)
    .bind(time::to_millis(record.updated_at))
    .execute(&mut *conn)
    .await?;

    let id = result.last_insert_rowid();
    write_relations(conn, id, record).await?;
    Ok(id)
}

/// Sets, service marks and lineage edges of `record`, stored under `id`
async fn write_relations(conn: &mut SqliteConnection, id: i64, record: &Record) -> Result<()> {
    for set_spec in &record.sets {
        sqlx::query("INSERT OR IGNORE INTO record_sets (record_id, set_spec) VALUES (?, ?)")
            .bind(id)
            .bind(set_spec)
            .execute(&mut *conn)
            .await?;
    }
    for service_id in &record.processed_by {
        sqlx::query("INSERT OR IGNORE INTO record_processed_by (record_id, service_id) VALUES (?, ?)")
            .bind(id)
            .bind(service_id)
            .execute(&mut *conn)
            .await?;
    }
    for service_id in &record.input_for {
        sqlx::query("INSERT OR IGNORE INTO record_input_for (record_id, service_id) VALUES (?, ?)")
            .bind(id)
            .bind(service_id)
            .execute(&mut *conn)
            .await?;
    }
    for predecessor in &record.predecessors {
        sqlx::query(
            "INSERT OR IGNORE INTO record_lineage (predecessor_id, successor_id) VALUES (?, ?)",
        )
        .bind(predecessor)
        .bind(id)
        .execute(&mut *conn)
        .await?;
    }
    for successor in &record.successors {
        sqlx::query(
            "INSERT OR IGNORE INTO record_lineage (predecessor_id, successor_id) VALUES (?, ?)",
        )
        .bind(id)
        .bind(successor)
        .execute(&mut *conn)
        .await?;
    }
    Ok(())
}

async fn touch_last_modified(conn: &mut SqliteConnection, repo_name: &str) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO repositories (name, last_modified) VALUES (?, ?)
        ON CONFLICT(name) DO UPDATE SET last_modified = excluded.last_modified
        "#,
    )
    .bind(repo_name)
    .bind(time::to_millis(time::now()))
    .execute(&mut *conn)
    .await?;
    Ok(())
}
