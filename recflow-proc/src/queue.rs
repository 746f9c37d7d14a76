//! Job queue
//!
//! Jobs run in ascending `order`, assigned as the current maximum plus one inside the
//! insert statement itself, so concurrent enqueues cannot share an order.

use recflow_common::db::retry_on_lock;
use recflow_common::events::{EventBus, ServiceEvent};
use recflow_common::{time, Result};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tracing::debug;

use crate::models::{Job, JobKind};

fn job_from_row(row: &SqliteRow) -> Result<Job> {
    let kind: String = row.get("job_kind");
    Ok(Job {
        id: row.get("id"),
        service_id: row.get("service_id"),
        output_set: row.get("output_set"),
        kind: kind.parse()?,
        order: row.get("job_order"),
    })
}

#[derive(Clone)]
pub struct JobQueue {
    pool: SqlitePool,
    events: EventBus,
    max_lock_wait_ms: u64,
}

impl JobQueue {
    pub fn new(pool: SqlitePool, events: EventBus) -> Self {
        Self {
            pool,
            events,
            max_lock_wait_ms: 5_000,
        }
    }

    pub fn with_max_lock_wait_ms(mut self, max_lock_wait_ms: u64) -> Self {
        self.max_lock_wait_ms = max_lock_wait_ms;
        self
    }

    /// Append a job for `(service_id, output_set)`
    ///
    /// Returns `None` when an identical job is already pending; that job will process
    /// the same input.
    pub async fn enqueue(
        &self,
        service_id: i64,
        output_set: Option<&str>,
        kind: JobKind,
    ) -> Result<Option<Job>> {
        let row = retry_on_lock("enqueue_job", self.max_lock_wait_ms, || async {
            let row = sqlx::query(
                r#"
                INSERT INTO jobs (service_id, output_set, job_kind, job_order, created_at)
                SELECT ?, ?, ?, (SELECT COALESCE(MAX(job_order), 0) + 1 FROM jobs), ?
                WHERE NOT EXISTS (
                    SELECT 1 FROM jobs WHERE service_id = ? AND output_set IS ?
                )
                RETURNING id, service_id, output_set, job_kind, job_order
                "#,
            )
            .bind(service_id)
            .bind(output_set)
            .bind(kind.as_str())
            .bind(time::to_millis(time::now()))
            .bind(service_id)
            .bind(output_set)
            .fetch_optional(&self.pool)
            .await?;
            Ok(row)
        })
        .await?;

        let Some(row) = row else {
            debug!(service_id, ?output_set, "Job already pending");
            return Ok(None);
        };

        let job = job_from_row(&row)?;
        debug!(job_id = job.id, service_id, order = job.order, kind = %kind, "Enqueued job");
        self.events.emit_lossy(ServiceEvent::JobEnqueued {
            job_id: job.id,
            service_id,
            output_set: job.output_set.clone(),
            order: job.order,
        });
        Ok(Some(job))
    }

    /// Lowest-order job, without removing it
    pub async fn peek(&self) -> Result<Option<Job>> {
        let row = sqlx::query(
            r#"
            SELECT id, service_id, output_set, job_kind, job_order
            FROM jobs ORDER BY job_order ASC LIMIT 1
            "#,
        )
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(job_from_row).transpose()
    }

    /// Remove and return the lowest-order job
    pub async fn next(&self) -> Result<Option<Job>> {
        let row = retry_on_lock("dequeue_job", self.max_lock_wait_ms, || async {
            Ok(sqlx::query(
                r#"
                DELETE FROM jobs
                WHERE id = (SELECT id FROM jobs ORDER BY job_order ASC LIMIT 1)
                RETURNING id, service_id, output_set, job_kind, job_order
                "#,
            )
            .fetch_optional(&self.pool)
            .await?)
        })
        .await?;
        row.as_ref().map(job_from_row).transpose()
    }

    pub async fn pending_for(&self, service_id: i64) -> Result<Vec<Job>> {
        let rows = sqlx::query(
            r#"
            SELECT id, service_id, output_set, job_kind, job_order
            FROM jobs WHERE service_id = ? ORDER BY job_order ASC
            "#,
        )
        .bind(service_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(job_from_row).collect()
    }

    /// All pending jobs in execution order
    pub async fn list(&self) -> Result<Vec<Job>> {
        let rows = sqlx::query(
            "SELECT id, service_id, output_set, job_kind, job_order FROM jobs ORDER BY job_order ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(job_from_row).collect()
    }

    /// Remove a job; false if another consumer took it first
    pub async fn remove(&self, job_id: i64) -> Result<bool> {
        let result = retry_on_lock("remove_job", self.max_lock_wait_ms, || async {
            Ok(sqlx::query("DELETE FROM jobs WHERE id = ?")
                .bind(job_id)
                .execute(&self.pool)
                .await?)
        })
        .await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn remove_for_service(&self, service_id: i64) -> Result<u64> {
        let result = sqlx::query("DELETE FROM jobs WHERE service_id = ?")
            .bind(service_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    pub async fn len(&self) -> Result<i64> {
        let count = sqlx::query_scalar("SELECT COUNT(*) FROM jobs")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    pub async fn is_empty(&self) -> Result<bool> {
        Ok(self.len().await? == 0)
    }
}
