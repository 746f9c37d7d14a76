//! Two-phase write batch

use sqlx::SqlitePool;
use std::collections::BTreeSet;
use tracing::{debug, warn};

use super::Repository;
use crate::db::retry_on_lock;
use crate::models::Record;
use crate::Result;

/// Outcome of a committed batch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchSummary {
    pub activated: usize,
    pub processed_marks: usize,
}

/// Write scope opened by [`Repository::begin_batch`]
///
/// Inserts are staged invisible under the batch id; processed marks on input records are
/// deferred. Both are applied in one transaction by [`Batch::end`]. Other batches on the
/// same repository never touch these rows. A batch dropped without `end` or `abort` leaves
/// its rows invisible until [`purge_abandoned_batches`] runs at startup.
pub struct Batch {
    repo: Repository,
    id: String,
    staged: BTreeSet<i64>,
    processed: Vec<(i64, i64)>,
    finished: bool,
}

impl Batch {
    pub(super) fn new(repo: Repository, id: String) -> Self {
        Self {
            repo,
            id,
            staged: BTreeSet::new(),
            processed: Vec::new(),
            finished: false,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn repository(&self) -> &Repository {
        &self.repo
    }

    /// Insert a staged record and assign its id
    pub async fn add_record(&mut self, record: &mut Record) -> Result<i64> {
        let id = self.repo.insert(record, Some(&self.id)).await?;
        record.id = Some(id);
        self.staged.insert(id);
        Ok(id)
    }

    /// Updates apply immediately; a staged record stays staged
    pub async fn update_record(&self, record: &mut Record) -> Result<()> {
        self.repo.update_record(record).await
    }

    /// Defer "processed by `service_id`" for an input record until the batch ends
    pub fn mark_processed(&mut self, record_id: i64, service_id: i64) {
        self.processed.push((record_id, service_id));
    }

    pub fn is_staged(&self, id: i64) -> bool {
        self.staged.contains(&id)
    }

    pub fn staged_count(&self) -> usize {
        self.staged.len()
    }

    pub fn pending_marks(&self) -> usize {
        self.processed.len()
    }

    /// Point lookup that also sees this batch's staged records
    pub async fn get_record(&self, id: i64) -> Result<Option<Record>> {
        Ok(self
            .repo
            .load_by_id(id)
            .await?
            .and_then(|(record, visible)| (visible || self.is_staged(id)).then_some(record)))
    }

    /// OAI lookup that also sees this batch's staged records
    pub async fn get_record_by_oai_id(&self, oai_id: &str) -> Result<Option<Record>> {
        Ok(self.repo.load_by_oai_id(oai_id).await?.and_then(|(record, visible)| {
            let staged = record.id.is_some_and(|id| self.is_staged(id));
            (visible || staged).then_some(record)
        }))
    }

    /// Activate staged records and apply processed marks atomically
    pub async fn end(mut self) -> Result<BatchSummary> {
        let summary = retry_on_lock("end_batch", self.repo.max_lock_wait_ms(), || self.commit())
            .await?;
        self.finished = true;
        if summary.activated < self.staged.len() {
            warn!(
                repo = %self.repo.name(),
                batch_id = %self.id,
                staged = self.staged.len(),
                activated = summary.activated,
                "Staged records went missing before batch end"
            );
        }
        debug!(
            repo = %self.repo.name(),
            activated = summary.activated,
            processed_marks = summary.processed_marks,
            "Batch committed"
        );
        Ok(summary)
    }

    /// Delete the staged records and discard the deferred marks
    pub async fn abort(mut self) -> Result<u64> {
        let removed = retry_on_lock("abort_batch", self.repo.max_lock_wait_ms(), || async {
            let mut tx = self.repo.pool().begin().await?;
            let result = sqlx::query("DELETE FROM records WHERE batch_id = ? AND visible = 0")
                .bind(&self.id)
                .execute(&mut *tx)
                .await?;
            sqlx::query("DELETE FROM open_batches WHERE batch_id = ?")
                .bind(&self.id)
                .execute(&mut *tx)
                .await?;
            tx.commit().await?;
            Ok(result.rows_affected())
        })
        .await?;
        self.finished = true;
        debug!(repo = %self.repo.name(), batch_id = %self.id, removed, "Batch aborted");
        Ok(removed)
    }

    async fn commit(&self) -> Result<BatchSummary> {
        let mut tx = self.repo.pool().begin().await?;

        let activated = sqlx::query("UPDATE records SET visible = 1, batch_id = NULL WHERE batch_id = ?")
            .bind(&self.id)
            .execute(&mut *tx)
            .await?
            .rows_affected();

        for (record_id, service_id) in &self.processed {
            sqlx::query(
                "INSERT OR IGNORE INTO record_processed_by (record_id, service_id) VALUES (?, ?)",
            )
            .bind(record_id)
            .bind(service_id)
            .execute(&mut *tx)
            .await?;

            sqlx::query("DELETE FROM record_input_for WHERE record_id = ? AND service_id = ?")
                .bind(record_id)
                .bind(service_id)
                .execute(&mut *tx)
                .await?;
        }

        sqlx::query("DELETE FROM open_batches WHERE batch_id = ?")
            .bind(&self.id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        Ok(BatchSummary {
            activated: activated as usize,
            processed_marks: self.processed.len(),
        })
    }
}

impl Drop for Batch {
    fn drop(&mut self) {
        if !self.finished && (!self.staged.is_empty() || !self.processed.is_empty()) {
            warn!(
                repo = %self.repo.name(),
                batch_id = %self.id,
                staged = self.staged.len(),
                processed_marks = self.processed.len(),
                "Batch dropped without end; staged records stay invisible"
            );
        }
    }
}

/// Forget every open batch and delete the rows they staged
///
/// Only safe while no batch is live, i.e. at startup before any run is dispatched.
pub async fn purge_abandoned_batches(pool: &SqlitePool) -> Result<u64> {
    let mut tx = pool.begin().await?;
    let purged = sqlx::query("DELETE FROM records WHERE visible = 0")
        .execute(&mut *tx)
        .await?
        .rows_affected();
    sqlx::query("DELETE FROM open_batches").execute(&mut *tx).await?;
    tx.commit().await?;

    if purged > 0 {
        warn!(purged, "Purged records staged by batches that never ended");
    }
    Ok(purged)
}
