//! Processing directive evaluation
//!
//! Routes freshly produced records to downstream services. Jobs are not enqueued while
//! records are evaluated: the caller flushes them with [`DirectiveEvaluator::enqueue_scheduled`]
//! once the batch holding those records is committed, so a downstream pass never starts
//! before its input is visible. Each `(service, output set)` is enqueued at most once per
//! commit window.

use recflow_common::{Record, Result};
use std::collections::BTreeSet;
use tracing::debug;

use crate::models::{JobKind, ProcessingDirective};
use crate::queue::JobQueue;

pub struct DirectiveEvaluator {
    directives: Vec<ProcessingDirective>,
    queue: JobQueue,
    services_to_run: BTreeSet<(i64, Option<String>)>,
}

impl DirectiveEvaluator {
    pub fn new(directives: Vec<ProcessingDirective>, queue: JobQueue) -> Self {
        Self {
            directives,
            queue,
            services_to_run: BTreeSet::new(),
        }
    }

    pub fn directives(&self) -> &[ProcessingDirective] {
        &self.directives
    }

    /// `(service, output set)` pairs awaiting a job
    pub fn scheduled(&self) -> &BTreeSet<(i64, Option<String>)> {
        &self.services_to_run
    }

    /// Mark `record` as input for every matching directive's target
    ///
    /// Mutates the in-memory record; the caller persists it. Returns the number of
    /// directives matched.
    pub fn evaluate(&mut self, record: &mut Record) -> usize {
        let targets: Vec<(i64, Option<String>)> = self
            .directives
            .iter()
            .filter(|d| d.matches(record))
            .map(|d| (d.target_service_id, d.output_set.clone()))
            .collect();

        for (service_id, output_set) in &targets {
            record.input_for.insert(*service_id);
            record.processed_by.remove(service_id);
            self.services_to_run.insert((*service_id, output_set.clone()));
        }

        if !targets.is_empty() {
            debug!(oai_id = %record.oai_id, matched = targets.len(), "Processing directives matched");
        }
        targets.len()
    }

    /// Mark `record` as input again for every service that already consumed it
    pub fn reprocess(&mut self, record: &mut Record) {
        let consumers: Vec<i64> = std::mem::take(&mut record.processed_by).into_iter().collect();
        for service_id in consumers {
            record.input_for.insert(service_id);
            self.services_to_run.insert((service_id, None));
        }
    }

    /// Enqueue one job per scheduled `(service, output set)`
    ///
    /// Call after the records that caused the scheduling are committed. Returns the
    /// number of jobs created; pairs that already have a pending job create none.
    pub async fn enqueue_scheduled(&mut self) -> Result<usize> {
        let mut created = 0;
        for (service_id, output_set) in std::mem::take(&mut self.services_to_run) {
            if self
                .queue
                .enqueue(service_id, output_set.as_deref(), JobKind::ProcessingDirective)
                .await?
                .is_some()
            {
                created += 1;
            }
        }
        Ok(created)
    }
}
