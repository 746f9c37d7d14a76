use recflow_common::config::HarvestSettings;
use recflow_common::events::{EventBus, ServiceEvent};
use recflow_common::index::SearchIndex;
use recflow_common::{time, Batch, Error, Record, RecordStatus, Repository, Result};
use serde::Serialize;
use sqlx::SqlitePool;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::{HarvestClient, HarvestRequest, HarvestedRecord};
use crate::db::{directives, providers, schedules};
use crate::engine::DirectiveEvaluator;
use crate::models::{DirectiveSource, HarvestScheduleStep, Provider};
use crate::queue::JobQueue;
use crate::AppState;

/// Outcome of one harvest step
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HarvestSummary {
    pub step_id: i64,
    pub request: String,
    pub added: u64,
    pub updated: u64,
    pub deleted: u64,
    /// Deletions of records this repository never held
    pub ignored: u64,
}

impl HarvestSummary {
    pub fn total(&self) -> u64 {
        self.added + self.updated + self.deleted + self.ignored
    }
}

pub struct HarvestRunner {
    pool: SqlitePool,
    index: Arc<dyn SearchIndex>,
    events: EventBus,
    queue: JobQueue,
    client: Arc<dyn HarvestClient>,
    settings: HarvestSettings,
    max_lock_wait_ms: u64,
}

impl HarvestRunner {
    pub fn new(state: &AppState, client: Arc<dyn HarvestClient>) -> Self {
        Self {
            pool: state.db.clone(),
            index: state.index.clone(),
            events: state.event_bus.clone(),
            queue: state.queue(),
            client,
            settings: state.config.harvest.clone(),
            max_lock_wait_ms: state.config.engine.max_lock_wait_ms,
        }
    }

    /// Run every step of a schedule in order; the first failing step stops the run
    pub async fn run_schedule(&self, schedule_id: i64) -> Result<Vec<HarvestSummary>> {
        let schedule = schedules::load_schedule(&self.pool, schedule_id).await?;
        let provider = providers::load_provider(&self.pool, schedule.provider_id).await?;

        let mut summaries = Vec::with_capacity(schedule.steps.len());
        for step in &schedule.steps {
            summaries.push(self.run_step(&provider, step).await?);
        }
        Ok(summaries)
    }

    /// Harvest records changed since the step last ran
    pub async fn run_step(&self, provider: &Provider, step: &HarvestScheduleStep) -> Result<HarvestSummary> {
        let started = time::now();
        let request = HarvestRequest {
            base_url: provider.base_url.clone(),
            metadata_prefix: step.format.clone(),
            set_spec: step.set_spec.clone(),
            from: step.last_ran,
            until: started,
            harvest_all: step.last_ran.is_none(),
            timeout_ms: self.settings.timeout_ms,
            step_id: step.id,
        };
        info!(provider = %provider.name, step_id = step.id, request = %request.request_string(), "Starting harvest");

        let response = tokio::time::timeout(
            time::millis_to_duration(self.settings.timeout_ms),
            self.client.harvest(&request),
        )
        .await
        .map_err(|_| Error::Timeout(self.settings.timeout_ms))??;

        let repo = Repository::new(self.pool.clone(), provider.repo_name.clone(), self.index.clone())
            .with_max_lock_wait_ms(self.max_lock_wait_ms);
        let provider_directives =
            directives::load_directives_for(&self.pool, DirectiveSource::Provider(provider.id)).await?;
        let mut directive_eval = DirectiveEvaluator::new(provider_directives, self.queue.clone());

        let mut summary = HarvestSummary {
            step_id: step.id,
            request: response.request.clone(),
            added: 0,
            updated: 0,
            deleted: 0,
            ignored: 0,
        };

        let mut batch = repo.begin_batch().await?;
        let staged = stage_harvest(
            &mut batch,
            &mut directive_eval,
            &mut summary,
            &step.format,
            response.records,
        )
        .await;
        if let Err(err) = staged {
            if let Err(abort_err) = batch.abort().await {
                warn!(provider = %provider.name, error = %abort_err, "Failed to abort harvest batch");
            }
            return Err(err);
        }
        batch.end().await?;
        repo.process_complete().await?;
        let jobs = directive_eval.enqueue_scheduled().await?;

        schedules::set_last_ran(&self.pool, step.id, started).await?;
        self.events.emit_lossy(ServiceEvent::HarvestCompleted {
            provider_id: provider.id,
            step_id: step.id,
            records: summary.total(),
            timestamp: time::now(),
        });
        info!(
            provider = %provider.name,
            step_id = step.id,
            added = summary.added,
            updated = summary.updated,
            deleted = summary.deleted,
            jobs,
            "Harvest step complete"
        );
        Ok(summary)
    }
}

/// Apply one harvest response to the open batch
async fn stage_harvest(
    batch: &mut Batch,
    directive_eval: &mut DirectiveEvaluator,
    summary: &mut HarvestSummary,
    format: &str,
    records: Vec<HarvestedRecord>,
) -> Result<()> {
    for harvested in records {
        let existing = batch.get_record_by_oai_id(&harvested.oai_id).await?;
        match existing {
            Some(mut record) => {
                apply_harvested(&mut record, format, harvested);
                if record.is_deleted() {
                    directive_eval.reprocess(&mut record);
                    summary.deleted += 1;
                } else {
                    directive_eval.evaluate(&mut record);
                    summary.updated += 1;
                }
                batch.update_record(&mut record).await?;
            }
            None if harvested.deleted => {
                debug!(oai_id = %harvested.oai_id, "Ignoring deletion of unknown record");
                summary.ignored += 1;
            }
            None => {
                let mut record = Record::new(harvested.oai_id.clone(), format);
                apply_harvested(&mut record, format, harvested);
                directive_eval.evaluate(&mut record);
                batch.add_record(&mut record).await?;
                summary.added += 1;
            }
        }
    }
    Ok(())
}

fn apply_harvested(record: &mut Record, format: &str, harvested: HarvestedRecord) {
    record.format = format.to_string();
    record.sets = harvested.sets;
    if harvested.deleted {
        record.status = RecordStatus::Deleted;
    } else {
        record.status = RecordStatus::Active;
        record.payload = harvested.payload;
    }
}
