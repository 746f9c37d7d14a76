//! Processing pipeline engine
//!
//! Drives one service over its pending input:
//! 1. Typed batches in record-type priority order, each followed by a checkpoint
//! 2. All remaining input as one batch
//! 3. Final batch commit and index commit
//!
//! Progress is record-state driven: an input record stops being pending when the batch
//! that processed it ends. A restarted pass simply re-queries pending input.

pub mod control;
pub mod directives;
pub mod ids;
pub mod report;
pub mod stats;

pub use control::RunControl;
pub use directives::DirectiveEvaluator;
pub use report::{LogReportSink, PassReport, ReportSink};
pub use stats::PassStats;

use recflow_common::config::{EngineSettings, ErrorPolicy};
use recflow_common::events::{EventBus, ServiceEvent};
use recflow_common::index::SearchIndex;
use recflow_common::repo::input::{self, TypeSelector};
use recflow_common::{time, Batch, Error, Record, RecordFilter, Repository, Result, ServiceStatus};
use sqlx::SqlitePool;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::db::services::{self, ServiceTotals};
use crate::db::{directives as directive_db, record_types};
use crate::models::{DirectiveSource, ServiceInfo};
use crate::queue::JobQueue;
use crate::services::{MetadataService, ProcessContext, ServiceContext};
use ids::{ElementCounters, OaiIdGenerator};

/// Result of one pass
#[derive(Debug, Clone, PartialEq)]
pub struct RunOutcome {
    pub run_id: Uuid,
    pub service_id: i64,
    /// Persisted status after the pass: NOT_RUNNING, CANCELED or ERROR
    pub status: ServiceStatus,
    pub stats: PassStats,
    pub failure: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Completed,
    Canceled,
}

/// State of one pass
struct Pass {
    info: ServiceInfo,
    run_id: Uuid,
    ctx: ServiceContext,
    batch: Option<Batch>,
    stats: PassStats,
    base: ServiceTotals,
    directives: DirectiveEvaluator,
    oai_ids: OaiIdGenerator,
    counters: ElementCounters,
    output_set: Option<String>,
    since_checkpoint: u64,
    skipped: HashSet<i64>,
}

#[derive(Clone)]
pub struct PipelineEngine {
    pool: SqlitePool,
    index: Arc<dyn SearchIndex>,
    events: EventBus,
    queue: JobQueue,
    reports: Arc<dyn ReportSink>,
    settings: EngineSettings,
}

impl PipelineEngine {
    pub fn new(
        pool: SqlitePool,
        index: Arc<dyn SearchIndex>,
        events: EventBus,
        queue: JobQueue,
        settings: EngineSettings,
    ) -> Self {
        Self {
            pool,
            index,
            events,
            queue,
            reports: Arc::new(LogReportSink),
            settings,
        }
    }

    pub fn with_report_sink(mut self, reports: Arc<dyn ReportSink>) -> Self {
        self.reports = reports;
        self
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    /// Output repository of a service, configured with the engine's settings
    pub fn repository_for(&self, info: &ServiceInfo) -> Repository {
        Repository::new(self.pool.clone(), info.repo_name.clone(), self.index.clone())
            .with_page_size(self.settings.page_size)
            .with_max_lock_wait_ms(self.settings.max_lock_wait_ms)
    }

    pub fn service_context(&self, info: &ServiceInfo) -> ServiceContext {
        ServiceContext {
            info: info.clone(),
            pool: self.pool.clone(),
            repository: self.repository_for(info),
        }
    }

    /// Run one pass of `service` over its pending input
    ///
    /// Fails with `Error::AlreadyRunning` when another run holds the service. Every
    /// other failure ends the pass with status ERROR and is reported in the outcome.
    pub async fn run(
        &self,
        service: &mut dyn MetadataService,
        service_id: i64,
        output_set: Option<String>,
        control: &RunControl,
    ) -> Result<RunOutcome> {
        let previous = services::load_status(&self.pool, service_id).await?;
        if !services::try_start(&self.pool, service_id).await? {
            return Err(Error::AlreadyRunning(format!("service {}", service_id)));
        }
        self.emit_status(service_id, previous, ServiceStatus::Running);

        let run_id = Uuid::new_v4();
        let mut pass = match self.prepare(service_id, run_id, output_set).await {
            Ok(pass) => pass,
            Err(err) => {
                error!(service_id, error = %err, "Failed to prepare pass");
                services::set_status(&self.pool, service_id, ServiceStatus::Error).await?;
                self.emit_status(service_id, ServiceStatus::Running, ServiceStatus::Error);
                return Err(err);
            }
        };

        info!(service = %pass.info.name, %run_id, "Starting processing pass");
        let result = self.drive(&mut pass, service, control).await;
        self.finish(pass, service, result).await
    }

    async fn prepare(&self, service_id: i64, run_id: Uuid, output_set: Option<String>) -> Result<Pass> {
        let info = services::load_service(&self.pool, service_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("service {}", service_id)))?;

        let directives =
            directive_db::load_directives_for(&self.pool, DirectiveSource::Service(info.id)).await?;
        let oai_ids = OaiIdGenerator::load(
            &self.pool,
            &self.settings.domain_name,
            &self.settings.instance_name,
            &info.name,
        )
        .await?;
        let counters = ElementCounters::load(&self.pool, &info.name).await?;
        let base = ServiceTotals {
            warnings: info.warnings,
            errors: info.errors,
            errors_per_commit: 0,
            input_record_count: info.input_record_count,
            output_record_count: info.output_record_count,
        };

        Ok(Pass {
            ctx: self.service_context(&info),
            info,
            run_id,
            batch: None,
            stats: PassStats::default(),
            base,
            directives: DirectiveEvaluator::new(directives, self.queue.clone()),
            oai_ids,
            counters,
            output_set,
            since_checkpoint: 0,
            skipped: HashSet::new(),
        })
    }

    async fn drive(
        &self,
        pass: &mut Pass,
        service: &mut dyn MetadataService,
        control: &RunControl,
    ) -> Result<Flow> {
        service.begin_pass(&pass.ctx).await?;

        pass.stats.total_input =
            input::count_pending_input(&self.pool, pass.info.id, TypeSelector::Any).await? as u64;
        let record_types = record_types::load_priority_list(&self.pool, pass.info.id).await?;
        pass.batch = Some(pass.ctx.repository.begin_batch().await?);

        for record_type in &record_types {
            debug!(service = %pass.info.name, record_type, "Processing typed batch");
            let flow = self
                .process_pending(pass, service, control, TypeSelector::Only(record_type))
                .await?;
            if flow == Flow::Canceled {
                return Ok(Flow::Canceled);
            }
            self.checkpoint(pass, service).await?;
        }

        self.process_pending(pass, service, control, TypeSelector::Any).await
    }

    async fn process_pending(
        &self,
        pass: &mut Pass,
        service: &mut dyn MetadataService,
        control: &RunControl,
        selector: TypeSelector<'_>,
    ) -> Result<Flow> {
        let mut cursor = 0;
        loop {
            let page = input::pending_input(
                &self.pool,
                pass.info.id,
                selector,
                cursor,
                self.settings.page_size,
            )
            .await?;
            let Some(last_id) = page.last().and_then(|r| r.id) else {
                return Ok(Flow::Completed);
            };

            for record in &page {
                if self.observe(pass, control).await? == Flow::Canceled {
                    return Ok(Flow::Canceled);
                }
                if record.id.is_some_and(|id| pass.skipped.contains(&id)) {
                    continue;
                }

                self.process_record(pass, service, record).await?;

                if pass.since_checkpoint >= self.settings.checkpoint_interval {
                    self.checkpoint(pass, service).await?;
                }
            }
            cursor = last_id;
        }
    }

    /// Honor pause and cancel requests between records
    async fn observe(&self, pass: &Pass, control: &RunControl) -> Result<Flow> {
        if control.is_canceled() {
            return Ok(Flow::Canceled);
        }
        if !control.is_paused() {
            return Ok(Flow::Continue);
        }

        self.transition(pass.info.id, ServiceStatus::Running, ServiceStatus::Paused)
            .await?;
        info!(service = %pass.info.name, processed = pass.stats.processed, "Pass paused");

        let poll = time::millis_to_duration(self.settings.pause_poll_ms);
        let cancel = control.cancellation_token();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(Flow::Canceled),
                _ = control.resumed() => break,
                _ = tokio::time::sleep(poll) => {
                    if control.is_canceled() {
                        return Ok(Flow::Canceled);
                    }
                    if !control.is_paused() {
                        break;
                    }
                    debug!(service = %pass.info.name, "Still paused");
                }
            }
        }

        self.transition(pass.info.id, ServiceStatus::Paused, ServiceStatus::Running)
            .await?;
        info!(service = %pass.info.name, processed = pass.stats.processed, "Pass resumed");
        Ok(Flow::Continue)
    }

    async fn process_record(
        &self,
        pass: &mut Pass,
        service: &mut dyn MetadataService,
        record: &Record,
    ) -> Result<()> {
        let input_id = record.require_id()?;
        let batch = pass
            .batch
            .as_mut()
            .ok_or_else(|| Error::Internal("No open output batch".to_string()))?;

        let result = {
            let mut ctx = ProcessContext {
                service: &pass.info,
                output: &*batch,
                oai_ids: &mut pass.oai_ids,
                counters: &mut pass.counters,
                stats: &mut pass.stats,
            };
            service.process(&mut ctx, record).await
        };
        pass.stats.processed += 1;
        pass.since_checkpoint += 1;

        let outputs = match result {
            Ok(outputs) => outputs,
            Err(err) => return self.handle_failure(pass, record, err),
        };

        for mut output in outputs {
            output.predecessors.insert(input_id);
            if let Some(set_spec) = &pass.output_set {
                output.sets.insert(set_spec.clone());
            }
            pass.directives.evaluate(&mut output);
            if output.is_deleted() {
                pass.directives.reprocess(&mut output);
            }

            if output.id.is_some() {
                batch.update_record(&mut output).await?;
                pass.stats.outputs_updated += 1;
            } else {
                batch.add_record(&mut output).await?;
                pass.stats.outputs_added += 1;
            }
        }

        batch.mark_processed(input_id, pass.info.id);
        Ok(())
    }

    fn handle_failure(&self, pass: &mut Pass, record: &Record, err: Error) -> Result<()> {
        pass.stats.record_error(&record.oai_id);
        let err = match err {
            Error::Storage(_) => return Err(err),
            err @ Error::RecordProcessing { .. } => err,
            other => Error::record(record.oai_id.clone(), other.to_string()),
        };
        error!(service = %pass.info.name, oai_id = %record.oai_id, error = %err, "Record processing failed");

        match self.settings.error_policy {
            ErrorPolicy::AbortPass => Err(err),
            ErrorPolicy::SkipWithBudget { max_errors } => {
                if pass.stats.errors > max_errors {
                    return Err(Error::Internal(format!(
                        "Error budget of {} exhausted; last failure: {}",
                        max_errors, err
                    )));
                }
                if let Some(id) = record.id {
                    pass.skipped.insert(id);
                }
                warn!(service = %pass.info.name, oai_id = %record.oai_id, "Record left pending");
                Ok(())
            }
        }
    }

    /// Flush service state, commit the batch and index, persist statistics and counters,
    /// then reopen the batch
    ///
    /// Service state is durable before the batch marks its inputs processed.
    async fn checkpoint(&self, pass: &mut Pass, service: &mut dyn MetadataService) -> Result<()> {
        service.checkpoint(&pass.ctx).await?;
        if let Some(batch) = pass.batch.take() {
            batch.end().await?;
        }
        pass.directives.enqueue_scheduled().await?;
        self.index.commit_index().await?;
        self.flush_stats(pass).await?;
        self.persist_counters(pass).await?;

        pass.since_checkpoint = 0;
        pass.stats.errors_since_commit = 0;
        pass.batch = Some(pass.ctx.repository.begin_batch().await?);

        info!(service = %pass.info.name, processed = pass.stats.processed, "Checkpoint committed");
        self.events.emit_lossy(ServiceEvent::Checkpoint {
            service_id: pass.info.id,
            run_id: pass.run_id,
            processed: pass.stats.processed,
            timestamp: time::now(),
        });
        Ok(())
    }

    /// Wait for queued index work, then commit the index and touch `last_modified`
    async fn refresh_index(&self, pass: &Pass) -> Result<()> {
        self.index
            .wait_for_job_completion(time::millis_to_duration(self.settings.index_wait_ms))
            .await?;
        pass.ctx.repository.process_complete().await
    }

    async fn flush_stats(&self, pass: &Pass) -> Result<()> {
        let available = pass
            .ctx
            .repository
            .get_record_count(&RecordFilter::default())
            .await?;
        let totals = pass.stats.totals(&pass.base, available);
        services::save_totals(&self.pool, pass.info.id, &totals).await
    }

    async fn persist_counters(&self, pass: &Pass) -> Result<()> {
        pass.oai_ids.persist(&self.pool).await?;
        pass.counters.persist(&self.pool).await
    }

    /// Close out the pass: everything that succeeded stays durable
    async fn finish(
        &self,
        mut pass: Pass,
        service: &mut dyn MetadataService,
        result: Result<Flow>,
    ) -> Result<RunOutcome> {
        let (mut status, mut failure) = match result {
            Ok(Flow::Canceled) => (ServiceStatus::Canceled, None),
            Ok(_) => (ServiceStatus::NotRunning, None),
            Err(err) => {
                error!(service = %pass.info.name, error = %err, "Processing pass failed");
                (ServiceStatus::Error, Some(err.to_string()))
            }
        };

        if let Err(err) = service.end_pass(&pass.ctx).await {
            error!(service = %pass.info.name, error = %err, "end_pass hook failed");
        }

        if let Some(batch) = pass.batch.take() {
            match batch.end().await {
                Ok(_) => {
                    if let Err(err) = pass.directives.enqueue_scheduled().await {
                        error!(service = %pass.info.name, error = %err, "Failed to enqueue downstream jobs");
                    }
                }
                Err(err) => {
                    error!(service = %pass.info.name, error = %err, "Failed to commit final batch");
                    status = ServiceStatus::Error;
                    failure.get_or_insert_with(|| err.to_string());
                }
            }
        }

        let commit = if status == ServiceStatus::NotRunning {
            self.refresh_index(&pass).await
        } else {
            self.index.commit_index().await
        };
        if let Err(err) = commit {
            error!(service = %pass.info.name, error = %err, "Index commit failed");
            status = ServiceStatus::Error;
            failure.get_or_insert_with(|| err.to_string());
        }

        if let Err(err) = self.flush_stats(&pass).await {
            error!(service = %pass.info.name, error = %err, "Failed to flush statistics");
        }
        if let Err(err) = self.persist_counters(&pass).await {
            error!(service = %pass.info.name, error = %err, "Failed to persist counters");
        }

        let current = services::load_status(&self.pool, pass.info.id).await?;
        self.transition(pass.info.id, current, status).await?;

        info!(
            service = %pass.info.name,
            run_id = %pass.run_id,
            %status,
            processed = pass.stats.processed,
            errors = pass.stats.errors,
            "Processing pass finished"
        );
        self.events.emit_lossy(ServiceEvent::RunFinished {
            service_id: pass.info.id,
            run_id: pass.run_id,
            status,
            processed: pass.stats.processed,
            errors: pass.stats.errors,
            timestamp: time::now(),
        });

        let report = PassReport {
            service: pass.info.name.clone(),
            run_id: pass.run_id,
            status,
            total_input: pass.stats.total_input,
            processed: pass.stats.processed,
            succeeded: pass.stats.succeeded(),
            errors: pass.stats.errors,
            warnings: pass.stats.warnings,
            failure: failure.clone(),
            unprocessed_error_ids: pass.stats.unprocessed_error_ids.clone(),
        };
        if let Err(err) = self.reports.deliver(&report).await {
            warn!(service = %pass.info.name, error = %err, "Failed to deliver pass report");
        }

        Ok(RunOutcome {
            run_id: pass.run_id,
            service_id: pass.info.id,
            status,
            stats: pass.stats,
            failure,
        })
    }

    async fn transition(&self, service_id: i64, from: ServiceStatus, to: ServiceStatus) -> Result<()> {
        services::set_status(&self.pool, service_id, to).await?;
        self.emit_status(service_id, from, to);
        Ok(())
    }

    fn emit_status(&self, service_id: i64, old_status: ServiceStatus, new_status: ServiceStatus) {
        self.events.emit_lossy(ServiceEvent::StatusChanged {
            service_id,
            old_status,
            new_status,
            timestamp: time::now(),
        });
    }
}
