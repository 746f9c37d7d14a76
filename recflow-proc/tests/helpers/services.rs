//! Scripted services for engine and scheduler tests

use async_trait::async_trait;
use recflow_common::repo::input::{self, TypeSelector};
use recflow_common::{Error, Record, RecordStatus, Result};
use recflow_proc::engine::RunControl;
use recflow_proc::services::{MetadataService, ProcessContext, ServiceContext, ServiceRegistry};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Semaphore;

/// Copies each input to one output and records what it saw
#[derive(Default)]
pub struct ScriptedService {
    pub seen: Arc<Mutex<Vec<String>>>,
    pub checkpoints: Arc<AtomicUsize>,
    /// Pending input count observed by each checkpoint hook
    pub pending_at_checkpoint: Arc<Mutex<Vec<i64>>>,
    pub passes: Arc<AtomicUsize>,
    fail_on: BTreeSet<String>,
    /// Pause (or cancel) the run once this many records were seen
    pause_after: Option<(usize, RunControl)>,
    cancel_after: Option<(usize, RunControl)>,
}

impl ScriptedService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_on(mut self, oai_ids: &[&str]) -> Self {
        self.fail_on = oai_ids.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn pausing_after(mut self, count: usize, control: RunControl) -> Self {
        self.pause_after = Some((count, control));
        self
    }

    pub fn canceling_after(mut self, count: usize, control: RunControl) -> Self {
        self.cancel_after = Some((count, control));
        self
    }

    pub fn seen(&self) -> Vec<String> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl MetadataService for ScriptedService {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn begin_pass(&mut self, _ctx: &ServiceContext) -> Result<()> {
        self.passes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn checkpoint(&mut self, ctx: &ServiceContext) -> Result<()> {
        self.checkpoints.fetch_add(1, Ordering::SeqCst);
        let pending = input::count_pending_input(&ctx.pool, ctx.info.id, TypeSelector::Any).await?;
        self.pending_at_checkpoint.lock().unwrap().push(pending);
        Ok(())
    }

    async fn process(&mut self, ctx: &mut ProcessContext<'_>, record: &Record) -> Result<Vec<Record>> {
        let seen = {
            let mut seen = self.seen.lock().unwrap();
            seen.push(record.oai_id.clone());
            seen.len()
        };
        if let Some((count, control)) = &self.pause_after {
            if seen == *count {
                control.pause();
            }
        }
        if let Some((count, control)) = &self.cancel_after {
            if seen == *count {
                control.cancel();
            }
        }
        if self.fail_on.contains(&record.oai_id) {
            return Err(Error::record(record.oai_id.clone(), "scripted failure"));
        }

        let input_id = record.require_id()?;
        let existing = ctx.existing_successors(input_id).await?;
        if record.is_deleted() {
            return Ok(existing
                .into_iter()
                .map(|mut r| {
                    r.status = RecordStatus::Deleted;
                    r
                })
                .collect());
        }
        let mut output = match existing.into_iter().next() {
            Some(previous) => previous,
            None => Record::new(ctx.oai_ids.next_id(), record.format.clone()),
        };
        output.payload = record.payload.clone();
        output.record_type = record.record_type.clone();
        Ok(vec![output])
    }
}

/// Copies each input, but holds every record until the test releases a permit
#[derive(Clone)]
pub struct GatedService {
    gate: Arc<Semaphore>,
    /// Records that entered `process`
    pub entered: Arc<AtomicUsize>,
}

impl GatedService {
    pub const KIND: &'static str = "gated";

    pub fn new() -> Self {
        Self {
            gate: Arc::new(Semaphore::new(0)),
            entered: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn release(&self, records: usize) {
        self.gate.add_permits(records);
    }

    /// Builtin services plus this one under [`GatedService::KIND`]
    pub fn registry(&self) -> ServiceRegistry {
        let mut registry = ServiceRegistry::with_builtin();
        let gated = self.clone();
        registry.register(Self::KIND, move |_info, _config| {
            Ok(Box::new(gated.clone()) as Box<dyn MetadataService>)
        });
        registry
    }

    /// Wait until `count` records have entered `process`
    pub async fn wait_entered(&self, count: usize) {
        for _ in 0..500 {
            if self.entered.load(Ordering::SeqCst) >= count {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        panic!("gated service never reached {} records", count);
    }
}

#[async_trait]
impl MetadataService for GatedService {
    fn name(&self) -> &str {
        "gated"
    }

    async fn process(&mut self, ctx: &mut ProcessContext<'_>, record: &Record) -> Result<Vec<Record>> {
        self.entered.fetch_add(1, Ordering::SeqCst);
        self.gate
            .acquire()
            .await
            .map_err(|e| Error::Internal(e.to_string()))?
            .forget();
        let output = Record::new(ctx.oai_ids.next_id(), record.format.clone())
            .with_payload(record.payload.clone());
        Ok(vec![output])
    }
}

/// Panics on its first record
pub struct PanickingService;

impl PanickingService {
    pub const KIND: &'static str = "panicking";

    pub fn registry() -> ServiceRegistry {
        let mut registry = ServiceRegistry::with_builtin();
        registry.register(Self::KIND, |_info, _config| {
            Ok(Box::new(PanickingService) as Box<dyn MetadataService>)
        });
        registry
    }
}

#[async_trait]
impl MetadataService for PanickingService {
    fn name(&self) -> &str {
        "panicking"
    }

    async fn process(&mut self, _ctx: &mut ProcessContext<'_>, record: &Record) -> Result<Vec<Record>> {
        panic!("cannot process {}", record.oai_id);
    }
}
