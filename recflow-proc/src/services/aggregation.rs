//! Deduplicating service
//!
//! Every input is indexed in the configured matchers. An input matching an earlier
//! record joins that record's output: the input becomes another predecessor and a link
//! ties it to its match. An input matching nothing gets an output of its own. An updated
//! input keeps its output: it is linked to any new matches, and an output it alone backs
//! takes its new payload.

use async_trait::async_trait;
use recflow_common::config::MatchingSettings;
use recflow_common::repo::input;
use recflow_common::{Error, Record, RecordStatus, Result};
use serde_json::Value;
use tracing::{debug, info};

use super::{MetadataService, ProcessContext, ServiceContext};
use crate::engine::ids::ElementKind;
use crate::matching::{MatchEngine, MatchPointStore, ParsedRecord};

pub const KIND: &str = "aggregation";

pub struct AggregationService {
    name: String,
    settings: MatchingSettings,
    engine: Option<MatchEngine>,
}

impl AggregationService {
    /// Fails with `Error::Config` when the matcher configuration is invalid
    pub fn new(name: impl Into<String>, settings: MatchingSettings) -> Result<Self> {
        MatchEngine::from_settings(&settings, None)?;
        Ok(Self {
            name: name.into(),
            settings,
            engine: None,
        })
    }

    /// Matchers of the current or most recent pass
    pub fn match_engine(&self) -> Option<&MatchEngine> {
        self.engine.as_ref()
    }

    fn engine_mut(&mut self) -> Result<&mut MatchEngine> {
        self.engine
            .as_mut()
            .ok_or_else(|| Error::Internal("Match engine used outside a pass".to_string()))
    }

    fn store(ctx: &ServiceContext) -> MatchPointStore {
        MatchPointStore::new(ctx.pool.clone(), ctx.info.name.clone())
    }

    /// Tombstone outputs left without a live predecessor; detach the rest
    async fn retract(&mut self, ctx: &mut ProcessContext<'_>, input_id: i64) -> Result<Vec<Record>> {
        self.engine_mut()?.remove_record(input_id).await?;

        let repo = ctx.output.repository();
        let mut retracted = Vec::new();
        for mut output in ctx.existing_successors(input_id).await? {
            let output_id = output.require_id()?;
            let mut still_backed = false;
            for predecessor in repo.get_predecessor_ids(output_id).await? {
                if predecessor == input_id {
                    continue;
                }
                if input::get_record_any(repo.pool(), predecessor)
                    .await?
                    .is_some_and(|r| !r.is_deleted())
                {
                    still_backed = true;
                    break;
                }
            }

            if still_backed {
                repo.remove_lineage(input_id, output_id).await?;
                debug!(input_id, output_id, "Detached deleted input from merged output");
            } else if !output.is_deleted() {
                output.status = RecordStatus::Deleted;
                retracted.push(output);
            }
        }
        Ok(retracted)
    }

    /// First candidate, in rule order, that already has an output
    async fn matched_output(ctx: &ProcessContext<'_>, candidates: &[i64]) -> Result<Option<Record>> {
        for candidate in candidates {
            if let Some(output) = ctx.existing_successors(*candidate).await?.into_iter().next() {
                return Ok(Some(output));
            }
        }
        Ok(None)
    }
}

/// The input's payload under the manifestation id the output already carries
fn refreshed_payload(input: &Value, previous: &Value) -> Value {
    let mut payload = input.clone();
    if let (Value::Object(object), Some(manifestation)) = (&mut payload, previous.get("manifestation_id")) {
        object.insert("manifestation_id".to_string(), manifestation.clone());
    }
    payload
}

#[async_trait]
impl MetadataService for AggregationService {
    fn name(&self) -> &str {
        &self.name
    }

    async fn uninstall(&mut self, ctx: &ServiceContext) -> Result<()> {
        let removed = Self::store(ctx).clear_scope().await?;
        info!(service = %self.name, removed, "Cleared match points");
        Ok(())
    }

    async fn begin_pass(&mut self, ctx: &ServiceContext) -> Result<()> {
        let store = Self::store(ctx);
        let mut engine = MatchEngine::from_settings(&self.settings, Some(&store))?;
        engine.load().await?;
        self.engine = Some(engine);
        Ok(())
    }

    async fn checkpoint(&mut self, _ctx: &ServiceContext) -> Result<()> {
        self.engine_mut()?.flush(false).await
    }

    async fn end_pass(&mut self, _ctx: &ServiceContext) -> Result<()> {
        match self.engine.as_mut() {
            Some(engine) => engine.flush(true).await,
            None => Ok(()),
        }
    }

    async fn process(&mut self, ctx: &mut ProcessContext<'_>, record: &Record) -> Result<Vec<Record>> {
        let input_id = record.require_id()?;
        if record.is_deleted() {
            return self.retract(ctx, input_id).await;
        }

        let parsed = ParsedRecord::from_record(record)?;
        let engine = self.engine_mut()?;
        engine.remove_record(input_id).await?;
        let candidates = engine.determine_matches(&parsed).await?;

        let repo = ctx.output.repository();
        for candidate in &candidates {
            repo.add_link(input_id, *candidate).await?;
        }

        if let Some(mut output) = ctx.existing_successors(input_id).await?.into_iter().next() {
            if output.predecessors.iter().all(|id| *id == input_id) {
                output.payload = refreshed_payload(&record.payload, &output.payload);
            }
            output.status = RecordStatus::Active;
            return Ok(vec![output]);
        }

        if let Some(mut output) = Self::matched_output(ctx, &candidates).await? {
            debug!(oai_id = %record.oai_id, matches = candidates.len(), "Merged into existing output");
            output.status = RecordStatus::Active;
            return Ok(vec![output]);
        }

        let mut payload = record.payload.clone();
        if let Value::Object(object) = &mut payload {
            let manifestation = ctx.counters.next_id(ElementKind::Manifestation);
            object.insert("manifestation_id".to_string(), Value::from(manifestation));
        }
        let output = Record::new(ctx.oai_ids.next_id(), record.format.clone()).with_payload(payload);
        Ok(vec![output])
    }
}
