//! Metadata services
//!
//! A service is a per-record transform plus lifecycle hooks. The engine owns iteration,
//! persistence and run control; a service only turns one input record into zero or more
//! output records.

pub mod aggregation;
pub mod lifecycle;
pub mod normalization;
pub mod registry;
pub mod scripts;

pub use registry::ServiceRegistry;

use async_trait::async_trait;
use recflow_common::{Batch, Record, Repository, Result};
use sqlx::SqlitePool;

use crate::engine::ids::{ElementCounters, OaiIdGenerator};
use crate::engine::stats::PassStats;
use crate::models::ServiceInfo;

/// Context for lifecycle and pass hooks
#[derive(Clone, Debug)]
pub struct ServiceContext {
    pub info: ServiceInfo,
    pub pool: SqlitePool,
    /// This service's output repository
    pub repository: Repository,
}

/// Per-record context handed to [`MetadataService::process`]
pub struct ProcessContext<'a> {
    pub service: &'a ServiceInfo,
    /// Open output batch; lookups through it see records staged earlier in the pass
    pub output: &'a Batch,
    pub oai_ids: &'a mut OaiIdGenerator,
    pub counters: &'a mut ElementCounters,
    pub stats: &'a mut PassStats,
}

impl ProcessContext<'_> {
    /// Output records of this service already derived from `input_id`
    pub async fn existing_successors(&self, input_id: i64) -> Result<Vec<Record>> {
        let ids = self.output.repository().get_successor_ids(input_id).await?;
        let mut successors = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(record) = self.output.get_record(id).await? {
                successors.push(record);
            }
        }
        Ok(successors)
    }
}

#[async_trait]
pub trait MetadataService: Send + Sync {
    fn name(&self) -> &str;

    async fn install(&mut self, _ctx: &ServiceContext) -> Result<()> {
        Ok(())
    }

    async fn uninstall(&mut self, _ctx: &ServiceContext) -> Result<()> {
        Ok(())
    }

    /// Called after update scripts ran, with the version being replaced
    async fn update(&mut self, _ctx: &ServiceContext, _from_version: &str) -> Result<()> {
        Ok(())
    }

    async fn begin_pass(&mut self, _ctx: &ServiceContext) -> Result<()> {
        Ok(())
    }

    /// Called at every engine checkpoint, before the batch commits the processed marks
    async fn checkpoint(&mut self, _ctx: &ServiceContext) -> Result<()> {
        Ok(())
    }

    /// Called once when the pass ends, whatever the outcome
    async fn end_pass(&mut self, _ctx: &ServiceContext) -> Result<()> {
        Ok(())
    }

    /// Transform one input record
    ///
    /// Returned records without an id are inserted; records with an id are rewritten.
    /// The engine adds the input as predecessor of every returned record.
    async fn process(&mut self, ctx: &mut ProcessContext<'_>, record: &Record) -> Result<Vec<Record>>;
}
