//! Search index boundary
//!
//! The engine writes through the repository and commits the index at checkpoints.
//! It never reads from the index.

use async_trait::async_trait;
use std::time::Duration;

use crate::Result;

#[async_trait]
pub trait SearchIndex: Send + Sync {
    /// Make all writes since the previous commit durable and searchable
    async fn commit_index(&self) -> Result<()>;

    /// Block until queued index work drains or `timeout` elapses
    async fn wait_for_job_completion(&self, timeout: Duration) -> Result<()>;
}

/// Index that accepts every commit and holds nothing
#[derive(Debug, Default, Clone, Copy)]
pub struct NullIndex;

#[async_trait]
impl SearchIndex for NullIndex {
    async fn commit_index(&self) -> Result<()> {
        tracing::trace!("Index commit (no-op)");
        Ok(())
    }

    async fn wait_for_job_completion(&self, _timeout: Duration) -> Result<()> {
        Ok(())
    }
}
