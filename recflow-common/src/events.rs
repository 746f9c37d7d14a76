//! Service event bus
//!
//! Status transitions, checkpoints and run completions are broadcast to any listener.
//! Emission never blocks the engine; with no subscribers events are dropped.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::models::ServiceStatus;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServiceEvent {
    /// Persisted service status changed
    StatusChanged {
        service_id: i64,
        old_status: ServiceStatus,
        new_status: ServiceStatus,
        timestamp: DateTime<Utc>,
    },

    /// A checkpoint committed the index and flushed statistics
    Checkpoint {
        service_id: i64,
        run_id: Uuid,
        processed: u64,
        timestamp: DateTime<Utc>,
    },

    /// A pass ended in any terminal state
    RunFinished {
        service_id: i64,
        run_id: Uuid,
        status: ServiceStatus,
        processed: u64,
        errors: u64,
        timestamp: DateTime<Utc>,
    },

    /// A job was appended to the queue
    JobEnqueued {
        job_id: i64,
        service_id: i64,
        output_set: Option<String>,
        order: i64,
    },

    /// A harvest step finished ingesting
    HarvestCompleted {
        provider_id: i64,
        step_id: i64,
        records: u64,
        timestamp: DateTime<Utc>,
    },
}

/// Broadcast channel for [`ServiceEvent`]s
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<ServiceEvent>,
    capacity: usize,
}

impl EventBus {
    /// Creates a new EventBus buffering up to `capacity` events per lagging receiver
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx, capacity }
    }

    /// Subscribe to all future events
    pub fn subscribe(&self) -> broadcast::Receiver<ServiceEvent> {
        self.tx.subscribe()
    }

    /// Emit an event, returning the number of receivers
    #[allow(clippy::result_large_err)]
    pub fn emit(
        &self,
        event: ServiceEvent,
    ) -> Result<usize, broadcast::error::SendError<ServiceEvent>> {
        self.tx.send(event)
    }

    /// Emit an event, ignoring if no subscribers are listening
    pub fn emit_lossy(&self, event: ServiceEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
