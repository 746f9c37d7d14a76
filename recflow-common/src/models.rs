//! Record and status models shared across recflow crates

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use crate::{Error, Result};

/// Record status. Deletion is a tombstone, never a physical removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecordStatus {
    Active,
    Deleted,
}

impl RecordStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordStatus::Active => "ACTIVE",
            RecordStatus::Deleted => "DELETED",
        }
    }
}

impl FromStr for RecordStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "ACTIVE" => Ok(RecordStatus::Active),
            "DELETED" => Ok(RecordStatus::Deleted),
            other => Err(Error::Internal(format!("Unknown record status: {}", other))),
        }
    }
}

/// One version of a metadata entity
///
/// Lineage is held as integer ids in both directions. `predecessors` is always loaded;
/// `successors` is filled on demand by `Repository::inject_successors`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// Assigned by the repository on insert
    pub id: Option<i64>,
    pub oai_id: String,
    pub format: String,
    pub sets: BTreeSet<String>,
    /// Optional type used for priority-ordered batches
    pub record_type: Option<String>,
    pub status: RecordStatus,
    pub payload: serde_json::Value,
    pub predecessors: BTreeSet<i64>,
    pub successors: BTreeSet<i64>,
    pub processed_by: BTreeSet<i64>,
    pub input_for: BTreeSet<i64>,
    pub updated_at: DateTime<Utc>,
}

impl Record {
    pub fn new(oai_id: impl Into<String>, format: impl Into<String>) -> Self {
        Self {
            id: None,
            oai_id: oai_id.into(),
            format: format.into(),
            sets: BTreeSet::new(),
            record_type: None,
            status: RecordStatus::Active,
            payload: serde_json::Value::Object(Default::default()),
            predecessors: BTreeSet::new(),
            successors: BTreeSet::new(),
            processed_by: BTreeSet::new(),
            input_for: BTreeSet::new(),
            updated_at: crate::time::now(),
        }
    }

    pub fn with_set(mut self, set_spec: impl Into<String>) -> Self {
        self.sets.insert(set_spec.into());
        self
    }

    pub fn with_type(mut self, record_type: impl Into<String>) -> Self {
        self.record_type = Some(record_type.into());
        self
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn is_deleted(&self) -> bool {
        self.status == RecordStatus::Deleted
    }

    /// Id of a persisted record
    pub fn require_id(&self) -> Result<i64> {
        self.id
            .ok_or_else(|| Error::InvalidInput(format!("Record {} has not been stored", self.oai_id)))
    }
}

/// Header-only view used for counts and monitoring
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordHeader {
    pub id: i64,
    pub oai_id: String,
    pub format: String,
    pub status: RecordStatus,
    pub sets: BTreeSet<String>,
    pub updated_at: DateTime<Utc>,
}

/// Run status of a metadata service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServiceStatus {
    NotRunning,
    Running,
    Paused,
    Canceled,
    Error,
}

impl ServiceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceStatus::NotRunning => "NOT_RUNNING",
            ServiceStatus::Running => "RUNNING",
            ServiceStatus::Paused => "PAUSED",
            ServiceStatus::Canceled => "CANCELED",
            ServiceStatus::Error => "ERROR",
        }
    }

    /// A run owns the service while RUNNING or PAUSED
    pub fn is_active(&self) -> bool {
        matches!(self, ServiceStatus::Running | ServiceStatus::Paused)
    }
}

impl fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ServiceStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "NOT_RUNNING" => Ok(ServiceStatus::NotRunning),
            "RUNNING" => Ok(ServiceStatus::Running),
            "PAUSED" => Ok(ServiceStatus::Paused),
            "CANCELED" => Ok(ServiceStatus::Canceled),
            "ERROR" => Ok(ServiceStatus::Error),
            other => Err(Error::Internal(format!("Unknown service status: {}", other))),
        }
    }
}
