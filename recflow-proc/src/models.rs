//! Service, provider, job, directive and schedule models

use chrono::{DateTime, Utc};
use recflow_common::{Error, Record, Result, ServiceStatus};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

/// Persisted service row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceInfo {
    pub id: i64,
    pub name: String,
    /// Registry key of the implementation
    pub kind: String,
    pub version: String,
    /// Repository receiving this service's output
    pub repo_name: String,
    pub status: ServiceStatus,
    pub warnings: i64,
    pub errors: i64,
    pub errors_per_commit: i64,
    pub input_record_count: i64,
    pub output_record_count: i64,
    pub status_changed_at: DateTime<Utc>,
}

/// Harvest source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Provider {
    pub id: i64,
    pub name: String,
    pub base_url: String,
    pub repo_name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobKind {
    /// Enqueued by directive evaluation or deletion propagation
    ProcessingDirective,
    /// Full reprocess after install or recovery
    ServiceReprocess,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::ProcessingDirective => "PROCESSING_DIRECTIVE",
            JobKind::ServiceReprocess => "SERVICE_REPROCESS",
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "PROCESSING_DIRECTIVE" => Ok(JobKind::ProcessingDirective),
            "SERVICE_REPROCESS" => Ok(JobKind::ServiceReprocess),
            other => Err(Error::Internal(format!("Unknown job kind: {}", other))),
        }
    }
}

/// One pending invocation of a service pass
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: i64,
    pub service_id: i64,
    pub output_set: Option<String>,
    pub kind: JobKind,
    /// Strictly increasing; execution order
    pub order: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DirectiveSource {
    Provider(i64),
    Service(i64),
}

/// Routing rule from a source's output to a target service's input
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessingDirective {
    pub id: i64,
    pub source: DirectiveSource,
    pub target_service_id: i64,
    pub output_set: Option<String>,
    pub formats: BTreeSet<String>,
    /// Empty means every set
    pub sets: BTreeSet<String>,
}

impl ProcessingDirective {
    /// Format must be listed; sets must intersect unless the directive names none
    pub fn matches(&self, record: &Record) -> bool {
        self.formats.contains(&record.format)
            && (self.sets.is_empty() || !self.sets.is_disjoint(&record.sets))
    }
}

/// New directive before insertion
#[derive(Debug, Clone, PartialEq)]
pub struct NewDirective {
    pub source: DirectiveSource,
    pub target_service_id: i64,
    pub output_set: Option<String>,
    pub formats: Vec<String>,
    pub sets: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HarvestSchedule {
    pub id: i64,
    pub name: String,
    pub provider_id: i64,
    pub steps: Vec<HarvestScheduleStep>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HarvestScheduleStep {
    pub id: i64,
    pub schedule_id: i64,
    pub step_order: i64,
    pub format: String,
    pub set_spec: Option<String>,
    /// Start time of the last successful run
    pub last_ran: Option<DateTime<Utc>>,
}
