//! Harvest boundary
//!
//! The wire protocol lives behind [`HarvestClient`]. The runner turns a schedule step
//! into a request, ingests the response into the provider repository and routes new
//! records through the provider's processing directives.

mod runner;

pub use runner::{HarvestRunner, HarvestSummary};

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use recflow_common::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HarvestRequest {
    pub base_url: String,
    pub metadata_prefix: String,
    pub set_spec: Option<String>,
    /// Start of the incremental window; `None` together with `harvest_all`
    pub from: Option<DateTime<Utc>>,
    pub until: DateTime<Utc>,
    pub harvest_all: bool,
    pub timeout_ms: u64,
    pub step_id: i64,
}

impl HarvestRequest {
    /// ListRecords request as it would be sent to the provider
    pub fn request_string(&self) -> String {
        let stamp = |ts: &DateTime<Utc>| ts.to_rfc3339_opts(SecondsFormat::Secs, true);
        let mut request = format!(
            "{}?verb=ListRecords&metadataPrefix={}",
            self.base_url, self.metadata_prefix
        );
        if let Some(set_spec) = &self.set_spec {
            request.push_str(&format!("&set={}", set_spec));
        }
        if let Some(from) = &self.from {
            request.push_str(&format!("&from={}", stamp(from)));
        }
        request.push_str(&format!("&until={}", stamp(&self.until)));
        request
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HarvestedRecord {
    pub oai_id: String,
    pub sets: BTreeSet<String>,
    pub deleted: bool,
    #[serde(default)]
    pub payload: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HarvestResponse {
    pub records: Vec<HarvestedRecord>,
    /// Literal request the client issued
    pub request: String,
}

#[async_trait]
pub trait HarvestClient: Send + Sync {
    async fn harvest(&self, request: &HarvestRequest) -> Result<HarvestResponse>;
}
