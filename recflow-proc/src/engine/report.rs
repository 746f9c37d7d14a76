//! End-of-pass reports

use async_trait::async_trait;
use recflow_common::{Result, ServiceStatus};
use serde::Serialize;
use std::fmt;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PassReport {
    pub service: String,
    pub run_id: Uuid,
    pub status: ServiceStatus,
    pub total_input: u64,
    pub processed: u64,
    pub succeeded: u64,
    pub errors: u64,
    pub warnings: u64,
    pub failure: Option<String>,
    pub unprocessed_error_ids: Vec<String>,
}

impl fmt::Display for PassReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Service: {}", self.service)?;
        writeln!(f, "Status: {}", self.status)?;
        writeln!(f, "Records pending at start: {}", self.total_input)?;
        writeln!(f, "Records processed: {}", self.processed)?;
        writeln!(f, "Processed successfully: {}", self.succeeded)?;
        writeln!(f, "Errors: {}", self.errors)?;
        writeln!(f, "Warnings: {}", self.warnings)?;
        if !self.unprocessed_error_ids.is_empty() {
            writeln!(f, "Unprocessed: {}", self.unprocessed_error_ids.join(", "))?;
        }
        if let Some(reason) = &self.failure {
            writeln!(f, "Failure: {}", reason)?;
        }
        Ok(())
    }
}

/// Destination for pass reports
#[async_trait]
pub trait ReportSink: Send + Sync {
    async fn deliver(&self, report: &PassReport) -> Result<()>;
}

/// Writes reports to the tracing log
#[derive(Debug, Default, Clone, Copy)]
pub struct LogReportSink;

#[async_trait]
impl ReportSink for LogReportSink {
    async fn deliver(&self, report: &PassReport) -> Result<()> {
        if report.failure.is_some() {
            tracing::warn!(service = %report.service, run_id = %report.run_id, "Pass report\n{}", report);
        } else {
            tracing::info!(service = %report.service, run_id = %report.run_id, "Pass report\n{}", report);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_mentions_failure() {
        let report = PassReport {
            service: "Normalization".to_string(),
            run_id: Uuid::nil(),
            status: ServiceStatus::Error,
            total_input: 3,
            processed: 2,
            succeeded: 1,
            errors: 1,
            warnings: 0,
            failure: Some("bad leader".to_string()),
            unprocessed_error_ids: vec!["oai:x:2".to_string()],
        };
        let text = report.to_string();
        assert!(text.contains("Status: ERROR"));
        assert!(text.contains("Processed successfully: 1"));
        assert!(text.contains("Failure: bad leader"));
        assert!(text.contains("oai:x:2"));
    }
}
