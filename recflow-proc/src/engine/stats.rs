//! Per-pass statistics

use crate::db::services::ServiceTotals;

/// Counters accumulated by one pass; flushed at checkpoints
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PassStats {
    /// Input records handed to the service
    pub processed: u64,
    /// New output records written
    pub outputs_added: u64,
    /// Existing output records rewritten
    pub outputs_updated: u64,
    pub errors: u64,
    /// Errors since the last checkpoint
    pub errors_since_commit: u64,
    pub warnings: u64,
    /// OAI ids of records left pending after a failure
    pub unprocessed_error_ids: Vec<String>,
    /// Input pending when the pass started
    pub total_input: u64,
}

impl PassStats {
    pub fn record_error(&mut self, oai_id: &str) {
        self.errors += 1;
        self.errors_since_commit += 1;
        self.unprocessed_error_ids.push(oai_id.to_string());
    }

    pub fn warn(&mut self) {
        self.warnings += 1;
    }

    pub fn succeeded(&self) -> u64 {
        self.processed.saturating_sub(self.errors)
    }

    /// Service totals after this pass: `base` plus the pass's counters
    ///
    /// Output is the number of records available in the service repository. An
    /// input count of zero falls back to the output count.
    pub fn totals(&self, base: &ServiceTotals, records_available: i64) -> ServiceTotals {
        let mut input = base.input_record_count + self.processed as i64;
        if input == 0 {
            input = records_available;
        }
        ServiceTotals {
            warnings: base.warnings + self.warnings as i64,
            errors: base.errors + self.errors as i64,
            errors_per_commit: self.errors_since_commit as i64,
            input_record_count: input,
            output_record_count: records_available,
        }
    }
}
