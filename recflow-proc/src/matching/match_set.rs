use recflow_common::{Error, Result};
use std::collections::BTreeMap;

use super::matcher::FieldMatcher;
use super::parsed::ParsedRecord;

/// Working context for one match determination: a record plus the active matchers
pub struct MatchSet<'a> {
    record: &'a ParsedRecord,
    matchers: &'a BTreeMap<String, Box<dyn FieldMatcher>>,
}

impl<'a> MatchSet<'a> {
    pub fn new(
        record: &'a ParsedRecord,
        matchers: &'a BTreeMap<String, Box<dyn FieldMatcher>>,
    ) -> Self {
        Self { record, matchers }
    }

    pub fn record(&self) -> &ParsedRecord {
        self.record
    }

    pub fn matcher(&self, name: &str) -> Result<&dyn FieldMatcher> {
        self.matchers
            .get(name)
            .map(|m| m.as_ref())
            .ok_or_else(|| Error::Config(format!("Matcher '{}' is not active", name)))
    }
}
