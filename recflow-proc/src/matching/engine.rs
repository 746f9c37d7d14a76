use recflow_common::config::MatchingSettings;
use recflow_common::{Error, Result};
use std::collections::{BTreeMap, BTreeSet};

use super::match_set::MatchSet;
use super::matcher::{FieldMatcher, KeyedFieldMatcher};
use super::parsed::ParsedRecord;
use super::rules::{builtin_rule, MatchRule};
use super::store::MatchPointStore;

/// Configured matchers and rules for one deduplicating service
pub struct MatchEngine {
    matchers: BTreeMap<String, Box<dyn FieldMatcher>>,
    rules: Vec<Box<dyn MatchRule>>,
}

impl MatchEngine {
    /// Build from configured names; unknown names and rules whose matchers are not
    /// active are configuration errors
    pub fn from_settings(settings: &MatchingSettings, store: Option<&MatchPointStore>) -> Result<Self> {
        let mut matchers: BTreeMap<String, Box<dyn FieldMatcher>> = BTreeMap::new();
        for name in &settings.matchers {
            let mut matcher = KeyedFieldMatcher::builtin(name)
                .ok_or_else(|| Error::Config(format!("Unknown matcher: {}", name)))?;
            if let Some(store) = store {
                matcher = matcher.with_store(store.clone());
            }
            matchers.insert(name.clone(), Box::new(matcher));
        }

        let mut rules = Vec::with_capacity(settings.match_rules.len());
        for name in &settings.match_rules {
            let rule =
                builtin_rule(name).ok_or_else(|| Error::Config(format!("Unknown match rule: {}", name)))?;
            if let Some(missing) = rule.matchers().iter().find(|m| !matchers.contains_key(**m)) {
                return Err(Error::Config(format!(
                    "Match rule {} needs matcher {}, which is not configured",
                    name, missing
                )));
            }
            rules.push(rule);
        }

        Ok(Self { matchers, rules })
    }

    pub fn matcher(&self, name: &str) -> Option<&dyn FieldMatcher> {
        self.matchers.get(name).map(|m| m.as_ref())
    }

    pub fn matcher_names(&self) -> impl Iterator<Item = &str> {
        self.matchers.keys().map(String::as_str)
    }

    /// Index `record` in every matcher, then collect candidates rule by rule
    ///
    /// Candidates are ordered by the first rule that produced them.
    pub async fn determine_matches(&mut self, record: &ParsedRecord) -> Result<Vec<i64>> {
        for matcher in self.matchers.values_mut() {
            matcher.add_record(record);
        }
        self.candidates(record).await
    }

    /// Candidates for `record` without indexing it
    pub async fn candidates(&self, record: &ParsedRecord) -> Result<Vec<i64>> {
        let set = MatchSet::new(record, &self.matchers);
        let mut seen = BTreeSet::new();
        let mut ordered = Vec::new();
        for rule in &self.rules {
            for id in rule.determine_matches(&set).await? {
                if seen.insert(id) {
                    ordered.push(id);
                }
            }
        }
        Ok(ordered)
    }

    pub async fn remove_record(&mut self, record_id: i64) -> Result<()> {
        for matcher in self.matchers.values_mut() {
            matcher.remove_record(record_id).await?;
        }
        Ok(())
    }

    pub async fn load(&mut self) -> Result<()> {
        for matcher in self.matchers.values_mut() {
            matcher.load().await?;
        }
        Ok(())
    }

    pub async fn flush(&mut self, force: bool) -> Result<()> {
        for matcher in self.matchers.values_mut() {
            matcher.flush(force).await?;
        }
        Ok(())
    }
}
