//! Match rules
//!
//! A rule turns matcher lookups for the current record into duplicate candidates. The
//! record's own id is never a candidate.

use async_trait::async_trait;
use recflow_common::Result;
use std::collections::BTreeSet;

use super::match_set::MatchSet;

#[async_trait]
pub trait MatchRule: Send + Sync {
    fn name(&self) -> &str;

    /// Matchers this rule consults
    fn matchers(&self) -> &[&'static str];

    async fn determine_matches(&self, set: &MatchSet<'_>) -> Result<BTreeSet<i64>>;
}

/// Candidates are every record sharing a key in one matcher
pub struct SingleMatcherRule {
    matcher: &'static str,
}

impl SingleMatcherRule {
    pub fn new(matcher: &'static str) -> Self {
        Self { matcher }
    }
}

#[async_trait]
impl MatchRule for SingleMatcherRule {
    fn name(&self) -> &str {
        self.matcher
    }

    fn matchers(&self) -> &[&'static str] {
        std::slice::from_ref(&self.matcher)
    }

    async fn determine_matches(&self, set: &MatchSet<'_>) -> Result<BTreeSet<i64>> {
        let record = set.record();
        let mut ids = set.matcher(self.matcher)?.get_matching_ids(record).await?;
        ids.remove(&record.id);
        Ok(ids)
    }
}

/// Candidates must match in every listed matcher
pub struct IntersectionRule {
    name: &'static str,
    matchers: Vec<&'static str>,
}

impl IntersectionRule {
    pub fn new(name: &'static str, matchers: Vec<&'static str>) -> Self {
        Self { name, matchers }
    }
}

#[async_trait]
impl MatchRule for IntersectionRule {
    fn name(&self) -> &str {
        self.name
    }

    fn matchers(&self) -> &[&'static str] {
        &self.matchers
    }

    async fn determine_matches(&self, set: &MatchSet<'_>) -> Result<BTreeSet<i64>> {
        let record = set.record();
        let mut candidates: Option<BTreeSet<i64>> = None;
        for name in &self.matchers {
            let ids = set.matcher(name)?.get_matching_ids(record).await?;
            let narrowed = match candidates {
                Some(previous) => previous.intersection(&ids).copied().collect(),
                None => ids,
            };
            if narrowed.is_empty() {
                return Ok(BTreeSet::new());
            }
            candidates = Some(narrowed);
        }
        let mut ids = candidates.unwrap_or_default();
        ids.remove(&record.id);
        Ok(ids)
    }
}

/// Names accepted by [`builtin_rule`]
pub const BUILTIN_RULES: [&str; 6] = [
    "isbn",
    "issn",
    "lccn",
    "system_control_number",
    "x024a_x245ah",
    "x028ab_x245ah",
];

pub fn builtin_rule(name: &str) -> Option<Box<dyn MatchRule>> {
    let rule: Box<dyn MatchRule> = match name {
        "isbn" => Box::new(SingleMatcherRule::new("isbn")),
        "issn" => Box::new(SingleMatcherRule::new("issn")),
        "lccn" => Box::new(SingleMatcherRule::new("lccn")),
        "system_control_number" => Box::new(SingleMatcherRule::new("system_control_number")),
        "x024a_x245ah" => Box::new(IntersectionRule::new("x024a_x245ah", vec!["x024a", "x245ah"])),
        "x028ab_x245ah" => Box::new(IntersectionRule::new("x028ab_x245ah", vec!["x028ab", "x245ah"])),
        _ => return None,
    };
    Some(rule)
}
