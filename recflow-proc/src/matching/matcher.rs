//! Field matchers
//!
//! A matcher indexes normalized keys of one field family: key → record ids sharing it.
//! Points live in memory and are persisted to a [`MatchPointStore`] on flush. Lookups
//! consult both, so a forced flush mid-run loses nothing.

use async_trait::async_trait;
use recflow_common::Result;
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

use super::normalizers;
use super::parsed::ParsedRecord;
use super::store::MatchPointStore;

#[async_trait]
pub trait FieldMatcher: Send + Sync {
    fn name(&self) -> &str;

    /// Normalized keys `record` yields for this field family
    fn extract_keys(&self, record: &ParsedRecord) -> BTreeSet<String>;

    /// Index `record` under each extracted key; idempotent per (key, id)
    ///
    /// Returns the number of keys extracted.
    fn add_record(&mut self, record: &ParsedRecord) -> usize;

    async fn remove_record(&mut self, record_id: i64) -> Result<()>;

    /// Every record id indexed under `key`
    async fn matching_ids(&self, key: &str) -> Result<BTreeSet<i64>>;

    /// Records sharing at least one key with `record`, excluding `record` itself
    async fn get_matching_ids(&self, record: &ParsedRecord) -> Result<BTreeSet<i64>> {
        let mut ids = BTreeSet::new();
        for key in self.extract_keys(record) {
            ids.extend(self.matching_ids(&key).await?);
        }
        ids.remove(&record.id);
        Ok(ids)
    }

    /// Distinct record ids indexed
    async fn num_record_ids(&self) -> Result<usize>;

    /// Distinct keys indexed
    async fn num_match_points(&self) -> Result<usize>;

    /// Rehydrate memory from durable storage
    async fn load(&mut self) -> Result<()>;

    /// Persist new points; `force` also clears memory
    async fn flush(&mut self, force: bool) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Normalizer {
    Isbn,
    Issn,
    Lccn,
    SystemControlNumber,
    Text,
}

impl Normalizer {
    pub fn apply(&self, raw: &str) -> Option<String> {
        match self {
            Normalizer::Isbn => normalizers::isbn(raw),
            Normalizer::Issn => normalizers::issn(raw),
            Normalizer::Lccn => normalizers::lccn(raw),
            Normalizer::SystemControlNumber => normalizers::system_control_number(raw),
            Normalizer::Text => normalizers::text(raw),
        }
    }
}

/// Names accepted by [`KeyedFieldMatcher::builtin`]
pub const BUILTIN_MATCHERS: [&str; 10] = [
    "isbn",
    "issn",
    "lccn",
    "system_control_number",
    "x024a",
    "x028ab",
    "x130a",
    "x240a",
    "x245ah",
    "x260abc",
];

fn builtin_definition(name: &str) -> Option<(&'static [&'static str], Normalizer)> {
    let def: (&'static [&'static str], Normalizer) = match name {
        "isbn" => (&["020a"], Normalizer::Isbn),
        "issn" => (&["022a"], Normalizer::Issn),
        "lccn" => (&["010a"], Normalizer::Lccn),
        "system_control_number" => (&["035a"], Normalizer::SystemControlNumber),
        "x024a" => (&["024a"], Normalizer::Text),
        "x028ab" => (&["028a", "028b"], Normalizer::Text),
        "x130a" => (&["130a"], Normalizer::Text),
        "x240a" => (&["240a"], Normalizer::Text),
        "x245ah" => (&["245a", "245h"], Normalizer::Text),
        "x260abc" => (&["260a", "260b", "260c"], Normalizer::Text),
        _ => return None,
    };
    Some(def)
}

/// Matcher keyed on one field, or several subfields combined occurrence by occurrence
#[derive(Debug)]
pub struct KeyedFieldMatcher {
    name: String,
    fields: Vec<String>,
    normalizer: Normalizer,
    points: BTreeMap<String, BTreeSet<i64>>,
    record_keys: BTreeMap<i64, BTreeSet<String>>,
    unsaved: BTreeSet<(String, i64)>,
    store: Option<MatchPointStore>,
}

impl KeyedFieldMatcher {
    pub fn new(name: impl Into<String>, fields: &[&str], normalizer: Normalizer) -> Self {
        Self {
            name: name.into(),
            fields: fields.iter().map(|f| f.to_string()).collect(),
            normalizer,
            points: BTreeMap::new(),
            record_keys: BTreeMap::new(),
            unsaved: BTreeSet::new(),
            store: None,
        }
    }

    pub fn builtin(name: &str) -> Option<Self> {
        builtin_definition(name).map(|(fields, normalizer)| Self::new(name, fields, normalizer))
    }

    pub fn with_store(mut self, store: MatchPointStore) -> Self {
        self.store = Some(store);
        self
    }

    fn insert_point(&mut self, key: String, record_id: i64) -> bool {
        let added = self.points.entry(key.clone()).or_default().insert(record_id);
        self.record_keys.entry(record_id).or_default().insert(key);
        added
    }

    fn composite_keys(&self, record: &ParsedRecord) -> BTreeSet<String> {
        let columns: Vec<&[String]> = self.fields.iter().map(|f| record.values(f)).collect();
        let occurrences = columns.iter().map(|c| c.len()).max().unwrap_or(0);

        (0..occurrences)
            .filter_map(|i| {
                let parts: Vec<String> = columns
                    .iter()
                    .filter_map(|column| column.get(i))
                    .filter_map(|raw| self.normalizer.apply(raw))
                    .collect();
                (!parts.is_empty()).then(|| parts.join(" "))
            })
            .collect()
    }
}

#[async_trait]
impl FieldMatcher for KeyedFieldMatcher {
    fn name(&self) -> &str {
        &self.name
    }

    fn extract_keys(&self, record: &ParsedRecord) -> BTreeSet<String> {
        match self.fields.as_slice() {
            [field] => record
                .values(field)
                .iter()
                .filter_map(|raw| self.normalizer.apply(raw))
                .collect(),
            _ => self.composite_keys(record),
        }
    }

    fn add_record(&mut self, record: &ParsedRecord) -> usize {
        let keys = self.extract_keys(record);
        let count = keys.len();
        for key in keys {
            if self.insert_point(key.clone(), record.id) && self.store.is_some() {
                self.unsaved.insert((key, record.id));
            }
        }
        count
    }

    async fn remove_record(&mut self, record_id: i64) -> Result<()> {
        if let Some(keys) = self.record_keys.remove(&record_id) {
            for key in keys {
                if let Some(ids) = self.points.get_mut(&key) {
                    ids.remove(&record_id);
                    if ids.is_empty() {
                        self.points.remove(&key);
                    }
                }
            }
        }
        self.unsaved.retain(|(_, id)| *id != record_id);
        if let Some(store) = &self.store {
            store.delete_record(&self.name, record_id).await?;
        }
        Ok(())
    }

    async fn matching_ids(&self, key: &str) -> Result<BTreeSet<i64>> {
        let mut ids = self.points.get(key).cloned().unwrap_or_default();
        if let Some(store) = &self.store {
            ids.extend(store.ids_for_key(&self.name, key).await?);
        }
        Ok(ids)
    }

    async fn num_record_ids(&self) -> Result<usize> {
        let Some(store) = &self.store else {
            return Ok(self.record_keys.len());
        };
        let mut ids = store.record_ids(&self.name).await?;
        ids.extend(self.record_keys.keys().copied());
        Ok(ids.len())
    }

    async fn num_match_points(&self) -> Result<usize> {
        let Some(store) = &self.store else {
            return Ok(self.points.len());
        };
        let mut keys = store.keys(&self.name).await?;
        keys.extend(self.points.keys().cloned());
        Ok(keys.len())
    }

    async fn load(&mut self) -> Result<()> {
        if self.store.is_none() {
            return Ok(());
        }
        self.flush(true).await?;

        let Some(store) = &self.store else {
            return Ok(());
        };
        let points = store.load_points(&self.name).await?;
        let loaded = points.len();
        for (key, record_id) in points {
            self.insert_point(key, record_id);
        }
        debug!(matcher = %self.name, points = loaded, "Loaded match points");
        Ok(())
    }

    async fn flush(&mut self, force: bool) -> Result<()> {
        let Some(store) = &self.store else {
            return Ok(());
        };
        let pending: Vec<(String, i64)> = std::mem::take(&mut self.unsaved).into_iter().collect();
        store.insert_points(&self.name, &pending).await?;
        if force {
            self.points.clear();
            self.record_keys.clear();
        }
        debug!(matcher = %self.name, persisted = pending.len(), force, "Flushed match points");
        Ok(())
    }
}
