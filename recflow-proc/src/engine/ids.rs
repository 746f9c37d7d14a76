//! Identifier generation with persisted, never-reused counters

use recflow_common::Result;
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use std::collections::BTreeMap;

use crate::db::counters;

const OAI_COUNTER: &str = "oai";

/// Produces `oai:{domain}:{instance}/{service}/{n}` identifiers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OaiIdGenerator {
    prefix: String,
    scope: String,
    next: i64,
}

impl OaiIdGenerator {
    pub fn new(domain: &str, instance: &str, service_name: &str, next: i64) -> Self {
        Self {
            prefix: format!("oai:{}:{}/{}/", domain, instance, service_name.replace(' ', "_")),
            scope: service_name.to_string(),
            next: next.max(1),
        }
    }

    /// Resume from the persisted counter for `service_name`
    pub async fn load(
        pool: &SqlitePool,
        domain: &str,
        instance: &str,
        service_name: &str,
    ) -> Result<Self> {
        let next = counters::load_counter(pool, service_name, OAI_COUNTER)
            .await?
            .unwrap_or(1);
        Ok(Self::new(domain, instance, service_name, next))
    }

    pub fn next_id(&mut self) -> String {
        let id = format!("{}{}", self.prefix, self.next);
        self.next += 1;
        id
    }

    pub fn peek_next(&self) -> i64 {
        self.next
    }

    pub async fn persist(&self, pool: &SqlitePool) -> Result<()> {
        counters::save_counter(pool, &self.scope, OAI_COUNTER, self.next).await
    }
}

/// Kinds of entity that receive their own identifier sequence
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ElementKind {
    Work,
    Expression,
    Manifestation,
    Holdings,
    Item,
    Record,
}

impl ElementKind {
    pub const ALL: [ElementKind; 6] = [
        ElementKind::Work,
        ElementKind::Expression,
        ElementKind::Manifestation,
        ElementKind::Holdings,
        ElementKind::Item,
        ElementKind::Record,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ElementKind::Work => "work",
            ElementKind::Expression => "expression",
            ElementKind::Manifestation => "manifestation",
            ElementKind::Holdings => "holdings",
            ElementKind::Item => "item",
            ElementKind::Record => "record",
        }
    }
}

/// Next-identifier counters per element kind, scoped to one service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ElementCounters {
    scope: String,
    next: BTreeMap<ElementKind, i64>,
}

impl ElementCounters {
    pub fn new(scope: &str) -> Self {
        Self {
            scope: scope.to_string(),
            next: ElementKind::ALL.iter().map(|k| (*k, 1)).collect(),
        }
    }

    pub async fn load(pool: &SqlitePool, scope: &str) -> Result<Self> {
        let mut counters = Self::new(scope);
        for kind in ElementKind::ALL {
            if let Some(value) = counters::load_counter(pool, scope, kind.as_str()).await? {
                counters.next.insert(kind, value);
            }
        }
        Ok(counters)
    }

    pub fn next_id(&mut self, kind: ElementKind) -> i64 {
        let slot = self.next.entry(kind).or_insert(1);
        let id = *slot;
        *slot += 1;
        id
    }

    pub fn peek_next(&self, kind: ElementKind) -> i64 {
        self.next.get(&kind).copied().unwrap_or(1)
    }

    pub async fn persist(&self, pool: &SqlitePool) -> Result<()> {
        for (kind, value) in &self.next {
            counters::save_counter(pool, &self.scope, kind.as_str(), *value).await?;
        }
        Ok(())
    }
}
