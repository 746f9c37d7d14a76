//! Lineage graph and non-lineage links
//!
//! Each derivation is a single `(predecessor, successor)` row, so a successor listing and
//! the matching predecessor listing can never disagree. Edges may cross repositories.

use sqlx::Row;
use std::collections::{BTreeMap, BTreeSet};

use super::Repository;
use crate::models::Record;
use crate::Result;

fn id_array(ids: &BTreeSet<i64>) -> Result<String> {
    Ok(serde_json::to_string(&ids.iter().collect::<Vec<_>>())?)
}

impl Repository {
    pub async fn get_predecessor_ids(&self, id: i64) -> Result<BTreeSet<i64>> {
        let ids: Vec<i64> = sqlx::query_scalar(
            "SELECT predecessor_id FROM record_lineage WHERE successor_id = ? ORDER BY predecessor_id",
        )
        .bind(id)
        .fetch_all(self.pool())
        .await?;
        Ok(ids.into_iter().collect())
    }

    pub async fn get_successor_ids(&self, id: i64) -> Result<BTreeSet<i64>> {
        let ids: Vec<i64> = sqlx::query_scalar(
            "SELECT successor_id FROM record_lineage WHERE predecessor_id = ? ORDER BY successor_id",
        )
        .bind(id)
        .fetch_all(self.pool())
        .await?;
        Ok(ids.into_iter().collect())
    }

    /// Fill `record.successors` from the lineage table
    pub async fn inject_successors(&self, record: &mut Record) -> Result<()> {
        let id = record.require_id()?;
        record.successors = self.get_successor_ids(id).await?;
        Ok(())
    }

    /// Fill `successors` for every stored record in one query
    pub async fn inject_successor_ids(&self, records: &mut [Record]) -> Result<()> {
        let ids: BTreeSet<i64> = records.iter().filter_map(|r| r.id).collect();
        if ids.is_empty() {
            return Ok(());
        }

        let rows = sqlx::query(
            r#"
            SELECT predecessor_id, successor_id FROM record_lineage
            WHERE predecessor_id IN (SELECT value FROM json_each(?))
            "#,
        )
        .bind(id_array(&ids)?)
        .fetch_all(self.pool())
        .await?;

        let mut by_predecessor: BTreeMap<i64, BTreeSet<i64>> = BTreeMap::new();
        for row in rows {
            by_predecessor
                .entry(row.get("predecessor_id"))
                .or_default()
                .insert(row.get("successor_id"));
        }

        for record in records.iter_mut() {
            if let Some(id) = record.id {
                record.successors = by_predecessor.remove(&id).unwrap_or_default();
            }
        }
        Ok(())
    }

    /// Record that `successor` was derived from `predecessor`
    pub async fn add_lineage(&self, predecessor: i64, successor: i64) -> Result<()> {
        sqlx::query(
            "INSERT OR IGNORE INTO record_lineage (predecessor_id, successor_id) VALUES (?, ?)",
        )
        .bind(predecessor)
        .bind(successor)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Drop one derivation edge (both directions)
    pub async fn remove_lineage(&self, predecessor: i64, successor: i64) -> Result<()> {
        sqlx::query("DELETE FROM record_lineage WHERE predecessor_id = ? AND successor_id = ?")
            .bind(predecessor)
            .bind(successor)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    /// Transitive closure over predecessor edges, seeds included
    ///
    /// Traces derived records back to every harvested original behind them, across any
    /// number of services. Service deletion does not use it: retraction moves one edge at a
    /// time, through the consumers queued for each tombstoned output.
    pub async fn populate_predecessors(&self, seeds: &BTreeSet<i64>) -> Result<BTreeSet<i64>> {
        let mut reached = seeds.clone();
        let mut frontier = seeds.clone();

        while !frontier.is_empty() {
            let found: Vec<i64> = sqlx::query_scalar(
                r#"
                SELECT DISTINCT predecessor_id FROM record_lineage
                WHERE successor_id IN (SELECT value FROM json_each(?))
                "#,
            )
            .bind(id_array(&frontier)?)
            .fetch_all(self.pool())
            .await?;

            frontier = found.into_iter().filter(|id| reached.insert(*id)).collect();
        }

        Ok(reached)
    }

    /// Record a same-entity relationship; does not imply lineage
    pub async fn add_link(&self, from_id: i64, to_id: i64) -> Result<()> {
        sqlx::query("INSERT OR IGNORE INTO record_links (from_id, to_id) VALUES (?, ?)")
            .bind(from_id)
            .bind(to_id)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    /// Ids linked to `to_id`, ascending
    pub async fn get_linked_record_ids(&self, to_id: i64) -> Result<Vec<i64>> {
        let ids = sqlx::query_scalar("SELECT from_id FROM record_links WHERE to_id = ? ORDER BY from_id")
            .bind(to_id)
            .fetch_all(self.pool())
            .await?;
        Ok(ids)
    }
}
