//! Durable match points
//!
//! One table holds every matcher's points, partitioned by `scope` (the owning service)
//! and matcher name.

use recflow_common::Result;
use sqlx::{Row, SqlitePool};
use std::collections::BTreeSet;

#[derive(Debug, Clone)]
pub struct MatchPointStore {
    pool: SqlitePool,
    scope: String,
}

impl MatchPointStore {
    pub fn new(pool: SqlitePool, scope: impl Into<String>) -> Self {
        Self {
            pool,
            scope: scope.into(),
        }
    }

    pub fn scope(&self) -> &str {
        &self.scope
    }

    /// Insert points in one transaction; existing points are left alone
    pub async fn insert_points(&self, matcher: &str, points: &[(String, i64)]) -> Result<()> {
        if points.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await?;
        for (key, record_id) in points {
            sqlx::query(
                r#"
                INSERT OR IGNORE INTO match_points (scope, matcher, match_key, record_id)
                VALUES (?, ?, ?, ?)
                "#,
            )
            .bind(&self.scope)
            .bind(matcher)
            .bind(key)
            .bind(record_id)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn ids_for_key(&self, matcher: &str, key: &str) -> Result<BTreeSet<i64>> {
        let ids: Vec<i64> = sqlx::query_scalar(
            r#"
            SELECT record_id FROM match_points
            WHERE scope = ? AND matcher = ? AND match_key = ?
            "#,
        )
        .bind(&self.scope)
        .bind(matcher)
        .bind(key)
        .fetch_all(&self.pool)
        .await?;
        Ok(ids.into_iter().collect())
    }

    pub async fn load_points(&self, matcher: &str) -> Result<Vec<(String, i64)>> {
        let rows = sqlx::query(
            r#"
            SELECT match_key, record_id FROM match_points
            WHERE scope = ? AND matcher = ?
            ORDER BY record_id, match_key
            "#,
        )
        .bind(&self.scope)
        .bind(matcher)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .iter()
            .map(|row| (row.get("match_key"), row.get("record_id")))
            .collect())
    }

    pub async fn record_ids(&self, matcher: &str) -> Result<BTreeSet<i64>> {
        let ids: Vec<i64> = sqlx::query_scalar(
            "SELECT DISTINCT record_id FROM match_points WHERE scope = ? AND matcher = ?",
        )
        .bind(&self.scope)
        .bind(matcher)
        .fetch_all(&self.pool)
        .await?;
        Ok(ids.into_iter().collect())
    }

    pub async fn keys(&self, matcher: &str) -> Result<BTreeSet<String>> {
        let keys: Vec<String> = sqlx::query_scalar(
            "SELECT DISTINCT match_key FROM match_points WHERE scope = ? AND matcher = ?",
        )
        .bind(&self.scope)
        .bind(matcher)
        .fetch_all(&self.pool)
        .await?;
        Ok(keys.into_iter().collect())
    }

    pub async fn delete_record(&self, matcher: &str, record_id: i64) -> Result<()> {
        sqlx::query("DELETE FROM match_points WHERE scope = ? AND matcher = ? AND record_id = ?")
            .bind(&self.scope)
            .bind(matcher)
            .bind(record_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Drop every matcher's points in this scope
    pub async fn clear_scope(&self) -> Result<u64> {
        let result = sqlx::query("DELETE FROM match_points WHERE scope = ?")
            .bind(&self.scope)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}
