//! Database Test Utilities

use anyhow::Result;
use recflow_common::db::init_database;
use recflow_common::index::NullIndex;
use recflow_common::{Record, Repository};
use sqlx::SqlitePool;
use std::sync::Arc;
use tempfile::TempDir;

/// Create temporary test database with the schema applied
///
/// Returns (TempDir, SqlitePool) - TempDir must be kept alive for duration of test
pub async fn create_test_db() -> Result<(TempDir, SqlitePool)> {
    let temp_dir = TempDir::new()?;
    let db_path = temp_dir.path().join("test_recflow.db");
    let pool = init_database(&db_path).await?;
    Ok((temp_dir, pool))
}

pub fn repository(pool: &SqlitePool, name: &str) -> Repository {
    Repository::new(pool.clone(), name, Arc::new(NullIndex))
}

/// `count` marc21 records named `oai:test:{prefix}{n}`, stored in order
pub async fn seed_records(repo: &Repository, prefix: &str, count: usize) -> Result<Vec<i64>> {
    let mut ids = Vec::with_capacity(count);
    for n in 0..count {
        let mut record = Record::new(format!("oai:test:{}{}", prefix, n), "marc21");
        ids.push(repo.add_record(&mut record).await?);
    }
    Ok(ids)
}
