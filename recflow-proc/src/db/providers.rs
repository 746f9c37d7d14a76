//! Harvest provider rows

use recflow_common::{Error, Result};
use sqlx::{Row, SqlitePool};

use crate::models::Provider;

/// Insert a provider; its repository is named after it
pub async fn insert_provider(pool: &SqlitePool, name: &str, base_url: &str) -> Result<Provider> {
    let repo_name = format!("provider:{}", name);
    let id = sqlx::query("INSERT INTO providers (name, base_url, repo_name) VALUES (?, ?, ?)")
        .bind(name)
        .bind(base_url)
        .bind(&repo_name)
        .execute(pool)
        .await?
        .last_insert_rowid();

    Ok(Provider {
        id,
        name: name.to_string(),
        base_url: base_url.to_string(),
        repo_name,
    })
}

pub async fn load_provider(pool: &SqlitePool, id: i64) -> Result<Provider> {
    let row = sqlx::query("SELECT id, name, base_url, repo_name FROM providers WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| Error::NotFound(format!("provider {}", id)))?;

    Ok(Provider {
        id: row.get("id"),
        name: row.get("name"),
        base_url: row.get("base_url"),
        repo_name: row.get("repo_name"),
    })
}
