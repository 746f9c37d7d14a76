//! Monotonic identifier counters

use recflow_common::Result;
use sqlx::SqlitePool;

/// Next value of `scope`/`name`, if one was ever persisted
pub async fn load_counter(pool: &SqlitePool, scope: &str, name: &str) -> Result<Option<i64>> {
    let value = sqlx::query_scalar("SELECT next_value FROM id_counters WHERE scope = ? AND name = ?")
        .bind(scope)
        .bind(name)
        .fetch_optional(pool)
        .await?;
    Ok(value)
}

/// Persist a counter; a stored value is never lowered
pub async fn save_counter(pool: &SqlitePool, scope: &str, name: &str, next_value: i64) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO id_counters (scope, name, next_value) VALUES (?, ?, ?)
        ON CONFLICT(scope, name) DO UPDATE SET next_value = MAX(next_value, excluded.next_value)
        "#,
    )
    .bind(scope)
    .bind(name)
    .bind(next_value)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn delete_scope(pool: &SqlitePool, scope: &str) -> Result<()> {
    sqlx::query("DELETE FROM id_counters WHERE scope = ?")
        .bind(scope)
        .execute(pool)
        .await?;
    Ok(())
}
