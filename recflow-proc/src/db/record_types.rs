//! Record-type priority lists

use recflow_common::Result;
use sqlx::SqlitePool;

/// Record types for `service_id`, lowest priority number first
pub async fn load_priority_list(pool: &SqlitePool, service_id: i64) -> Result<Vec<String>> {
    let names = sqlx::query_scalar(
        "SELECT name FROM record_types WHERE service_id = ? ORDER BY priority ASC, name ASC",
    )
    .bind(service_id)
    .fetch_all(pool)
    .await?;
    Ok(names)
}

pub async fn set_priority(pool: &SqlitePool, service_id: i64, name: &str, priority: i64) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO record_types (service_id, name, priority) VALUES (?, ?, ?)
        ON CONFLICT(service_id, name) DO UPDATE SET priority = excluded.priority
        "#,
    )
    .bind(service_id)
    .bind(name)
    .bind(priority)
    .execute(pool)
    .await?;
    Ok(())
}
