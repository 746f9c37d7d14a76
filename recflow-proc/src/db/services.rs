//! Service rows: registration, status transitions and statistics

use recflow_common::{time, Error, Result, ServiceStatus};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use crate::models::ServiceInfo;

const SERVICE_COLUMNS: &str = r#"
    id, name, kind, version, repo_name, status, warnings, errors, errors_per_commit,
    input_record_count, output_record_count, status_changed_at
"#;

/// Cumulative counters written at each checkpoint
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServiceTotals {
    pub warnings: i64,
    pub errors: i64,
    pub errors_per_commit: i64,
    pub input_record_count: i64,
    pub output_record_count: i64,
}

fn service_from_row(row: &SqliteRow) -> Result<ServiceInfo> {
    let status: String = row.get("status");
    Ok(ServiceInfo {
        id: row.get("id"),
        name: row.get("name"),
        kind: row.get("kind"),
        version: row.get("version"),
        repo_name: row.get("repo_name"),
        status: status.parse()?,
        warnings: row.get("warnings"),
        errors: row.get("errors"),
        errors_per_commit: row.get("errors_per_commit"),
        input_record_count: row.get("input_record_count"),
        output_record_count: row.get("output_record_count"),
        status_changed_at: time::from_millis(row.get("status_changed_at")),
    })
}

/// Insert a service row; the output repository is named after the service
pub async fn insert_service(
    pool: &SqlitePool,
    name: &str,
    kind: &str,
    version: &str,
) -> Result<ServiceInfo> {
    let repo_name = format!("service:{}", name);
    let id = sqlx::query(
        r#"
        INSERT INTO services (name, kind, version, repo_name, status, status_changed_at)
        VALUES (?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(name)
    .bind(kind)
    .bind(version)
    .bind(&repo_name)
    .bind(ServiceStatus::NotRunning.as_str())
    .bind(time::to_millis(time::now()))
    .execute(pool)
    .await?
    .last_insert_rowid();

    load_service(pool, id)
        .await?
        .ok_or_else(|| Error::Internal(format!("Service {} vanished after insert", id)))
}

pub async fn load_service(pool: &SqlitePool, id: i64) -> Result<Option<ServiceInfo>> {
    let sql = format!("SELECT {} FROM services WHERE id = ?", SERVICE_COLUMNS);
    let row = sqlx::query(&sql).bind(id).fetch_optional(pool).await?;
    row.as_ref().map(service_from_row).transpose()
}

pub async fn load_service_by_name(pool: &SqlitePool, name: &str) -> Result<Option<ServiceInfo>> {
    let sql = format!("SELECT {} FROM services WHERE name = ?", SERVICE_COLUMNS);
    let row = sqlx::query(&sql).bind(name).fetch_optional(pool).await?;
    row.as_ref().map(service_from_row).transpose()
}

pub async fn list_services(pool: &SqlitePool) -> Result<Vec<ServiceInfo>> {
    let sql = format!("SELECT {} FROM services ORDER BY id", SERVICE_COLUMNS);
    let rows = sqlx::query(&sql).fetch_all(pool).await?;
    rows.iter().map(service_from_row).collect()
}

/// Atomically claim the service for a run
///
/// Returns false when another run already holds it (RUNNING or PAUSED).
pub async fn try_start(pool: &SqlitePool, id: i64) -> Result<bool> {
    let result = sqlx::query(
        r#"
        UPDATE services SET status = 'RUNNING', status_changed_at = ?
        WHERE id = ? AND status NOT IN ('RUNNING', 'PAUSED')
        "#,
    )
    .bind(time::to_millis(time::now()))
    .bind(id)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() == 1)
}

pub async fn set_status(pool: &SqlitePool, id: i64, status: ServiceStatus) -> Result<()> {
    let result = sqlx::query("UPDATE services SET status = ?, status_changed_at = ? WHERE id = ?")
        .bind(status.as_str())
        .bind(time::to_millis(time::now()))
        .bind(id)
        .execute(pool)
        .await?;
    if result.rows_affected() == 0 {
        return Err(Error::NotFound(format!("service {}", id)));
    }
    Ok(())
}

pub async fn load_status(pool: &SqlitePool, id: i64) -> Result<ServiceStatus> {
    let status: Option<String> = sqlx::query_scalar("SELECT status FROM services WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await?;
    status
        .ok_or_else(|| Error::NotFound(format!("service {}", id)))?
        .parse()
}

pub async fn save_totals(pool: &SqlitePool, id: i64, totals: &ServiceTotals) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE services
        SET warnings = ?, errors = ?, errors_per_commit = ?,
            input_record_count = ?, output_record_count = ?
        WHERE id = ?
        "#,
    )
    .bind(totals.warnings)
    .bind(totals.errors)
    .bind(totals.errors_per_commit)
    .bind(totals.input_record_count)
    .bind(totals.output_record_count)
    .bind(id)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn update_version(pool: &SqlitePool, id: i64, version: &str) -> Result<()> {
    sqlx::query("UPDATE services SET version = ? WHERE id = ?")
        .bind(version)
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn delete_service_row(pool: &SqlitePool, id: i64) -> Result<()> {
    sqlx::query("DELETE FROM services WHERE id = ?")
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Services a previous process left RUNNING or PAUSED
pub async fn interrupted_services(pool: &SqlitePool) -> Result<Vec<ServiceInfo>> {
    let sql = format!(
        "SELECT {} FROM services WHERE status IN ('RUNNING', 'PAUSED') ORDER BY id",
        SERVICE_COLUMNS
    );
    let rows = sqlx::query(&sql).fetch_all(pool).await?;
    rows.iter().map(service_from_row).collect()
}

/// Drop every input and processed mark naming the service
pub async fn clear_record_marks(pool: &SqlitePool, id: i64) -> Result<()> {
    let mut tx = pool.begin().await?;
    for table in ["record_input_for", "record_processed_by"] {
        sqlx::query(&format!("DELETE FROM {} WHERE service_id = ?", table))
            .bind(id)
            .execute(&mut *tx)
            .await?;
    }
    tx.commit().await?;
    Ok(())
}
