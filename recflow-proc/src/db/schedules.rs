//! Harvest schedules and their steps

use chrono::{DateTime, Utc};
use recflow_common::{time, Error, Result};
use sqlx::{Row, SqlitePool};

use crate::models::{HarvestSchedule, HarvestScheduleStep};

pub async fn insert_schedule(pool: &SqlitePool, name: &str, provider_id: i64) -> Result<i64> {
    let id = sqlx::query("INSERT INTO harvest_schedules (name, provider_id) VALUES (?, ?)")
        .bind(name)
        .bind(provider_id)
        .execute(pool)
        .await?
        .last_insert_rowid();
    Ok(id)
}

/// Append a step after the schedule's current last step
pub async fn add_step(
    pool: &SqlitePool,
    schedule_id: i64,
    format: &str,
    set_spec: Option<&str>,
) -> Result<i64> {
    let id = sqlx::query(
        r#"
        INSERT INTO harvest_schedule_steps (schedule_id, step_order, format, set_spec)
        SELECT ?, COALESCE(MAX(step_order), 0) + 1, ?, ?
        FROM harvest_schedule_steps WHERE schedule_id = ?
        "#,
    )
    .bind(schedule_id)
    .bind(format)
    .bind(set_spec)
    .bind(schedule_id)
    .execute(pool)
    .await?
    .last_insert_rowid();
    Ok(id)
}

pub async fn load_schedule(pool: &SqlitePool, id: i64) -> Result<HarvestSchedule> {
    let row = sqlx::query("SELECT id, name, provider_id FROM harvest_schedules WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| Error::NotFound(format!("harvest schedule {}", id)))?;

    let steps = sqlx::query(
        r#"
        SELECT id, schedule_id, step_order, format, set_spec, last_ran
        FROM harvest_schedule_steps WHERE schedule_id = ? ORDER BY step_order
        "#,
    )
    .bind(id)
    .fetch_all(pool)
    .await?
    .iter()
    .map(|row| HarvestScheduleStep {
        id: row.get("id"),
        schedule_id: row.get("schedule_id"),
        step_order: row.get("step_order"),
        format: row.get("format"),
        set_spec: row.get("set_spec"),
        last_ran: row.get::<Option<i64>, _>("last_ran").map(time::from_millis),
    })
    .collect();

    Ok(HarvestSchedule {
        id: row.get("id"),
        name: row.get("name"),
        provider_id: row.get("provider_id"),
        steps,
    })
}

pub async fn set_last_ran(pool: &SqlitePool, step_id: i64, last_ran: DateTime<Utc>) -> Result<()> {
    sqlx::query("UPDATE harvest_schedule_steps SET last_ran = ? WHERE id = ?")
        .bind(time::to_millis(last_ran))
        .bind(step_id)
        .execute(pool)
        .await?;
    Ok(())
}
