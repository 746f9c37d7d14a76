//! Processing directive persistence

use recflow_common::{Error, Result};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use std::collections::BTreeSet;

use crate::models::{DirectiveSource, NewDirective, ProcessingDirective};

const DIRECTIVE_SELECT: &str = r#"
    SELECT d.id, d.source_provider_id, d.source_service_id, d.target_service_id, d.output_set,
           (SELECT group_concat(format, char(31)) FROM directive_formats WHERE directive_id = d.id) AS formats,
           (SELECT group_concat(set_spec, char(31)) FROM directive_sets WHERE directive_id = d.id) AS sets
    FROM processing_directives d
"#;

fn split(joined: Option<String>) -> BTreeSet<String> {
    joined
        .map(|s| s.split('\u{1f}').map(str::to_string).collect())
        .unwrap_or_default()
}

fn directive_from_row(row: &SqliteRow) -> Result<ProcessingDirective> {
    let provider: Option<i64> = row.get("source_provider_id");
    let service: Option<i64> = row.get("source_service_id");
    let source = match (provider, service) {
        (Some(id), None) => DirectiveSource::Provider(id),
        (None, Some(id)) => DirectiveSource::Service(id),
        _ => {
            return Err(Error::Config(format!(
                "Directive {} must have exactly one source",
                row.get::<i64, _>("id")
            )))
        }
    };

    Ok(ProcessingDirective {
        id: row.get("id"),
        source,
        target_service_id: row.get("target_service_id"),
        output_set: row.get("output_set"),
        formats: split(row.get("formats")),
        sets: split(row.get("sets")),
    })
}

/// Insert a directive; a directive without formats can never match and is rejected
pub async fn insert_directive(pool: &SqlitePool, directive: &NewDirective) -> Result<i64> {
    if directive.formats.is_empty() {
        return Err(Error::Config("Processing directive needs at least one format".to_string()));
    }

    let (provider, service) = match directive.source {
        DirectiveSource::Provider(id) => (Some(id), None),
        DirectiveSource::Service(id) => (None, Some(id)),
    };

    let mut tx = pool.begin().await?;
    let id = sqlx::query(
        r#"
        INSERT INTO processing_directives (source_provider_id, source_service_id, target_service_id, output_set)
        VALUES (?, ?, ?, ?)
        "#,
    )
    .bind(provider)
    .bind(service)
    .bind(directive.target_service_id)
    .bind(&directive.output_set)
    .execute(&mut *tx)
    .await?
    .last_insert_rowid();

    for format in &directive.formats {
        sqlx::query("INSERT OR IGNORE INTO directive_formats (directive_id, format) VALUES (?, ?)")
            .bind(id)
            .bind(format)
            .execute(&mut *tx)
            .await?;
    }
    for set_spec in &directive.sets {
        sqlx::query("INSERT OR IGNORE INTO directive_sets (directive_id, set_spec) VALUES (?, ?)")
            .bind(id)
            .bind(set_spec)
            .execute(&mut *tx)
            .await?;
    }
    tx.commit().await?;

    Ok(id)
}

/// Directives routing the output of `source`
pub async fn load_directives_for(
    pool: &SqlitePool,
    source: DirectiveSource,
) -> Result<Vec<ProcessingDirective>> {
    let (column, id) = match source {
        DirectiveSource::Provider(id) => ("source_provider_id", id),
        DirectiveSource::Service(id) => ("source_service_id", id),
    };
    let sql = format!("{} WHERE d.{} = ? ORDER BY d.id", DIRECTIVE_SELECT, column);
    let rows = sqlx::query(&sql).bind(id).fetch_all(pool).await?;
    rows.iter().map(directive_from_row).collect()
}

/// Remove directives naming the service as source or target
pub async fn delete_directives_for_service(pool: &SqlitePool, service_id: i64) -> Result<u64> {
    let result = sqlx::query(
        "DELETE FROM processing_directives WHERE source_service_id = ? OR target_service_id = ?",
    )
    .bind(service_id)
    .bind(service_id)
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}
