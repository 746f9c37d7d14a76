//! Database initialization
//!
//! Creates the database on first run and applies the idempotent schema. Pragmas are set
//! through connect options so every pooled connection carries them.

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::Result;

/// Current schema version recorded in `schema_version`
pub const SCHEMA_VERSION: i64 = 1;

/// Initialize database connection and create tables if needed
pub async fn init_database(db_path: &Path) -> Result<SqlitePool> {
    let newly_created = !db_path.exists();

    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let options = SqliteConnectOptions::new()
        .filename(db_path)
        .create_if_missing(true)
        .foreign_keys(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_millis(250));

    let pool = SqlitePoolOptions::new()
        .max_connections(20)
        .min_connections(5)
        .connect_with(options)
        .await?;

    if newly_created {
        info!("Initialized new database: {}", db_path.display());
    } else {
        info!("Opened existing database: {}", db_path.display());
    }

    create_schema(&pool).await?;

    Ok(pool)
}

/// Apply every table definition (safe to call multiple times)
pub async fn create_schema(pool: &SqlitePool) -> Result<()> {
    create_schema_version_table(pool).await?;

    // Record store
    create_repositories_table(pool).await?;
    create_records_table(pool).await?;
    create_open_batches_table(pool).await?;
    create_record_sets_table(pool).await?;
    create_record_lineage_table(pool).await?;
    create_record_links_table(pool).await?;
    create_record_service_tables(pool).await?;

    // Service configuration and run state
    create_providers_table(pool).await?;
    create_services_table(pool).await?;
    create_processing_directive_tables(pool).await?;
    create_jobs_table(pool).await?;
    create_record_types_table(pool).await?;
    create_id_counters_table(pool).await?;

    // Deduplication and harvest scheduling
    create_match_points_table(pool).await?;
    create_harvest_schedule_tables(pool).await?;

    sqlx::query("INSERT OR IGNORE INTO schema_version (version) VALUES (?)")
        .bind(SCHEMA_VERSION)
        .execute(pool)
        .await?;

    Ok(())
}

async fn create_schema_version_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn create_repositories_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS repositories (
            name TEXT PRIMARY KEY,
            last_modified INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Records of every repository share one table so ids are globally unique
async fn create_records_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS records (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            repo_name TEXT NOT NULL,
            oai_id TEXT NOT NULL,
            format TEXT NOT NULL,
            record_type TEXT,
            status TEXT NOT NULL DEFAULT 'ACTIVE' CHECK (status IN ('ACTIVE', 'DELETED')),
            payload TEXT NOT NULL DEFAULT '{}',
            visible INTEGER NOT NULL DEFAULT 1,
            batch_id TEXT,
            updated_at INTEGER NOT NULL,
            UNIQUE (repo_name, oai_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_records_repo_updated ON records(repo_name, updated_at)",
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_records_visible ON records(repo_name, visible)")
        .execute(pool)
        .await?;

    Ok(())
}

/// Write batches begun and not yet ended; staged rows carry the batch id
async fn create_open_batches_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS open_batches (
            batch_id TEXT PRIMARY KEY,
            repo_name TEXT NOT NULL,
            opened_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_records_batch ON records(batch_id)")
        .execute(pool)
        .await?;

    Ok(())
}

async fn create_record_sets_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS record_sets (
            record_id INTEGER NOT NULL REFERENCES records(id) ON DELETE CASCADE,
            set_spec TEXT NOT NULL,
            PRIMARY KEY (record_id, set_spec)
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// One row per derivation edge; both lineage directions read the same row
async fn create_record_lineage_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS record_lineage (
            predecessor_id INTEGER NOT NULL REFERENCES records(id) ON DELETE CASCADE,
            successor_id INTEGER NOT NULL REFERENCES records(id) ON DELETE CASCADE,
            PRIMARY KEY (predecessor_id, successor_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_record_lineage_successor ON record_lineage(successor_id)",
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn create_record_links_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS record_links (
            from_id INTEGER NOT NULL REFERENCES records(id) ON DELETE CASCADE,
            to_id INTEGER NOT NULL REFERENCES records(id) ON DELETE CASCADE,
            PRIMARY KEY (from_id, to_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_record_links_to ON record_links(to_id)")
        .execute(pool)
        .await?;

    Ok(())
}

async fn create_record_service_tables(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS record_processed_by (
            record_id INTEGER NOT NULL REFERENCES records(id) ON DELETE CASCADE,
            service_id INTEGER NOT NULL,
            PRIMARY KEY (record_id, service_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS record_input_for (
            record_id INTEGER NOT NULL REFERENCES records(id) ON DELETE CASCADE,
            service_id INTEGER NOT NULL,
            PRIMARY KEY (record_id, service_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_record_input_for_service ON record_input_for(service_id, record_id)",
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn create_providers_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS providers (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL UNIQUE,
            base_url TEXT NOT NULL,
            repo_name TEXT NOT NULL UNIQUE
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn create_services_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS services (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL UNIQUE,
            kind TEXT NOT NULL,
            version TEXT NOT NULL,
            repo_name TEXT NOT NULL UNIQUE,
            status TEXT NOT NULL DEFAULT 'NOT_RUNNING',
            warnings INTEGER NOT NULL DEFAULT 0,
            errors INTEGER NOT NULL DEFAULT 0,
            errors_per_commit INTEGER NOT NULL DEFAULT 0,
            input_record_count INTEGER NOT NULL DEFAULT 0,
            output_record_count INTEGER NOT NULL DEFAULT 0,
            status_changed_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn create_processing_directive_tables(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS processing_directives (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            source_provider_id INTEGER REFERENCES providers(id) ON DELETE CASCADE,
            source_service_id INTEGER REFERENCES services(id) ON DELETE CASCADE,
            target_service_id INTEGER NOT NULL REFERENCES services(id) ON DELETE CASCADE,
            output_set TEXT,
            CHECK ((source_provider_id IS NULL) <> (source_service_id IS NULL))
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS directive_formats (
            directive_id INTEGER NOT NULL REFERENCES processing_directives(id) ON DELETE CASCADE,
            format TEXT NOT NULL,
            PRIMARY KEY (directive_id, format)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS directive_sets (
            directive_id INTEGER NOT NULL REFERENCES processing_directives(id) ON DELETE CASCADE,
            set_spec TEXT NOT NULL,
            PRIMARY KEY (directive_id, set_spec)
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn create_jobs_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS jobs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            service_id INTEGER NOT NULL,
            output_set TEXT,
            job_kind TEXT NOT NULL,
            job_order INTEGER NOT NULL UNIQUE,
            created_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn create_record_types_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS record_types (
            service_id INTEGER NOT NULL REFERENCES services(id) ON DELETE CASCADE,
            name TEXT NOT NULL,
            priority INTEGER NOT NULL,
            PRIMARY KEY (service_id, name)
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn create_id_counters_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS id_counters (
            scope TEXT NOT NULL,
            name TEXT NOT NULL,
            next_value INTEGER NOT NULL,
            PRIMARY KEY (scope, name)
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn create_match_points_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS match_points (
            scope TEXT NOT NULL,
            matcher TEXT NOT NULL,
            match_key TEXT NOT NULL,
            record_id INTEGER NOT NULL,
            PRIMARY KEY (scope, matcher, match_key, record_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_match_points_record ON match_points(scope, matcher, record_id)",
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn create_harvest_schedule_tables(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS harvest_schedules (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL UNIQUE,
            provider_id INTEGER NOT NULL REFERENCES providers(id) ON DELETE CASCADE
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS harvest_schedule_steps (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            schedule_id INTEGER NOT NULL REFERENCES harvest_schedules(id) ON DELETE CASCADE,
            step_order INTEGER NOT NULL,
            format TEXT NOT NULL,
            set_spec TEXT,
            last_ran INTEGER,
            UNIQUE (schedule_id, step_order)
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}
