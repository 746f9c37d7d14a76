//! Database and state fixtures

use anyhow::Result;
use async_trait::async_trait;
use recflow_common::config::RecflowConfig;
use recflow_common::db::init_database;
use recflow_common::events::EventBus;
use recflow_common::index::SearchIndex;
use recflow_common::{Record, Repository};
use recflow_proc::db::{providers, services};
use recflow_proc::models::{Provider, ServiceInfo};
use recflow_proc::AppState;
use serde_json::json;
use sqlx::SqlitePool;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
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

/// Index that counts commits and completion waits
#[derive(Debug, Default)]
pub struct CountingIndex {
    commits: AtomicUsize,
    waits: AtomicUsize,
}

impl CountingIndex {
    pub fn commits(&self) -> usize {
        self.commits.load(Ordering::SeqCst)
    }

    pub fn waits(&self) -> usize {
        self.waits.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SearchIndex for CountingIndex {
    async fn commit_index(&self) -> recflow_common::Result<()> {
        self.commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn wait_for_job_completion(&self, _timeout: Duration) -> recflow_common::Result<()> {
        self.waits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Defaults with a short pause poll so pause tests stay fast
pub fn test_config() -> RecflowConfig {
    let mut config = RecflowConfig::default();
    config.engine.pause_poll_ms = 50;
    config.engine.domain_name = "test.org".to_string();
    config.engine.instance_name = "RF".to_string();
    config.scheduler.poll_ms = 20;
    config
}

pub struct TestEnv {
    pub _dir: TempDir,
    pub state: AppState,
    pub index: Arc<CountingIndex>,
}

pub async fn test_env(config: RecflowConfig) -> Result<TestEnv> {
    let (dir, pool) = create_test_db().await?;
    let index = Arc::new(CountingIndex::default());
    let state = AppState::new(pool, EventBus::new(1024), config).with_index(index.clone());
    Ok(TestEnv { _dir: dir, state, index })
}

pub async fn provider(state: &AppState, name: &str) -> Result<(Provider, Repository)> {
    let provider = providers::insert_provider(&state.db, name, "http://provider.example/oai").await?;
    let repo = Repository::new(state.db.clone(), provider.repo_name.clone(), state.index.clone());
    Ok((provider, repo))
}

pub async fn service(state: &AppState, name: &str, kind: &str) -> Result<ServiceInfo> {
    Ok(services::insert_service(&state.db, name, kind, "1.0").await?)
}

/// Marc21 record with the given extracted fields
pub fn marc_record(oai_id: &str, fields: serde_json::Value) -> Record {
    Record::new(oai_id, "marc21").with_payload(json!({ "fields": fields }))
}

/// Store `count` records as pending input for `service_id`
pub async fn seed_input(
    repo: &Repository,
    service_id: i64,
    prefix: &str,
    count: usize,
) -> Result<Vec<i64>> {
    let mut ids = Vec::with_capacity(count);
    for n in 0..count {
        let mut record = marc_record(
            &format!("oai:test:{}{}", prefix, n),
            json!({ "245a": [format!("Title {}", n)] }),
        );
        record.input_for.insert(service_id);
        ids.push(repo.add_record(&mut record).await?);
    }
    Ok(ids)
}
