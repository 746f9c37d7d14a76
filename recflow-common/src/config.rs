//! Configuration loading and root folder resolution

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Environment variable naming the root folder
pub const ROOT_FOLDER_ENV: &str = "RECFLOW_ROOT";

/// Database file created under the root folder
pub const DATABASE_FILE: &str = "recflow.db";

/// How the engine reacts to a record whose transform fails
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum ErrorPolicy {
    /// First failure aborts the pass and sets the service to ERROR
    #[default]
    AbortPass,
    /// Failing records stay pending; the pass aborts once `max_errors` is exceeded
    SkipWithBudget { max_errors: u64 },
}

/// Processing pipeline settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    /// Records between forced index commits and statistics flushes
    pub checkpoint_interval: u64,
    /// Poll interval while a run is paused
    pub pause_poll_ms: u64,
    /// Records fetched per repository page
    pub page_size: i64,
    pub error_policy: ErrorPolicy,
    /// Domain and instance segments of generated OAI identifiers
    pub domain_name: String,
    pub instance_name: String,
    /// Max wait passed to `retry_on_lock`
    pub max_lock_wait_ms: u64,
    /// How long a finished pass waits for queued index work before the final commit
    pub index_wait_ms: u64,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            checkpoint_interval: 100_000,
            pause_poll_ms: 3_000,
            page_size: 1_000,
            error_policy: ErrorPolicy::AbortPass,
            domain_name: "localhost".to_string(),
            instance_name: "recflow".to_string(),
            max_lock_wait_ms: 5_000,
            index_wait_ms: 60_000,
        }
    }
}

/// Deduplication settings: active matcher and rule names, in rule precedence order
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MatchingSettings {
    pub matchers: Vec<String>,
    pub match_rules: Vec<String>,
}

impl Default for MatchingSettings {
    fn default() -> Self {
        Self {
            matchers: vec![
                "isbn".to_string(),
                "issn".to_string(),
                "lccn".to_string(),
                "system_control_number".to_string(),
            ],
            match_rules: vec![
                "isbn".to_string(),
                "issn".to_string(),
                "lccn".to_string(),
                "system_control_number".to_string(),
            ],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HarvestSettings {
    pub timeout_ms: u64,
}

impl Default for HarvestSettings {
    fn default() -> Self {
        Self { timeout_ms: 300_000 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerSettings {
    /// Idle wait between job queue polls
    pub poll_ms: u64,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self { poll_ms: 1_000 }
    }
}

/// Top-level configuration file contents
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RecflowConfig {
    pub root_folder: Option<PathBuf>,
    pub engine: EngineSettings,
    pub matching: MatchingSettings,
    pub harvest: HarvestSettings,
    pub scheduler: SchedulerSettings,
}

impl RecflowConfig {
    /// Parse and validate TOML text
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: RecflowConfig = toml::from_str(text)
            .map_err(|e| Error::Config(format!("Invalid config file: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse a config file
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// Load the platform config file if one exists, otherwise defaults
    pub fn load_or_default() -> Result<Self> {
        match config_file_path() {
            Some(path) if path.exists() => Self::load(&path),
            _ => Ok(Self::default()),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.engine.checkpoint_interval == 0 {
            return Err(Error::Config("checkpoint_interval must be positive".to_string()));
        }
        if self.engine.page_size <= 0 {
            return Err(Error::Config("page_size must be positive".to_string()));
        }
        if self.engine.domain_name.is_empty() || self.engine.instance_name.is_empty() {
            return Err(Error::Config("domain_name and instance_name are required".to_string()));
        }
        Ok(())
    }

    /// Database file location under the resolved root folder
    pub fn database_path(root: &Path) -> PathBuf {
        root.join(DATABASE_FILE)
    }
}

/// Root folder resolution priority order:
/// 1. Command-line argument (highest priority)
/// 2. Environment variable
/// 3. TOML config file
/// 4. OS-dependent default (fallback)
pub fn resolve_root_folder(cli_arg: Option<&str>, config: &RecflowConfig) -> PathBuf {
    if let Some(path) = cli_arg {
        return PathBuf::from(path);
    }

    if let Ok(path) = std::env::var(ROOT_FOLDER_ENV) {
        return PathBuf::from(path);
    }

    if let Some(path) = &config.root_folder {
        return path.clone();
    }

    default_root_folder()
}

/// Platform config file: `<config dir>/recflow/config.toml`
pub fn config_file_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("recflow").join("config.toml"))
}

fn default_root_folder() -> PathBuf {
    dirs::data_local_dir()
        .map(|d| d.join("recflow"))
        .unwrap_or_else(|| PathBuf::from("./recflow_data"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_defaults_match_engine_constants() {
        let config = RecflowConfig::default();
        assert_eq!(config.engine.checkpoint_interval, 100_000);
        assert_eq!(config.engine.pause_poll_ms, 3_000);
        assert_eq!(config.harvest.timeout_ms, 300_000);
        assert_eq!(config.engine.error_policy, ErrorPolicy::AbortPass);
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = RecflowConfig::from_toml_str(
            r#"
            [engine]
            checkpoint_interval = 50
            error_policy = { mode = "skip_with_budget", max_errors = 3 }

            [matching]
            matchers = ["isbn"]
            match_rules = ["isbn"]
            "#,
        )
        .unwrap();

        assert_eq!(config.engine.checkpoint_interval, 50);
        assert_eq!(config.engine.pause_poll_ms, 3_000);
        assert_eq!(
            config.engine.error_policy,
            ErrorPolicy::SkipWithBudget { max_errors: 3 }
        );
        assert_eq!(config.matching.matchers, vec!["isbn".to_string()]);
    }

    #[test]
    fn test_zero_checkpoint_interval_rejected() {
        let err = RecflowConfig::from_toml_str("[engine]\ncheckpoint_interval = 0\n").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_malformed_toml_is_config_error() {
        let err = RecflowConfig::from_toml_str("[engine\n").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    #[serial]
    fn test_cli_argument_wins_over_env() {
        std::env::set_var(ROOT_FOLDER_ENV, "/tmp/from-env");
        let root = resolve_root_folder(Some("/tmp/from-cli"), &RecflowConfig::default());
        std::env::remove_var(ROOT_FOLDER_ENV);
        assert_eq!(root, PathBuf::from("/tmp/from-cli"));
    }

    #[test]
    #[serial]
    fn test_env_wins_over_config_file() {
        std::env::set_var(ROOT_FOLDER_ENV, "/tmp/from-env");
        let config = RecflowConfig {
            root_folder: Some(PathBuf::from("/tmp/from-config")),
            ..Default::default()
        };
        let root = resolve_root_folder(None, &config);
        std::env::remove_var(ROOT_FOLDER_ENV);
        assert_eq!(root, PathBuf::from("/tmp/from-env"));
    }

    #[test]
    #[serial]
    fn test_config_file_root_used_without_env() {
        std::env::remove_var(ROOT_FOLDER_ENV);
        let config = RecflowConfig {
            root_folder: Some(PathBuf::from("/tmp/from-config")),
            ..Default::default()
        };
        assert_eq!(resolve_root_folder(None, &config), PathBuf::from("/tmp/from-config"));
    }
}
