//! Versioned update scripts
//!
//! A service update runs every `update.X.Y[.Z].sql` script newer than the installed
//! version and no newer than the target, in version order.

use recflow_common::{Error, Result};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Version {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl FromStr for Version {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || Error::InvalidInput(format!("Invalid version: {}", s));
        let parts = s
            .trim()
            .split('.')
            .map(|p| p.parse::<u32>().map_err(|_| invalid()))
            .collect::<Result<Vec<u32>>>()?;
        match parts.as_slice() {
            [major, minor] => Ok(Version { major: *major, minor: *minor, patch: 0 }),
            [major, minor, patch] => Ok(Version { major: *major, minor: *minor, patch: *patch }),
            _ => Err(invalid()),
        }
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateScript {
    pub version: Version,
    pub file_name: String,
    pub sql: String,
}

/// Version named by an update script file, if it is one
pub fn script_version(file_name: &str) -> Option<Version> {
    file_name
        .strip_prefix("update.")?
        .strip_suffix(".sql")?
        .parse()
        .ok()
}

/// Scripts in `(from, to]`, oldest first
pub fn plan(mut scripts: Vec<UpdateScript>, from: Version, to: Version) -> Vec<UpdateScript> {
    scripts.retain(|s| s.version > from && s.version <= to);
    scripts.sort_by(|a, b| a.version.cmp(&b.version));
    scripts
}

/// Every update script in `dir`; other files are ignored
pub async fn load_scripts(dir: &Path) -> Result<Vec<UpdateScript>> {
    let mut scripts = Vec::new();
    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let file_name = entry.file_name().to_string_lossy().to_string();
        let Some(version) = script_version(&file_name) else {
            continue;
        };
        let sql = tokio::fs::read_to_string(entry.path()).await?;
        scripts.push(UpdateScript { version, file_name, sql });
    }
    Ok(scripts)
}

/// Run each script in its own transaction; the first failure stops the update
pub async fn apply(pool: &SqlitePool, scripts: &[UpdateScript]) -> Result<()> {
    for script in scripts {
        let mut tx = pool.begin().await?;
        sqlx::raw_sql(&script.sql).execute(&mut *tx).await?;
        tx.commit().await?;
        info!(script = %script.file_name, version = %script.version, "Applied update script");
    }
    Ok(())
}
