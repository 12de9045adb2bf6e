use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::TasklaneError;

/// Environment variable overriding the data directory
pub const DATA_DIR_ENV: &str = "TASKLANE_HOME";

pub const DEFAULT_INTERVAL_SECS: u64 = 300;
pub const DEFAULT_MAX_RETRIES: u32 = 5;
pub const DEFAULT_NOTIFY_CAPACITY: usize = 64;

/// Sync configuration stored in `<data_dir>/config.toml`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Skip all remote I/O
    pub offline_mode: bool,
    /// Seconds between daemon ticks
    pub interval_secs: u64,
    /// Operations that failed this many times are left for manual attention
    pub max_retries: u32,
    /// Bounded notification queue size
    pub notify_capacity: usize,
    /// External command run for each notification (argv, message appended)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notify_command: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub backends: Vec<BackendConfig>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            offline_mode: false,
            interval_secs: DEFAULT_INTERVAL_SECS,
            max_retries: DEFAULT_MAX_RETRIES,
            notify_capacity: DEFAULT_NOTIFY_CAPACITY,
            notify_command: None,
            backends: Vec::new(),
        }
    }
}

impl SyncConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }

    /// The backend reconciliation runs against
    pub fn primary_backend(&self) -> Option<&BackendConfig> {
        self.backends.first()
    }

    pub fn validate(&self) -> Result<(), TasklaneError> {
        if self.notify_capacity == 0 {
            return Err(TasklaneError::InvalidArgs("notify_capacity must be at least 1".to_string()));
        }
        for backend in &self.backends {
            if backend.name.is_empty() {
                return Err(TasklaneError::InvalidArgs("backend name must not be empty".to_string()));
            }
            if backend.kind == BackendKind::Directory && backend.path.is_none() {
                return Err(TasklaneError::InvalidArgs(format!(
                    "directory backend '{}' requires a path",
                    backend.name
                )));
            }
        }
        Ok(())
    }
}

/// One remote endpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendConfig {
    pub name: String,
    pub kind: BackendKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// JSON file on a local or mounted filesystem
    Directory,
    /// Process-local store, mostly for tests
    Memory,
}

/// Load config from `<data_dir>/config.toml`, defaults if absent
pub fn load_config(data_dir: &Path) -> Result<SyncConfig, TasklaneError> {
    let path = config_path(data_dir);
    if !path.exists() {
        return Ok(SyncConfig::default());
    }
    let content = std::fs::read_to_string(&path)?;
    let config: SyncConfig = toml::from_str(&content)?;
    config.validate()?;
    Ok(config)
}

/// Save config to `<data_dir>/config.toml`
pub fn save_config(data_dir: &Path, config: &SyncConfig) -> Result<(), TasklaneError> {
    std::fs::create_dir_all(data_dir)?;
    let content = toml::to_string_pretty(config)?;
    std::fs::write(config_path(data_dir), content)?;
    Ok(())
}

/// Resolve the data directory: explicit flag, `TASKLANE_HOME`,
/// `$XDG_DATA_HOME/tasklane`, then `$HOME/.local/share/tasklane`
pub fn resolve_data_dir(explicit: Option<&Path>) -> Result<PathBuf, TasklaneError> {
    if let Some(dir) = explicit {
        return Ok(dir.to_path_buf());
    }
    if let Some(dir) = non_empty_env(DATA_DIR_ENV) {
        return Ok(PathBuf::from(dir));
    }
    if let Some(xdg) = non_empty_env("XDG_DATA_HOME") {
        return Ok(PathBuf::from(xdg).join("tasklane"));
    }
    if let Some(home) = non_empty_env("HOME") {
        return Ok(PathBuf::from(home).join(".local").join("share").join("tasklane"));
    }
    Err(TasklaneError::InvalidArgs(format!(
        "cannot determine data directory; pass --data-dir or set {}",
        DATA_DIR_ENV
    )))
}

fn non_empty_env(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

pub fn config_path(data_dir: &Path) -> PathBuf {
    data_dir.join("config.toml")
}

/// The sled directory; its lock file is `<data_dir>/db.lock`
pub fn db_path(data_dir: &Path) -> PathBuf {
    data_dir.join("db")
}

/// Liveness marker of the sync daemon
pub fn daemon_lock_path(data_dir: &Path) -> PathBuf {
    data_dir.join("daemon.lock")
}

pub fn daemon_log_path(data_dir: &Path) -> PathBuf {
    data_dir.join("sync-daemon.log")
}
