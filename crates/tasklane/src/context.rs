use std::path::PathBuf;

use libtasklane_core::config::{db_path, load_config, resolve_data_dir};
use libtasklane_core::{
    DatabaseGuard, DatabaseSource, SledTaskStore, SyncConfig, SyncCoordinator, TasklaneError,
};
use libtasklane_sync::DaemonError;

use crate::cli::Cli;

/// Resolved context for a tasklane command
pub struct TasklaneContext {
    pub data_dir: PathBuf,
    pub config: SyncConfig,
}

impl TasklaneContext {
    pub fn resolve(cli: &Cli) -> Result<Self, TasklaneError> {
        let data_dir = resolve_data_dir(cli.data_dir.as_deref())?;
        std::fs::create_dir_all(&data_dir)?;
        let config = load_config(&data_dir)?;
        Ok(Self { data_dir, config })
    }

    /// Open the database, waiting briefly if the daemon is mid-tick
    pub fn open_db(&self) -> Result<DatabaseGuard, TasklaneError> {
        DatabaseSource::on_disk(db_path(&self.data_dir)).acquire()
    }

    pub fn coordinator(db: &DatabaseGuard) -> SyncCoordinator<SledTaskStore> {
        SyncCoordinator::new(db.task_store(), db.queue())
    }
}

/// Flatten a daemon-side error into the CLI's error type
pub fn from_daemon_error(err: DaemonError) -> TasklaneError {
    match err {
        DaemonError::Core(e) => e,
        DaemonError::Io(e) => TasklaneError::Io(e),
        DaemonError::Json(e) => TasklaneError::Json(e),
        other => TasklaneError::Internal(other.to_string()),
    }
}
