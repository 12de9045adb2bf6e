use sled::transaction::TransactionError;
use thiserror::Error;

/// Main error type for tasklane operations
#[derive(Debug, Error)]
pub enum TasklaneError {
    #[error("invalid arguments: {0}")]
    InvalidArgs(String),

    #[error("invalid resolution strategy '{0}' (expected one of: server_wins, local_wins, merge, keep_both)")]
    InvalidStrategy(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("unsupported capability: {0}")]
    UnsupportedCapability(String),

    #[error("database busy: {0}")]
    DbBusy(String),

    #[error("remote error: {0}")]
    Remote(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("sled error: {0}")]
    Sled(#[from] sled::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<TransactionError<TasklaneError>> for TasklaneError {
    fn from(e: TransactionError<TasklaneError>) -> Self {
        match e {
            TransactionError::Abort(inner) => inner,
            TransactionError::Storage(inner) => TasklaneError::Sled(inner),
        }
    }
}

impl TasklaneError {
    /// Get the error code for JSON output
    pub fn error_code(&self) -> &'static str {
        match self {
            TasklaneError::InvalidArgs(_) => "invalid_args",
            TasklaneError::InvalidStrategy(_) => "invalid_strategy",
            TasklaneError::NotFound(_) => "not_found",
            TasklaneError::Conflict(_) => "conflict",
            TasklaneError::UnsupportedCapability(_) => "unsupported_capability",
            TasklaneError::DbBusy(_) => "db_busy",
            TasklaneError::Remote(_) => "remote_error",
            TasklaneError::Io(_) => "io_error",
            TasklaneError::Sled(_) => "db_error",
            TasklaneError::Json(_) => "internal_error",
            TasklaneError::TomlParse(_) => "invalid_config",
            TasklaneError::TomlSerialize(_) => "internal_error",
            TasklaneError::Internal(_) => "internal_error",
        }
    }

    /// Whether this is a storage-level failure.
    ///
    /// The daemon treats these as transient: logged, retried on the next tick.
    pub fn is_storage(&self) -> bool {
        matches!(
            self,
            TasklaneError::DbBusy(_)
                | TasklaneError::Io(_)
                | TasklaneError::Sled(_)
                | TasklaneError::Json(_)
        )
    }

    /// Get actionable suggestions for fixing the error
    pub fn suggestions(&self) -> Vec<&'static str> {
        match self {
            TasklaneError::NotFound(msg) => {
                if msg.contains("conflict") {
                    vec!["Run 'tasklane sync conflicts' to see pending conflicts"]
                } else if msg.contains("task") || msg.starts_with("Task") {
                    vec!["Run 'tasklane task list' to see available tasks"]
                } else {
                    vec![]
                }
            }
            TasklaneError::InvalidStrategy(_) => vec![
                "Valid strategies: server_wins, local_wins, merge, keep_both",
            ],
            TasklaneError::DbBusy(_) => vec![
                "The sync daemon may be in the middle of a tick, retry shortly",
                "Or run 'tasklane sync daemon stop' to stop the daemon",
            ],
            TasklaneError::Sled(_) => vec![
                "Check disk space and permissions of the data directory",
            ],
            TasklaneError::Remote(_) => vec![
                "Run 'tasklane sync status' to check backend connectivity",
                "Pending operations stay queued and are retried on the next sync",
            ],
            TasklaneError::TomlParse(_) => vec![
                "Check the syntax of config.toml in the data directory",
            ],
            _ => vec![],
        }
    }

    /// Create a NotFound error for a task local-id
    pub fn task_not_found(task_id: u64) -> Self {
        TasklaneError::NotFound(format!("Task {} not found", task_id))
    }

    /// Create a NotFound error for a pending conflict
    pub fn conflict_not_found(task_uid: &str) -> Self {
        TasklaneError::NotFound(format!("no pending conflict for task uid '{}'", task_uid))
    }

    /// Create a DbBusy error with lock details
    pub fn database_locked(details: Option<&str>) -> Self {
        let msg = match details {
            Some(d) => format!("Database is locked ({})", d),
            None => "Database is locked by another process".to_string(),
        };
        TasklaneError::DbBusy(msg)
    }
}
