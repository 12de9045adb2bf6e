//! Sync daemon error types

use libtasklane_core::TasklaneError;
use thiserror::Error;

/// Errors raised by the daemon and its collaborators
#[derive(Error, Debug)]
pub enum DaemonError {
    /// Store, queue or remote failure
    #[error(transparent)]
    Core(#[from] TasklaneError),

    /// Another live daemon owns the data directory
    #[error("Daemon already running as process {pid} (lease expires in {expires_in_ms}ms)")]
    LockHeld { pid: u32, expires_in_ms: u64 },

    /// The marker was removed or taken over while this daemon ran
    #[error("Daemon marker lost (now owned by {})", .owner.as_deref().unwrap_or("nobody"))]
    LockLost { owner: Option<String> },

    /// Notification delivery failed
    #[error("Notification failed: {0}")]
    Notification(String),

    /// Worker task panicked or was cancelled
    #[error("Worker task failed: {0}")]
    Worker(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl DaemonError {
    pub fn error_code(&self) -> &'static str {
        match self {
            DaemonError::Core(e) => e.error_code(),
            DaemonError::LockHeld { .. } => "daemon_running",
            DaemonError::LockLost { .. } => "daemon_marker_lost",
            DaemonError::Notification(_) => "notification_error",
            DaemonError::Worker(_) => "internal_error",
            DaemonError::Io(_) => "io_error",
            DaemonError::Json(_) => "internal_error",
        }
    }
}

impl From<tokio::task::JoinError> for DaemonError {
    fn from(e: tokio::task::JoinError) -> Self {
        DaemonError::Worker(e.to_string())
    }
}
