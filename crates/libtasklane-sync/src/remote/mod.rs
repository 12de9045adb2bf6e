//! Remote backends
//!
//! The wire protocol of a real task server is out of scope; backends only
//! have to honor the fetch/push contract below. Two are provided: a JSON
//! file in a directory (shared folder, mounted drive) and an in-process map.

mod directory;
mod memory;

pub use directory::DirectoryRemote;
pub use memory::MemoryRemote;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use libtasklane_core::{BackendConfig, BackendKind, LocalId, Task, TaskStatus, TasklaneError};
use serde::{Deserialize, Serialize};

/// A task as the remote side stores it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteTask {
    pub uid: String,
    pub list_id: String,
    pub summary: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub status: TaskStatus,
    #[serde(default)]
    pub priority: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub due: Option<DateTime<Utc>>,
    /// Server-side modification time
    pub modified: DateTime<Utc>,
    /// Tombstone for a remote deletion
    #[serde(default)]
    pub deleted: bool,
}

impl RemoteTask {
    /// Snapshot a local task under the given uid
    pub fn from_task(task: &Task, uid: &str, modified: DateTime<Utc>) -> Self {
        Self {
            uid: uid.to_string(),
            list_id: task.list_id.clone(),
            summary: task.summary.clone(),
            description: task.description.clone(),
            status: task.status,
            priority: task.priority,
            due: task.due,
            modified,
            deleted: false,
        }
    }

    /// Local row carrying this remote state
    pub fn to_local(&self, id: LocalId, created: DateTime<Utc>) -> Task {
        Task {
            id,
            uid: self.uid.clone(),
            list_id: self.list_id.clone(),
            summary: self.summary.clone(),
            description: self.description.clone(),
            status: self.status,
            priority: self.priority,
            due: self.due,
            created,
            modified: self.modified,
        }
    }

    /// Same user-visible content as a local task
    pub fn same_content(&self, task: &Task) -> bool {
        !self.deleted
            && self.list_id == task.list_id
            && self.summary == task.summary
            && self.description == task.description
            && self.status == task.status
            && self.priority == task.priority
            && self.due == task.due
    }
}

/// Contract a remote endpoint has to satisfy during a daemon tick.
///
/// Calls are blocking; the daemon runs them off the async executor.
pub trait RemoteBackend: Send + Sync {
    fn name(&self) -> &str;

    /// Cheap reachability probe
    fn check_connection(&self) -> Result<(), TasklaneError>;

    /// Tasks changed (or tombstoned) after `since`; everything if `None`
    fn fetch_changes(&self, since: Option<DateTime<Utc>>) -> Result<Vec<RemoteTask>, TasklaneError>;

    /// Create a task remotely; the returned snapshot carries the new uid
    fn push_create(&self, task: &Task) -> Result<RemoteTask, TasklaneError>;

    /// Overwrite the remote task identified by `task.uid`
    fn push_update(&self, task: &Task) -> Result<RemoteTask, TasklaneError>;

    fn push_delete(&self, uid: &str) -> Result<(), TasklaneError>;
}

/// Instantiate a configured backend
pub fn open_backend(config: &BackendConfig) -> Result<Arc<dyn RemoteBackend>, TasklaneError> {
    match config.kind {
        BackendKind::Directory => {
            let path = config.path.as_ref().ok_or_else(|| {
                TasklaneError::InvalidArgs(format!("directory backend '{}' requires a path", config.name))
            })?;
            Ok(Arc::new(DirectoryRemote::new(&config.name, path)))
        }
        BackendKind::Memory => Ok(Arc::new(MemoryRemote::new(&config.name))),
    }
}

pub(crate) fn new_uid() -> String {
    uuid::Uuid::new_v4().to_string()
}

pub(crate) fn remote_error(backend: &str, msg: impl std::fmt::Display) -> TasklaneError {
    TasklaneError::Remote(format!("{}: {}", backend, msg))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_to_local_keeps_remote_fields() {
        let now = Utc::now();
        let task = Task::new("L1", "Buy milk").with_priority(2);
        let remote = RemoteTask::from_task(&task, "u1", now);

        let local = remote.to_local(7, task.created);
        assert_eq!(local.id, 7);
        assert_eq!(local.uid, "u1");
        assert_eq!(local.modified, now);
        assert!(remote.same_content(&local));
    }

    #[test]
    fn test_open_backend_requires_path() {
        let config = BackendConfig {
            name: "home".to_string(),
            kind: BackendKind::Directory,
            path: None,
        };
        assert!(open_backend(&config).is_err());

        let config = BackendConfig { kind: BackendKind::Memory, ..config };
        assert_eq!(open_backend(&config).unwrap().name(), "home");
    }
}
