use std::collections::BTreeMap;
use std::fs::File;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use fs2::FileExt;
use libtasklane_core::{Task, TasklaneError};
use tracing::debug;

use super::{new_uid, remote_error, RemoteBackend, RemoteTask};

const TASKS_FILE: &str = "tasks.json";
const LOCK_FILE: &str = "tasks.lock";

/// Remote kept as `tasks.json` in a directory, guarded by an fs2 lock
/// so several machines sharing the folder serialize their writes.
pub struct DirectoryRemote {
    name: String,
    root: PathBuf,
}

impl DirectoryRemote {
    pub fn new(name: &str, root: &Path) -> Self {
        Self {
            name: name.to_string(),
            root: root.to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn with_state<T>(
        &self,
        f: impl FnOnce(&mut BTreeMap<String, RemoteTask>) -> Result<(T, bool), TasklaneError>,
    ) -> Result<T, TasklaneError> {
        self.check_connection()?;

        let lock_file = File::create(self.root.join(LOCK_FILE))?;
        lock_file
            .lock_exclusive()
            .map_err(|e| remote_error(&self.name, format!("lock failed: {}", e)))?;

        let path = self.root.join(TASKS_FILE);
        let mut state: BTreeMap<String, RemoteTask> = match std::fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };

        let (value, dirty) = f(&mut state)?;
        if dirty {
            let tmp = path.with_extension("json.tmp");
            std::fs::write(&tmp, serde_json::to_vec_pretty(&state)?)?;
            std::fs::rename(&tmp, &path)?;
            debug!(backend = %self.name, tasks = state.len(), "wrote remote state");
        }
        // flock is released when lock_file drops
        Ok(value)
    }
}

impl RemoteBackend for DirectoryRemote {
    fn name(&self) -> &str {
        &self.name
    }

    fn check_connection(&self) -> Result<(), TasklaneError> {
        if !self.root.is_dir() {
            return Err(remote_error(
                &self.name,
                format!("directory {} is not reachable", self.root.display()),
            ));
        }
        Ok(())
    }

    fn fetch_changes(&self, since: Option<DateTime<Utc>>) -> Result<Vec<RemoteTask>, TasklaneError> {
        self.with_state(|state| {
            let changed = state
                .values()
                .filter(|t| since.map_or(true, |since| t.modified > since))
                .cloned()
                .collect();
            Ok((changed, false))
        })
    }

    fn push_create(&self, task: &Task) -> Result<RemoteTask, TasklaneError> {
        self.with_state(|state| {
            let remote = RemoteTask::from_task(task, &new_uid(), Utc::now());
            state.insert(remote.uid.clone(), remote.clone());
            Ok((remote, true))
        })
    }

    fn push_update(&self, task: &Task) -> Result<RemoteTask, TasklaneError> {
        let name = self.name.clone();
        self.with_state(|state| {
            if !state.contains_key(&task.uid) {
                return Err(remote_error(&name, format!("unknown uid '{}'", task.uid)));
            }
            let remote = RemoteTask::from_task(task, &task.uid, Utc::now());
            state.insert(remote.uid.clone(), remote.clone());
            Ok((remote, true))
        })
    }

    fn push_delete(&self, uid: &str) -> Result<(), TasklaneError> {
        self.with_state(|state| match state.get_mut(uid) {
            Some(existing) => {
                existing.deleted = true;
                existing.modified = Utc::now();
                Ok(((), true))
            }
            None => Ok(((), false)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_missing_directory_unreachable() {
        let dir = tempdir().unwrap();
        let remote = DirectoryRemote::new("share", &dir.path().join("nope"));
        assert!(matches!(remote.check_connection().unwrap_err(), TasklaneError::Remote(_)));
        assert!(remote.fetch_changes(None).is_err());
    }

    #[test]
    fn test_state_persists_across_instances() {
        let dir = tempdir().unwrap();
        let remote = DirectoryRemote::new("share", dir.path());

        assert!(remote.fetch_changes(None).unwrap().is_empty());
        let created = remote.push_create(&Task::new("L1", "Water plants")).unwrap();

        let other = DirectoryRemote::new("share", dir.path());
        let fetched = other.fetch_changes(None).unwrap();
        assert_eq!(fetched.len(), 1);
        assert_eq!(fetched[0].uid, created.uid);
        assert_eq!(fetched[0].summary, "Water plants");

        other.push_delete(&created.uid).unwrap();
        assert!(remote.fetch_changes(None).unwrap()[0].deleted);
    }
}
