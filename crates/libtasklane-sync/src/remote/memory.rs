use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use libtasklane_core::{Task, TasklaneError};

use super::{new_uid, remote_error, RemoteBackend, RemoteTask};

/// In-process remote: a map of uid to task
pub struct MemoryRemote {
    name: String,
    tasks: Mutex<BTreeMap<String, RemoteTask>>,
    reachable: AtomicBool,
    latency: Mutex<Option<Duration>>,
}

impl MemoryRemote {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            tasks: Mutex::new(BTreeMap::new()),
            reachable: AtomicBool::new(true),
            latency: Mutex::new(None),
        }
    }

    /// Simulate a slow link: every call sleeps this long
    pub fn with_latency(self, latency: Duration) -> Self {
        self.set_latency(Some(latency));
        self
    }

    pub fn set_latency(&self, latency: Option<Duration>) {
        if let Ok(mut guard) = self.latency.lock() {
            *guard = latency;
        }
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    /// Store a task as if another client had written it
    pub fn put_remote(&self, task: RemoteTask) -> Result<(), TasklaneError> {
        self.lock()?.insert(task.uid.clone(), task);
        Ok(())
    }

    pub fn get_remote(&self, uid: &str) -> Result<Option<RemoteTask>, TasklaneError> {
        Ok(self.lock()?.get(uid).cloned())
    }

    /// Live (non-tombstoned) tasks
    pub fn live_tasks(&self) -> Result<Vec<RemoteTask>, TasklaneError> {
        Ok(self.lock()?.values().filter(|t| !t.deleted).cloned().collect())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, BTreeMap<String, RemoteTask>>, TasklaneError> {
        self.tasks
            .lock()
            .map_err(|_| remote_error(&self.name, "state poisoned"))
    }

    fn enter(&self) -> Result<(), TasklaneError> {
        let latency = self.latency.lock().ok().and_then(|guard| *guard);
        if let Some(latency) = latency {
            std::thread::sleep(latency);
        }
        if !self.reachable.load(Ordering::SeqCst) {
            return Err(remote_error(&self.name, "unreachable"));
        }
        Ok(())
    }
}

impl RemoteBackend for MemoryRemote {
    fn name(&self) -> &str {
        &self.name
    }

    fn check_connection(&self) -> Result<(), TasklaneError> {
        if !self.reachable.load(Ordering::SeqCst) {
            return Err(remote_error(&self.name, "unreachable"));
        }
        Ok(())
    }

    fn fetch_changes(&self, since: Option<DateTime<Utc>>) -> Result<Vec<RemoteTask>, TasklaneError> {
        self.enter()?;
        Ok(self
            .lock()?
            .values()
            .filter(|t| since.map_or(true, |since| t.modified > since))
            .cloned()
            .collect())
    }

    fn push_create(&self, task: &Task) -> Result<RemoteTask, TasklaneError> {
        self.enter()?;
        let remote = RemoteTask::from_task(task, &new_uid(), Utc::now());
        self.lock()?.insert(remote.uid.clone(), remote.clone());
        Ok(remote)
    }

    fn push_update(&self, task: &Task) -> Result<RemoteTask, TasklaneError> {
        self.enter()?;
        let mut tasks = self.lock()?;
        if !tasks.contains_key(&task.uid) {
            return Err(remote_error(&self.name, format!("unknown uid '{}'", task.uid)));
        }
        let remote = RemoteTask::from_task(task, &task.uid, Utc::now());
        tasks.insert(remote.uid.clone(), remote.clone());
        Ok(remote)
    }

    fn push_delete(&self, uid: &str) -> Result<(), TasklaneError> {
        self.enter()?;
        if let Some(existing) = self.lock()?.get_mut(uid) {
            existing.deleted = true;
            existing.modified = Utc::now();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_update_delete() {
        let remote = MemoryRemote::new("mem");
        let mut task = Task::new("L1", "Buy milk");

        let created = remote.push_create(&task).unwrap();
        assert!(!created.uid.is_empty());

        task.uid = created.uid.clone();
        task.summary = "Buy oat milk".to_string();
        remote.push_update(&task).unwrap();
        assert_eq!(remote.get_remote(&task.uid).unwrap().unwrap().summary, "Buy oat milk");

        remote.push_delete(&task.uid).unwrap();
        assert!(remote.get_remote(&task.uid).unwrap().unwrap().deleted);
        assert!(remote.live_tasks().unwrap().is_empty());
    }

    #[test]
    fn test_fetch_since() {
        let remote = MemoryRemote::new("mem");
        let before = Utc::now() - chrono::Duration::seconds(1);
        remote.push_create(&Task::new("L1", "a")).unwrap();

        assert_eq!(remote.fetch_changes(Some(before)).unwrap().len(), 1);
        assert!(remote.fetch_changes(Some(Utc::now() + chrono::Duration::seconds(1))).unwrap().is_empty());
    }

    #[test]
    fn test_unreachable() {
        let remote = MemoryRemote::new("mem");
        remote.set_reachable(false);
        assert!(matches!(remote.check_connection().unwrap_err(), TasklaneError::Remote(_)));
        assert!(remote.push_create(&Task::new("L1", "a")).is_err());
    }

    #[test]
    fn test_update_unknown_uid() {
        let remote = MemoryRemote::new("mem");
        let mut task = Task::new("L1", "a");
        task.uid = "missing".to_string();
        assert!(remote.push_update(&task).is_err());
    }
}
