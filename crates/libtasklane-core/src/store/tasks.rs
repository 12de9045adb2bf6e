use chrono::Utc;
use tracing::debug;

use super::{decode_u64, id_key, Database, DbStats};
use crate::error::TasklaneError;
use crate::types::{LocalId, Task, TaskFilter};

/// Task persistence used by the coordinator and the daemon
pub trait TaskStore {
    /// Persist a new task; the store assigns its local id
    fn create_task(&self, task: Task) -> Result<Task, TasklaneError>;

    /// Replace an existing task, stamping `modified`
    fn update_task(&self, task: Task) -> Result<Task, TasklaneError>;

    /// Remove a task, returning the removed row
    fn delete_task(&self, id: LocalId) -> Result<Task, TasklaneError>;

    fn get_task(&self, id: LocalId) -> Result<Option<Task>, TasklaneError>;

    fn list_tasks(&self, filter: &TaskFilter) -> Result<Vec<Task>, TasklaneError>;

    fn close(&self) -> Result<(), TasklaneError>;

    /// Lookup by remote uid, when the store keeps such an index
    fn local_ids(&self) -> Option<&dyn LocalIdIndex> {
        None
    }

    /// Storage maintenance, when the store supports it
    fn maintenance(&self) -> Option<&dyn StorageMaintenance> {
        None
    }
}

/// Optional capability: mapping between remote uids and local ids
pub trait LocalIdIndex {
    fn local_id_for_uid(&self, uid: &str) -> Result<Option<LocalId>, TasklaneError>;

    fn task_by_uid(&self, uid: &str) -> Result<Option<Task>, TasklaneError>;
}

/// Optional capability: inspection and repair of the backing storage
pub trait StorageMaintenance {
    fn stats(&self) -> Result<DbStats, TasklaneError>;

    /// Rebuild the uid index from task rows, returning the indexed count
    fn rebuild_uid_index(&self) -> Result<usize, TasklaneError>;

    /// Flush to disk, returning the bytes written
    fn flush(&self) -> Result<usize, TasklaneError>;
}

/// TaskStore backed by the `tasks` and `task_uids` sled trees
#[derive(Debug, Clone)]
pub struct SledTaskStore {
    db: Database,
}

impl SledTaskStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Write a task row as-is, keeping its timestamps.
    ///
    /// Used when applying remote state; assigns a local id if the task has none.
    pub fn put_task(&self, mut task: Task) -> Result<Task, TasklaneError> {
        if task.id == 0 {
            task.id = self.db.next_id()?;
        }
        let previous = self.get_task(task.id)?;
        self.write(&task, previous.as_ref())?;
        Ok(task)
    }

    /// Record the uid the remote assigned to a local task
    pub fn assign_uid(&self, id: LocalId, uid: &str) -> Result<Task, TasklaneError> {
        let previous = self
            .get_task(id)?
            .ok_or_else(|| TasklaneError::task_not_found(id))?;
        let mut task = previous.clone();
        task.uid = uid.to_string();
        self.write(&task, Some(&previous))?;
        debug!(task_id = id, uid, "assigned remote uid");
        Ok(task)
    }

    fn write(&self, task: &Task, previous: Option<&Task>) -> Result<(), TasklaneError> {
        let json = serde_json::to_vec(task)?;
        self.db.tasks.insert(id_key(task.id), json)?;

        if let Some(prev) = previous {
            if !prev.uid.is_empty() && prev.uid != task.uid {
                self.db.task_uids.remove(prev.uid.as_bytes())?;
            }
        }
        if !task.uid.is_empty() {
            self.db.task_uids.insert(task.uid.as_bytes(), &id_key(task.id)[..])?;
        }
        Ok(())
    }
}

impl TaskStore for SledTaskStore {
    fn create_task(&self, mut task: Task) -> Result<Task, TasklaneError> {
        if task.summary.trim().is_empty() {
            return Err(TasklaneError::InvalidArgs("task summary must not be empty".to_string()));
        }
        task.id = self.db.next_id()?;
        let now = Utc::now();
        task.created = now;
        task.modified = now;
        self.write(&task, None)?;
        Ok(task)
    }

    fn update_task(&self, mut task: Task) -> Result<Task, TasklaneError> {
        let previous = self
            .get_task(task.id)?
            .ok_or_else(|| TasklaneError::task_not_found(task.id))?;
        task.created = previous.created;
        task.modified = Utc::now();
        self.write(&task, Some(&previous))?;
        Ok(task)
    }

    fn delete_task(&self, id: LocalId) -> Result<Task, TasklaneError> {
        let bytes = self
            .db
            .tasks
            .remove(id_key(id))?
            .ok_or_else(|| TasklaneError::task_not_found(id))?;
        let task: Task = serde_json::from_slice(&bytes)?;
        if !task.uid.is_empty() {
            self.db.task_uids.remove(task.uid.as_bytes())?;
        }
        Ok(task)
    }

    fn get_task(&self, id: LocalId) -> Result<Option<Task>, TasklaneError> {
        match self.db.tasks.get(id_key(id))? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    fn list_tasks(&self, filter: &TaskFilter) -> Result<Vec<Task>, TasklaneError> {
        let mut tasks = Vec::new();
        for result in self.db.tasks.iter() {
            let (_, value) = result?;
            let task: Task = serde_json::from_slice(&value)?;
            if filter.matches(&task) {
                tasks.push(task);
            }
        }
        // Keys are big-endian ids, so iteration is already in id order
        Ok(tasks)
    }

    fn close(&self) -> Result<(), TasklaneError> {
        self.db.tasks.flush()?;
        self.db.task_uids.flush()?;
        Ok(())
    }

    fn local_ids(&self) -> Option<&dyn LocalIdIndex> {
        Some(self)
    }

    fn maintenance(&self) -> Option<&dyn StorageMaintenance> {
        Some(self)
    }
}

impl LocalIdIndex for SledTaskStore {
    fn local_id_for_uid(&self, uid: &str) -> Result<Option<LocalId>, TasklaneError> {
        if uid.is_empty() {
            return Ok(None);
        }
        Ok(self.db.task_uids.get(uid.as_bytes())?.map(|bytes| decode_u64(&bytes)))
    }

    fn task_by_uid(&self, uid: &str) -> Result<Option<Task>, TasklaneError> {
        match self.local_id_for_uid(uid)? {
            Some(id) => self.get_task(id),
            None => Ok(None),
        }
    }
}

impl StorageMaintenance for SledTaskStore {
    fn stats(&self) -> Result<DbStats, TasklaneError> {
        self.db.stats()
    }

    fn rebuild_uid_index(&self) -> Result<usize, TasklaneError> {
        self.db.task_uids.clear()?;
        let mut indexed = 0;
        for result in self.db.tasks.iter() {
            let (key, value) = result?;
            let task: Task = serde_json::from_slice(&value)?;
            if !task.uid.is_empty() {
                self.db.task_uids.insert(task.uid.as_bytes(), key)?;
                indexed += 1;
            }
        }
        Ok(indexed)
    }

    fn flush(&self) -> Result<usize, TasklaneError> {
        self.db.flush()
    }
}
