//! TaskStore wrapper that records sync intent for every mutation.

use tracing::warn;

use crate::error::TasklaneError;
use crate::queue::{OperationSink, SyncQueue};
use crate::store::{LocalIdIndex, StorageMaintenance, TaskStore};
use crate::types::{LocalId, OperationType, Task, TaskFilter};

/// Wraps a TaskStore; each successful mutation enqueues one sync operation.
///
/// The mutation is applied first. If enqueueing then fails the mutation is
/// kept and the failure is only logged, so a task can change locally without
/// a matching queue entry.
pub struct SyncCoordinator<S: TaskStore, Q: OperationSink = SyncQueue> {
    inner: S,
    queue: Q,
}

impl<S: TaskStore, Q: OperationSink> SyncCoordinator<S, Q> {
    pub fn new(inner: S, queue: Q) -> Self {
        Self { inner, queue }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    pub fn queue(&self) -> &Q {
        &self.queue
    }

    /// The local-id index of the wrapped store
    pub fn require_local_ids(&self) -> Result<&dyn LocalIdIndex, TasklaneError> {
        self.inner
            .local_ids()
            .ok_or_else(|| TasklaneError::UnsupportedCapability("local id index".to_string()))
    }

    /// The maintenance capability of the wrapped store
    pub fn require_maintenance(&self) -> Result<&dyn StorageMaintenance, TasklaneError> {
        self.inner
            .maintenance()
            .ok_or_else(|| TasklaneError::UnsupportedCapability("storage maintenance".to_string()))
    }

    fn enqueue(&self, task: &Task, op: OperationType) {
        if let Err(e) = self.queue.record(task, op) {
            warn!(task_id = task.id, op = %op, error = %e, "failed to queue sync operation");
        }
    }
}

impl<S: TaskStore, Q: OperationSink> TaskStore for SyncCoordinator<S, Q> {
    fn create_task(&self, task: Task) -> Result<Task, TasklaneError> {
        let created = self.inner.create_task(task)?;
        self.enqueue(&created, OperationType::Create);
        Ok(created)
    }

    fn update_task(&self, task: Task) -> Result<Task, TasklaneError> {
        let updated = self.inner.update_task(task)?;
        self.enqueue(&updated, OperationType::Update);
        Ok(updated)
    }

    fn delete_task(&self, id: LocalId) -> Result<Task, TasklaneError> {
        let deleted = self.inner.delete_task(id)?;
        self.enqueue(&deleted, OperationType::Delete);
        Ok(deleted)
    }

    fn get_task(&self, id: LocalId) -> Result<Option<Task>, TasklaneError> {
        self.inner.get_task(id)
    }

    fn list_tasks(&self, filter: &TaskFilter) -> Result<Vec<Task>, TasklaneError> {
        self.inner.list_tasks(filter)
    }

    fn close(&self) -> Result<(), TasklaneError> {
        if let Err(e) = self.queue.close() {
            warn!(error = %e, "failed to close sync queue");
        }
        self.inner.close()
    }

    fn local_ids(&self) -> Option<&dyn LocalIdIndex> {
        self.inner.local_ids()
    }

    fn maintenance(&self) -> Option<&dyn StorageMaintenance> {
        self.inner.maintenance()
    }
}
