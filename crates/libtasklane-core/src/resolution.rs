//! Local writes that settle one conflict.
//!
//! A resolver stages row writes, queue changes and the baseline in a
//! `ResolutionPlan`. `commit` applies them and marks the conflict resolved in
//! one sled transaction over every tree involved. A commit that fails writes
//! nothing: the conflict stays pending and the plan can be rebuilt and
//! retried.

use chrono::Utc;
use sled::transaction::{ConflictableTransactionError, TransactionError};
use sled::Transactional;
use tracing::info;

use crate::error::TasklaneError;
use crate::store::{decode_u64, id_key, Database, QUEUE_LEN_KEY};
use crate::types::{
    ConflictStatus, LocalId, OperationType, ResolutionStrategy, SyncBaseline, SyncConflict, SyncOperation, Task,
};

fn abort<E: Into<TasklaneError>>(e: E) -> ConflictableTransactionError<TasklaneError> {
    ConflictableTransactionError::Abort(e.into())
}

#[derive(Debug, Clone)]
enum BaselineChange {
    Keep,
    Set(SyncBaseline),
    Remove,
}

#[derive(Debug, Clone)]
pub struct ResolutionPlan {
    db: Database,
    task_uid: String,
    strategy: ResolutionStrategy,
    /// Local row for the uid when the plan was built
    expected: Option<Task>,
    writes: Vec<Task>,
    delete: Option<LocalId>,
    dropped: Vec<u64>,
    enqueued: Vec<SyncOperation>,
    baseline: BaselineChange,
}

impl ResolutionPlan {
    /// Start an empty plan. `current` is the local row for the uid; the commit
    /// aborts if that row changes in the meantime.
    pub fn new(db: &Database, task_uid: &str, strategy: ResolutionStrategy, current: Option<&Task>) -> Self {
        Self {
            db: db.clone(),
            task_uid: task_uid.to_string(),
            strategy,
            expected: current.cloned(),
            writes: Vec::new(),
            delete: None,
            dropped: Vec::new(),
            enqueued: Vec::new(),
            baseline: BaselineChange::Keep,
        }
    }

    pub fn task_uid(&self) -> &str {
        &self.task_uid
    }

    pub fn strategy(&self) -> ResolutionStrategy {
        self.strategy
    }

    /// Stage a row write that keeps the task's timestamps. A task without a
    /// local id gets one now.
    pub fn put_task(&mut self, mut task: Task) -> Result<Task, TasklaneError> {
        if task.id == 0 {
            task.id = self.db.next_id()?;
        }
        self.writes.push(task.clone());
        Ok(task)
    }

    pub fn delete_task(&mut self, id: LocalId) {
        self.delete = Some(id);
    }

    /// Stage removal of queued operations
    pub fn drop_operations(&mut self, ops: &[SyncOperation]) {
        self.dropped.extend(ops.iter().map(|op| op.id));
    }

    /// Stage one new queue entry for `task`
    pub fn enqueue(&mut self, task: &Task, operation_type: OperationType) -> Result<(), TasklaneError> {
        self.enqueued.push(SyncOperation {
            id: self.db.next_id()?,
            task_id: task.id,
            task_uid: task.uid.clone(),
            task_summary: task.summary.clone(),
            list_id: task.list_id.clone(),
            operation_type,
            retry_count: 0,
            last_attempt_at: None,
            created_at: Utc::now(),
        });
        Ok(())
    }

    pub fn set_baseline(&mut self, baseline: SyncBaseline) {
        self.baseline = BaselineChange::Set(baseline);
    }

    pub fn remove_baseline(&mut self) {
        self.baseline = BaselineChange::Remove;
    }

    /// Number of queue entries the plan adds
    pub fn enqueued(&self) -> usize {
        self.enqueued.len()
    }

    /// Apply every staged change and mark the conflict resolved, all or nothing.
    ///
    /// Fails with `NotFound` if the uid has no pending conflict and with
    /// `Conflict` if the local row changed since the plan was built.
    pub fn commit(self) -> Result<SyncConflict, TasklaneError> {
        let now = Utc::now();
        let uid = self.task_uid.as_bytes();
        let db = &self.db;

        let result: Result<SyncConflict, TransactionError<TasklaneError>> = (
            &db.tasks,
            &db.task_uids,
            &db.queue,
            &db.metadata,
            &db.conflicts,
            &db.conflict_pending,
            &db.baselines,
        )
            .transaction(|(tasks, uids, queue, meta, rows, pending, baselines)| {
                let key = pending
                    .get(uid)?
                    .ok_or_else(|| abort(TasklaneError::conflict_not_found(&self.task_uid)))?;
                let bytes = rows.get(&key)?.ok_or_else(|| {
                    abort(TasklaneError::Internal(format!(
                        "pending index points at missing conflict {}",
                        decode_u64(&key)
                    )))
                })?;
                let mut conflict: SyncConflict = serde_json::from_slice(&bytes).map_err(abort)?;

                let current: Option<Task> = match uids.get(uid)? {
                    Some(id) => match tasks.get(&id)? {
                        Some(row) => Some(serde_json::from_slice(&row).map_err(abort)?),
                        None => None,
                    },
                    None => None,
                };
                if current != self.expected {
                    return Err(abort(TasklaneError::Conflict(format!(
                        "task '{}' changed while its conflict was being resolved",
                        self.task_uid
                    ))));
                }

                if let Some(id) = self.delete {
                    if let Some(row) = tasks.remove(&id_key(id)[..])? {
                        let removed: Task = serde_json::from_slice(&row).map_err(abort)?;
                        if !removed.uid.is_empty() {
                            uids.remove(removed.uid.as_bytes())?;
                        }
                    }
                }

                for task in &self.writes {
                    let row_key = id_key(task.id);
                    let previous: Option<Task> = match tasks.get(&row_key[..])? {
                        Some(row) => Some(serde_json::from_slice(&row).map_err(abort)?),
                        None => None,
                    };
                    tasks.insert(&row_key[..], serde_json::to_vec(task).map_err(abort)?)?;
                    if let Some(prev) = previous {
                        if !prev.uid.is_empty() && prev.uid != task.uid {
                            uids.remove(prev.uid.as_bytes())?;
                        }
                    }
                    if !task.uid.is_empty() {
                        uids.insert(task.uid.as_bytes(), &row_key[..])?;
                    }
                }

                let mut len = meta.get(QUEUE_LEN_KEY)?.map(|b| decode_u64(&b)).unwrap_or(0);
                for id in &self.dropped {
                    if queue.remove(&id_key(*id)[..])?.is_some() {
                        len = len.saturating_sub(1);
                    }
                }
                for op in &self.enqueued {
                    queue.insert(&id_key(op.id)[..], serde_json::to_vec(op).map_err(abort)?)?;
                    len += 1;
                }
                meta.insert(QUEUE_LEN_KEY, &len.to_be_bytes()[..])?;

                match &self.baseline {
                    BaselineChange::Keep => {}
                    BaselineChange::Set(baseline) => {
                        baselines.insert(uid, serde_json::to_vec(baseline).map_err(abort)?)?;
                    }
                    BaselineChange::Remove => {
                        baselines.remove(uid)?;
                    }
                }

                conflict.status = ConflictStatus::Resolved;
                conflict.resolution = Some(self.strategy);
                conflict.resolved_at = Some(now);
                rows.insert(&key, serde_json::to_vec(&conflict).map_err(abort)?)?;
                pending.remove(uid)?;
                Ok(conflict)
            });
        let conflict = result?;

        info!(
            uid = %self.task_uid,
            strategy = %self.strategy,
            writes = self.writes.len(),
            enqueued = self.enqueued.len(),
            dropped = self.dropped.len(),
            "conflict resolution committed"
        );
        Ok(conflict)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{LocalIdIndex, TaskStore};
    use crate::types::NewConflict;
    use tempfile::tempdir;

    fn setup() -> (tempfile::TempDir, Database, Task) {
        let dir = tempdir().unwrap();
        let db = Database::open(&dir.path().join("db")).unwrap();
        let task = db.task_store().put_task(Task { uid: "abc".to_string(), ..Task::new("L1", "mine") }).unwrap();
        db.queue()
            .queue_operation(task.id, &task.uid, &task.summary, &task.list_id, OperationType::Update)
            .unwrap();
        db.conflict_store()
            .add_conflict(NewConflict {
                task_uid: "abc".to_string(),
                task_summary: "mine".to_string(),
                list_id: "L1".to_string(),
                local_version: serde_json::to_string(&task).unwrap(),
                remote_version: "{}".to_string(),
                local_modified: task.modified,
                remote_modified: Utc::now(),
            })
            .unwrap();
        (dir, db, task)
    }

    fn theirs(task: &Task) -> Task {
        Task { summary: "theirs".to_string(), ..task.clone() }
    }

    #[test]
    fn test_commit_applies_everything() {
        let (_dir, db, task) = setup();
        let queued = db.queue().pending_operations().unwrap();

        let mut plan = ResolutionPlan::new(&db, "abc", ResolutionStrategy::ServerWins, Some(&task));
        plan.drop_operations(&queued);
        plan.put_task(theirs(&task)).unwrap();
        let copy = plan.put_task(Task::new("L1", "copy")).unwrap();
        plan.enqueue(&copy, OperationType::Create).unwrap();
        plan.set_baseline(SyncBaseline {
            remote_modified: Utc::now(),
            local_modified: task.modified,
            synced_at: Utc::now(),
        });
        assert_eq!(plan.enqueued(), 1);

        let conflict = plan.commit().unwrap();
        assert_eq!(conflict.status, ConflictStatus::Resolved);
        assert_eq!(conflict.resolution, Some(ResolutionStrategy::ServerWins));

        let store = db.task_store();
        assert_eq!(store.task_by_uid("abc").unwrap().unwrap().summary, "theirs");
        assert_eq!(store.get_task(copy.id).unwrap().unwrap().summary, "copy");
        let ops = db.queue().pending_operations().unwrap();
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].operation_type, OperationType::Create);
        assert_eq!(db.queue().pending_count().unwrap(), 1);
        assert!(db.metadata().baseline("abc").unwrap().is_some());
        assert!(!db.conflict_store().has_pending("abc").unwrap());
    }

    #[test]
    fn test_changed_row_aborts_without_writes() {
        let (_dir, db, task) = setup();

        let mut plan = ResolutionPlan::new(&db, "abc", ResolutionStrategy::KeepBoth, Some(&task));
        let copy = plan.put_task(Task::new("L1", "copy")).unwrap();
        plan.enqueue(&copy, OperationType::Create).unwrap();

        // Edited locally after the plan was built
        db.task_store().update_task(Task { summary: "edited".to_string(), ..task.clone() }).unwrap();

        assert!(matches!(plan.commit().unwrap_err(), TasklaneError::Conflict(_)));
        assert!(db.task_store().get_task(copy.id).unwrap().is_none());
        assert_eq!(db.queue().pending_count().unwrap(), 1);
        assert!(db.conflict_store().has_pending("abc").unwrap());
    }

    #[test]
    fn test_commit_without_pending_conflict() {
        let (_dir, db, task) = setup();
        db.conflict_store().mark_resolved("abc", ResolutionStrategy::LocalWins).unwrap();

        let mut plan = ResolutionPlan::new(&db, "abc", ResolutionStrategy::ServerWins, Some(&task));
        plan.delete_task(task.id);
        plan.remove_baseline();

        assert!(matches!(plan.commit().unwrap_err(), TasklaneError::NotFound(_)));
        assert!(db.task_store().get_task(task.id).unwrap().is_some());
    }
}
