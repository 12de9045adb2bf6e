//! Applies a resolution strategy to local state and closes the conflict.
//!
//! Every strategy only stages its changes in a `ResolutionPlan`; the plan is
//! committed together with marking the conflict resolved, so a failed
//! resolution leaves no partial writes behind and can simply be retried.

use chrono::Utc;
use libtasklane_core::{
    ConflictStore, Database, LocalIdIndex, OperationType, ResolutionPlan, ResolutionStrategy,
    SledTaskStore, SyncBaseline, SyncConflict, SyncQueue, Task, TasklaneError,
};
use serde::Serialize;
use tracing::info;

use crate::remote::RemoteTask;

/// What a resolution did to local state
#[derive(Debug, Clone, Serialize)]
pub struct ResolutionOutcome {
    pub conflict: SyncConflict,
    /// The local row for the uid after resolution (None if deleted)
    pub task: Option<Task>,
    /// Remote copy inserted by `keep_both`
    pub copy: Option<Task>,
    /// Sync operations enqueued
    pub enqueued: usize,
}

/// A resolution computed against the current local state, not yet written
pub struct PreparedResolution {
    plan: ResolutionPlan,
    task: Option<Task>,
    copy: Option<Task>,
}

impl PreparedResolution {
    /// Write everything at once. Fails with `Conflict`, changing nothing, if
    /// the local row was edited after `prepare`.
    pub fn commit(self) -> Result<ResolutionOutcome, TasklaneError> {
        let enqueued = self.plan.enqueued();
        let uid = self.plan.task_uid().to_string();
        let conflict = self.plan.commit()?;
        info!(uid = %uid, strategy = ?conflict.resolution, "applied conflict resolution");

        Ok(ResolutionOutcome {
            conflict,
            task: self.task,
            copy: self.copy,
            enqueued,
        })
    }
}

pub struct ConflictResolver {
    db: Database,
    store: SledTaskStore,
    queue: SyncQueue,
    conflicts: ConflictStore,
}

impl ConflictResolver {
    pub fn new(db: &Database) -> Self {
        Self {
            db: db.clone(),
            store: db.task_store(),
            queue: db.queue(),
            conflicts: db.conflict_store(),
        }
    }

    /// Resolve the pending conflict for `task_uid`.
    ///
    /// Unknown strategy names fail before anything is read; a uid without a
    /// pending conflict fails with `NotFound`.
    pub fn resolve(&self, task_uid: &str, strategy: &str) -> Result<ResolutionOutcome, TasklaneError> {
        self.prepare(task_uid, strategy)?.commit()
    }

    /// Compute what `strategy` would write without touching storage
    pub fn prepare(&self, task_uid: &str, strategy: &str) -> Result<PreparedResolution, TasklaneError> {
        let strategy: ResolutionStrategy = strategy.parse()?;
        let conflict = self.conflicts.conflict_by_uid(task_uid)?;

        let snapshot = conflict.local_task()?;
        let remote: RemoteTask = serde_json::from_str(&conflict.remote_version)?;
        let current = self.store.task_by_uid(task_uid)?;

        let mut plan = ResolutionPlan::new(&self.db, task_uid, strategy, current.as_ref());
        let (task, copy) = match strategy {
            ResolutionStrategy::ServerWins => (self.server_wins(&mut plan, current, &remote)?, None),
            ResolutionStrategy::LocalWins => (self.local_wins(&mut plan, current, &remote)?, None),
            ResolutionStrategy::Merge => (Some(self.merge(&mut plan, current, snapshot, &remote)?), None),
            ResolutionStrategy::KeepBoth => self.keep_both(&mut plan, current, &remote)?,
        };
        Ok(PreparedResolution { plan, task, copy })
    }

    /// Local row takes the remote snapshot; queued local intent is superseded
    fn server_wins(
        &self,
        plan: &mut ResolutionPlan,
        current: Option<Task>,
        remote: &RemoteTask,
    ) -> Result<Option<Task>, TasklaneError> {
        let id = current.as_ref().map_or(0, |t| t.id);
        plan.drop_operations(&self.queue.operations_for(id, &remote.uid)?);

        if remote.deleted {
            if let Some(task) = current {
                plan.delete_task(task.id);
            }
            plan.remove_baseline();
            return Ok(None);
        }

        let created = current.as_ref().map_or(remote.modified, |t| t.created);
        let task = plan.put_task(remote.to_local(id, created))?;
        plan.set_baseline(baseline(remote, &task));
        Ok(Some(task))
    }

    /// Local row stays; the remote version becomes the baseline so the next
    /// push overwrites it
    fn local_wins(
        &self,
        plan: &mut ResolutionPlan,
        current: Option<Task>,
        remote: &RemoteTask,
    ) -> Result<Option<Task>, TasklaneError> {
        let task = match current {
            Some(task) => task,
            None => return Ok(None),
        };
        plan.set_baseline(baseline(remote, &task));
        self.requeue_update(plan, &task)?;
        Ok(Some(task))
    }

    /// Newer side wins per field; unset fields are filled from the older side.
    /// The result is a fresh local edit and is queued for push.
    fn merge(
        &self,
        plan: &mut ResolutionPlan,
        current: Option<Task>,
        snapshot: Task,
        remote: &RemoteTask,
    ) -> Result<Task, TasklaneError> {
        let exists = current.is_some();
        let local = current.unwrap_or(snapshot);
        let remote_task = remote.to_local(local.id, local.created);

        let merged = if remote.deleted {
            local.clone()
        } else if remote.modified > local.modified {
            fill_missing(remote_task, &local)
        } else {
            fill_missing(local.clone(), &remote_task)
        };

        let written = plan.put_task(Task {
            id: if exists { local.id } else { 0 },
            uid: remote.uid.clone(),
            created: local.created,
            modified: Utc::now(),
            ..merged
        })?;
        plan.enqueue(&written, OperationType::Update)?;
        plan.set_baseline(baseline(remote, &written));
        Ok(written)
    }

    /// Local row stays and is re-pushed; the remote snapshot becomes a new,
    /// unsynced task
    fn keep_both(
        &self,
        plan: &mut ResolutionPlan,
        current: Option<Task>,
        remote: &RemoteTask,
    ) -> Result<(Option<Task>, Option<Task>), TasklaneError> {
        if let Some(ref task) = current {
            plan.set_baseline(baseline(remote, task));
            self.requeue_update(plan, task)?;
        }
        if remote.deleted {
            return Ok((current, None));
        }

        let now = Utc::now();
        let copy = plan.put_task(Task {
            id: 0,
            uid: String::new(),
            created: now,
            modified: now,
            ..remote.to_local(0, now)
        })?;
        plan.enqueue(&copy, OperationType::Create)?;
        Ok((current, Some(copy)))
    }

    fn requeue_update(&self, plan: &mut ResolutionPlan, task: &Task) -> Result<(), TasklaneError> {
        let already_queued = self
            .queue
            .operations_for(task.id, &task.uid)?
            .iter()
            .any(|op| op.operation_type != OperationType::Delete);
        if !already_queued {
            plan.enqueue(task, OperationType::Update)?;
        }
        Ok(())
    }
}

fn baseline(remote: &RemoteTask, local: &Task) -> SyncBaseline {
    SyncBaseline {
        remote_modified: remote.modified,
        local_modified: local.modified,
        synced_at: Utc::now(),
    }
}

fn fill_missing(mut primary: Task, secondary: &Task) -> Task {
    if primary.summary.trim().is_empty() {
        primary.summary = secondary.summary.clone();
    }
    if primary.description.as_deref().map_or(true, str::is_empty) {
        primary.description = secondary.description.clone();
    }
    if primary.due.is_none() {
        primary.due = secondary.due;
    }
    if primary.priority == 0 {
        primary.priority = secondary.priority;
    }
    primary
}
