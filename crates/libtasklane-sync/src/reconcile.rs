//! One reconciliation pass between the local database and a backend.
//!
//! Pull first: remote changes fast-forward clean local rows and become
//! conflicts when the local row has unsynced changes. Then push the queue
//! oldest-first, skipping uids with a pending conflict.
//!
//! Remote changes skipped because of a pending conflict hold the per-backend
//! watermark back, so they are fetched again once the conflict is resolved.

use chrono::{DateTime, Duration, Utc};
use libtasklane_core::{
    ConflictStore, Database, LocalIdIndex, NewConflict, OperationType, SledTaskStore, SyncBaseline,
    SyncMetadata, SyncOperation, SyncQueue, Task, TaskStore, TasklaneError,
};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::remote::{RemoteBackend, RemoteTask};

/// Counts from one pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub pushed: usize,
    pub pulled: usize,
    pub conflicts: usize,
    pub failed: usize,
    pub skipped: usize,
}

pub struct Reconciler<'a> {
    backend: &'a dyn RemoteBackend,
    store: SledTaskStore,
    queue: SyncQueue,
    conflicts: ConflictStore,
    metadata: SyncMetadata,
    max_retries: u32,
}

enum PushOutcome {
    Pushed,
    /// Nothing to send; the operation is obsolete
    Dropped,
    /// Must wait for an earlier operation
    Deferred,
}

impl<'a> Reconciler<'a> {
    pub fn new(db: &Database, backend: &'a dyn RemoteBackend, max_retries: u32) -> Self {
        Self {
            backend,
            store: db.task_store(),
            queue: db.queue(),
            conflicts: db.conflict_store(),
            metadata: db.metadata(),
            max_retries,
        }
    }

    pub fn run(&self) -> Result<SyncReport, TasklaneError> {
        let started = Utc::now();
        let mut report = SyncReport::default();

        self.backend.check_connection()?;
        let held_back = self.pull(&mut report)?;
        self.push(&mut report)?;

        let watermark = match held_back {
            Some(oldest) => (oldest - Duration::milliseconds(1)).min(started),
            None => started,
        };
        self.metadata.set_last_sync_for(self.backend.name(), watermark)?;
        self.metadata.set_last_sync(Utc::now())?;

        info!(
            backend = self.backend.name(),
            pushed = report.pushed,
            pulled = report.pulled,
            conflicts = report.conflicts,
            failed = report.failed,
            skipped = report.skipped,
            "reconciliation finished"
        );
        Ok(report)
    }

    /// Returns the oldest `modified` among remote changes left unapplied
    fn pull(&self, report: &mut SyncReport) -> Result<Option<DateTime<Utc>>, TasklaneError> {
        let since = self.metadata.last_sync_for(self.backend.name())?;
        let changes = self.backend.fetch_changes(since)?;
        debug!(backend = self.backend.name(), changes = changes.len(), "fetched remote changes");

        let mut held_back: Option<DateTime<Utc>> = None;
        for remote in changes {
            if remote.uid.is_empty() {
                report.skipped += 1;
                continue;
            }
            if self.conflicts.has_pending(&remote.uid)? {
                debug!(uid = %remote.uid, "remote change waits for conflict resolution");
                held_back = Some(held_back.map_or(remote.modified, |t| t.min(remote.modified)));
                report.skipped += 1;
                continue;
            }
            let baseline = self.metadata.baseline(&remote.uid)?;
            if let Some(ref b) = baseline {
                if remote.modified <= b.remote_modified {
                    continue;
                }
            }

            match self.store.task_by_uid(&remote.uid)? {
                Some(local) => {
                    let dirty = !self.queue.operations_for(local.id, &local.uid)?.is_empty()
                        || baseline
                            .as_ref()
                            .map_or(false, |b| local.modified > b.local_modified);

                    if !dirty {
                        self.fast_forward(Some(local), &remote)?;
                        report.pulled += 1;
                    } else if remote.same_content(&local) {
                        // Both sides made the same edit
                        self.record_baseline(&remote, &local)?;
                    } else {
                        self.conflicts.add_conflict(NewConflict {
                            task_uid: remote.uid.clone(),
                            task_summary: local.summary.clone(),
                            list_id: local.list_id.clone(),
                            local_version: serde_json::to_string(&local)?,
                            remote_version: serde_json::to_string(&remote)?,
                            local_modified: local.modified,
                            remote_modified: remote.modified,
                        })?;
                        report.conflicts += 1;
                    }
                }
                None => {
                    let deleted_locally = self
                        .queue
                        .operations_for(0, &remote.uid)?
                        .iter()
                        .any(|op| op.operation_type == OperationType::Delete);
                    if deleted_locally {
                        // The queued delete is pushed below
                        continue;
                    }
                    if self.fast_forward(None, &remote)? {
                        report.pulled += 1;
                    }
                }
            }
        }
        Ok(held_back)
    }

    /// Apply remote state to a clean local row. Returns false if nothing changed.
    fn fast_forward(&self, local: Option<Task>, remote: &RemoteTask) -> Result<bool, TasklaneError> {
        if remote.deleted {
            self.metadata.remove_baseline(&remote.uid)?;
            return match local {
                Some(task) => {
                    self.store.delete_task(task.id)?;
                    debug!(uid = %remote.uid, "applied remote deletion");
                    Ok(true)
                }
                None => Ok(false),
            };
        }

        let (id, created) = local.map_or((0, remote.modified), |t| (t.id, t.created));
        let task = self.store.put_task(remote.to_local(id, created))?;
        self.record_baseline(remote, &task)?;
        debug!(uid = %remote.uid, task_id = task.id, "applied remote change");
        Ok(true)
    }

    fn record_baseline(&self, remote: &RemoteTask, local: &Task) -> Result<(), TasklaneError> {
        self.metadata.set_baseline(
            &remote.uid,
            &SyncBaseline {
                remote_modified: remote.modified,
                local_modified: local.modified,
                synced_at: Utc::now(),
            },
        )
    }

    fn push(&self, report: &mut SyncReport) -> Result<(), TasklaneError> {
        for op in self.queue.pending_operations()? {
            if op.retry_count >= self.max_retries {
                report.skipped += 1;
                continue;
            }

            let task = if op.task_id != 0 {
                self.store.get_task(op.task_id)?
            } else {
                None
            };
            let uid = task
                .as_ref()
                .map(|t| t.uid.clone())
                .filter(|uid| !uid.is_empty())
                .unwrap_or_else(|| op.task_uid.clone());

            if !uid.is_empty() && self.conflicts.has_pending(&uid)? {
                report.skipped += 1;
                continue;
            }

            match self.push_one(&op, task, &uid) {
                Ok(PushOutcome::Pushed) => {
                    self.queue.remove_operation(op.id)?;
                    report.pushed += 1;
                }
                Ok(PushOutcome::Dropped) => {
                    self.queue.remove_operation(op.id)?;
                }
                Ok(PushOutcome::Deferred) => {
                    report.skipped += 1;
                }
                Err(TasklaneError::Remote(msg)) => {
                    warn!(op_id = op.id, op = %op.operation_type, error = %msg, "push failed");
                    self.queue.record_failure(op.id)?;
                    report.failed += 1;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    fn push_one(&self, op: &SyncOperation, task: Option<Task>, uid: &str) -> Result<PushOutcome, TasklaneError> {
        match op.operation_type {
            OperationType::Create | OperationType::Update => {
                let task = match task {
                    Some(task) => task,
                    // Deleted before it was pushed; a delete op follows if it ever synced
                    None => return Ok(PushOutcome::Dropped),
                };
                if task.is_synced() {
                    let remote = self.backend.push_update(&task)?;
                    self.record_baseline(&remote, &task)?;
                    Ok(PushOutcome::Pushed)
                } else if op.operation_type == OperationType::Create {
                    let remote = self.backend.push_create(&task)?;
                    let task = self.store.assign_uid(task.id, &remote.uid)?;
                    self.record_baseline(&remote, &task)?;
                    Ok(PushOutcome::Pushed)
                } else {
                    Ok(PushOutcome::Deferred)
                }
            }
            OperationType::Delete => {
                if uid.is_empty() {
                    return Ok(PushOutcome::Dropped);
                }
                self.backend.push_delete(uid)?;
                self.metadata.remove_baseline(uid)?;
                Ok(PushOutcome::Pushed)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::MemoryRemote;
    use libtasklane_core::{SyncCoordinator, TaskStatus};
    use tempfile::tempdir;

    fn setup() -> (tempfile::TempDir, Database, MemoryRemote) {
        let dir = tempdir().unwrap();
        let db = Database::open(&dir.path().join("db")).unwrap();
        (dir, db, MemoryRemote::new("mem"))
    }

    fn coordinator(db: &Database) -> SyncCoordinator<SledTaskStore> {
        SyncCoordinator::new(db.task_store(), db.queue())
    }

    #[test]
    fn test_push_create_assigns_uid() {
        let (_dir, db, remote) = setup();
        let task = coordinator(&db).create_task(Task::new("L1", "Buy milk")).unwrap();

        let report = Reconciler::new(&db, &remote, 5).run().unwrap();
        assert_eq!(report.pushed, 1);
        assert_eq!(db.queue().pending_count().unwrap(), 0);

        let synced = db.task_store().get_task(task.id).unwrap().unwrap();
        assert!(synced.is_synced());
        assert_eq!(remote.get_remote(&synced.uid).unwrap().unwrap().summary, "Buy milk");
        assert!(db.metadata().last_sync().unwrap().is_some());
    }

    #[test]
    fn test_create_update_delete_same_tick() {
        let (_dir, db, remote) = setup();
        let coord = coordinator(&db);
        let task = coord.create_task(Task::new("L1", "temp")).unwrap();
        let mut changed = task.clone();
        changed.summary = "temp 2".to_string();
        coord.update_task(changed).unwrap();

        Reconciler::new(&db, &remote, 5).run().unwrap();
        let uid = db.task_store().get_task(task.id).unwrap().unwrap().uid;
        assert_eq!(remote.get_remote(&uid).unwrap().unwrap().summary, "temp 2");

        coord.delete_task(task.id).unwrap();
        let report = Reconciler::new(&db, &remote, 5).run().unwrap();
        assert_eq!(report.pushed, 1);
        assert!(remote.get_remote(&uid).unwrap().unwrap().deleted);
    }

    #[test]
    fn test_deleted_before_push_is_dropped() {
        let (_dir, db, remote) = setup();
        let coord = coordinator(&db);
        let task = coord.create_task(Task::new("L1", "never mind")).unwrap();
        coord.delete_task(task.id).unwrap();

        let report = Reconciler::new(&db, &remote, 5).run().unwrap();
        assert_eq!(report.pushed, 0);
        assert_eq!(db.queue().pending_count().unwrap(), 0);
        assert!(remote.live_tasks().unwrap().is_empty());
    }

    #[test]
    fn test_pull_new_remote_task() {
        let (_dir, db, remote) = setup();
        let now = Utc::now();
        remote
            .put_remote(RemoteTask::from_task(&Task::new("L2", "From phone"), "phone-1", now))
            .unwrap();

        let report = Reconciler::new(&db, &remote, 5).run().unwrap();
        assert_eq!(report.pulled, 1);

        let local = db.task_store().task_by_uid("phone-1").unwrap().unwrap();
        assert_eq!(local.summary, "From phone");
        assert_eq!(db.queue().pending_count().unwrap(), 0);
    }

    #[test]
    fn test_fast_forward_clean_row() {
        let (_dir, db, remote) = setup();
        let task = coordinator(&db).create_task(Task::new("L1", "original")).unwrap();
        Reconciler::new(&db, &remote, 5).run().unwrap();
        let uid = db.task_store().get_task(task.id).unwrap().unwrap().uid;

        let mut edited = remote.get_remote(&uid).unwrap().unwrap();
        edited.status = TaskStatus::Completed;
        edited.modified = Utc::now() + chrono::Duration::seconds(5);
        remote.put_remote(edited).unwrap();

        let report = Reconciler::new(&db, &remote, 5).run().unwrap();
        assert_eq!(report.pulled, 1);
        assert_eq!(report.conflicts, 0);
        assert_eq!(db.task_store().get_task(task.id).unwrap().unwrap().status, TaskStatus::Completed);
    }

    #[test]
    fn test_divergence_becomes_conflict_and_blocks_push() {
        let (_dir, db, remote) = setup();
        let coord = coordinator(&db);
        let task = coord.create_task(Task::new("L1", "original")).unwrap();
        Reconciler::new(&db, &remote, 5).run().unwrap();
        let synced = db.task_store().get_task(task.id).unwrap().unwrap();

        let mut local_edit = synced.clone();
        local_edit.summary = "local edit".to_string();
        coord.update_task(local_edit).unwrap();

        let mut remote_edit = remote.get_remote(&synced.uid).unwrap().unwrap();
        remote_edit.summary = "remote edit".to_string();
        remote_edit.modified = Utc::now() + chrono::Duration::seconds(5);
        remote.put_remote(remote_edit).unwrap();

        let report = Reconciler::new(&db, &remote, 5).run().unwrap();
        assert_eq!(report.conflicts, 1);
        assert_eq!(report.pushed, 0);
        assert_eq!(report.skipped, 1);

        let conflict = db.conflict_store().conflict_by_uid(&synced.uid).unwrap();
        assert_eq!(conflict.task_summary, "local edit");
        assert_eq!(remote.get_remote(&synced.uid).unwrap().unwrap().summary, "remote edit");
        assert_eq!(db.queue().pending_count().unwrap(), 1);
    }

    #[test]
    fn test_remote_edit_during_conflict_survives_resolution() {
        let (_dir, db, remote) = setup();
        let coord = coordinator(&db);
        let task = coord.create_task(Task::new("L1", "original")).unwrap();
        Reconciler::new(&db, &remote, 5).run().unwrap();
        let synced = db.task_store().get_task(task.id).unwrap().unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));

        let mut mine = synced.clone();
        mine.summary = "mine".to_string();
        coord.update_task(mine).unwrap();
        let mut theirs = remote.get_remote(&synced.uid).unwrap().unwrap();
        theirs.summary = "theirs v1".to_string();
        theirs.modified = Utc::now();
        remote.put_remote(theirs.clone()).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));

        assert_eq!(Reconciler::new(&db, &remote, 5).run().unwrap().conflicts, 1);

        // Edited again remotely while the conflict is open
        std::thread::sleep(std::time::Duration::from_millis(5));
        theirs.summary = "theirs v2".to_string();
        theirs.modified = Utc::now();
        remote.put_remote(theirs).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));

        let report = Reconciler::new(&db, &remote, 5).run().unwrap();
        assert_eq!(report.pulled, 0);
        assert_eq!(report.skipped, 2);

        crate::resolver::ConflictResolver::new(&db)
            .resolve(&synced.uid, "server_wins")
            .unwrap();
        assert_eq!(db.task_store().get_task(task.id).unwrap().unwrap().summary, "theirs v1");

        let report = Reconciler::new(&db, &remote, 5).run().unwrap();
        assert_eq!(report.pulled, 1);
        assert_eq!(report.conflicts, 0);
        assert_eq!(db.task_store().get_task(task.id).unwrap().unwrap().summary, "theirs v2");
        assert_eq!(remote.get_remote(&synced.uid).unwrap().unwrap().summary, "theirs v2");
        assert_eq!(db.queue().pending_count().unwrap(), 0);
    }

    #[test]
    fn test_remote_failure_records_retry() {
        let (_dir, db, remote) = setup();
        coordinator(&db).create_task(Task::new("L1", "a")).unwrap();

        remote.set_reachable(false);
        assert!(matches!(
            Reconciler::new(&db, &remote, 5).run().unwrap_err(),
            TasklaneError::Remote(_)
        ));
        assert_eq!(db.queue().pending_operations().unwrap()[0].retry_count, 0);
    }

    #[test]
    fn test_exhausted_retries_skipped() {
        let (_dir, db, remote) = setup();
        coordinator(&db).create_task(Task::new("L1", "a")).unwrap();
        let op = db.queue().pending_operations().unwrap().remove(0);
        for _ in 0..3 {
            db.queue().record_failure(op.id).unwrap();
        }

        let report = Reconciler::new(&db, &remote, 3).run().unwrap();
        assert_eq!(report.skipped, 1);
        assert_eq!(report.pushed, 0);
        assert_eq!(db.queue().pending_count().unwrap(), 1);
    }
}
