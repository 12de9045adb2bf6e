//! Durable conflict records.
//!
//! Rows live in `sync_conflicts` keyed by id and are never deleted. The
//! `conflict_pending` tree maps a task uid to the id of its single pending
//! conflict; both trees change together inside one transaction.

use chrono::Utc;
use sled::transaction::{ConflictableTransactionError, TransactionError};
use sled::Transactional;
use tracing::info;

use crate::error::TasklaneError;
use crate::store::{decode_u64, id_key, Database};
use crate::types::{ConflictStatus, NewConflict, ResolutionStrategy, SyncConflict};

#[derive(Debug, Clone)]
pub struct ConflictStore {
    db: Database,
}

fn abort<E: Into<TasklaneError>>(e: E) -> ConflictableTransactionError<TasklaneError> {
    ConflictableTransactionError::Abort(e.into())
}

impl ConflictStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Record a new pending conflict.
    ///
    /// Fails with `Conflict` if the uid already has a pending conflict.
    pub fn add_conflict(&self, new: NewConflict) -> Result<SyncConflict, TasklaneError> {
        if new.task_uid.is_empty() {
            return Err(TasklaneError::InvalidArgs("conflict requires a task uid".to_string()));
        }

        let conflict = SyncConflict {
            id: self.db.next_id()?,
            task_uid: new.task_uid,
            task_summary: new.task_summary,
            list_id: new.list_id,
            local_version: new.local_version,
            remote_version: new.remote_version,
            local_modified: new.local_modified,
            remote_modified: new.remote_modified,
            detected_at: Utc::now(),
            status: ConflictStatus::Pending,
            resolution: None,
            resolved_at: None,
        };
        let key = id_key(conflict.id);
        let json = serde_json::to_vec(&conflict)?;
        let uid = conflict.task_uid.as_bytes();

        let result: Result<(), TransactionError<TasklaneError>> =
            (&self.db.conflicts, &self.db.conflict_pending).transaction(|(rows, pending)| {
                if pending.get(uid)?.is_some() {
                    return Err(abort(TasklaneError::Conflict(format!(
                        "task uid '{}' already has a pending conflict",
                        conflict.task_uid
                    ))));
                }
                rows.insert(&key[..], json.as_slice())?;
                pending.insert(uid, &key[..])?;
                Ok(())
            });
        result?;

        info!(conflict_id = conflict.id, uid = %conflict.task_uid, "conflict detected");
        Ok(conflict)
    }

    /// Pending conflicts, most recently detected first
    pub fn conflicts(&self) -> Result<Vec<SyncConflict>, TasklaneError> {
        let mut pending: Vec<SyncConflict> = self
            .all_conflicts()?
            .into_iter()
            .filter(SyncConflict::is_pending)
            .collect();
        pending.sort_by(|a, b| b.detected_at.cmp(&a.detected_at).then(b.id.cmp(&a.id)));
        Ok(pending)
    }

    /// Every conflict ever recorded, in id order
    pub fn all_conflicts(&self) -> Result<Vec<SyncConflict>, TasklaneError> {
        let mut conflicts = Vec::new();
        for result in self.db.conflicts.iter() {
            let (_, value) = result?;
            conflicts.push(serde_json::from_slice(&value)?);
        }
        Ok(conflicts)
    }

    /// The pending conflict for a uid
    pub fn conflict_by_uid(&self, task_uid: &str) -> Result<SyncConflict, TasklaneError> {
        let id = self
            .db
            .conflict_pending
            .get(task_uid.as_bytes())?
            .map(|bytes| decode_u64(&bytes))
            .ok_or_else(|| TasklaneError::conflict_not_found(task_uid))?;
        match self.db.conflicts.get(id_key(id))? {
            Some(bytes) => Ok(serde_json::from_slice(&bytes)?),
            None => Err(TasklaneError::Internal(format!(
                "pending index points at missing conflict {}",
                id
            ))),
        }
    }

    pub fn has_pending(&self, task_uid: &str) -> Result<bool, TasklaneError> {
        Ok(self.db.conflict_pending.contains_key(task_uid.as_bytes())?)
    }

    pub fn pending_count(&self) -> usize {
        self.db.conflict_pending.len()
    }

    /// Mark the pending conflict for `task_uid` resolved with the named strategy.
    ///
    /// The strategy is validated before storage is touched. A uid with no
    /// pending conflict yields `NotFound` and changes nothing.
    pub fn resolve_conflict(&self, task_uid: &str, strategy: &str) -> Result<SyncConflict, TasklaneError> {
        let strategy: ResolutionStrategy = strategy.parse()?;
        self.mark_resolved(task_uid, strategy)
    }

    /// Flip the pending row to resolved in one transaction
    pub fn mark_resolved(
        &self,
        task_uid: &str,
        strategy: ResolutionStrategy,
    ) -> Result<SyncConflict, TasklaneError> {
        let now = Utc::now();
        let uid = task_uid.as_bytes();

        let result: Result<SyncConflict, TransactionError<TasklaneError>> =
            (&self.db.conflicts, &self.db.conflict_pending).transaction(|(rows, pending)| {
                let key = pending
                    .get(uid)?
                    .ok_or_else(|| abort(TasklaneError::conflict_not_found(task_uid)))?;
                let bytes = rows.get(&key)?.ok_or_else(|| {
                    abort(TasklaneError::Internal(format!(
                        "pending index points at missing conflict {}",
                        decode_u64(&key)
                    )))
                })?;
                let mut conflict: SyncConflict = serde_json::from_slice(&bytes).map_err(abort)?;
                conflict.status = ConflictStatus::Resolved;
                conflict.resolution = Some(strategy);
                conflict.resolved_at = Some(now);
                let json = serde_json::to_vec(&conflict).map_err(abort)?;
                rows.insert(&key, json)?;
                pending.remove(uid)?;
                Ok(conflict)
            });
        let conflict = result?;

        info!(uid = task_uid, strategy = %strategy, "conflict resolved");
        Ok(conflict)
    }
}
