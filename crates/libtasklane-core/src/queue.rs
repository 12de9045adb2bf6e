//! Durable, ordered log of local mutations awaiting remote propagation.
//!
//! Entries live in the `sync_queue` tree keyed by big-endian id. The pending
//! count is a counter in `sync_metadata` updated in the same transaction as
//! every insert and removal, so `pending_count` never scans the tree.

use chrono::Utc;
use sled::transaction::{ConflictableTransactionError, TransactionError};
use sled::Transactional;
use tracing::debug;

use crate::error::TasklaneError;
use crate::store::{decode_u64, id_key, read_counter, Database, TaskStore, QUEUE_LEN_KEY};
use crate::types::{LocalId, OperationType, SyncOperation, Task};

#[derive(Debug, Clone)]
pub struct SyncQueue {
    db: Database,
}

/// Where `SyncCoordinator` records sync intent
pub trait OperationSink {
    fn record(&self, task: &Task, operation_type: OperationType) -> Result<(), TasklaneError>;

    fn close(&self) -> Result<(), TasklaneError>;
}

impl OperationSink for SyncQueue {
    fn record(&self, task: &Task, operation_type: OperationType) -> Result<(), TasklaneError> {
        self.queue_operation(task.id, &task.uid, &task.summary, &task.list_id, operation_type)
            .map(|_| ())
    }

    fn close(&self) -> Result<(), TasklaneError> {
        SyncQueue::close(self)
    }
}

impl SyncQueue {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Append one operation stamped with the current time
    pub fn queue_operation(
        &self,
        task_id: LocalId,
        task_uid: &str,
        task_summary: &str,
        list_id: &str,
        operation_type: OperationType,
    ) -> Result<SyncOperation, TasklaneError> {
        let op = SyncOperation {
            id: self.db.next_id()?,
            task_id,
            task_uid: task_uid.to_string(),
            task_summary: task_summary.to_string(),
            list_id: list_id.to_string(),
            operation_type,
            retry_count: 0,
            last_attempt_at: None,
            created_at: Utc::now(),
        };
        let key = id_key(op.id);
        let json = serde_json::to_vec(&op)?;

        let result: Result<(), TransactionError<TasklaneError>> =
            (&self.db.queue, &self.db.metadata).transaction(|(queue, meta)| {
                queue.insert(&key[..], json.as_slice())?;
                let len = meta.get(QUEUE_LEN_KEY)?.map(|b| decode_u64(&b)).unwrap_or(0);
                meta.insert(QUEUE_LEN_KEY, &(len + 1).to_be_bytes()[..])?;
                Ok(())
            });
        result?;

        debug!(op_id = op.id, task_id, op = %operation_type, "queued sync operation");
        Ok(op)
    }

    /// All pending operations, oldest first
    pub fn pending_operations(&self) -> Result<Vec<SyncOperation>, TasklaneError> {
        let mut ops = Vec::new();
        for result in self.db.queue.iter() {
            let (_, value) = result?;
            let op: SyncOperation = serde_json::from_slice(&value)?;
            ops.push(op);
        }
        ops.sort_by_key(|op| op.processing_key());
        Ok(ops)
    }

    /// Pending operations with summaries refreshed from live task rows.
    ///
    /// Rows that no longer exist keep the summary captured at enqueue time.
    pub fn pending_operations_with(&self, store: &dyn TaskStore) -> Result<Vec<SyncOperation>, TasklaneError> {
        let mut ops = self.pending_operations()?;
        for op in &mut ops {
            if op.task_id == 0 {
                continue;
            }
            if let Some(task) = store.get_task(op.task_id)? {
                op.task_summary = task.summary;
            }
        }
        Ok(ops)
    }

    /// Pending operations touching one task, matched by local id or uid
    pub fn operations_for(&self, task_id: LocalId, task_uid: &str) -> Result<Vec<SyncOperation>, TasklaneError> {
        Ok(self
            .pending_operations()?
            .into_iter()
            .filter(|op| {
                (task_id != 0 && op.task_id == task_id)
                    || (!task_uid.is_empty() && op.task_uid == task_uid)
            })
            .collect())
    }

    pub fn pending_count(&self) -> Result<u64, TasklaneError> {
        read_counter(&self.db.metadata, QUEUE_LEN_KEY)
    }

    /// Delete every queued operation, returning how many were removed
    pub fn clear_queue(&self) -> Result<u64, TasklaneError> {
        let keys: Vec<sled::IVec> = self
            .db
            .queue
            .iter()
            .keys()
            .collect::<Result<_, _>>()?;
        let removed = self.remove_keys(&keys)?;
        debug!(removed, "cleared sync queue");
        Ok(removed)
    }

    /// Remove one operation after successful propagation
    pub fn remove_operation(&self, id: u64) -> Result<bool, TasklaneError> {
        let key = sled::IVec::from(&id_key(id)[..]);
        Ok(self.remove_keys(std::slice::from_ref(&key))? == 1)
    }

    /// Remove every operation touching a task, returning the count removed
    pub fn remove_operations_for(&self, task_id: LocalId, task_uid: &str) -> Result<u64, TasklaneError> {
        let keys: Vec<sled::IVec> = self
            .operations_for(task_id, task_uid)?
            .iter()
            .map(|op| sled::IVec::from(&id_key(op.id)[..]))
            .collect();
        self.remove_keys(&keys)
    }

    /// Record a failed propagation attempt
    pub fn record_failure(&self, id: u64) -> Result<SyncOperation, TasklaneError> {
        let key = id_key(id);
        let now = Utc::now();

        let result: Result<SyncOperation, TransactionError<TasklaneError>> =
            self.db.queue.transaction(|queue| {
                let bytes = queue.get(&key[..])?.ok_or_else(|| {
                    ConflictableTransactionError::Abort(TasklaneError::NotFound(format!(
                        "sync operation {} not found",
                        id
                    )))
                })?;
                let mut op: SyncOperation = serde_json::from_slice(&bytes)
                    .map_err(|e| ConflictableTransactionError::Abort(TasklaneError::from(e)))?;
                op.retry_count += 1;
                op.last_attempt_at = Some(now);
                let json = serde_json::to_vec(&op)
                    .map_err(|e| ConflictableTransactionError::Abort(TasklaneError::from(e)))?;
                queue.insert(&key[..], json)?;
                Ok(op)
            });
        Ok(result?)
    }

    pub fn close(&self) -> Result<(), TasklaneError> {
        self.db.queue.flush()?;
        self.db.metadata.flush()?;
        Ok(())
    }

    fn remove_keys(&self, keys: &[sled::IVec]) -> Result<u64, TasklaneError> {
        if keys.is_empty() {
            return Ok(0);
        }
        let result: Result<u64, TransactionError<TasklaneError>> =
            (&self.db.queue, &self.db.metadata).transaction(|(queue, meta)| {
                let mut removed = 0u64;
                for key in keys {
                    if queue.remove(key)?.is_some() {
                        removed += 1;
                    }
                }
                let len = meta.get(QUEUE_LEN_KEY)?.map(|b| decode_u64(&b)).unwrap_or(0);
                meta.insert(QUEUE_LEN_KEY, &len.saturating_sub(removed).to_be_bytes()[..])?;
                Ok(removed)
            });
        Ok(result?)
    }
}
