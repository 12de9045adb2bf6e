use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::TasklaneError;
use crate::types::task::{LocalId, Task};

/// Kind of local mutation recorded in the sync queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    Create,
    Update,
    Delete,
}

impl OperationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationType::Create => "create",
            OperationType::Update => "update",
            OperationType::Delete => "delete",
        }
    }
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationType {
    type Err = TasklaneError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "create" => Ok(OperationType::Create),
            "update" => Ok(OperationType::Update),
            "delete" => Ok(OperationType::Delete),
            other => Err(TasklaneError::InvalidArgs(format!("unknown operation type '{}'", other))),
        }
    }
}

/// One queued mutation intent awaiting remote propagation.
///
/// Rows are immutable apart from `retry_count` and `last_attempt_at`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncOperation {
    pub id: u64,
    /// Local id of the task (0 if unknown)
    pub task_id: LocalId,
    /// Remote uid (empty before the first sync)
    pub task_uid: String,
    /// Summary captured at enqueue time, survives deletion of the task row
    pub task_summary: String,
    pub list_id: String,
    pub operation_type: OperationType,
    pub retry_count: u32,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl SyncOperation {
    /// Processing order: oldest first, store id breaks ties
    pub fn processing_key(&self) -> (DateTime<Utc>, u64) {
        (self.created_at, self.id)
    }
}

/// Conflict bookkeeping state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictStatus {
    Pending,
    Resolved,
}

impl ConflictStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictStatus::Pending => "pending",
            ConflictStatus::Resolved => "resolved",
        }
    }
}

/// Named policy selected when closing a conflict
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionStrategy {
    ServerWins,
    LocalWins,
    Merge,
    KeepBoth,
}

impl ResolutionStrategy {
    pub const ALL: [ResolutionStrategy; 4] = [
        ResolutionStrategy::ServerWins,
        ResolutionStrategy::LocalWins,
        ResolutionStrategy::Merge,
        ResolutionStrategy::KeepBoth,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ResolutionStrategy::ServerWins => "server_wins",
            ResolutionStrategy::LocalWins => "local_wins",
            ResolutionStrategy::Merge => "merge",
            ResolutionStrategy::KeepBoth => "keep_both",
        }
    }
}

impl fmt::Display for ResolutionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResolutionStrategy {
    type Err = TasklaneError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .find(|strategy| strategy.as_str() == s)
            .copied()
            .ok_or_else(|| TasklaneError::InvalidStrategy(s.to_string()))
    }
}

/// A detected divergence between local and remote state for one uid
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncConflict {
    pub id: u64,
    pub task_uid: String,
    pub task_summary: String,
    pub list_id: String,
    /// Serialized local snapshot
    pub local_version: String,
    /// Serialized remote snapshot
    pub remote_version: String,
    pub local_modified: DateTime<Utc>,
    pub remote_modified: DateTime<Utc>,
    pub detected_at: DateTime<Utc>,
    pub status: ConflictStatus,
    #[serde(default)]
    pub resolution: Option<ResolutionStrategy>,
    #[serde(default)]
    pub resolved_at: Option<DateTime<Utc>>,
}

impl SyncConflict {
    pub fn is_pending(&self) -> bool {
        self.status == ConflictStatus::Pending
    }

    /// Decode the local snapshot
    pub fn local_task(&self) -> Result<Task, TasklaneError> {
        Ok(serde_json::from_str(&self.local_version)?)
    }
}

/// Input for `ConflictStore::add_conflict`
#[derive(Debug, Clone)]
pub struct NewConflict {
    pub task_uid: String,
    pub task_summary: String,
    pub list_id: String,
    pub local_version: String,
    pub remote_version: String,
    pub local_modified: DateTime<Utc>,
    pub remote_modified: DateTime<Utc>,
}

/// Last reconciled state for one uid
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncBaseline {
    pub remote_modified: DateTime<Utc>,
    pub local_modified: DateTime<Utc>,
    pub synced_at: DateTime<Utc>,
}
