use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::TasklaneError;

/// Local task identifier, assigned by the store and usable without sync
pub type LocalId = u64;

/// Task completion state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    NeedsAction,
    InProgress,
    Completed,
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::NeedsAction => "needs_action",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Completed => "completed",
            TaskStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = TasklaneError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "needs_action" | "todo" | "open" => Ok(TaskStatus::NeedsAction),
            "in_progress" => Ok(TaskStatus::InProgress),
            "completed" | "done" => Ok(TaskStatus::Completed),
            "cancelled" => Ok(TaskStatus::Cancelled),
            other => Err(TasklaneError::InvalidArgs(format!("unknown task status '{}'", other))),
        }
    }
}

/// A task row as persisted by a TaskStore
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Local id (0 means "not yet stored")
    pub id: LocalId,
    /// Remote identifier; empty until the first successful sync
    #[serde(default)]
    pub uid: String,
    pub list_id: String,
    pub summary: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub status: TaskStatus,
    /// 0 = unset, 1 = highest, 9 = lowest
    #[serde(default)]
    pub priority: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub due: Option<DateTime<Utc>>,
    pub created: DateTime<Utc>,
    pub modified: DateTime<Utc>,
}

impl Task {
    /// Build an unsaved task with the given summary in a list
    pub fn new(list_id: impl Into<String>, summary: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: 0,
            uid: String::new(),
            list_id: list_id.into(),
            summary: summary.into(),
            description: None,
            status: TaskStatus::NeedsAction,
            priority: 0,
            due: None,
            created: now,
            modified: now,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_due(mut self, due: DateTime<Utc>) -> Self {
        self.due = Some(due);
        self
    }

    pub fn is_synced(&self) -> bool {
        !self.uid.is_empty()
    }

    pub fn is_done(&self) -> bool {
        matches!(self.status, TaskStatus::Completed | TaskStatus::Cancelled)
    }
}

/// Filter for listing tasks
#[derive(Debug, Default, Clone)]
pub struct TaskFilter {
    pub list_id: Option<String>,
    pub status: Option<TaskStatus>,
    /// Include completed/cancelled tasks
    pub include_done: bool,
}

impl TaskFilter {
    pub fn matches(&self, task: &Task) -> bool {
        if let Some(ref list) = self.list_id {
            if &task.list_id != list {
                return false;
            }
        }
        if let Some(status) = self.status {
            return task.status == status;
        }
        self.include_done || !task.is_done()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_parse() {
        assert_eq!("done".parse::<TaskStatus>().unwrap(), TaskStatus::Completed);
        assert_eq!("in_progress".parse::<TaskStatus>().unwrap(), TaskStatus::InProgress);
        assert!("someday".parse::<TaskStatus>().is_err());
    }

    #[test]
    fn test_filter_hides_done_by_default() {
        let mut task = Task::new("L1", "Buy milk");
        let filter = TaskFilter::default();
        assert!(filter.matches(&task));

        task.status = TaskStatus::Completed;
        assert!(!filter.matches(&task));

        let all = TaskFilter { include_done: true, ..Default::default() };
        assert!(all.matches(&task));
    }

    #[test]
    fn test_filter_by_list() {
        let task = Task::new("L1", "Buy milk");
        let filter = TaskFilter { list_id: Some("L2".to_string()), ..Default::default() };
        assert!(!filter.matches(&task));
    }
}
