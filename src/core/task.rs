//! Tasks as seen from the external task store.
//!
//! Tasks are owned by the store; the orchestrator reads them and flips
//! their handoff labels, nothing else. Placement and handoff state travel
//! as labels (see [`crate::store::labels`]).

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Open/closed state of a task in the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    #[default]
    Open,
    Closed,
}

impl TaskState {
    /// Map a store status string. Everything that is not closed counts as
    /// open (the store also knows `in_progress`, `blocked`, ...).
    pub fn from_store(status: &str) -> Self {
        match status {
            "closed" | "done" | "tombstone" => TaskState::Closed,
            _ => TaskState::Open,
        }
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskState::Open => write!(f, "open"),
            TaskState::Closed => write!(f, "closed"),
        }
    }
}

/// Kind of work item. Epics group tasks and are never dispatched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum IssueType {
    #[default]
    Task,
    Bug,
    Feature,
    Chore,
    Epic,
}

impl IssueType {
    pub fn from_store(kind: &str) -> Self {
        match kind {
            "bug" => IssueType::Bug,
            "feature" => IssueType::Feature,
            "chore" => IssueType::Chore,
            "epic" => IssueType::Epic,
            _ => IssueType::Task,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            IssueType::Task => "task",
            IssueType::Bug => "bug",
            IssueType::Feature => "feature",
            IssueType::Chore => "chore",
            IssueType::Epic => "epic",
        }
    }
}

/// A task ("bead") in the external store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub status: TaskState,
    #[serde(default)]
    pub issue_type: IssueType,
    #[serde(default)]
    pub labels: BTreeSet<String>,
    /// Ids of tasks that must finish before this one can start.
    #[serde(default)]
    pub blocked_by: Vec<String>,
}

impl Task {
    pub fn new(id: &str, title: &str) -> Self {
        Self {
            id: id.to_string(),
            title: title.to_string(),
            description: None,
            status: TaskState::Open,
            issue_type: IssueType::Task,
            labels: BTreeSet::new(),
            blocked_by: Vec::new(),
        }
    }

    pub fn with_labels<I, S>(mut self, labels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.labels.extend(labels.into_iter().map(Into::into));
        self
    }

    pub fn blocked_by<I, S>(mut self, blockers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.blocked_by.extend(blockers.into_iter().map(Into::into));
        self
    }

    pub fn with_type(mut self, issue_type: IssueType) -> Self {
        self.issue_type = issue_type;
        self
    }

    pub fn closed(mut self) -> Self {
        self.status = TaskState::Closed;
        self
    }

    pub fn is_closed(&self) -> bool {
        self.status == TaskState::Closed
    }

    pub fn is_epic(&self) -> bool {
        self.issue_type == IssueType::Epic
    }

    pub fn has_label(&self, label: &str) -> bool {
        self.labels.contains(label)
    }

    /// Value of the first `<key>:<value>` label, if any.
    pub fn label_value(&self, key: &str) -> Option<&str> {
        self.labels.iter().find_map(|label| {
            label
                .strip_prefix(key)
                .and_then(|rest| rest.strip_prefix(':'))
                .filter(|value| !value.is_empty())
        })
    }
}
