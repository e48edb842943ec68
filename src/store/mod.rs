//! External task store interface.
//!
//! The store is the only source of truth for which tasks exist and how they
//! block each other. Every call takes the task-store root of the plan it
//! concerns (the plan directory).

pub mod beads;
pub mod labels;
pub mod memory;

use async_trait::async_trait;
use std::path::Path;

use crate::core::task::{IssueType, Task, TaskState};
use crate::Result;

pub use beads::BeadsCli;
pub use labels::{LabelScheme, Placement};
pub use memory::MemoryTaskStore;

/// Selects tasks by label (all must match) and status.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskFilter {
    pub labels: Vec<String>,
    pub status: Option<TaskState>,
}

impl TaskFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn open_with_label(label: &str) -> Self {
        Self {
            labels: vec![label.to_string()],
            status: Some(TaskState::Open),
        }
    }

    pub fn matches(&self, task: &Task) -> bool {
        self.status.map_or(true, |s| s == task.status)
            && self.labels.iter().all(|l| task.has_label(l))
    }
}

#[derive(Debug, Clone, Default)]
pub struct NewTask {
    pub title: String,
    pub description: Option<String>,
    pub issue_type: IssueType,
    pub labels: Vec<String>,
}

#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Prepare an empty store under `root`.
    async fn init(&self, root: &Path, prefix: &str) -> Result<()>;

    async fn list(&self, root: &Path, filter: &TaskFilter) -> Result<Vec<Task>>;

    async fn create(&self, root: &Path, task: NewTask) -> Result<Task>;

    async fn update(
        &self,
        root: &Path,
        id: &str,
        add_labels: &[String],
        remove_labels: &[String],
    ) -> Result<()>;

    async fn close(&self, root: &Path, id: &str, message: &str) -> Result<()>;

    /// Record that `blocked` cannot start before `blocker` is done.
    async fn add_dependency(&self, root: &Path, blocked: &str, blocker: &str) -> Result<()>;

    /// Ids of the tasks `id` blocks.
    async fn dependents(&self, root: &Path, id: &str) -> Result<Vec<String>>;
}
