//! Label protocol shared with the task store.
//!
//! - `repo:<name>` and `worktree:<name>` place a task before it is handed off
//! - `<prefix>-ready` marks a task eligible for dispatch
//! - `<prefix>-sent` marks it claimed by this orchestrator

use crate::core::task::Task;

pub const REPO_KEY: &str = "repo";
pub const WORKTREE_KEY: &str = "worktree";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelScheme {
    prefix: String,
}

impl LabelScheme {
    pub fn new(prefix: &str) -> Self {
        Self {
            prefix: prefix.to_string(),
        }
    }

    pub fn ready(&self) -> String {
        format!("{}-ready", self.prefix)
    }

    pub fn sent(&self) -> String {
        format!("{}-sent", self.prefix)
    }
}

pub fn repo_label(name: &str) -> String {
    format!("{}:{}", REPO_KEY, name)
}

pub fn worktree_label(name: &str) -> String {
    format!("{}:{}", WORKTREE_KEY, name)
}

/// Where a task runs: which repository, which named worktree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Placement {
    pub repo: String,
    pub worktree: String,
}

impl Placement {
    /// Read placement labels. On failure returns the missing label keys.
    pub fn from_task(task: &Task) -> Result<Self, Vec<&'static str>> {
        let repo = task.label_value(REPO_KEY);
        let worktree = task.label_value(WORKTREE_KEY);
        match (repo, worktree) {
            (Some(repo), Some(worktree)) => Ok(Self {
                repo: repo.to_string(),
                worktree: worktree.to_string(),
            }),
            (repo, worktree) => {
                let mut missing = Vec::new();
                if repo.is_none() {
                    missing.push(REPO_KEY);
                }
                if worktree.is_none() {
                    missing.push(WORKTREE_KEY);
                }
                Err(missing)
            }
        }
    }
}
