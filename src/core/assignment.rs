//! Task assignments: which agent works on which task of a plan.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::agent::AgentId;
use crate::core::plan::PlanId;
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssignmentStatus {
    /// Recorded, worker not started yet.
    Pending,
    /// Worker confirmed started.
    InProgress,
    /// Task prompt delivered to the worker.
    Sent,
    Completed,
    Failed,
}

impl AssignmentStatus {
    /// Statuses that still have a worker attached.
    pub fn is_open(&self) -> bool {
        matches!(
            self,
            AssignmentStatus::Pending | AssignmentStatus::InProgress | AssignmentStatus::Sent
        )
    }
}

impl std::fmt::Display for AssignmentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AssignmentStatus::Pending => write!(f, "pending"),
            AssignmentStatus::InProgress => write!(f, "in_progress"),
            AssignmentStatus::Sent => write!(f, "sent"),
            AssignmentStatus::Completed => write!(f, "completed"),
            AssignmentStatus::Failed => write!(f, "failed"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskAssignment {
    pub bead_id: String,
    pub agent_id: AgentId,
    pub plan_id: PlanId,
    pub status: AssignmentStatus,
    pub assigned_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub worktree_path: Option<PathBuf>,
    pub branch: Option<String>,
    pub error: Option<String>,
}

impl TaskAssignment {
    pub fn new(plan_id: PlanId, bead_id: &str, agent_id: AgentId) -> Self {
        Self {
            bead_id: bead_id.to_string(),
            agent_id,
            plan_id,
            status: AssignmentStatus::Pending,
            assigned_at: Utc::now(),
            completed_at: None,
            worktree_path: None,
            branch: None,
            error: None,
        }
    }

    pub fn start(&mut self) {
        self.status = AssignmentStatus::InProgress;
    }

    /// The agent received its prompt.
    pub fn mark_sent(&mut self) {
        if self.status == AssignmentStatus::InProgress {
            self.status = AssignmentStatus::Sent;
        }
    }

    pub fn complete(&mut self) {
        self.status = AssignmentStatus::Completed;
        self.completed_at = Some(Utc::now());
    }

    pub fn fail(&mut self, error: &str) {
        self.status = AssignmentStatus::Failed;
        self.error = Some(error.to_string());
        self.completed_at = Some(Utc::now());
    }
}

/// All assignments of one plan, at most one per task.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AssignmentBook {
    entries: Vec<TaskAssignment>,
}

impl AssignmentBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, bead_id: &str) -> Option<&TaskAssignment> {
        self.entries.iter().find(|a| a.bead_id == bead_id)
    }

    pub fn get_mut(&mut self, bead_id: &str) -> Option<&mut TaskAssignment> {
        self.entries.iter_mut().find(|a| a.bead_id == bead_id)
    }

    pub fn contains(&self, bead_id: &str) -> bool {
        self.get(bead_id).is_some()
    }

    /// Record a new pending assignment.
    ///
    /// # Errors
    /// `AssignmentExists` when the task already has one in this plan.
    pub fn create(
        &mut self,
        plan_id: PlanId,
        bead_id: &str,
        agent_id: AgentId,
    ) -> Result<&mut TaskAssignment> {
        if self.contains(bead_id) {
            return Err(Error::AssignmentExists {
                plan_id,
                bead_id: bead_id.to_string(),
            });
        }
        self.entries
            .push(TaskAssignment::new(plan_id, bead_id, agent_id));
        let last = self.entries.len() - 1;
        Ok(&mut self.entries[last])
    }

    /// Drop the task's assignment so it can be dispatched again.
    pub fn remove(&mut self, bead_id: &str) -> Option<TaskAssignment> {
        let pos = self.entries.iter().position(|a| a.bead_id == bead_id)?;
        Some(self.entries.remove(pos))
    }

    pub fn iter(&self) -> impl Iterator<Item = &TaskAssignment> {
        self.entries.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut TaskAssignment> {
        self.entries.iter_mut()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn as_slice(&self) -> &[TaskAssignment] {
        &self.entries
    }
}
