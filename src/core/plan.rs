//! Plans and their lifecycle state machine.
//!
//! A plan moves through
//!
//! draft -> discussing -> discussed -> delegating -> in_progress -> ready_for_review -> completed
//!
//! with `failed` reachable from every in-flight state and restart
//! (failed -> draft | discussed) as the only back-edge.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use uuid::Uuid;

use crate::agent::AgentId;
use crate::error::{Error, Result};
use crate::util::slugify;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PlanId(pub Uuid);

impl PlanId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Return first 8 characters of the UUID for display.
    pub fn short(&self) -> String {
        self.0.to_string()[..8].to_string()
    }
}

impl Default for PlanId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for PlanId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for PlanId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PlanStatus {
    #[default]
    Draft,
    Discussing,
    Discussed,
    Delegating,
    InProgress,
    ReadyForReview,
    Completed,
    Failed,
}

impl PlanStatus {
    /// Check if moving from `self` to `target` is a legal edge.
    ///
    /// - Draft -> Discussing | Delegating
    /// - Discussing -> Discussed | Draft
    /// - Discussed -> Delegating
    /// - Delegating -> InProgress
    /// - InProgress -> ReadyForReview
    /// - ReadyForReview -> Completed
    /// - any in-flight state -> Failed
    /// - Failed -> Draft | Discussed
    pub fn can_transition(&self, target: PlanStatus) -> bool {
        use PlanStatus::*;
        match (self, target) {
            (Draft, Discussing) | (Draft, Delegating) => true,
            (Discussing, Discussed) | (Discussing, Draft) => true,
            (Discussed, Delegating) => true,
            (Delegating, InProgress) => true,
            (InProgress, ReadyForReview) => true,
            (ReadyForReview, Completed) => true,
            (from, Failed) => from.is_in_flight(),
            (Failed, Draft) | (Failed, Discussed) => true,
            _ => false,
        }
    }

    /// States the dispatcher keeps polling in.
    pub fn is_polling(&self) -> bool {
        matches!(
            self,
            PlanStatus::Delegating | PlanStatus::InProgress | PlanStatus::ReadyForReview
        )
    }

    /// States a running plan can be cancelled from.
    pub fn is_in_flight(&self) -> bool {
        matches!(
            self,
            PlanStatus::Discussing
                | PlanStatus::Discussed
                | PlanStatus::Delegating
                | PlanStatus::InProgress
                | PlanStatus::ReadyForReview
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, PlanStatus::Completed)
    }
}

impl std::fmt::Display for PlanStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            PlanStatus::Draft => "draft",
            PlanStatus::Discussing => "discussing",
            PlanStatus::Discussed => "discussed",
            PlanStatus::Delegating => "delegating",
            PlanStatus::InProgress => "in_progress",
            PlanStatus::ReadyForReview => "ready_for_review",
            PlanStatus::Completed => "completed",
            PlanStatus::Failed => "failed",
        };
        write!(f, "{}", name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BranchStrategy {
    /// Task branches are consolidated onto one shared branch per plan.
    #[default]
    FeatureBranch,
    /// Every task branch becomes its own pull request.
    RaisePrs,
}

impl std::fmt::Display for BranchStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BranchStrategy::FeatureBranch => write!(f, "feature_branch"),
            BranchStrategy::RaisePrs => write!(f, "raise_prs"),
        }
    }
}

impl FromStr for BranchStrategy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "feature_branch" | "feature-branch" => Ok(BranchStrategy::FeatureBranch),
            "raise_prs" | "raise-prs" => Ok(BranchStrategy::RaisePrs),
            other => Err(Error::Validation(format!(
                "unknown branch strategy '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorktreeStatus {
    Active,
    Cleaned,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum WorktreeKind {
    #[default]
    Task,
    Merge,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorktreeRecord {
    pub path: PathBuf,
    pub branch: String,
    pub repository_id: String,
    pub status: WorktreeStatus,
    #[serde(default)]
    pub kind: WorktreeKind,
    pub agent_id: Option<AgentId>,
    pub task_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl WorktreeRecord {
    pub fn new(path: PathBuf, branch: &str, repository_id: &str, kind: WorktreeKind) -> Self {
        Self {
            path,
            branch: branch.to_string(),
            repository_id: repository_id.to_string(),
            status: WorktreeStatus::Active,
            kind,
            agent_id: None,
            task_id: None,
            created_at: Utc::now(),
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == WorktreeStatus::Active
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Discussion {
    pub agent_profile: String,
    pub agent_id: Option<AgentId>,
    pub approved: bool,
    pub summary: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Discussion {
    pub fn start(agent_profile: &str) -> Self {
        Self {
            agent_profile: agent_profile.to_string(),
            agent_id: None,
            approved: false,
            summary: None,
            started_at: Utc::now(),
            completed_at: None,
        }
    }
}

/// A branch pushed to a remote while the plan ran.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushedBranch {
    pub repository_id: String,
    pub branch: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusChange {
    pub status: PlanStatus,
    pub at: DateTime<Utc>,
}

/// Parameters for a new plan.
#[derive(Debug, Clone, Default)]
pub struct NewPlan {
    pub title: String,
    pub description: Option<String>,
    pub repository_ids: Vec<String>,
    pub max_parallel_agents: Option<usize>,
    pub branch_strategy: BranchStrategy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    pub id: PlanId,
    pub title: String,
    pub description: Option<String>,
    pub status: PlanStatus,
    pub max_parallel_agents: usize,
    pub branch_strategy: BranchStrategy,
    pub feature_branch: Option<String>,
    #[serde(default)]
    pub repository_ids: Vec<String>,
    #[serde(default)]
    pub worktrees: Vec<WorktreeRecord>,
    pub discussion: Option<Discussion>,
    /// Agent profile the plan is executed with.
    #[serde(default)]
    pub reference_agent: Option<String>,
    #[serde(default)]
    pub pushed_branches: Vec<PushedBranch>,
    pub last_error: Option<String>,
    #[serde(default)]
    pub history: Vec<StatusChange>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Plan {
    pub fn new(params: NewPlan, default_max_parallel: usize) -> Self {
        let id = PlanId::new();
        let now = Utc::now();
        let feature_branch = match params.branch_strategy {
            BranchStrategy::FeatureBranch => Some(feature_branch_name(&params.title, &id)),
            BranchStrategy::RaisePrs => None,
        };
        Self {
            id,
            title: params.title,
            description: params.description,
            status: PlanStatus::Draft,
            max_parallel_agents: params
                .max_parallel_agents
                .unwrap_or(default_max_parallel)
                .max(1),
            branch_strategy: params.branch_strategy,
            feature_branch,
            repository_ids: params.repository_ids,
            worktrees: Vec::new(),
            discussion: None,
            reference_agent: None,
            pushed_branches: Vec::new(),
            last_error: None,
            history: vec![StatusChange {
                status: PlanStatus::Draft,
                at: now,
            }],
            created_at: now,
            updated_at: now,
        }
    }

    pub fn can_transition(&self, target: PlanStatus) -> bool {
        self.status.can_transition(target)
    }

    /// Move to `target`, rejecting edges outside the lifecycle graph.
    pub fn transition(&mut self, target: PlanStatus) -> Result<()> {
        if !self.can_transition(target) {
            return Err(Error::InvalidTransition {
                from: self.status,
                to: target,
            });
        }
        self.set_status(target);
        Ok(())
    }

    /// Undo a transition whose side effects failed to materialize.
    pub fn rollback(&mut self, previous: PlanStatus) {
        self.set_status(previous);
    }

    fn set_status(&mut self, status: PlanStatus) {
        self.status = status;
        self.touch();
        self.history.push(StatusChange {
            status,
            at: self.updated_at,
        });
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    pub fn discussion_approved(&self) -> bool {
        self.discussion.as_ref().is_some_and(|d| d.approved)
    }

    pub fn active_worktrees(&self) -> impl Iterator<Item = &WorktreeRecord> {
        self.worktrees.iter().filter(|w| w.is_active())
    }

    pub fn worktree_for_task(&self, task_id: &str) -> Option<&WorktreeRecord> {
        self.worktrees
            .iter()
            .rev()
            .find(|w| w.task_id.as_deref() == Some(task_id))
    }

    pub fn active_merge_worktree(&self) -> Option<&WorktreeRecord> {
        self.active_worktrees()
            .find(|w| w.kind == WorktreeKind::Merge)
    }

    pub fn mark_worktree_cleaned(&mut self, path: &Path) {
        for record in self.worktrees.iter_mut().filter(|w| w.path == path) {
            record.status = WorktreeStatus::Cleaned;
        }
        self.touch();
    }

    pub fn record_pushed_branch(&mut self, repository_id: &str, branch: &str) {
        let pushed = PushedBranch {
            repository_id: repository_id.to_string(),
            branch: branch.to_string(),
        };
        if !self.pushed_branches.contains(&pushed) {
            self.pushed_branches.push(pushed);
        }
    }

    /// Directory holding this plan's task store and worktrees.
    pub fn dir(&self, data_root: &Path) -> PathBuf {
        plan_dir(data_root, &self.id)
    }

    pub fn worktree_path(&self, data_root: &Path, repo_name: &str, name: &str) -> PathBuf {
        self.dir(data_root)
            .join("worktrees")
            .join(slugify(repo_name))
            .join(slugify(name))
    }
}

pub fn plan_dir(data_root: &Path, id: &PlanId) -> PathBuf {
    data_root.join("plans").join(id.to_string())
}

fn feature_branch_name(title: &str, id: &PlanId) -> String {
    let slug = slugify(title);
    if slug.is_empty() {
        format!("foreman/{}", id.short())
    } else {
        format!("foreman/{}-{}", slug, id.short())
    }
}
