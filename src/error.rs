use thiserror::Error;

use crate::core::plan::{PlanId, PlanStatus};

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Git error: {0}")]
    Git(#[from] git2::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("Tmux error: {0}")]
    Tmux(String),

    #[error("Git command failed: {0}")]
    GitCommand(String),

    #[error("Task store error: {0}")]
    TaskStore(String),

    #[error("Failed to start agent: {0}")]
    Spawn(String),

    #[error("Credential error: {0}")]
    Credential(String),

    #[error("No home directory")]
    NoHomeDir,

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Task join error: {0}")]
    TaskJoin(String),

    #[error("Plan not found: {0}")]
    PlanNotFound(PlanId),

    #[error("Repository not found: {0}")]
    RepositoryNotFound(String),

    #[error("Agent profile not found: {0}")]
    AgentProfileNotFound(String),

    #[error("Invalid plan transition from {from} to {to}")]
    InvalidTransition { from: PlanStatus, to: PlanStatus },

    #[error("Task {bead_id} already has an assignment in plan {plan_id}")]
    AssignmentExists { plan_id: PlanId, bead_id: String },
}

pub type Result<T> = std::result::Result<T, Error>;
