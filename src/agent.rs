use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifier of a live agent process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AgentId(pub Uuid);

impl AgentId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Return first 8 characters of the UUID for display.
    pub fn short(&self) -> String {
        self.0.to_string()[..8].to_string()
    }
}

impl Default for AgentId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for AgentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What an agent process is doing for its plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentRole {
    Discussion,
    Orchestrator,
    Planner,
    Task,
    Merge,
}

impl AgentRole {
    /// Roles whose conversation survives restarts of the agent process.
    pub fn keeps_session(&self) -> bool {
        matches!(
            self,
            AgentRole::Discussion | AgentRole::Orchestrator | AgentRole::Planner
        )
    }
}

impl std::fmt::Display for AgentRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AgentRole::Discussion => write!(f, "discussion"),
            AgentRole::Orchestrator => write!(f, "orchestrator"),
            AgentRole::Planner => write!(f, "planner"),
            AgentRole::Task => write!(f, "task"),
            AgentRole::Merge => write!(f, "merge"),
        }
    }
}

/// A configured coding agent ("reference agent") that plans are run with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentProfile {
    pub id: String,
    pub name: String,
    pub command: String,
}

impl Default for AgentProfile {
    fn default() -> Self {
        Self {
            id: "claude".to_string(),
            name: "Claude".to_string(),
            command: "claude".to_string(),
        }
    }
}

impl AgentProfile {
    fn base_command(&self) -> Vec<String> {
        self.command.split_whitespace().map(String::from).collect()
    }

    pub fn binary(&self) -> String {
        self.base_command()
            .into_iter()
            .next()
            .unwrap_or_else(|| "claude".to_string())
    }

    pub fn is_available(&self) -> bool {
        which::which(self.binary()).is_ok()
    }

    /// Command line starting a brand new conversation with a known id.
    pub fn fresh_command(&self, session_id: &str) -> String {
        let mut cmd = self.base_command();
        cmd.push("--session-id".to_string());
        cmd.push(session_id.to_string());
        cmd.join(" ")
    }

    /// Command line resuming an existing conversation.
    pub fn resume_command(&self, session_id: &str) -> String {
        let mut cmd = self.base_command();
        cmd.push("--resume".to_string());
        cmd.push(session_id.to_string());
        cmd.join(" ")
    }

    /// Command line for an agent that does not keep a session.
    pub fn plain_command(&self) -> String {
        self.base_command().join(" ")
    }
}
