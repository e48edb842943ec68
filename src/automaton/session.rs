//! Agent conversation continuity.
//!
//! A long-lived agent (discussion, orchestrator, planner) is started with a
//! session id remembered under `session:<key>`. On the next start the id is
//! resumed, but only when the agent CLI actually wrote a non-empty transcript
//! for it; otherwise a new id is minted and the agent starts fresh.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::debug;
use uuid::Uuid;

use crate::agent::AgentProfile;
use crate::persist::KvStore;
use crate::{Error, Result};

pub fn session_key(key: &str) -> String {
    format!("session:{}", key)
}

/// Answers whether the agent CLI holds a usable record of a session.
pub trait SessionRecords: Send + Sync {
    fn has_content(&self, cwd: &Path, session_id: &str) -> bool;
}

/// Claude Code transcripts: `~/.claude/projects/<encoded cwd>/<id>.jsonl`.
#[derive(Debug, Clone)]
pub struct ClaudeTranscripts {
    projects_dir: PathBuf,
}

impl ClaudeTranscripts {
    pub fn new(projects_dir: PathBuf) -> Self {
        Self { projects_dir }
    }

    pub fn from_home() -> Result<Self> {
        let home = dirs::home_dir().ok_or(Error::NoHomeDir)?;
        Ok(Self::new(home.join(".claude").join("projects")))
    }

    pub fn transcript_path(&self, cwd: &Path, session_id: &str) -> PathBuf {
        self.projects_dir
            .join(encode_project_dir(cwd))
            .join(format!("{}.jsonl", session_id))
    }
}

/// Directory name the agent CLI uses for a working directory.
pub fn encode_project_dir(cwd: &Path) -> String {
    cwd.to_string_lossy()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect()
}

impl SessionRecords for ClaudeTranscripts {
    fn has_content(&self, cwd: &Path, session_id: &str) -> bool {
        std::fs::metadata(self.transcript_path(cwd, session_id))
            .map(|m| m.is_file() && m.len() > 0)
            .unwrap_or(false)
    }
}

/// How an agent process should start its conversation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionStart {
    Fresh(String),
    Resume(String),
}

impl SessionStart {
    pub fn id(&self) -> &str {
        match self {
            SessionStart::Fresh(id) | SessionStart::Resume(id) => id,
        }
    }

    pub fn is_resume(&self) -> bool {
        matches!(self, SessionStart::Resume(_))
    }

    pub fn command(&self, profile: &AgentProfile) -> String {
        match self {
            SessionStart::Fresh(id) => profile.fresh_command(id),
            SessionStart::Resume(id) => profile.resume_command(id),
        }
    }
}

#[derive(Clone)]
pub struct SessionStore {
    kv: Arc<dyn KvStore>,
}

impl SessionStore {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }

    pub fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self
            .kv
            .get(&session_key(key))?
            .filter(|id| !id.trim().is_empty()))
    }

    pub fn set(&self, key: &str, session_id: &str) -> Result<()> {
        self.kv.set(&session_key(key), session_id)
    }

    pub fn clear(&self, key: &str) -> Result<()> {
        debug!("SessionStore::clear key={}", key);
        self.kv.delete(&session_key(key))
    }

    /// Resume the stored session when its record has content, else mint and
    /// persist a new id.
    pub fn resolve(
        &self,
        key: &str,
        cwd: &Path,
        records: &dyn SessionRecords,
    ) -> Result<SessionStart> {
        if let Some(id) = self.get(key)? {
            if records.has_content(cwd, &id) {
                debug!("Resuming session {} for {}", id, key);
                return Ok(SessionStart::Resume(id));
            }
            debug!("Session {} for {} has no record, starting fresh", id, key);
        }
        let id = Uuid::new_v4().to_string();
        self.set(key, &id)?;
        Ok(SessionStart::Fresh(id))
    }
}
