use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::debug;

use crate::agent::AgentProfile;
use crate::core::repository::Repository;
use crate::{Error, Result};

/// How task agents are started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DispatchMode {
    /// Interactive agent in a terminal session.
    #[default]
    Interactive,
    /// Agent inside a managed container; needs a credential.
    Headless,
}

/// Timing knobs for the terminal automaton.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AutomatonConfig {
    pub prompt_ready_timeout_ms: u64,
    pub trust_settle_ms: u64,
    pub buffer_idle_ms: u64,
    pub trust_debounce_ms: u64,
    pub accept_mode_attempts: u32,
    pub typing_delay_ms: u64,
    pub paste_confirm_timeout_ms: u64,
    pub agent_ready_timeout_ms: u64,
    pub capture_interval_ms: u64,
}

impl Default for AutomatonConfig {
    fn default() -> Self {
        Self {
            prompt_ready_timeout_ms: 3_000,
            trust_settle_ms: 500,
            buffer_idle_ms: 2_000,
            trust_debounce_ms: 5_000,
            accept_mode_attempts: 4,
            typing_delay_ms: 5,
            paste_confirm_timeout_ms: 2_000,
            agent_ready_timeout_ms: 30_000,
            capture_interval_ms: 200,
        }
    }
}

impl AutomatonConfig {
    pub fn prompt_ready_timeout(&self) -> Duration {
        Duration::from_millis(self.prompt_ready_timeout_ms)
    }

    pub fn trust_settle(&self) -> Duration {
        Duration::from_millis(self.trust_settle_ms)
    }

    pub fn buffer_idle(&self) -> Duration {
        Duration::from_millis(self.buffer_idle_ms)
    }

    pub fn trust_debounce(&self) -> Duration {
        Duration::from_millis(self.trust_debounce_ms)
    }

    pub fn typing_delay(&self) -> Duration {
        Duration::from_millis(self.typing_delay_ms)
    }

    pub fn paste_confirm_timeout(&self) -> Duration {
        Duration::from_millis(self.paste_confirm_timeout_ms)
    }

    pub fn agent_ready_timeout(&self) -> Duration {
        Duration::from_millis(self.agent_ready_timeout_ms)
    }

    pub fn capture_interval(&self) -> Duration {
        Duration::from_millis(self.capture_interval_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub poll_interval_secs: u64,
    pub default_max_parallel_agents: usize,
    pub label_prefix: String,
    pub data_dir: Option<String>,
    pub shell: Option<String>,
    pub dispatch_mode: DispatchMode,
    /// Command template for headless agents. `{token}`, `{workdir}` and
    /// `{prompt}` are substituted before launch.
    pub headless_command: String,
    pub login_command: Option<String>,
    pub credential_env: String,
    pub agents: Vec<AgentProfile>,
    pub repositories: Vec<Repository>,
    pub automaton: AutomatonConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            poll_interval_secs: 5,
            default_max_parallel_agents: 3,
            label_prefix: "foreman".to_string(),
            data_dir: None,
            shell: None,
            dispatch_mode: DispatchMode::Interactive,
            headless_command: "docker run --rm -i -e CLAUDE_CODE_OAUTH_TOKEN={token} -v {workdir}:/workspace -w /workspace foreman-agent claude -p {prompt}".to_string(),
            login_command: None,
            credential_env: "CLAUDE_CODE_OAUTH_TOKEN".to_string(),
            agents: vec![AgentProfile::default()],
            repositories: Vec::new(),
            automaton: AutomatonConfig::default(),
        }
    }
}

impl Config {
    pub fn foreman_dir() -> Result<PathBuf> {
        Ok(dirs::home_dir().ok_or(Error::NoHomeDir)?.join(".foreman"))
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::foreman_dir()?.join("foreman.toml"))
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }

    /// Root for plan directories and persisted records.
    pub fn data_root(&self) -> Result<PathBuf> {
        match &self.data_dir {
            Some(dir) => Ok(expand_tilde(dir)),
            None => Ok(Self::foreman_dir()?.join("data")),
        }
    }

    pub fn effective_shell(&self) -> String {
        self.shell
            .clone()
            .or_else(|| std::env::var("SHELL").ok().filter(|s| !s.trim().is_empty()))
            .unwrap_or_else(|| "bash".to_string())
    }

    pub fn ready_label(&self) -> String {
        format!("{}-ready", self.label_prefix)
    }

    pub fn sent_label(&self) -> String {
        format!("{}-sent", self.label_prefix)
    }

    pub fn agent(&self, id: &str) -> Result<&AgentProfile> {
        self.agents
            .iter()
            .find(|a| a.id == id)
            .ok_or_else(|| Error::AgentProfileNotFound(id.to_string()))
    }

    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        debug!("Config::load path={}", path.display());
        if !path.exists() {
            debug!("Config file not found, using defaults");
            return Ok(Self::default());
        }
        let config: Self = toml::from_str(&fs::read_to_string(path)?)?;
        debug!(
            "Config loaded: poll={}s max_agents={} prefix={} mode={:?}",
            config.poll_interval_secs,
            config.default_max_parallel_agents,
            config.label_prefix,
            config.dispatch_mode
        );
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        let dir = Self::foreman_dir()?;
        if !dir.exists() {
            debug!("Creating foreman directory");
            fs::create_dir_all(&dir)?;
        }
        let path = Self::config_path()?;
        fs::write(&path, toml::to_string_pretty(self)?)?;
        debug!("Config saved to {}", path.display());
        Ok(())
    }
}

fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}
