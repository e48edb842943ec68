//! Terminal automaton: one supervised interactive process per agent.
//!
//! An [`Automaton`] owns a [`ProcessHandle`] and a driver task. The driver
//! feeds every output chunk to the [`detect::DetectorSet`] and writes back
//! whatever the detectors ask for: the agent command once the shell prompt
//! shows, Enter on the trust dialog, shift-tab until edits are
//! auto-accepted. Callers interact through [`Subscription`]s,
//! [`Automaton::wait_for_output`] and the two text injection styles.

pub mod detect;
pub mod host;
pub mod registry;
pub mod session;

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use regex::Regex;
use std::sync::LazyLock;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::agent::{AgentId, AgentProfile, AgentRole};
use crate::config::AutomatonConfig;
use crate::core::plan::PlanId;
use crate::{Error, Result};

use detect::{strip_ansi, truncate_front, AcceptModeCycler, Action, DetectorSet, StartupGate, TrustDetector};
use host::{ProcessEvent, ProcessHandle, ProcessHost, SpawnSpec, BACK_TAB, ENTER};
use session::{SessionRecords, SessionStart, SessionStore};

pub use registry::AgentRegistry;

/// Agent CLI preview shown after a bulk paste, before it is submitted.
static PASTE_PREVIEW_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\[pasted (text|content)").unwrap());

const RECENT_CAP: usize = 32 * 1024;

/// Shared collaborators every automaton is started with.
#[derive(Clone)]
pub struct AutomatonDeps {
    pub host: Arc<dyn ProcessHost>,
    pub sessions: SessionStore,
    pub records: Arc<dyn SessionRecords>,
    pub timing: AutomatonConfig,
}

#[derive(Debug, Clone)]
pub enum Launch {
    /// Start `shell`, then type the agent command once the prompt is up.
    /// With a `session_key` the agent resumes or starts a tracked session.
    Interactive {
        shell: String,
        profile: AgentProfile,
        session_key: Option<String>,
    },
    /// Run `command` directly, as headless agents are.
    Direct { command: String },
}

#[derive(Debug, Clone)]
pub struct AutomatonSpec {
    pub name: String,
    pub cwd: PathBuf,
    pub role: AgentRole,
    pub plan_id: Option<PlanId>,
    pub task_id: Option<String>,
    pub launch: Launch,
    /// Cycle the agent into auto-accepting edits.
    pub accept_edits: bool,
    pub env: Vec<(String, String)>,
}

impl AutomatonSpec {
    pub fn new(name: impl Into<String>, cwd: PathBuf, role: AgentRole, launch: Launch) -> Self {
        Self {
            name: name.into(),
            cwd,
            role,
            plan_id: None,
            task_id: None,
            launch,
            accept_edits: false,
            env: Vec::new(),
        }
    }

    pub fn for_plan(mut self, plan_id: PlanId) -> Self {
        self.plan_id = Some(plan_id);
        self
    }

    pub fn for_task(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = Some(task_id.into());
        self
    }

    pub fn accepting_edits(mut self) -> Self {
        self.accept_edits = true;
        self
    }
}

/// Receiver of one automaton's output with its own cancellation.
pub struct Subscription {
    rx: broadcast::Receiver<ProcessEvent>,
    token: CancellationToken,
}

impl Subscription {
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Next event, or `None` once cancelled or the stream closed.
    pub async fn next(&mut self) -> Option<ProcessEvent> {
        loop {
            tokio::select! {
                _ = self.token.cancelled() => return None,
                event = self.rx.recv() => match event {
                    Ok(event) => return Some(event),
                    Err(RecvError::Lagged(n)) => debug!("subscription lagged by {} events", n),
                    Err(RecvError::Closed) => return None,
                },
            }
        }
    }

    /// Wait until output seen by this subscription matches `pattern`.
    ///
    /// Returns false on timeout, process exit or cancellation.
    pub async fn wait_for(&mut self, pattern: &Regex, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut seen = String::new();
        loop {
            let event = match tokio::time::timeout_at(deadline, self.next()).await {
                Ok(Some(event)) => event,
                Ok(None) | Err(_) => return false,
            };
            match event {
                ProcessEvent::Data(text) => {
                    seen.push_str(&strip_ansi(&text));
                    truncate_front(&mut seen, RECENT_CAP);
                    if pattern.is_match(&seen) {
                        return true;
                    }
                }
                ProcessEvent::Exit { .. } => return false,
            }
        }
    }

    pub fn unsubscribe(self) {
        self.token.cancel();
    }
}

/// An invalid expression is matched literally.
fn compile(pattern: &str) -> Option<Regex> {
    Regex::new(pattern)
        .or_else(|_| Regex::new(&regex::escape(pattern)))
        .ok()
}

fn mark_exited(exit: &watch::Sender<Option<Option<i32>>>, code: Option<i32>) {
    exit.send_if_modified(|state| {
        if state.is_none() {
            *state = Some(code);
            true
        } else {
            false
        }
    });
}

pub struct Automaton {
    pub id: AgentId,
    pub role: AgentRole,
    pub plan_id: Option<PlanId>,
    pub task_id: Option<String>,
    pub name: String,
    pub cwd: PathBuf,
    session: Option<SessionStart>,
    handle: Arc<dyn ProcessHandle>,
    cancel: CancellationToken,
    exit: Arc<watch::Sender<Option<Option<i32>>>>,
    recent: Arc<Mutex<String>>,
    timing: AutomatonConfig,
}

impl std::fmt::Debug for Automaton {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Automaton")
            .field("id", &self.id)
            .field("role", &self.role)
            .field("name", &self.name)
            .field("cwd", &self.cwd)
            .finish()
    }
}

impl Automaton {
    /// Start the process and its driver.
    pub async fn spawn(deps: &AutomatonDeps, spec: AutomatonSpec) -> Result<Arc<Self>> {
        let timing = deps.timing.clone();
        let trust = TrustDetector::new(
            &spec.cwd,
            timing.buffer_idle(),
            timing.trust_settle(),
            timing.trust_debounce(),
        );
        let mut detectors = DetectorSet::new(trust);
        let mut session = None;
        let mut session_key = None;

        let host_command = match &spec.launch {
            Launch::Interactive {
                shell,
                profile,
                session_key: key,
            } => {
                let command = match key {
                    Some(key) => {
                        let start =
                            deps.sessions
                                .resolve(key, &spec.cwd, deps.records.as_ref())?;
                        let command = start.command(profile);
                        session = Some(start);
                        session_key = Some(key.clone());
                        command
                    }
                    None => profile.plain_command(),
                };
                detectors = detectors.with_gate(
                    StartupGate::new(Instant::now(), timing.prompt_ready_timeout()),
                    command,
                );
                shell.clone()
            }
            Launch::Direct { command } => command.clone(),
        };
        if spec.accept_edits {
            detectors = detectors.with_cycler(AcceptModeCycler::new(
                timing.accept_mode_attempts,
                timing.trust_settle(),
            ));
        }
        if session_key.is_some() {
            detectors = detectors.watching_session();
        }

        debug!(
            "Automaton::spawn name={} role={} cwd={}",
            spec.name,
            spec.role,
            spec.cwd.display()
        );
        let handle = deps
            .host
            .spawn(&SpawnSpec {
                name: spec.name.clone(),
                cwd: spec.cwd.clone(),
                command: host_command,
                env: spec.env.clone(),
            })
            .await
            .map_err(|e| Error::Spawn(format!("{}: {}", spec.name, e)))?;

        let events = handle.subscribe();
        let (exit, _) = watch::channel(None);
        let automaton = Arc::new(Self {
            id: AgentId::new(),
            role: spec.role,
            plan_id: spec.plan_id,
            task_id: spec.task_id,
            name: spec.name,
            cwd: spec.cwd,
            session,
            handle: handle.clone(),
            cancel: CancellationToken::new(),
            exit: Arc::new(exit),
            recent: Arc::new(Mutex::new(String::new())),
            timing,
        });

        let driver = Driver {
            name: automaton.name.clone(),
            handle,
            events,
            detectors,
            cancel: automaton.cancel.clone(),
            exit: automaton.exit.clone(),
            recent: automaton.recent.clone(),
            sessions: session_key.map(|key| (deps.sessions.clone(), key)),
        };
        tokio::spawn(driver.run());

        Ok(automaton)
    }

    pub fn session(&self) -> Option<&SessionStart> {
        self.session.as_ref()
    }

    pub fn subscribe(&self) -> Subscription {
        Subscription {
            rx: self.handle.subscribe(),
            token: self.cancel.child_token(),
        }
    }

    /// Wait for output produced from now on to match `pattern`.
    pub async fn wait_for_output(&self, pattern: &str, timeout: Duration) -> bool {
        let Some(re) = compile(pattern) else {
            return false;
        };
        let mut sub = self.subscribe();
        let matched = sub.wait_for(&re, timeout).await;
        sub.unsubscribe();
        matched
    }

    /// Wait until `pattern` matches anything the process printed so far.
    pub async fn wait_until_shown(&self, pattern: &str, timeout: Duration) -> bool {
        let Some(re) = compile(pattern) else {
            return false;
        };
        let deadline = Instant::now() + timeout;
        loop {
            if re.is_match(&self.recent_output()) {
                return true;
            }
            if !self.is_alive() || Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    pub fn recent_output(&self) -> String {
        self.recent.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub async fn write(&self, data: &str) -> Result<()> {
        self.handle.write(data).await
    }

    /// Type `text` one character at a time, then press Enter.
    pub async fn type_text(&self, text: &str) -> Result<()> {
        let delay = self.timing.typing_delay();
        let mut buf = [0u8; 4];
        for c in text.chars() {
            self.handle.write(c.encode_utf8(&mut buf)).await?;
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
        }
        self.handle.write(ENTER).await
    }

    /// Write `text` in one go and submit it once the paste preview shows.
    ///
    /// Enter is sent even when no preview appears in time; the return value
    /// tells whether the preview was seen.
    pub async fn paste_text(&self, text: &str) -> Result<bool> {
        let mut sub = self.subscribe();
        self.handle.write(text).await?;
        let previewed = sub
            .wait_for(&PASTE_PREVIEW_RE, self.timing.paste_confirm_timeout())
            .await;
        sub.unsubscribe();
        if !previewed {
            debug!("{}: no paste preview, submitting anyway", self.name);
        }
        self.handle.write(ENTER).await?;
        Ok(previewed)
    }

    pub async fn resize(&self, cols: u16, rows: u16) -> Result<()> {
        self.handle.resize(cols, rows).await
    }

    pub async fn kill(&self) -> Result<()> {
        debug!("Automaton::kill name={}", self.name);
        self.cancel.cancel();
        let result = self.handle.kill().await;
        mark_exited(&self.exit, None);
        result
    }

    pub fn is_alive(&self) -> bool {
        self.exit.borrow().is_none() && self.handle.is_alive()
    }

    /// Exit code once the process is gone. `Some(None)` when it was killed
    /// or its status is unknown.
    pub fn exit_status(&self) -> Option<Option<i32>> {
        *self.exit.borrow()
    }

    pub async fn wait_exit(&self) -> Option<i32> {
        let mut rx = self.exit.subscribe();
        loop {
            let state = *rx.borrow_and_update();
            if let Some(code) = state {
                return code;
            }
            if rx.changed().await.is_err() {
                return None;
            }
        }
    }
}

struct Driver {
    name: String,
    handle: Arc<dyn ProcessHandle>,
    events: broadcast::Receiver<ProcessEvent>,
    detectors: DetectorSet,
    cancel: CancellationToken,
    exit: Arc<watch::Sender<Option<Option<i32>>>>,
    recent: Arc<Mutex<String>>,
    sessions: Option<(SessionStore, String)>,
}

impl Driver {
    async fn run(mut self) {
        loop {
            let deadline = self.detectors.next_deadline();
            let timer = async move {
                match deadline {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                _ = self.cancel.cancelled() => break,
                event = self.events.recv() => match event {
                    Ok(ProcessEvent::Data(text)) => {
                        self.remember(&text);
                        let actions = self.detectors.feed(&text, Instant::now());
                        self.perform(actions).await;
                    }
                    Ok(ProcessEvent::Exit { code }) => {
                        debug!("{} exited with {:?}", self.name, code);
                        mark_exited(&self.exit, code);
                        break;
                    }
                    Err(RecvError::Lagged(n)) => warn!("{}: driver lagged by {} events", self.name, n),
                    Err(RecvError::Closed) => {
                        mark_exited(&self.exit, None);
                        break;
                    }
                },
                _ = timer => {
                    let actions = self.detectors.poll(Instant::now());
                    self.perform(actions).await;
                }
            }
        }
    }

    fn remember(&self, text: &str) {
        let mut recent = self.recent.lock().unwrap_or_else(|e| e.into_inner());
        recent.push_str(&strip_ansi(text));
        truncate_front(&mut recent, RECENT_CAP);
    }

    async fn perform(&self, actions: Vec<Action>) {
        for action in actions {
            let result = match &action {
                Action::Launch(command) => {
                    debug!("{}: launching {}", self.name, command);
                    self.handle.write(&format!("{}{}", command, ENTER)).await
                }
                Action::ConfirmTrust => {
                    debug!("{}: confirming trust dialog", self.name);
                    self.handle.write(ENTER).await
                }
                Action::ToggleMode => self.handle.write(BACK_TAB).await,
                Action::SessionCleared => match &self.sessions {
                    Some((store, key)) => store.clear(key),
                    None => Ok(()),
                },
            };
            if let Err(e) = result {
                warn!("{}: {:?} failed: {}", self.name, action, e);
            }
        }
    }
}
