//! Output detectors driving the terminal automaton.
//!
//! Every detector is a plain state machine. Output is pushed with
//! `feed(text, now)`, time is advanced with `poll(now)` and
//! `next_deadline()` tells the driver when the next `poll` is due. None of
//! them touch the process; they return what should be written instead.

use regex::Regex;
use std::path::Path;
use std::sync::LazyLock;
use std::time::Duration;
use tokio::time::Instant;

/// Characters a shell prompt ends with.
const PROMPT_SUFFIXES: &[char] = &['$', '%', '#', '>', '❯', '»', '➜'];

/// Phrases of the agent's "trust this folder" dialog.
const TRUST_PHRASES: &[&str] = &[
    "do you trust the files in this folder",
    "trust the files in this folder",
    "do you trust this folder",
    "yes, proceed",
];

/// Status-line text shown once auto-accept of edits is on.
pub const ACCEPT_EDITS_ON: &str = "accept edits on";

/// Status-line hints that the agent UI is up and its mode can be toggled.
const MODE_HINTS: &[&str] = &["for shortcuts", "shift+tab to cycle", "plan mode on", "bypass permissions"];

/// Output telling that the agent's conversation was wiped.
const SESSION_CLEARED_MARKERS: &[&str] = &["conversation cleared", "session cleared"];

/// Keep at most this much text in a rolling buffer.
const BUFFER_CAP: usize = 16 * 1024;

static ANSI_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\x1b\[[0-9;?]*[ -/]*[@-~]|\x1b\][^\x07\x1b]*(\x07|\x1b\\)|\x1b[@-Z\\-_]").unwrap()
});

/// `user@host:path`, optionally bracketed and followed by a prompt char.
static USER_AT_HOST_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\[?[\w.-]+@[\w.-]+(:\S*|\s+\S+\])\s*[$#%>❯]?\s*$").unwrap()
});

pub fn strip_ansi(text: &str) -> String {
    ANSI_RE.replace_all(text, "").to_string()
}

pub(crate) fn truncate_front(text: &mut String, cap: usize) {
    if text.len() <= cap {
        return;
    }
    let mut cut = text.len() - cap;
    while !text.is_char_boundary(cut) {
        cut += 1;
    }
    text.drain(..cut);
}

fn earliest(a: Option<Instant>, b: Option<Instant>) -> Option<Instant> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, None) => a,
        (None, b) => b,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferState {
    Idle,
    /// Collecting output; cleared once `deadline` passes without more.
    Buffering { deadline: Instant },
    /// A consumer matched the contents; further output is ignored until reset.
    Matched,
}

/// Accumulates recent output and forgets it after a quiet period.
#[derive(Debug, Clone)]
pub struct RollingBuffer {
    text: String,
    state: BufferState,
    idle: Duration,
}

impl RollingBuffer {
    pub fn new(idle: Duration) -> Self {
        Self {
            text: String::new(),
            state: BufferState::Idle,
            idle,
        }
    }

    pub fn state(&self) -> BufferState {
        self.state
    }

    pub fn contents(&self) -> &str {
        &self.text
    }

    pub fn feed(&mut self, chunk: &str, now: Instant) {
        if self.state == BufferState::Matched {
            return;
        }
        self.text.push_str(&strip_ansi(chunk));
        truncate_front(&mut self.text, BUFFER_CAP);
        self.state = BufferState::Buffering {
            deadline: now + self.idle,
        };
    }

    pub fn poll(&mut self, now: Instant) {
        if let BufferState::Buffering { deadline } = self.state {
            if now >= deadline {
                self.reset();
            }
        }
    }

    pub fn mark_matched(&mut self) {
        self.text.clear();
        self.state = BufferState::Matched;
    }

    pub fn reset(&mut self) {
        self.text.clear();
        self.state = BufferState::Idle;
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        match self.state {
            BufferState::Buffering { deadline } => Some(deadline),
            _ => None,
        }
    }
}

/// True when the last non-empty line looks like an interactive shell prompt.
pub fn looks_like_prompt(text: &str) -> bool {
    let Some(line) = text.lines().rev().map(str::trim_end).find(|l| !l.is_empty()) else {
        return false;
    };
    line.ends_with(PROMPT_SUFFIXES) || USER_AT_HOST_RE.is_match(line)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateReason {
    Prompt,
    Timeout,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GateState {
    Waiting { deadline: Instant },
    Fired(GateReason),
}

/// Holds the agent launch back until the shell prompt shows up.
#[derive(Debug, Clone)]
pub struct StartupGate {
    state: GateState,
    tail: String,
}

impl StartupGate {
    pub fn new(now: Instant, fallback: Duration) -> Self {
        Self {
            state: GateState::Waiting {
                deadline: now + fallback,
            },
            tail: String::new(),
        }
    }

    pub fn is_fired(&self) -> bool {
        matches!(self.state, GateState::Fired(_))
    }

    /// Returns the reason exactly once, when the gate opens.
    pub fn feed(&mut self, text: &str, now: Instant) -> Option<GateReason> {
        if self.is_fired() {
            return None;
        }
        self.tail.push_str(&strip_ansi(text));
        truncate_front(&mut self.tail, 1024);
        if looks_like_prompt(&self.tail) {
            self.state = GateState::Fired(GateReason::Prompt);
            self.tail.clear();
            return Some(GateReason::Prompt);
        }
        self.poll(now)
    }

    pub fn poll(&mut self, now: Instant) -> Option<GateReason> {
        match self.state {
            GateState::Waiting { deadline } if now >= deadline => {
                self.state = GateState::Fired(GateReason::Timeout);
                self.tail.clear();
                Some(GateReason::Timeout)
            }
            _ => None,
        }
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        match self.state {
            GateState::Waiting { deadline } => Some(deadline),
            GateState::Fired(_) => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrustState {
    Watching,
    /// Dialog seen; confirm once the screen had time to settle.
    Settling { confirm_at: Instant },
    /// Confirmed recently; the same dialog text is ignored until `until`.
    Cooldown { until: Instant },
}

/// Answers the agent's "trust this folder" dialog for the working directory.
#[derive(Debug, Clone)]
pub struct TrustDetector {
    buffer: RollingBuffer,
    state: TrustState,
    markers: Vec<String>,
    settle: Duration,
    debounce: Duration,
}

impl TrustDetector {
    pub fn new(dir: &Path, idle: Duration, settle: Duration, debounce: Duration) -> Self {
        let mut markers = vec![dir.display().to_string().to_lowercase()];
        if let Some(name) = dir.file_name() {
            markers.push(name.to_string_lossy().to_lowercase());
        }
        markers.retain(|m| !m.is_empty());
        Self {
            buffer: RollingBuffer::new(idle),
            state: TrustState::Watching,
            markers,
            settle,
            debounce,
        }
    }

    pub fn state(&self) -> TrustState {
        self.state
    }

    fn is_trust_dialog(&self, text: &str) -> bool {
        let text = text.to_lowercase();
        TRUST_PHRASES.iter().any(|p| text.contains(p))
            && self.markers.iter().any(|m| text.contains(m.as_str()))
    }

    pub fn feed(&mut self, text: &str, now: Instant) {
        if self.state != TrustState::Watching {
            return;
        }
        self.buffer.feed(text, now);
        if self.is_trust_dialog(self.buffer.contents()) {
            self.buffer.mark_matched();
            self.state = TrustState::Settling {
                confirm_at: now + self.settle,
            };
        }
    }

    /// Returns true when Enter should be sent to accept the dialog.
    pub fn poll(&mut self, now: Instant) -> bool {
        self.buffer.poll(now);
        match self.state {
            TrustState::Settling { confirm_at } if now >= confirm_at => {
                self.state = TrustState::Cooldown {
                    until: now + self.debounce,
                };
                true
            }
            TrustState::Cooldown { until } if now >= until => {
                self.state = TrustState::Watching;
                self.buffer.reset();
                false
            }
            _ => false,
        }
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        let own = match self.state {
            TrustState::Watching => None,
            TrustState::Settling { confirm_at } => Some(confirm_at),
            TrustState::Cooldown { until } => Some(until),
        };
        earliest(own, self.buffer.next_deadline())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CyclerState {
    /// Agent UI not seen yet.
    Waiting,
    Cycling { attempts: u32, next_at: Instant },
    Confirmed,
    GaveUp,
}

/// Toggles the agent's permission mode with shift-tab until edits are
/// auto-accepted.
#[derive(Debug, Clone)]
pub struct AcceptModeCycler {
    state: CyclerState,
    max_attempts: u32,
    interval: Duration,
    tail: String,
}

impl AcceptModeCycler {
    pub fn new(max_attempts: u32, interval: Duration) -> Self {
        Self {
            state: CyclerState::Waiting,
            max_attempts,
            interval,
            tail: String::new(),
        }
    }

    pub fn state(&self) -> CyclerState {
        self.state
    }

    /// Once confirmed or abandoned the cycler never acts again.
    pub fn is_done(&self) -> bool {
        matches!(self.state, CyclerState::Confirmed | CyclerState::GaveUp)
    }

    pub fn feed(&mut self, text: &str, now: Instant) {
        if self.is_done() {
            return;
        }
        self.tail.push_str(&strip_ansi(text).to_lowercase());
        truncate_front(&mut self.tail, 2048);

        if self.tail.contains(ACCEPT_EDITS_ON) {
            self.state = CyclerState::Confirmed;
            self.tail.clear();
            return;
        }
        if self.state == CyclerState::Waiting && MODE_HINTS.iter().any(|h| self.tail.contains(h)) {
            self.state = CyclerState::Cycling {
                attempts: 0,
                next_at: now,
            };
        }
    }

    /// Returns true when a shift-tab should be sent.
    pub fn poll(&mut self, now: Instant) -> bool {
        let CyclerState::Cycling { attempts, next_at } = self.state else {
            return false;
        };
        if now < next_at {
            return false;
        }
        if attempts >= self.max_attempts {
            self.state = CyclerState::GaveUp;
            return false;
        }
        // Only output after this toggle counts as confirmation.
        self.tail.clear();
        self.state = CyclerState::Cycling {
            attempts: attempts + 1,
            next_at: now + self.interval,
        };
        true
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        match self.state {
            CyclerState::Cycling { next_at, .. } => Some(next_at),
            _ => None,
        }
    }
}

pub fn is_session_cleared(text: &str) -> bool {
    let text = text.to_lowercase();
    SESSION_CLEARED_MARKERS.iter().any(|m| text.contains(m))
}

/// What the driver should do in response to output or time passing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Type the agent command into the now-ready shell.
    Launch(String),
    /// Send Enter to accept the trust dialog.
    ConfirmTrust,
    /// Send shift-tab.
    ToggleMode,
    /// Forget the persisted session id.
    SessionCleared,
}

/// The detectors one automaton runs, wired together.
///
/// Trust and mode detection start only after the agent command has been
/// launched; the shell never shows either.
#[derive(Debug, Clone)]
pub struct DetectorSet {
    gate: Option<(StartupGate, String)>,
    launched: bool,
    trust: TrustDetector,
    cycler: Option<AcceptModeCycler>,
    watch_session: bool,
}

impl DetectorSet {
    pub fn new(trust: TrustDetector) -> Self {
        Self {
            gate: None,
            launched: true,
            trust,
            cycler: None,
            watch_session: false,
        }
    }

    /// Launch `command` once the shell prompt appears.
    pub fn with_gate(mut self, gate: StartupGate, command: impl Into<String>) -> Self {
        self.gate = Some((gate, command.into()));
        self.launched = false;
        self
    }

    pub fn with_cycler(mut self, cycler: AcceptModeCycler) -> Self {
        self.cycler = Some(cycler);
        self
    }

    pub fn watching_session(mut self) -> Self {
        self.watch_session = true;
        self
    }

    pub fn is_launched(&self) -> bool {
        self.launched
    }

    fn gate_fired(&mut self, fired: Option<GateReason>, actions: &mut Vec<Action>) {
        if fired.is_some() {
            if let Some((_, command)) = &self.gate {
                actions.push(Action::Launch(command.clone()));
            }
            self.launched = true;
        }
    }

    pub fn feed(&mut self, text: &str, now: Instant) -> Vec<Action> {
        let mut actions = Vec::new();
        if !self.launched {
            let fired = self.gate.as_mut().and_then(|(g, _)| g.feed(text, now));
            self.gate_fired(fired, &mut actions);
            return actions;
        }
        self.trust.feed(text, now);
        if let Some(cycler) = self.cycler.as_mut() {
            cycler.feed(text, now);
        }
        if self.watch_session && is_session_cleared(text) {
            actions.push(Action::SessionCleared);
        }
        actions.extend(self.poll(now));
        actions
    }

    pub fn poll(&mut self, now: Instant) -> Vec<Action> {
        let mut actions = Vec::new();
        if !self.launched {
            let fired = self.gate.as_mut().and_then(|(g, _)| g.poll(now));
            self.gate_fired(fired, &mut actions);
            return actions;
        }
        if self.trust.poll(now) {
            actions.push(Action::ConfirmTrust);
        }
        // Hold mode toggles while a trust confirmation is pending.
        let trust_pending = matches!(self.trust.state(), TrustState::Settling { .. });
        if let Some(cycler) = self.cycler.as_mut() {
            if !trust_pending && cycler.poll(now) {
                actions.push(Action::ToggleMode);
            }
        }
        actions
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        if !self.launched {
            return self.gate.as_ref().and_then(|(g, _)| g.next_deadline());
        }
        earliest(
            self.trust.next_deadline(),
            self.cycler.as_ref().and_then(|c| c.next_deadline()),
        )
    }
}
