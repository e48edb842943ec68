//! Host process layer for agents.
//!
//! The automaton only needs `spawn(cwd, command)` and a handle with
//! `write`, `resize`, `kill` plus an output event stream. [`TmuxHost`] is the
//! production implementation: one detached tmux session per agent, output
//! produced by polling `capture-pane`, exit observed through `#{pane_dead}`.

use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::process::Command;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::util::shell_escape;
use crate::{Error, Result};

/// Carriage return, what the Enter key sends.
pub const ENTER: &str = "\r";
/// Shift+Tab.
pub const BACK_TAB: &str = "\x1b[Z";
pub const ESCAPE: &str = "\x1b";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessEvent {
    Data(String),
    Exit { code: Option<i32> },
}

#[derive(Debug, Clone)]
pub struct SpawnSpec {
    /// Unique name for the process (tmux session name).
    pub name: String,
    pub cwd: PathBuf,
    /// Command line the host starts.
    pub command: String,
    pub env: Vec<(String, String)>,
}

#[async_trait]
pub trait ProcessHandle: Send + Sync {
    fn name(&self) -> &str;

    async fn write(&self, data: &str) -> Result<()>;

    async fn resize(&self, cols: u16, rows: u16) -> Result<()>;

    async fn kill(&self) -> Result<()>;

    fn subscribe(&self) -> broadcast::Receiver<ProcessEvent>;

    fn is_alive(&self) -> bool;
}

#[async_trait]
pub trait ProcessHost: Send + Sync {
    async fn spawn(&self, spec: &SpawnSpec) -> Result<Arc<dyn ProcessHandle>>;
}

/// How a chunk of written data reaches tmux.
#[derive(Debug, Clone, PartialEq, Eq)]
enum KeyChunk {
    /// Literal text (`send-keys -l`).
    Literal(String),
    /// A named key (`send-keys Enter`).
    Key(&'static str),
    /// Multi-line text, delivered as a bracketed paste.
    Paste(String),
}

fn key_chunks(data: &str) -> Vec<KeyChunk> {
    if data.contains('\n') {
        let body = data.strip_suffix(ENTER).unwrap_or(data);
        let mut chunks = vec![KeyChunk::Paste(body.to_string())];
        if body.len() != data.len() {
            chunks.push(KeyChunk::Key("Enter"));
        }
        return chunks;
    }

    let mut chunks = Vec::new();
    let mut literal = String::new();
    let mut rest = data;
    while !rest.is_empty() {
        let named = [(BACK_TAB, "BTab"), (ENTER, "Enter"), (ESCAPE, "Escape")]
            .into_iter()
            .find(|(seq, _)| rest.starts_with(seq));
        match named {
            Some((seq, key)) => {
                if !literal.is_empty() {
                    chunks.push(KeyChunk::Literal(std::mem::take(&mut literal)));
                }
                chunks.push(KeyChunk::Key(key));
                rest = &rest[seq.len()..];
            }
            None => {
                let c = rest.chars().next().unwrap_or_default();
                literal.push(c);
                rest = &rest[c.len_utf8()..];
            }
        }
    }
    if !literal.is_empty() {
        chunks.push(KeyChunk::Literal(literal));
    }
    chunks
}

/// Text in `current` that was not in `previous`.
///
/// Captures are whole-screen snapshots. When the screen scrolled, the
/// longest run of trailing lines of `previous` that opens `current` is
/// skipped; the last of those lines may have grown since.
fn new_output<'a>(previous: &str, current: &'a str) -> &'a str {
    if previous == current {
        return "";
    }
    if let Some(rest) = current.strip_prefix(previous) {
        return rest;
    }
    let prev: Vec<&str> = previous.lines().collect();
    let cur: Vec<&str> = current.lines().collect();
    let mut starts = Vec::with_capacity(cur.len());
    let mut pos = 0;
    for line in current.split_inclusive('\n') {
        starts.push(pos);
        pos += line.len();
    }

    for k in (1..=prev.len().min(cur.len())).rev() {
        let tail = &prev[prev.len() - k..];
        let head = &cur[..k];
        if tail.iter().all(|l| l.trim().is_empty()) {
            continue;
        }
        let last = k - 1;
        if tail[..last] == head[..last] && head[last].starts_with(tail[last]) {
            return &current[starts[last] + tail[last].len()..];
        }
    }
    current
}

async fn tmux(args: &[&str]) -> Result<String> {
    let output = Command::new("tmux").args(args).output().await?;
    if !output.status.success() {
        return Err(Error::Tmux(format!(
            "tmux {} failed: {}",
            args.first().copied().unwrap_or_default(),
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).to_string())
}

fn sanitize_session_name(s: &str) -> String {
    s.chars()
        .map(|c| {
            if c.is_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Runs every agent in its own detached tmux session.
#[derive(Debug, Clone)]
pub struct TmuxHost {
    capture_interval: Duration,
    width: u16,
    height: u16,
}

impl Default for TmuxHost {
    fn default() -> Self {
        Self::new(Duration::from_millis(200))
    }
}

impl TmuxHost {
    pub fn new(capture_interval: Duration) -> Self {
        Self {
            capture_interval,
            width: 200,
            height: 50,
        }
    }

    pub async fn is_available() -> bool {
        tmux(&["-V"]).await.is_ok()
    }
}

#[async_trait]
impl ProcessHost for TmuxHost {
    async fn spawn(&self, spec: &SpawnSpec) -> Result<Arc<dyn ProcessHandle>> {
        if spec.command.trim().is_empty() {
            return Err(Error::Validation("Command cannot be empty".to_string()));
        }
        let name = sanitize_session_name(&spec.name);
        let cwd = spec.cwd.display().to_string();
        let (width, height) = (self.width.to_string(), self.height.to_string());
        let mut args = vec![
            "new-session",
            "-d",
            "-s",
            &name,
            "-c",
            &cwd,
            "-x",
            &width,
            "-y",
            &height,
        ];
        let env: Vec<String> = spec
            .env
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();
        for pair in &env {
            args.push("-e");
            args.push(pair);
        }
        args.push(&spec.command);

        debug!("TmuxHost::spawn name={} cwd={}", name, cwd);
        tmux(&args).await?;
        if let Err(e) = tmux(&["set-option", "-t", &name, "remain-on-exit", "on"]).await {
            warn!("remain-on-exit not set for {}: {}", name, e);
        }

        let (tx, _) = broadcast::channel(1024);
        let handle = Arc::new(TmuxHandle {
            name,
            tx,
            alive: Arc::new(AtomicBool::new(true)),
            cancel: CancellationToken::new(),
            last_capture: Arc::new(Mutex::new(String::new())),
        });
        handle.start_capture(self.capture_interval);
        Ok(handle)
    }
}

pub struct TmuxHandle {
    name: String,
    tx: broadcast::Sender<ProcessEvent>,
    alive: Arc<AtomicBool>,
    cancel: CancellationToken,
    last_capture: Arc<Mutex<String>>,
}

impl TmuxHandle {
    fn start_capture(&self, interval: Duration) {
        let name = self.name.clone();
        let tx = self.tx.clone();
        let alive = self.alive.clone();
        let cancel = self.cancel.clone();
        let last = self.last_capture.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                match tmux(&["capture-pane", "-t", &name, "-p", "-J", "-S", "-2000"]).await {
                    Ok(capture) => {
                        let capture = capture.trim_end().to_string();
                        let mut previous = last.lock().unwrap_or_else(|e| e.into_inner());
                        let fresh = new_output(&previous, &capture).to_string();
                        *previous = capture;
                        drop(previous);
                        if !fresh.is_empty() {
                            trace!("{}: {} new bytes", name, fresh.len());
                            let _ = tx.send(ProcessEvent::Data(fresh));
                        }
                    }
                    Err(e) => {
                        debug!("capture failed for {}: {}", name, e);
                        alive.store(false, Ordering::SeqCst);
                        let _ = tx.send(ProcessEvent::Exit { code: None });
                        break;
                    }
                }

                if let Ok(status) =
                    tmux(&["display-message", "-t", &name, "-p", "#{pane_dead} #{pane_dead_status}"]).await
                {
                    let mut parts = status.split_whitespace();
                    if parts.next() == Some("1") {
                        let code = parts.next().and_then(|c| c.parse().ok());
                        debug!("{} exited with {:?}", name, code);
                        alive.store(false, Ordering::SeqCst);
                        let _ = tx.send(ProcessEvent::Exit { code });
                        break;
                    }
                }
            }
        });
    }

    async fn send(&self, chunk: &KeyChunk) -> Result<()> {
        match chunk {
            KeyChunk::Literal(text) => {
                tmux(&["send-keys", "-t", &self.name, "-l", "--", text]).await?;
            }
            KeyChunk::Key(key) => {
                tmux(&["send-keys", "-t", &self.name, key]).await?;
            }
            KeyChunk::Paste(text) => {
                let buffer = format!("foreman-{}", self.name);
                tmux(&["set-buffer", "-b", &buffer, "--", text]).await?;
                tmux(&["paste-buffer", "-p", "-d", "-b", &buffer, "-t", &self.name]).await?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl ProcessHandle for TmuxHandle {
    fn name(&self) -> &str {
        &self.name
    }

    async fn write(&self, data: &str) -> Result<()> {
        for chunk in key_chunks(data) {
            self.send(&chunk).await?;
        }
        Ok(())
    }

    async fn resize(&self, cols: u16, rows: u16) -> Result<()> {
        tmux(&[
            "resize-window",
            "-t",
            &self.name,
            "-x",
            &cols.to_string(),
            "-y",
            &rows.to_string(),
        ])
        .await?;
        Ok(())
    }

    async fn kill(&self) -> Result<()> {
        debug!("TmuxHandle::kill name={}", self.name);
        self.cancel.cancel();
        let was_alive = self.alive.swap(false, Ordering::SeqCst);
        if let Err(e) = tmux(&["kill-session", "-t", &self.name]).await {
            if !e.to_string().contains("can't find session") {
                return Err(e);
            }
            debug!("tmux session '{}' not found (already dead?)", self.name);
        }
        if was_alive {
            let _ = self.tx.send(ProcessEvent::Exit { code: None });
        }
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<ProcessEvent> {
        self.tx.subscribe()
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }
}

impl Drop for TmuxHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Shell command line starting `program` with `args`, each argument escaped.
pub fn command_line(program: &str, args: &[&str]) -> String {
    std::iter::once(program.to_string())
        .chain(args.iter().map(|a| shell_escape(a)))
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_chunks_plain_text() {
        assert_eq!(
            key_chunks("hello"),
            vec![KeyChunk::Literal("hello".to_string())]
        );
    }

    #[test]
    fn test_key_chunks_named_keys() {
        assert_eq!(
            key_chunks("claude --resume x\r"),
            vec![
                KeyChunk::Literal("claude --resume x".to_string()),
                KeyChunk::Key("Enter")
            ]
        );
        assert_eq!(key_chunks(BACK_TAB), vec![KeyChunk::Key("BTab")]);
        assert_eq!(key_chunks(ESCAPE), vec![KeyChunk::Key("Escape")]);
    }

    #[test]
    fn test_key_chunks_multiline_is_paste() {
        assert_eq!(
            key_chunks("line one\nline two"),
            vec![KeyChunk::Paste("line one\nline two".to_string())]
        );
        assert_eq!(
            key_chunks("a\nb\r"),
            vec![KeyChunk::Paste("a\nb".to_string()), KeyChunk::Key("Enter")]
        );
    }

    #[test]
    fn test_new_output_appended() {
        assert_eq!(new_output("$ ", "$ ls\nfile"), "ls\nfile");
        assert_eq!(new_output("same", "same"), "");
    }

    #[test]
    fn test_new_output_after_scroll() {
        let previous = "line1\nline2\nline3\nline4";
        let current = "line3\nline4\nline5";
        assert_eq!(new_output(previous, current), "\nline5");
    }

    #[test]
    fn test_new_output_after_long_scroll() {
        let previous = "a\nb\nc\nd\ne\nf";
        let current = "c\nd\ne\nf\ng\nh";
        assert_eq!(new_output(previous, current), "\ng\nh");
    }

    #[test]
    fn test_new_output_scroll_with_grown_line() {
        let previous = "l1\nl2\n$ ";
        let current = "l2\n$ ls\nfile";
        assert_eq!(new_output(previous, current), "ls\nfile");
    }

    #[test]
    fn test_new_output_unrelated_screen() {
        assert_eq!(new_output("old screen", "new screen"), "new screen");
    }

    #[test]
    fn test_sanitize_session_name() {
        assert_eq!(sanitize_session_name("plan:abc task/1"), "plan_abc_task_1");
    }

    #[test]
    fn test_command_line() {
        assert_eq!(
            command_line("claude", &["-p", "do the thing"]),
            "claude -p 'do the thing'"
        );
    }
}
