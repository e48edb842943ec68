//! Test fixtures for integration tests.
//!
//! Provides helpers for:
//! - Creating temporary git repositories
//! - A scripted process host standing in for tmux
//! - Fixed credentials and session records
//! - An orchestrator wired to all of the above

use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;
use tokio::sync::broadcast;

use foreman::automaton::host::{ProcessEvent, ProcessHandle, ProcessHost, SpawnSpec};
use foreman::automaton::session::SessionRecords;
use foreman::config::Config;
use foreman::core::assignment::AssignmentStatus;
use foreman::core::repository::Repository;
use foreman::core::task::Task;
use foreman::credentials::{CredentialProvider, Progress};
use foreman::dispatch::{TickOutcome, TickReport};
use foreman::persist::MemoryKv;
use foreman::store::labels::{repo_label, worktree_label};
use foreman::store::MemoryTaskStore;
use foreman::{Error, Orchestrator, Plan, PlanId, Result, Services};

/// Run git in `dir`, panicking with its output on failure.
pub fn git(dir: &Path, args: &[&str]) -> String {
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .expect("Failed to run git");
    assert!(
        output.status.success(),
        "git {:?} failed: {}",
        args,
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8_lossy(&output.stdout).trim().to_string()
}

/// A test repository with a temporary directory and initialized git.
pub struct TestRepo {
    /// The temporary directory containing the repo.
    pub temp_dir: TempDir,
    /// Path to the repository root.
    pub path: PathBuf,
}

impl TestRepo {
    /// Create a new test repository on `main` with an initial commit.
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let path = temp_dir.path().join("api");
        std::fs::create_dir_all(&path).expect("Failed to create repo directory");

        git(&path, &["init", "-b", "main"]);
        git(&path, &["config", "user.email", "test@test.com"]);
        git(&path, &["config", "user.name", "Test User"]);
        std::fs::write(path.join("README.md"), "# Test Repository\n").expect("Failed to write README");
        git(&path, &["add", "."]);
        git(&path, &["commit", "-m", "Initial commit"]);

        Self { temp_dir, path }
    }

    /// Add a bare `origin` beside the repository and push `main` to it.
    pub fn add_origin(&self) -> PathBuf {
        let origin = self.temp_dir.path().join("origin.git");
        git(self.temp_dir.path(), &["init", "--bare", "origin.git"]);
        git(&self.path, &["remote", "add", "origin", origin.to_str().expect("utf-8 path")]);
        git(&self.path, &["push", "-u", "origin", "main"]);
        origin
    }

    pub fn branch_exists(&self, branch: &str) -> bool {
        Command::new("git")
            .args(["rev-parse", "--verify", "--quiet", &format!("refs/heads/{}", branch)])
            .current_dir(&self.path)
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false)
    }
}

/// Whether the bare repository at `origin` has `branch`.
pub fn remote_has_branch(origin: &Path, branch: &str) -> bool {
    Command::new("git")
        .args(["rev-parse", "--verify", "--quiet", &format!("refs/heads/{}", branch)])
        .current_dir(origin)
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

/// Commit a file in a worktree.
pub fn commit_in(worktree: &Path, filename: &str, content: &str) {
    git(worktree, &["config", "user.email", "test@test.com"]);
    git(worktree, &["config", "user.name", "Test User"]);
    std::fs::write(worktree.join(filename), content).expect("Failed to write file");
    git(worktree, &["add", filename]);
    git(worktree, &["commit", "-m", &format!("add {}", filename)]);
}

/// A process that only does what the test tells it to.
pub struct FakeHandle {
    pub name: String,
    tx: broadcast::Sender<ProcessEvent>,
    alive: AtomicBool,
    writes: Mutex<Vec<String>>,
}

impl FakeHandle {
    pub fn emit(&self, text: &str) {
        let _ = self.tx.send(ProcessEvent::Data(text.to_string()));
    }

    pub fn exit(&self, code: i32) {
        self.alive.store(false, Ordering::SeqCst);
        let _ = self.tx.send(ProcessEvent::Exit { code: Some(code) });
    }

    pub fn writes(&self) -> Vec<String> {
        self.writes.lock().unwrap().clone()
    }
}

#[async_trait]
impl ProcessHandle for FakeHandle {
    fn name(&self) -> &str {
        &self.name
    }

    async fn write(&self, data: &str) -> Result<()> {
        self.writes.lock().unwrap().push(data.to_string());
        Ok(())
    }

    async fn resize(&self, _cols: u16, _rows: u16) -> Result<()> {
        Ok(())
    }

    async fn kill(&self) -> Result<()> {
        if self.alive.swap(false, Ordering::SeqCst) {
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

/// Records every spawn instead of starting processes.
#[derive(Default)]
pub struct FakeHost {
    spawned: Mutex<Vec<(SpawnSpec, Arc<FakeHandle>)>>,
    pub fail: AtomicBool,
}

impl FakeHost {
    pub fn names(&self) -> Vec<String> {
        self.spawned
            .lock()
            .unwrap()
            .iter()
            .map(|(spec, _)| spec.name.clone())
            .collect()
    }

    pub fn count(&self) -> usize {
        self.spawned.lock().unwrap().len()
    }

    /// Most recent process whose name ends with `suffix`.
    pub fn find(&self, suffix: &str) -> Option<Arc<FakeHandle>> {
        self.spawned
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|(spec, _)| spec.name.ends_with(suffix))
            .map(|(_, handle)| handle.clone())
    }
}

#[async_trait]
impl ProcessHost for FakeHost {
    async fn spawn(&self, spec: &SpawnSpec) -> Result<Arc<dyn ProcessHandle>> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(Error::Tmux("no server running".to_string()));
        }
        let (tx, _) = broadcast::channel(256);
        let handle = Arc::new(FakeHandle {
            name: spec.name.clone(),
            tx,
            alive: AtomicBool::new(true),
            writes: Mutex::new(Vec::new()),
        });
        self.spawned.lock().unwrap().push((spec.clone(), handle.clone()));
        Ok(handle)
    }
}

pub struct StaticCredentials(pub Option<String>);

#[async_trait]
impl CredentialProvider for StaticCredentials {
    fn token(&self) -> Option<String> {
        self.0.clone()
    }

    async fn acquire(&self, _progress: Progress<'_>) -> Result<String> {
        self.0
            .clone()
            .ok_or_else(|| Error::Credential("no token configured".to_string()))
    }
}

/// Session records that exist exactly when `present` is set.
#[derive(Default)]
pub struct FakeRecords {
    pub present: AtomicBool,
}

impl SessionRecords for FakeRecords {
    fn has_content(&self, _cwd: &Path, _session_id: &str) -> bool {
        self.present.load(Ordering::SeqCst)
    }
}

/// An orchestrator over one repository (`api`, id `r1`) and fake
/// collaborators.
pub struct TestEnv {
    pub repo: TestRepo,
    pub data: TempDir,
    pub orch: Orchestrator,
    pub host: Arc<FakeHost>,
    pub store: Arc<MemoryTaskStore>,
    pub kv: Arc<MemoryKv>,
    pub records: Arc<FakeRecords>,
}

impl TestEnv {
    pub fn new() -> Self {
        Self::with_config(|_| {})
    }

    pub fn with_config(adjust: impl FnOnce(&mut Config)) -> Self {
        let repo = TestRepo::new();
        let mut config = test_config(&repo);
        adjust(&mut config);
        let data = TempDir::new().expect("Failed to create data directory");
        let host = Arc::new(FakeHost::default());
        let store = Arc::new(MemoryTaskStore::new());
        let kv = Arc::new(MemoryKv::new());
        let records = Arc::new(FakeRecords::default());
        let orch = Orchestrator::new(
            config,
            data.path().to_path_buf(),
            Services {
                kv: kv.clone(),
                tasks: store.clone(),
                host: host.clone(),
                credentials: Arc::new(StaticCredentials(Some("token".to_string()))),
                records: records.clone(),
            },
        );
        Self {
            repo,
            data,
            orch,
            host,
            store,
            kv,
            records,
        }
    }

    pub fn root(&self, plan: &Plan) -> PathBuf {
        plan.dir(self.data.path())
    }

    /// Put a task the planner marked ready into the plan's store.
    pub fn ready_task(&self, plan: &Plan, id: &str, worktree: &str, blockers: &[&str]) {
        let task = Task::new(id, &format!("Task {}", id))
            .with_labels(["foreman-ready".to_string(), repo_label("api"), worktree_label(worktree)])
            .blocked_by(blockers.iter().copied());
        self.store.put(&self.root(plan), task);
    }

    pub fn close_task(&self, plan: &Plan, id: &str) {
        let task = self
            .store
            .get(&self.root(plan), id)
            .expect("task exists")
            .closed();
        self.store.put(&self.root(plan), task);
    }

    /// Wait until the task's prompt has been handed to its agent.
    pub async fn wait_sent(&self, id: &PlanId, task_id: &str) {
        let ctx = self.orch.context().clone();
        let id = *id;
        let sent = eventually(Duration::from_secs(3), || {
            let ctx = ctx.clone();
            async move {
                ctx.assignments(&id)
                    .await
                    .unwrap()
                    .get(task_id)
                    .is_some_and(|a| a.status == AssignmentStatus::Sent)
            }
        })
        .await;
        assert!(sent, "prompt for {} was never delivered", task_id);
    }

    /// Run one tick, retrying while a background tick holds the plan.
    pub async fn tick(&self, id: &PlanId) -> TickReport {
        for _ in 0..100 {
            match self.orch.tick(id).await.expect("tick failed") {
                TickOutcome::Ran(report) => return report,
                TickOutcome::Skipped => tokio::time::sleep(Duration::from_millis(20)).await,
                TickOutcome::Stopped => panic!("plan {} stopped polling", id.short()),
            }
        }
        panic!("tick for plan {} kept being skipped", id.short());
    }
}

fn test_config(repo: &TestRepo) -> Config {
    let mut config = Config::default();
    config.repositories = vec![Repository::new("r1", "api", repo.path.clone())];
    config.poll_interval_secs = 3600;
    config.shell = Some("sh".to_string());
    config.automaton.prompt_ready_timeout_ms = 50;
    config.automaton.agent_ready_timeout_ms = 50;
    config.automaton.typing_delay_ms = 0;
    config.automaton.paste_confirm_timeout_ms = 50;
    config
}

/// Poll `check` until it holds or `timeout` passes.
pub async fn eventually<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    check().await
}
