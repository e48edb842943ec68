//! Task store backed by the `bd` (beads) command-line tool.

use async_trait::async_trait;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::process::Output;
use tokio::process::Command;
use tracing::{debug, instrument};

use crate::core::task::{IssueType, Task, TaskState};
use crate::store::{NewTask, TaskFilter, TaskStore};
use crate::{Error, Result};

/// Issue as printed by `bd ... --json`.
#[derive(Debug, Deserialize)]
struct RawIssue {
    id: String,
    #[serde(default)]
    title: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    issue_type: Option<String>,
    #[serde(default)]
    labels: Option<Vec<String>>,
    #[serde(default)]
    dependencies: Option<Vec<RawDependency>>,
    #[serde(default)]
    dependents: Option<Vec<RawDependency>>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawDependency {
    Id(String),
    Link {
        #[serde(default)]
        id: Option<String>,
        #[serde(default)]
        depends_on_id: Option<String>,
        #[serde(default, rename = "type", alias = "dependency_type")]
        kind: Option<String>,
    },
}

impl RawDependency {
    /// Target id when this is a blocking relation.
    fn blocking_target(&self) -> Option<&str> {
        match self {
            RawDependency::Id(id) => Some(id),
            RawDependency::Link {
                id,
                depends_on_id,
                kind,
            } => {
                if kind.as_deref().is_some_and(|k| k != "blocks") {
                    return None;
                }
                depends_on_id.as_deref().or(id.as_deref())
            }
        }
    }
}

impl From<RawIssue> for Task {
    fn from(raw: RawIssue) -> Self {
        let blocked_by = raw
            .dependencies
            .iter()
            .flatten()
            .filter_map(|d| d.blocking_target())
            .filter(|id| *id != raw.id)
            .map(String::from)
            .collect();
        Task {
            status: raw
                .status
                .as_deref()
                .map(TaskState::from_store)
                .unwrap_or_default(),
            issue_type: raw
                .issue_type
                .as_deref()
                .map(IssueType::from_store)
                .unwrap_or_default(),
            labels: raw.labels.unwrap_or_default().into_iter().collect(),
            description: raw.description.filter(|d| !d.is_empty()),
            title: raw.title,
            id: raw.id,
            blocked_by,
        }
    }
}

/// Runs `bd` with `--json` in the plan's task-store directory.
#[derive(Debug, Clone)]
pub struct BeadsCli {
    binary: PathBuf,
}

impl Default for BeadsCli {
    fn default() -> Self {
        Self::new("bd")
    }
}

impl BeadsCli {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    pub fn is_available(&self) -> bool {
        which::which(&self.binary).is_ok()
    }

    #[instrument(skip(self), fields(root = %root.display()))]
    async fn run(&self, root: &Path, args: &[&str]) -> Result<String> {
        debug!("bd {:?}", args);
        let output: Output = Command::new(&self.binary)
            .args(args)
            .current_dir(root)
            .output()
            .await
            .map_err(|e| Error::TaskStore(format!("failed to run bd: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            debug!("bd failed: {}", stderr);
            return Err(Error::TaskStore(format!(
                "bd {} failed: {}",
                args.first().copied().unwrap_or_default(),
                stderr
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    async fn run_json<T: for<'de> Deserialize<'de>>(&self, root: &Path, args: &[&str]) -> Result<T> {
        let stdout = self.run(root, args).await?;
        parse_json(&stdout)
    }
}

/// `bd` prints an array for list-like commands and either an object or a
/// one-element array for single issues; empty output means nothing matched.
fn parse_json<T: for<'de> Deserialize<'de>>(stdout: &str) -> Result<T> {
    let trimmed = stdout.trim();
    let body = if trimmed.is_empty() { "[]" } else { trimmed };
    Ok(serde_json::from_str(body)?)
}

fn single_issue(stdout: &str) -> Result<RawIssue> {
    let trimmed = stdout.trim();
    if trimmed.starts_with('[') {
        let mut issues: Vec<RawIssue> = serde_json::from_str(trimmed)?;
        if issues.is_empty() {
            return Err(Error::TaskStore("bd returned no issue".to_string()));
        }
        Ok(issues.remove(0))
    } else {
        Ok(serde_json::from_str(trimmed)?)
    }
}

#[async_trait]
impl TaskStore for BeadsCli {
    async fn init(&self, root: &Path, prefix: &str) -> Result<()> {
        tokio::fs::create_dir_all(root).await?;
        self.run(root, &["init", "--prefix", prefix, "--quiet"])
            .await?;
        Ok(())
    }

    async fn list(&self, root: &Path, filter: &TaskFilter) -> Result<Vec<Task>> {
        let mut args: Vec<String> = vec!["list".into(), "--json".into(), "--limit".into(), "0".into()];
        for label in &filter.labels {
            args.push("--label".into());
            args.push(label.clone());
        }
        if let Some(status) = filter.status {
            args.push("--status".into());
            args.push(status.to_string());
        } else {
            args.push("--all".into());
        }
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        let raw: Vec<RawIssue> = self.run_json(root, &args).await?;
        let tasks: Vec<Task> = raw.into_iter().map(Task::from).collect();
        // bd may treat several labels as OR; enforce AND here.
        Ok(tasks.into_iter().filter(|t| filter.matches(t)).collect())
    }

    async fn create(&self, root: &Path, task: NewTask) -> Result<Task> {
        let mut args: Vec<String> = vec![
            "create".into(),
            task.title.clone(),
            "--json".into(),
            "--type".into(),
            task.issue_type.as_str().into(),
        ];
        if let Some(description) = &task.description {
            args.push("--description".into());
            args.push(description.clone());
        }
        if !task.labels.is_empty() {
            args.push("--labels".into());
            args.push(task.labels.join(","));
        }
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        let stdout = self.run(root, &args).await?;
        Ok(single_issue(&stdout)?.into())
    }

    async fn update(
        &self,
        root: &Path,
        id: &str,
        add_labels: &[String],
        remove_labels: &[String],
    ) -> Result<()> {
        for label in add_labels {
            self.run(root, &["label", "add", id, label]).await?;
        }
        for label in remove_labels {
            self.run(root, &["label", "remove", id, label]).await?;
        }
        Ok(())
    }

    async fn close(&self, root: &Path, id: &str, message: &str) -> Result<()> {
        self.run(root, &["close", id, "--reason", message, "--json"])
            .await?;
        Ok(())
    }

    async fn add_dependency(&self, root: &Path, blocked: &str, blocker: &str) -> Result<()> {
        self.run(root, &["dep", "add", blocked, blocker, "--type", "blocks"])
            .await?;
        Ok(())
    }

    async fn dependents(&self, root: &Path, id: &str) -> Result<Vec<String>> {
        let stdout = self.run(root, &["show", id, "--json"]).await?;
        let issue = single_issue(&stdout)?;
        Ok(issue
            .dependents
            .iter()
            .flatten()
            .filter_map(|d| match d {
                RawDependency::Id(id) => Some(id.clone()),
                RawDependency::Link { id, kind, .. } => {
                    if kind.as_deref().is_some_and(|k| k != "blocks") {
                        None
                    } else {
                        id.clone()
                    }
                }
            })
            .collect())
    }
}
