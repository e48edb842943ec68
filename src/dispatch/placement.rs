//! Where a ready task runs.
//!
//! A task names its repository and worktree through `repo:` and `worktree:`
//! labels. Tasks that cannot be placed are reported together, once per tick,
//! and retried on the next one.

use std::fmt;

use crate::core::plan::Plan;
use crate::core::repository::{Repository, RepositoryCatalog};
use crate::core::task::Task;
use crate::store::Placement;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlacementIssue {
    MissingLabels {
        task_id: String,
        missing: Vec<&'static str>,
    },
    UnknownRepository {
        task_id: String,
        repo: String,
    },
    /// The repository exists but the plan does not target it.
    OutsidePlan {
        task_id: String,
        repo: String,
    },
}

impl PlacementIssue {
    pub fn task_id(&self) -> &str {
        match self {
            PlacementIssue::MissingLabels { task_id, .. }
            | PlacementIssue::UnknownRepository { task_id, .. }
            | PlacementIssue::OutsidePlan { task_id, .. } => task_id,
        }
    }
}

impl fmt::Display for PlacementIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlacementIssue::MissingLabels { task_id, missing } => {
                let labels: Vec<String> = missing.iter().map(|k| format!("{}:", k)).collect();
                write!(f, "{} is missing {}", task_id, labels.join(" and "))
            }
            PlacementIssue::UnknownRepository { task_id, repo } => {
                write!(f, "{} names unknown repository '{}'", task_id, repo)
            }
            PlacementIssue::OutsidePlan { task_id, repo } => {
                write!(f, "{} targets '{}', which is not part of this plan", task_id, repo)
            }
        }
    }
}

/// A task's repository and worktree label.
#[derive(Debug, Clone, PartialEq)]
pub struct Resolved {
    pub repo: Repository,
    pub worktree: String,
}

pub fn resolve(task: &Task, plan: &Plan, repos: &RepositoryCatalog) -> Result<Resolved, PlacementIssue> {
    let placement = Placement::from_task(task).map_err(|missing| PlacementIssue::MissingLabels {
        task_id: task.id.clone(),
        missing,
    })?;
    let repo = repos
        .resolve(&placement.repo)
        .ok_or_else(|| PlacementIssue::UnknownRepository {
            task_id: task.id.clone(),
            repo: placement.repo.clone(),
        })?;
    if !plan.repository_ids.is_empty() && !plan.repository_ids.contains(&repo.id) {
        return Err(PlacementIssue::OutsidePlan {
            task_id: task.id.clone(),
            repo: placement.repo,
        });
    }
    Ok(Resolved {
        repo: repo.clone(),
        worktree: placement.worktree,
    })
}

/// One message covering every issue of a tick.
pub fn summarize(issues: &[PlacementIssue]) -> String {
    let details: Vec<String> = issues.iter().map(|i| i.to_string()).collect();
    format!(
        "{} ready task(s) could not be placed: {}",
        issues.len(),
        details.join("; ")
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::plan::NewPlan;
    use std::path::PathBuf;

    fn catalog() -> RepositoryCatalog {
        RepositoryCatalog::new(vec![
            Repository::new("r1", "api", PathBuf::from("/src/api")),
            Repository::new("r2", "web", PathBuf::from("/src/web")),
        ])
    }

    fn plan(repos: &[&str]) -> Plan {
        Plan::new(
            NewPlan {
                title: "p".to_string(),
                repository_ids: repos.iter().map(|r| r.to_string()).collect(),
                ..Default::default()
            },
            2,
        )
    }

    #[test]
    fn test_resolves_by_name() {
        let task = Task::new("bd-1", "x").with_labels(["repo:api", "worktree:auth"]);
        let resolved = resolve(&task, &plan(&[]), &catalog()).unwrap();
        assert_eq!(resolved.repo.id, "r1");
        assert_eq!(resolved.worktree, "auth");
    }

    #[test]
    fn test_missing_labels() {
        let task = Task::new("bd-2", "x").with_labels(["repo:api"]);
        let issue = resolve(&task, &plan(&[]), &catalog()).unwrap_err();
        assert_eq!(issue.to_string(), "bd-2 is missing worktree:");
    }

    #[test]
    fn test_unknown_and_outside_plan() {
        let task = Task::new("bd-3", "x").with_labels(["repo:mobile", "worktree:w"]);
        assert!(matches!(
            resolve(&task, &plan(&[]), &catalog()),
            Err(PlacementIssue::UnknownRepository { .. })
        ));

        let task = Task::new("bd-4", "x").with_labels(["repo:web", "worktree:w"]);
        let issue = resolve(&task, &plan(&["r1"]), &catalog()).unwrap_err();
        assert!(matches!(issue, PlacementIssue::OutsidePlan { .. }));
        assert_eq!(issue.task_id(), "bd-4");
    }

    #[test]
    fn test_summarize() {
        let issues = vec![
            PlacementIssue::MissingLabels {
                task_id: "a".to_string(),
                missing: vec!["repo", "worktree"],
            },
            PlacementIssue::UnknownRepository {
                task_id: "b".to_string(),
                repo: "x".to_string(),
            },
        ];
        assert_eq!(
            summarize(&issues),
            "2 ready task(s) could not be placed: a is missing repo: and worktree:; b names unknown repository 'x'"
        );
    }
}
