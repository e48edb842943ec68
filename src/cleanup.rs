//! Worktree and branch cleanup for a plan.
//!
//! Cleanup is idempotent: records already marked cleaned are skipped, and a
//! failure in one repository never stops the rest of the plan from being
//! cleaned. A branch is only deleted after its worktree is gone.

use std::collections::BTreeSet;
use std::path::PathBuf;

use tracing::{debug, warn};

use crate::core::plan::{Plan, WorktreeKind};
use crate::core::repository::RepositoryCatalog;
use crate::git::WorktreeCoordinator;

/// Report of cleanup operations performed.
#[derive(Debug, Clone, Default)]
pub struct CleanupReport {
    /// Worktrees that were removed.
    pub removed: Vec<PathBuf>,
    /// Worktrees already cleaned before this run.
    pub skipped: Vec<PathBuf>,
    /// Worktrees that could not be removed.
    pub failed: Vec<(PathBuf, String)>,
    pub branches_deleted: Vec<String>,
}

impl CleanupReport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn total_processed(&self) -> usize {
        self.removed.len() + self.skipped.len() + self.failed.len()
    }

    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn merge(&mut self, other: CleanupReport) {
        self.removed.extend(other.removed);
        self.skipped.extend(other.skipped);
        self.failed.extend(other.failed);
        self.branches_deleted.extend(other.branches_deleted);
    }
}

/// Remove every active worktree of `plan`, then delete its task branch.
///
/// Merge worktrees sit on the shared feature branch, which is kept. The
/// caller marks `report.removed` as cleaned on the plan.
pub async fn cleanup_plan_worktrees(
    plan: &Plan,
    repos: &RepositoryCatalog,
    git: &WorktreeCoordinator,
) -> CleanupReport {
    let mut report = CleanupReport::new();
    let mut touched = BTreeSet::new();

    for record in &plan.worktrees {
        if !record.is_active() {
            report.skipped.push(record.path.clone());
            continue;
        }
        let repo = match repos.get(&record.repository_id) {
            Ok(repo) => repo,
            Err(e) => {
                report.failed.push((record.path.clone(), e.to_string()));
                continue;
            }
        };
        touched.insert(repo.id.clone());

        if let Err(e) = git.remove_worktree(repo, &record.path, true).await {
            warn!(
                "cleanup: failed to remove worktree {}: {}",
                record.path.display(),
                e
            );
            report.failed.push((record.path.clone(), e.to_string()));
            continue;
        }
        report.removed.push(record.path.clone());

        if record.kind == WorktreeKind::Task {
            match git.delete_branch(repo, &record.branch).await {
                Ok(()) => report.branches_deleted.push(record.branch.clone()),
                Err(e) => warn!("cleanup: failed to delete branch {}: {}", record.branch, e),
            }
        }
    }

    for repo_id in touched {
        if let Ok(repo) = repos.get(&repo_id) {
            if let Err(e) = git.prune_worktrees(repo).await {
                warn!("cleanup: prune failed for {}: {}", repo.name, e);
            }
        }
    }

    debug!(
        "cleanup plan={} removed={} skipped={} failed={}",
        plan.id.short(),
        report.removed.len(),
        report.skipped.len(),
        report.failed.len()
    );
    report
}
