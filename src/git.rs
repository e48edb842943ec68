//! Git worktree and branch lifecycle.
//!
//! [`GitOps`] is the synchronous `git2` layer for one repository; network
//! operations (fetch, push) shell out to `git` and pull requests to `gh`.
//! [`WorktreeCoordinator`] wraps it for async callers, running every call on
//! the blocking pool.

use std::path::{Path, PathBuf};
use std::process::Command;

use git2::{BranchType, ErrorCode, Oid, StatusOptions, WorktreeAddOptions, WorktreePruneOptions};
use tracing::{debug, warn};

use crate::core::plan::{BranchStrategy, Plan};
use crate::core::repository::Repository;
use crate::util::{blocking, slugify};
use crate::{Error, Result};

pub const REMOTE: &str = "origin";

pub struct GitOps {
    repo_path: PathBuf,
}

impl GitOps {
    pub fn new(repo_path: &Path) -> Result<Self> {
        debug!("GitOps::new path={}", repo_path.display());
        let _ = git2::Repository::discover(repo_path)?;
        Ok(Self {
            repo_path: repo_path.to_path_buf(),
        })
    }

    fn repo(&self) -> Result<git2::Repository> {
        Ok(git2::Repository::discover(&self.repo_path)?)
    }

    pub fn repo_path(&self) -> &Path {
        &self.repo_path
    }

    /// Resolve the commit a new branch should start from.
    ///
    /// Prefers the local branch `base`, unless the remote-tracking branch has
    /// moved past it. Falls back to HEAD when neither exists.
    fn resolve_base(&self, repo: &git2::Repository, base: &str) -> Result<Oid> {
        let local = repo
            .find_branch(base, BranchType::Local)
            .ok()
            .and_then(|b| b.get().target());
        let remote = repo
            .find_branch(&format!("{}/{}", REMOTE, base), BranchType::Remote)
            .ok()
            .and_then(|b| b.get().target());

        match (local, remote) {
            (Some(l), Some(r)) if l != r && repo.graph_descendant_of(r, l)? => Ok(r),
            (Some(l), _) => Ok(l),
            (None, Some(r)) => Ok(r),
            (None, None) => {
                debug!("base '{}' not found, using HEAD", base);
                Ok(repo.head()?.peel_to_commit()?.id())
            }
        }
    }

    /// Add a worktree at `path` checked out on `branch`.
    ///
    /// `branch` is created from `base` unless it already exists, in which case
    /// the existing branch is checked out as is.
    pub fn create_worktree(&self, name: &str, branch: &str, path: &Path, base: &str) -> Result<()> {
        debug!(
            "GitOps::create_worktree name={} branch={} base={} path={}",
            name,
            branch,
            base,
            path.display()
        );
        let repo = self.repo()?;
        let branch_ref = match repo.find_branch(branch, BranchType::Local) {
            Ok(existing) => existing.into_reference(),
            Err(e) if e.code() == ErrorCode::NotFound => {
                let oid = self.resolve_base(&repo, base)?;
                let commit = repo.find_commit(oid)?;
                debug!("Creating branch {} from {}", branch, oid);
                repo.branch(branch, &commit, false)?.into_reference()
            }
            Err(e) => return Err(e.into()),
        };

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut opts = WorktreeAddOptions::new();
        opts.reference(Some(&branch_ref));
        repo.worktree(name, path, Some(&opts))?;
        debug!("Worktree created");
        Ok(())
    }

    /// Remove the worktree at `path`, its directory and its admin entry.
    ///
    /// A worktree with uncommitted changes is refused unless `force`.
    pub fn remove_worktree(&self, path: &Path, force: bool) -> Result<()> {
        debug!(
            "GitOps::remove_worktree path={} force={}",
            path.display(),
            force
        );
        if !force && Self::is_dirty(path) {
            return Err(Error::Validation(format!(
                "worktree {} has uncommitted changes",
                path.display()
            )));
        }

        let repo = self.repo()?;
        let names: Vec<String> = repo
            .worktrees()?
            .iter()
            .flatten()
            .map(String::from)
            .collect();
        let name = names
            .iter()
            .find(|name| {
                repo.find_worktree(name)
                    .map(|wt| same_path(wt.path(), path))
                    .unwrap_or(false)
            })
            .cloned();

        if let Some(name) = &name {
            if let Ok(worktree) = repo.find_worktree(name) {
                let _ = worktree.unlock();
                if let Err(e) = worktree.prune(Some(prune_all().working_tree(true))) {
                    warn!("Worktree prune failed for '{}': {}", name, e);
                }
            }
            // git keeps the branch "checked out" while the admin dir exists.
            let admin_dir = repo.path().join("worktrees").join(name);
            if admin_dir.exists() {
                let _ = std::fs::remove_dir_all(&admin_dir);
            }
        }

        if path.exists() {
            std::fs::remove_dir_all(path)?;
        }
        debug!("Worktree removed (admin entry {:?})", name);
        Ok(())
    }

    /// Prune admin entries whose working directory is gone.
    pub fn prune_worktrees(&self) -> Result<usize> {
        let repo = self.repo()?;
        let mut pruned = 0;
        for name in repo.worktrees()?.iter().flatten() {
            if let Ok(wt) = repo.find_worktree(name) {
                if !wt.path().exists() && wt.prune(Some(&mut prune_all())).is_ok() {
                    pruned += 1;
                }
            }
        }
        debug!("prune_worktrees: pruned {}", pruned);
        Ok(pruned)
    }

    pub fn branch_exists(&self, branch: &str) -> Result<bool> {
        let repo = self.repo()?;
        let exists = match repo.find_branch(branch, BranchType::Local) {
            Ok(_) => true,
            Err(e) if e.code() == ErrorCode::NotFound => false,
            Err(e) => return Err(e.into()),
        };
        Ok(exists)
    }

    /// Create `branch` from `from` if it does not exist. Returns whether it
    /// was created.
    pub fn ensure_branch(&self, branch: &str, from: &str) -> Result<bool> {
        if self.branch_exists(branch)? {
            return Ok(false);
        }
        let repo = self.repo()?;
        let oid = self.resolve_base(&repo, from)?;
        repo.branch(branch, &repo.find_commit(oid)?, false)?;
        debug!("ensure_branch: created {} from {}", branch, from);
        Ok(true)
    }

    /// Delete a local branch. Missing branches are fine; other failures are
    /// logged and swallowed.
    pub fn delete_branch(&self, branch: &str) -> Result<()> {
        let repo = self.repo()?;
        match repo.find_branch(branch, BranchType::Local) {
            Ok(mut b) => match b.delete() {
                Ok(()) => debug!("Branch deleted: {}", branch),
                Err(e) => warn!("Failed to delete branch '{}': {}", branch, e),
            },
            Err(e) if e.code() == ErrorCode::NotFound => {
                debug!("Branch '{}' not found (already deleted?)", branch)
            }
            Err(e) => warn!("Error looking up branch '{}': {}", branch, e),
        }
        Ok(())
    }

    /// Whether every commit of `branch` is reachable from `into`. A missing
    /// `branch` counts as merged.
    pub fn is_merged(&self, branch: &str, into: &str) -> Result<bool> {
        let repo = self.repo()?;
        let Some(tip) = repo
            .find_branch(branch, BranchType::Local)
            .ok()
            .and_then(|b| b.get().target())
        else {
            return Ok(true);
        };
        let target = self.resolve_base(&repo, into)?;
        Ok(tip == target || repo.graph_descendant_of(target, tip)?)
    }

    pub fn has_remote(&self) -> bool {
        self.repo()
            .map(|repo| repo.find_remote(REMOTE).is_ok())
            .unwrap_or(false)
    }

    /// Uncommitted changes (staged, unstaged or untracked). Missing or
    /// non-repository paths are clean.
    pub fn is_dirty(path: &Path) -> bool {
        let Ok(repo) = git2::Repository::open(path) else {
            return false;
        };
        let mut opts = StatusOptions::new();
        opts.include_untracked(true).include_ignored(false);
        repo.statuses(Some(&mut opts))
            .map(|s| !s.is_empty())
            .unwrap_or(false)
    }

    fn run(&self, program: &str, args: &[&str], dir: &Path) -> Result<String> {
        debug!("{} {:?} in {}", program, args, dir.display());
        let output = Command::new(program)
            .args(args)
            .current_dir(dir)
            .output()?;
        if !output.status.success() {
            return Err(Error::GitCommand(format!(
                "{} {} failed: {}",
                program,
                args.join(" "),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    pub fn fetch_branch(&self, branch: &str) -> Result<()> {
        self.run("git", &["fetch", REMOTE, branch], &self.repo_path)?;
        Ok(())
    }

    pub fn push_branch(&self, branch: &str) -> Result<()> {
        self.run("git", &["push", "-u", REMOTE, branch], &self.repo_path)?;
        Ok(())
    }

    pub fn delete_remote_branch(&self, branch: &str) -> Result<()> {
        self.run("git", &["push", REMOTE, "--delete", branch], &self.repo_path)?;
        Ok(())
    }

    /// Open a pull request for `branch` against `base` with `gh`. Returns the
    /// URL `gh` prints.
    pub fn open_pull_request(&self, branch: &str, base: &str, title: &str, body: &str) -> Result<String> {
        self.run(
            "gh",
            &[
                "pr", "create", "--head", branch, "--base", base, "--title", title, "--body", body,
            ],
            &self.repo_path,
        )
    }
}

fn prune_all() -> WorktreePruneOptions {
    let mut opts = WorktreePruneOptions::new();
    opts.valid(true).locked(true);
    opts
}

fn same_path(a: &Path, b: &Path) -> bool {
    let canon = |p: &Path| p.canonicalize().unwrap_or_else(|_| p.to_path_buf());
    a == b || canon(a) == canon(b)
}

/// Branch a task runs on.
///
/// - `feature_branch`: `<feature>--<worktree>-<task>`
/// - `raise_prs`: `foreman/<plan>/<worktree>-<task>`
pub fn task_branch(plan: &Plan, worktree: &str, task_id: &str) -> String {
    let leaf = format!("{}-{}", slugify(worktree), slugify(task_id));
    match (plan.branch_strategy, &plan.feature_branch) {
        (BranchStrategy::FeatureBranch, Some(feature)) => format!("{}--{}", feature, leaf),
        _ => format!("foreman/{}/{}", plan.id.short(), leaf),
    }
}

/// Branch new task branches are cut from.
pub fn base_branch(plan: &Plan, repo: &Repository) -> String {
    match (plan.branch_strategy, &plan.feature_branch) {
        (BranchStrategy::FeatureBranch, Some(feature)) => feature.clone(),
        _ => repo.default_branch.clone(),
    }
}

/// Name of the git admin entry for a worktree, unique across plans.
pub fn worktree_name(plan: &Plan, dir_name: &str) -> String {
    format!("foreman-{}-{}", plan.id.short(), slugify(dir_name))
}

/// Async front for [`GitOps`].
#[derive(Debug, Clone, Default)]
pub struct WorktreeCoordinator;

impl WorktreeCoordinator {
    pub fn new() -> Self {
        Self
    }

    pub async fn create_worktree(
        &self,
        repo: &Repository,
        name: &str,
        branch: &str,
        path: &Path,
        base: &str,
    ) -> Result<()> {
        let root = repo.root.clone();
        let (name, branch, path, base) = (
            name.to_string(),
            branch.to_string(),
            path.to_path_buf(),
            base.to_string(),
        );
        blocking(move || GitOps::new(&root)?.create_worktree(&name, &branch, &path, &base)).await
    }

    pub async fn remove_worktree(&self, repo: &Repository, path: &Path, force: bool) -> Result<()> {
        let root = repo.root.clone();
        let path = path.to_path_buf();
        blocking(move || GitOps::new(&root)?.remove_worktree(&path, force)).await
    }

    pub async fn prune_worktrees(&self, repo: &Repository) -> Result<usize> {
        let root = repo.root.clone();
        blocking(move || GitOps::new(&root)?.prune_worktrees()).await
    }

    pub async fn delete_branch(&self, repo: &Repository, branch: &str) -> Result<()> {
        let root = repo.root.clone();
        let branch = branch.to_string();
        blocking(move || GitOps::new(&root)?.delete_branch(&branch)).await
    }

    pub async fn ensure_branch(&self, repo: &Repository, branch: &str, from: &str) -> Result<bool> {
        let root = repo.root.clone();
        let (branch, from) = (branch.to_string(), from.to_string());
        blocking(move || GitOps::new(&root)?.ensure_branch(&branch, &from)).await
    }

    pub async fn is_merged(&self, repo: &Repository, branch: &str, into: &str) -> Result<bool> {
        let root = repo.root.clone();
        let (branch, into) = (branch.to_string(), into.to_string());
        blocking(move || GitOps::new(&root)?.is_merged(&branch, &into)).await
    }

    /// Fetch `branch` from the remote. Repositories without a remote are
    /// left alone.
    pub async fn fetch_branch(&self, repo: &Repository, branch: &str) -> Result<()> {
        let root = repo.root.clone();
        let branch = branch.to_string();
        blocking(move || {
            let git = GitOps::new(&root)?;
            if !git.has_remote() {
                return Ok(());
            }
            git.fetch_branch(&branch)
        })
        .await
    }

    /// Push `branch`. Returns false when the repository has no remote.
    pub async fn push_branch(&self, repo: &Repository, branch: &str) -> Result<bool> {
        let root = repo.root.clone();
        let branch = branch.to_string();
        blocking(move || {
            let git = GitOps::new(&root)?;
            if !git.has_remote() {
                return Ok(false);
            }
            git.push_branch(&branch)?;
            Ok(true)
        })
        .await
    }

    pub async fn delete_remote_branch(&self, repo: &Repository, branch: &str) -> Result<()> {
        let root = repo.root.clone();
        let branch = branch.to_string();
        blocking(move || GitOps::new(&root)?.delete_remote_branch(&branch)).await
    }

    pub async fn open_pull_request(
        &self,
        repo: &Repository,
        branch: &str,
        title: &str,
        body: &str,
    ) -> Result<String> {
        let root = repo.root.clone();
        let base = repo.default_branch.clone();
        let (branch, title, body) = (branch.to_string(), title.to_string(), body.to_string());
        blocking(move || GitOps::new(&root)?.open_pull_request(&branch, &base, &title, &body)).await
    }
}
