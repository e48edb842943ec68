//! Consolidating finished task branches onto a plan's feature branch.
//!
//! Under the feature-branch strategy a task whose blockers ran in the same
//! repository is cut from the feature branch, so it has to wait until those
//! blockers' branches are merged there. The merging is done by a merge
//! agent, at most one per plan, working in a dedicated worktree checked out
//! on the feature branch.

use std::sync::{Arc, LazyLock};
use std::time::Duration;

use regex::Regex;
use tracing::{debug, info, warn};

use super::prompt::{self, merge_done_pattern};
use crate::activity::ActivityKind;
use crate::agent::AgentRole;
use crate::automaton::{AutomatonSpec, Launch};
use crate::context::Context;
use crate::core::graph::{NodeStatus, TaskGraph};
use crate::core::plan::{Plan, WorktreeKind, WorktreeRecord};
use crate::core::repository::Repository;
use crate::core::task::Task;
use crate::git;
use crate::Result;

pub const MERGE_WORKTREE: &str = "merge";

/// How long a merge agent may work before it is stopped.
const MERGE_TIMEOUT: Duration = Duration::from_secs(2 * 60 * 60);

static MERGE_DONE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(&merge_done_pattern()).unwrap());

/// Branches of `task`'s finished blockers in `repo` that `feature` does not
/// contain yet. Blockers still being worked on are left out.
///
/// A branch whose merge state cannot be read counts as unmerged.
pub async fn unmerged_blockers(
    ctx: &Context,
    plan: &Plan,
    repo: &Repository,
    task: &Task,
    feature: &str,
    graph: &TaskGraph,
) -> Vec<String> {
    let mut pending = Vec::new();
    for blocker in &task.blocked_by {
        let finished = graph
            .node(blocker)
            .is_some_and(|n| n.status == NodeStatus::Completed);
        if !finished {
            continue;
        }
        let Some(record) = plan.worktree_for_task(blocker) else {
            continue;
        };
        if record.repository_id != repo.id || record.kind != WorktreeKind::Task {
            continue;
        }
        match ctx.git.is_merged(repo, &record.branch, feature).await {
            Ok(true) => {}
            Ok(false) => pending.push(record.branch.clone()),
            Err(e) => {
                warn!(
                    "cannot tell whether {} is merged into {}: {}",
                    record.branch, feature, e
                );
                pending.push(record.branch.clone());
            }
        }
    }
    pending.dedup();
    pending
}

/// Start a merge agent for `branches` unless the plan already has one.
///
/// Returns whether a new agent was started.
pub async fn ensure_merge_agent(
    ctx: &Arc<Context>,
    plan: &Plan,
    repo: &Repository,
    feature: &str,
    branches: &[String],
) -> Result<bool> {
    if ctx.agents.find(&plan.id, AgentRole::Merge).await.is_some() {
        debug!("plan {} already has a merge agent", plan.id.short());
        return Ok(false);
    }

    if let Some(stale) = plan.active_merge_worktree().cloned() {
        debug!("removing stale merge worktree {}", stale.path.display());
        if let Ok(stale_repo) = ctx.repos.get(&stale.repository_id) {
            if let Err(e) = ctx.git.remove_worktree(stale_repo, &stale.path, true).await {
                warn!("failed to remove stale merge worktree: {}", e);
            }
        }
        ctx.update_plan(&plan.id, |p| {
            p.mark_worktree_cleaned(&stale.path);
            Ok(())
        })
        .await?;
    }

    let path = plan.worktree_path(&ctx.data_root, &repo.name, MERGE_WORKTREE);
    let name = git::worktree_name(plan, MERGE_WORKTREE);
    ctx.git
        .create_worktree(repo, &name, feature, &path, feature)
        .await?;
    let record = WorktreeRecord::new(path.clone(), feature, &repo.id, WorktreeKind::Merge);
    ctx.update_plan(&plan.id, |p| {
        p.worktrees.push(record);
        Ok(())
    })
    .await?;

    let profile = super::agent_profile(&ctx.config, plan)?;
    let spec = AutomatonSpec::new(
        format!("foreman-{}-merge", plan.id.short()),
        path.clone(),
        AgentRole::Merge,
        Launch::Interactive {
            shell: ctx.config.effective_shell(),
            profile,
            session_key: None,
        },
    )
    .for_plan(plan.id)
    .accepting_edits();

    let automaton = match ctx.start_agent(spec).await {
        Ok(automaton) => automaton,
        Err(e) => {
            discard_worktree(ctx, plan, repo, &path).await;
            return Err(e);
        }
    };
    info!(
        "merge agent {} started for plan {} ({} branches)",
        automaton.id.short(),
        plan.id.short(),
        branches.len()
    );

    let text = prompt::merge_prompt(feature, branches);
    let count = branches.len();
    let feature = feature.to_string();
    let ready_timeout = ctx.config.automaton.agent_ready_timeout();
    let ctx = ctx.clone();
    let plan = plan.clone();
    let repo = repo.clone();
    tokio::spawn(async move {
        let mut sub = automaton.subscribe();
        if let Err(e) =
            prompt::deliver(&automaton, &text, &prompt::ready_pattern(true), ready_timeout).await
        {
            warn!("merge prompt not delivered: {}", e);
        }
        let finished = sub.wait_for(&MERGE_DONE_RE, MERGE_TIMEOUT).await;
        sub.unsubscribe();

        ctx.agents.kill(&automaton.id).await;
        discard_worktree(&ctx, &plan, &repo, &path).await;

        if finished {
            ctx.record(
                plan.id,
                ActivityKind::Success,
                format!("Merged {} branch(es) into {}", count, feature),
                None,
            );
        } else if ctx
            .plan(&plan.id)
            .await
            .is_ok_and(|p| p.status.is_polling())
        {
            ctx.record(
                plan.id,
                ActivityKind::Warning,
                "Merge agent stopped before finishing; it will be restarted",
                None,
            );
        }
    });
    Ok(true)
}

async fn discard_worktree(ctx: &Context, plan: &Plan, repo: &Repository, path: &std::path::Path) {
    if let Err(e) = ctx.git.remove_worktree(repo, path, true).await {
        warn!("failed to remove merge worktree {}: {}", path.display(), e);
    }
    if let Err(e) = ctx
        .update_plan(&plan.id, |p| {
            p.mark_worktree_cleaned(path);
            Ok(())
        })
        .await
    {
        warn!("failed to record merge worktree cleanup: {}", e);
    }
}
