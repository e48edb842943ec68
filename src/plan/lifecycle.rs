//! State-changing plan operations.
//!
//! Operations called in a state they do not apply to return the plan
//! unchanged, except where the lifecycle graph forbids the move outright
//! (restart, complete), which is an `InvalidTransition` error.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, warn};

use super::Orchestrator;
use crate::activity::ActivityKind;
use crate::agent::{AgentProfile, AgentRole};
use crate::automaton::session::SessionStart;
use crate::automaton::{Automaton, AutomatonSpec, Launch};
use crate::cleanup::{cleanup_plan_worktrees, CleanupReport};
use crate::context::Context;
use crate::core::plan::{BranchStrategy, Discussion, Plan, PlanId, PlanStatus};
use crate::dispatch::{self, prompt};
use crate::{Error, Result};

pub fn discussion_key(id: &PlanId) -> String {
    format!("{}:discussion", id)
}

pub fn orchestrator_key(id: &PlanId) -> String {
    format!("{}:orchestrator", id)
}

pub fn planner_key(id: &PlanId) -> String {
    format!("{}:planner", id)
}

fn agent_spec(ctx: &Context, plan: &Plan, role: AgentRole, profile: AgentProfile, key: String) -> AutomatonSpec {
    AutomatonSpec::new(
        format!("foreman-{}-{}", plan.id.short(), role),
        plan.dir(&ctx.data_root),
        role,
        Launch::Interactive {
            shell: ctx.config.effective_shell(),
            profile,
            session_key: Some(key),
        },
    )
    .for_plan(plan.id)
}

/// Hand `text` to a freshly started conversation. A resumed one already
/// has it.
fn greet(ctx: &Context, automaton: Arc<Automaton>, text: String) {
    if automaton.session().is_some_and(SessionStart::is_resume) {
        debug!("{} resumed its session, no prompt sent", automaton.name);
        return;
    }
    let timeout = ctx.config.automaton.agent_ready_timeout();
    tokio::spawn(async move {
        let ready = prompt::ready_pattern(false);
        if let Err(e) = prompt::deliver(&automaton, &text, &ready, timeout).await {
            warn!("prompt for {} not delivered: {}", automaton.name, e);
        }
    });
}

/// Mark every worktree the cleanup removed as cleaned.
async fn record_cleanup(ctx: &Context, id: &PlanId, report: &CleanupReport) -> Result<()> {
    if report.removed.is_empty() {
        return Ok(());
    }
    ctx.update_plan(id, |p| {
        for path in &report.removed {
            p.mark_worktree_cleaned(path);
        }
        Ok(())
    })
    .await?;
    Ok(())
}

impl Orchestrator {
    pub async fn start_discussion(&self, id: &PlanId, agent_id: &str) -> Result<Plan> {
        let ctx = &self.ctx;
        let plan = ctx.plan(id).await?;
        if plan.status != PlanStatus::Draft {
            debug!("start_discussion: plan {} is {}", id.short(), plan.status);
            return Ok(plan);
        }
        let profile = ctx.config.agent(agent_id)?.clone();
        tokio::fs::create_dir_all(plan.dir(&ctx.data_root)).await?;

        let spec = agent_spec(ctx, &plan, AgentRole::Discussion, profile.clone(), discussion_key(id));
        let automaton = match ctx.start_agent(spec).await {
            Ok(automaton) => automaton,
            Err(e) => {
                ctx.record(
                    *id,
                    ActivityKind::Error,
                    format!("Failed to start discussion: {}", e),
                    None,
                );
                return Err(e);
            }
        };

        let agent = automaton.id;
        let updated = ctx
            .update_plan(id, |p| {
                p.transition(PlanStatus::Discussing)?;
                let mut discussion = Discussion::start(&profile.id);
                discussion.agent_id = Some(agent);
                p.discussion = Some(discussion);
                Ok(())
            })
            .await;
        let (plan, ()) = match updated {
            Ok(updated) => updated,
            Err(e) => {
                ctx.agents.kill(&agent).await;
                return Err(e);
            }
        };

        greet(ctx, automaton, prompt::discussion_prompt(&plan));
        ctx.record(
            *id,
            ActivityKind::Info,
            format!("Discussion started with {}", profile.name),
            None,
        );
        Ok(plan)
    }

    pub async fn complete_discussion(&self, id: &PlanId, summary: Option<String>) -> Result<Plan> {
        let ctx = &self.ctx;
        let plan = ctx.plan(id).await?;
        if plan.status != PlanStatus::Discussing {
            return Ok(plan);
        }
        ctx.agents.kill_plan(id, &[AgentRole::Discussion]).await;
        let (plan, ()) = ctx
            .update_plan(id, |p| {
                p.transition(PlanStatus::Discussed)?;
                let profile = p
                    .discussion
                    .as_ref()
                    .map(|d| d.agent_profile.clone())
                    .unwrap_or_default();
                let discussion = p.discussion.get_or_insert_with(|| Discussion::start(&profile));
                discussion.approved = true;
                discussion.summary = summary.filter(|s| !s.trim().is_empty());
                discussion.completed_at = Some(Utc::now());
                Ok(())
            })
            .await?;
        ctx.record(*id, ActivityKind::Success, "Discussion approved", None);
        Ok(plan)
    }

    pub async fn cancel_discussion(&self, id: &PlanId) -> Result<Plan> {
        let ctx = &self.ctx;
        let plan = ctx.plan(id).await?;
        if plan.status != PlanStatus::Discussing {
            return Ok(plan);
        }
        ctx.agents.kill_plan(id, &[AgentRole::Discussion]).await;
        let (plan, ()) = ctx
            .update_plan(id, |p| {
                p.transition(PlanStatus::Draft)?;
                p.discussion = None;
                Ok(())
            })
            .await?;
        ctx.record(*id, ActivityKind::Info, "Discussion cancelled", None);
        Ok(plan)
    }

    /// Hand the plan to its orchestrator and planner agents and start
    /// dispatching.
    ///
    /// A second call while the plan is being executed, or already running,
    /// returns the plan unchanged.
    pub async fn execute_plan(&self, id: &PlanId, agent_id: &str) -> Result<Plan> {
        let ctx = &self.ctx;
        let plan = ctx.plan(id).await?;
        if matches!(plan.status, PlanStatus::Delegating | PlanStatus::InProgress) {
            debug!("execute_plan: plan {} already {}", id.short(), plan.status);
            return Ok(plan);
        }
        if !ctx.mark_executing(id).await {
            debug!("execute_plan: plan {} is already being executed", id.short());
            return Ok(plan);
        }
        if !plan.can_transition(PlanStatus::Delegating) {
            ctx.release_executing(id).await;
            return Err(Error::InvalidTransition {
                from: plan.status,
                to: PlanStatus::Delegating,
            });
        }
        let profile = match ctx.config.agent(agent_id) {
            Ok(profile) => profile.clone(),
            Err(e) => {
                ctx.release_executing(id).await;
                return Err(e);
            }
        };

        let previous = plan.status;
        let result = self.launch_execution(id, profile).await;
        ctx.release_executing(id).await;
        match result {
            Ok(plan) => Ok(plan),
            Err(e) => {
                warn!("execution of plan {} failed: {}", id.short(), e);
                ctx.stop_polling(id).await;
                ctx.agents
                    .kill_plan(id, &[AgentRole::Orchestrator, AgentRole::Planner])
                    .await;
                let message = e.to_string();
                if let Err(revert) = ctx
                    .update_plan(id, |p| {
                        p.rollback(previous);
                        p.last_error = Some(message.clone());
                        Ok(())
                    })
                    .await
                {
                    warn!("failed to revert plan {}: {}", id.short(), revert);
                }
                ctx.record(
                    *id,
                    ActivityKind::Error,
                    format!("Failed to execute plan: {}", message),
                    None,
                );
                Err(e)
            }
        }
    }

    async fn launch_execution(&self, id: &PlanId, profile: AgentProfile) -> Result<Plan> {
        let ctx = &self.ctx;
        let (plan, ()) = ctx
            .update_plan(id, |p| {
                p.transition(PlanStatus::Delegating)?;
                p.reference_agent = Some(profile.id.clone());
                p.last_error = None;
                Ok(())
            })
            .await?;

        let repos = ctx.plan_repositories(&plan)?;
        if let (BranchStrategy::FeatureBranch, Some(feature)) =
            (plan.branch_strategy, plan.feature_branch.as_deref())
        {
            for repo in &repos {
                if ctx.git.ensure_branch(repo, feature, &repo.default_branch).await? {
                    debug!("created {} in {}", feature, repo.name);
                }
                match ctx.git.push_branch(repo, feature).await {
                    Ok(true) => {
                        ctx.update_plan(id, |p| {
                            p.record_pushed_branch(&repo.id, feature);
                            Ok(())
                        })
                        .await?;
                    }
                    Ok(false) => {}
                    Err(e) => warn!("push of {} to {} failed: {}", feature, repo.name, e),
                }
            }
        }

        let root = plan.dir(&ctx.data_root);
        tokio::fs::create_dir_all(&root).await?;
        let orchestrator = ctx
            .start_agent(agent_spec(ctx, &plan, AgentRole::Orchestrator, profile.clone(), orchestrator_key(id)))
            .await?;
        let planner = ctx
            .start_agent(agent_spec(ctx, &plan, AgentRole::Planner, profile.clone(), planner_key(id)))
            .await?;

        let ready = ctx.labels.ready();
        let names: Vec<String> = repos.iter().map(|r| r.name.clone()).collect();
        greet(ctx, orchestrator, prompt::orchestrator_prompt(&plan, &root, &ready));
        greet(ctx, planner, prompt::planner_prompt(&plan, &root, &ready, &names));

        dispatch::start_polling(&self.ctx, *id).await;
        info!("plan {} executing with {}", id.short(), profile.id);
        ctx.record(
            *id,
            ActivityKind::Info,
            format!("Execution started with {}", profile.name),
            None,
        );
        ctx.plan(id).await
    }

    /// Stop a running plan and mark it failed. Its worktrees are cleaned up
    /// in the background once the new status is visible.
    pub async fn cancel_plan(&self, id: &PlanId) -> Result<Plan> {
        let ctx = &self.ctx;
        let plan = ctx.plan(id).await?;
        if !plan.status.is_in_flight() {
            debug!("cancel_plan: plan {} is {}", id.short(), plan.status);
            return Ok(plan);
        }

        let killed = ctx.agents.kill_plan(id, &[]).await;
        ctx.stop_polling(id).await;
        let (plan, ()) = ctx
            .update_plan(id, |p| {
                p.transition(PlanStatus::Failed)?;
                p.last_error = Some("cancelled".to_string());
                Ok(())
            })
            .await?;
        ctx.release_executing(id).await;
        info!("plan {} cancelled, {} agent(s) stopped", id.short(), killed);
        ctx.record(*id, ActivityKind::Error, "Plan cancelled", None);

        let bg = self.ctx.clone();
        let snapshot = plan.clone();
        let handle = tokio::spawn(async move {
            let report = cleanup_plan_worktrees(&snapshot, &bg.repos, &bg.git).await;
            if let Err(e) = record_cleanup(&bg, &snapshot.id, &report).await {
                warn!("failed to record cleanup of plan {}: {}", snapshot.id.short(), e);
            }
            if !report.is_success() {
                bg.record(
                    snapshot.id,
                    ActivityKind::Warning,
                    format!("{} worktree(s) could not be removed", report.failed.len()),
                    None,
                );
            }
        });
        ctx.set_cleanup(id, handle).await;
        Ok(plan)
    }

    /// Reset a failed plan so it can be run again.
    pub async fn restart_plan(&self, id: &PlanId) -> Result<Plan> {
        let ctx = &self.ctx;
        let plan = ctx.plan(id).await?;
        if plan.status != PlanStatus::Failed {
            return Err(Error::InvalidTransition {
                from: plan.status,
                to: PlanStatus::Draft,
            });
        }

        ctx.agents.kill_plan(id, &[]).await;
        ctx.stop_polling(id).await;
        ctx.await_cleanup(id).await;

        let plan = ctx.plan(id).await?;
        let report = cleanup_plan_worktrees(&plan, &ctx.repos, &ctx.git).await;
        record_cleanup(ctx, id, &report).await?;
        for pushed in &plan.pushed_branches {
            let result = match ctx.repos.get(&pushed.repository_id) {
                Ok(repo) => ctx.git.delete_remote_branch(repo, &pushed.branch).await,
                Err(e) => Err(e),
            };
            if let Err(e) = result {
                warn!("failed to delete remote branch {}: {}", pushed.branch, e);
            }
        }

        ctx.clear_assignments(id).await?;
        ctx.activities.clear(id)?;
        let target = if plan.discussion_approved() {
            PlanStatus::Discussed
        } else {
            PlanStatus::Draft
        };
        let (plan, ()) = ctx
            .update_plan(id, |p| {
                p.pushed_branches.clear();
                p.last_error = None;
                p.transition(target)
            })
            .await?;
        info!("plan {} restarted as {}", id.short(), plan.status);
        ctx.record(
            *id,
            ActivityKind::Info,
            format!("Plan restarted ({})", plan.status),
            None,
        );
        if !report.failed.is_empty() {
            let paths: Vec<String> = report
                .failed
                .iter()
                .map(|(path, _)| path.display().to_string())
                .collect();
            ctx.record(
                *id,
                ActivityKind::Warning,
                format!("{} worktree(s) could not be removed", report.failed.len()),
                Some(serde_json::json!({ "paths": paths })),
            );
        }
        Ok(plan)
    }

    pub async fn complete_plan(&self, id: &PlanId) -> Result<Plan> {
        let ctx = &self.ctx;
        let plan = ctx.plan(id).await?;
        if plan.status != PlanStatus::ReadyForReview {
            return Err(Error::InvalidTransition {
                from: plan.status,
                to: PlanStatus::Completed,
            });
        }
        ctx.stop_polling(id).await;
        ctx.agents
            .kill_plan(id, &[AgentRole::Orchestrator, AgentRole::Planner])
            .await;
        let (plan, ()) = ctx
            .update_plan(id, |p| p.transition(PlanStatus::Completed))
            .await?;
        info!("plan {} completed", id.short());
        ctx.record(*id, ActivityKind::Success, "Plan completed", None);
        Ok(plan)
    }

    /// Remove a plan with its agents, worktrees, directory and records.
    pub async fn delete_plan(&self, id: &PlanId) -> Result<()> {
        let ctx = &self.ctx;
        let plan = ctx.plan(id).await?;
        ctx.stop_polling(id).await;
        ctx.agents.kill_plan(id, &[]).await;
        ctx.await_cleanup(id).await;

        let plan = ctx.plan(id).await.unwrap_or(plan);
        let report = cleanup_plan_worktrees(&plan, &ctx.repos, &ctx.git).await;
        if !report.is_success() {
            warn!(
                "plan {}: {} worktree(s) left behind",
                id.short(),
                report.failed.len()
            );
        }

        let dir = plan.dir(&ctx.data_root);
        if dir.exists() {
            if let Err(e) = tokio::fs::remove_dir_all(&dir).await {
                warn!("failed to remove {}: {}", dir.display(), e);
            }
        }
        for key in ctx.kv.keys(&format!("session:{}:", id))? {
            ctx.kv.delete(&key)?;
        }
        ctx.activities.clear(id)?;
        ctx.forget_plan(id).await?;
        ctx.release_executing(id).await;
        info!("plan {} deleted", id.short());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::automaton::host::ProcessHandle;
    use crate::context::testing::{test_context, TestContext};
    use crate::core::plan::{NewPlan, WorktreeKind, WorktreeRecord};
    use crate::persist::KvStore;
    use std::sync::atomic::Ordering;

    async fn setup(strategy: BranchStrategy) -> (TestContext, Orchestrator, Plan) {
        let env = test_context();
        let orch = Orchestrator {
            ctx: env.ctx.clone(),
        };
        let plan = orch
            .create_plan(NewPlan {
                title: "Auth".to_string(),
                repository_ids: vec!["r1".to_string()],
                branch_strategy: strategy,
                ..Default::default()
            })
            .await
            .unwrap();
        (env, orch, plan)
    }

    #[tokio::test]
    async fn test_discussion_approve() {
        let (env, orch, plan) = setup(BranchStrategy::FeatureBranch).await;
        let started = orch.start_discussion(&plan.id, "claude").await.unwrap();
        assert_eq!(started.status, PlanStatus::Discussing);
        assert_eq!(env.host.last_spec().cwd, plan.dir(&env.ctx.data_root));

        // Starting again is a no-op.
        orch.start_discussion(&plan.id, "claude").await.unwrap();
        assert_eq!(env.host.spawned.lock().unwrap().len(), 1);

        let done = orch
            .complete_discussion(&plan.id, Some("split by layer".to_string()))
            .await
            .unwrap();
        assert_eq!(done.status, PlanStatus::Discussed);
        assert!(done.discussion_approved());
        assert_eq!(
            done.discussion.unwrap().summary.as_deref(),
            Some("split by layer")
        );
        assert!(!env.host.last().is_alive());
    }

    #[tokio::test]
    async fn test_discussion_cancel_returns_to_draft() {
        let (_env, orch, plan) = setup(BranchStrategy::FeatureBranch).await;
        orch.start_discussion(&plan.id, "claude").await.unwrap();
        let plan = orch.cancel_discussion(&plan.id).await.unwrap();
        assert_eq!(plan.status, PlanStatus::Draft);
        assert!(plan.discussion.is_none());
        // Elsewhere it does nothing.
        assert_eq!(
            orch.cancel_discussion(&plan.id).await.unwrap().status,
            PlanStatus::Draft
        );
    }

    #[tokio::test]
    async fn test_execute_spawns_agents_and_feature_branch() {
        let (env, orch, plan) = setup(BranchStrategy::FeatureBranch).await;
        let running = orch.execute_plan(&plan.id, "claude").await.unwrap();
        assert_eq!(running.status, PlanStatus::Delegating);
        assert_eq!(running.reference_agent.as_deref(), Some("claude"));

        let names: Vec<String> = env
            .host
            .spawned
            .lock()
            .unwrap()
            .iter()
            .map(|(spec, _)| spec.name.clone())
            .collect();
        assert_eq!(names.len(), 2);
        assert!(names[0].ends_with("orchestrator"));
        assert!(names[1].ends_with("planner"));
        assert!(env.ctx.is_polling(&plan.id).await);

        let repo = env.ctx.repos.get("r1").unwrap();
        let feature = running.feature_branch.clone().unwrap();
        let git = crate::git::GitOps::new(&repo.root).unwrap();
        assert!(git.branch_exists(&feature).unwrap());
        orch.shutdown().await;
    }

    #[tokio::test]
    async fn test_execute_failure_reverts() {
        let (env, orch, plan) = setup(BranchStrategy::RaisePrs).await;
        env.host.fail.store(true, Ordering::SeqCst);

        let err = orch.execute_plan(&plan.id, "claude").await.unwrap_err();
        assert!(matches!(err, Error::Spawn(_)));

        let plan = orch.get_plan(&plan.id).await.unwrap();
        assert_eq!(plan.status, PlanStatus::Draft);
        assert!(plan.last_error.is_some());
        assert!(!env.ctx.is_executing(&plan.id).await);
        assert!(!env.ctx.is_polling(&plan.id).await);
        assert!(orch
            .activities(&plan.id)
            .unwrap()
            .iter()
            .any(|a| a.kind == ActivityKind::Error));

        // The marker was released, so a retry goes through.
        env.host.fail.store(false, Ordering::SeqCst);
        let plan = orch.execute_plan(&plan.id, "claude").await.unwrap();
        assert_eq!(plan.status, PlanStatus::Delegating);
        orch.shutdown().await;
    }

    #[tokio::test]
    async fn test_unknown_agent_profile() {
        let (env, orch, plan) = setup(BranchStrategy::RaisePrs).await;
        assert!(matches!(
            orch.execute_plan(&plan.id, "nope").await,
            Err(Error::AgentProfileNotFound(_))
        ));
        assert!(!env.ctx.is_executing(&plan.id).await);
    }

    #[tokio::test]
    async fn test_cancel_then_restart() {
        let (env, orch, plan) = setup(BranchStrategy::RaisePrs).await;
        orch.execute_plan(&plan.id, "claude").await.unwrap();

        let failed = orch.cancel_plan(&plan.id).await.unwrap();
        assert_eq!(failed.status, PlanStatus::Failed);
        assert!(!env.ctx.is_polling(&plan.id).await);
        assert!(env.ctx.agents.by_plan(&plan.id).await.is_empty());

        let restarted = orch.restart_plan(&plan.id).await.unwrap();
        assert_eq!(restarted.status, PlanStatus::Draft);
        assert!(restarted.last_error.is_none());
        let activities = orch.activities(&plan.id).unwrap();
        assert_eq!(activities.len(), 1);
        assert!(activities[0].message.starts_with("Plan restarted"));
    }

    #[tokio::test]
    async fn test_restart_keeps_worktree_history() {
        let (env, orch, plan) = setup(BranchStrategy::RaisePrs).await;
        orch.execute_plan(&plan.id, "claude").await.unwrap();
        orch.cancel_plan(&plan.id).await.unwrap();
        env.ctx.await_cleanup(&plan.id).await;

        let root = plan.dir(&env.ctx.data_root);
        env.ctx
            .update_plan(&plan.id, |p| {
                let done = root.join("done");
                p.worktrees.push(WorktreeRecord::new(done.clone(), "foreman/done", "r1", WorktreeKind::Task));
                p.mark_worktree_cleaned(&done);
                p.worktrees.push(WorktreeRecord::new(
                    root.join("stuck"),
                    "foreman/stuck",
                    "gone",
                    WorktreeKind::Task,
                ));
                Ok(())
            })
            .await
            .unwrap();

        let restarted = orch.restart_plan(&plan.id).await.unwrap();
        assert_eq!(restarted.worktrees.len(), 2);
        assert_eq!(restarted.active_worktrees().count(), 1);
        let activities = orch.activities(&plan.id).unwrap();
        assert!(activities
            .iter()
            .any(|a| a.kind == ActivityKind::Warning && a.message.contains("could not be removed")));
    }

    #[tokio::test]
    async fn test_restart_only_from_failed() {
        let (_env, orch, plan) = setup(BranchStrategy::RaisePrs).await;
        assert!(matches!(
            orch.restart_plan(&plan.id).await,
            Err(Error::InvalidTransition { .. })
        ));
        assert!(matches!(
            orch.complete_plan(&plan.id).await,
            Err(Error::InvalidTransition { .. })
        ));
    }

    #[tokio::test]
    async fn test_restart_after_approved_discussion() {
        let (_env, orch, plan) = setup(BranchStrategy::RaisePrs).await;
        orch.start_discussion(&plan.id, "claude").await.unwrap();
        orch.complete_discussion(&plan.id, None).await.unwrap();
        orch.execute_plan(&plan.id, "claude").await.unwrap();
        orch.cancel_plan(&plan.id).await.unwrap();

        let restarted = orch.restart_plan(&plan.id).await.unwrap();
        assert_eq!(restarted.status, PlanStatus::Discussed);
    }

    #[tokio::test]
    async fn test_delete_removes_everything() {
        let (env, orch, plan) = setup(BranchStrategy::RaisePrs).await;
        orch.start_discussion(&plan.id, "claude").await.unwrap();
        let dir = plan.dir(&env.ctx.data_root);
        assert!(dir.exists());
        assert!(!env.kv.keys(&format!("session:{}:", plan.id)).unwrap().is_empty());

        orch.delete_plan(&plan.id).await.unwrap();
        assert!(!dir.exists());
        assert!(env.kv.keys(&format!("session:{}:", plan.id)).unwrap().is_empty());
        assert!(matches!(
            orch.get_plan(&plan.id).await,
            Err(Error::PlanNotFound(_))
        ));
        assert!(orch.list_plans().await.unwrap().is_empty());
    }
}
