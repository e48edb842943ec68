//! Task dispatcher: the per-plan poll loop.
//!
//! Every tick of an active plan picks up tasks the planner marked ready,
//! gives each one a worktree and an agent as long as the plan has capacity,
//! and then reconciles assignments with the tasks the agents closed.
//!
//! Ticks of one plan never overlap. An overlapping call returns
//! [`TickOutcome::Skipped`] and does nothing.

pub mod merge;
pub mod placement;
pub mod prompt;

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use serde_json::json;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::activity::ActivityKind;
use crate::agent::{AgentId, AgentProfile, AgentRole};
use crate::automaton::{Automaton, AutomatonSpec, Launch};
use crate::config::{Config, DispatchMode};
use crate::context::Context;
use crate::core::assignment::AssignmentStatus;
use crate::core::graph::{build_graph, GraphStats, NodeStatus, TaskGraph};
use crate::core::plan::{BranchStrategy, Plan, PlanId, PlanStatus, WorktreeKind, WorktreeRecord};
use crate::core::repository::Repository;
use crate::core::task::Task;
use crate::event::OrchestratorEvent;
use crate::git;
use crate::store::TaskFilter;
use crate::util::slugify;
use crate::Result;

use placement::{PlacementIssue, Resolved};

/// Profile of the agent a plan runs with: its reference agent, else the
/// first configured one.
pub fn agent_profile(config: &Config, plan: &Plan) -> Result<AgentProfile> {
    match &plan.reference_agent {
        Some(id) => config.agent(id).cloned(),
        None => Ok(config.agents.first().cloned().unwrap_or_default()),
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
    /// Another tick of the plan was still running.
    Skipped,
    /// The plan left the polling states; its loop ends.
    Stopped,
    Ran(TickReport),
}

/// What one tick did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TickReport {
    pub dispatched: Vec<String>,
    /// Waiting for their blockers to be merged into the feature branch.
    pub deferred: Vec<String>,
    pub unplaced: Vec<String>,
    pub failed: Vec<String>,
    pub completed: Vec<String>,
    /// Open assignments whose agent was gone; their tasks are ready again.
    pub requeued: Vec<String>,
    pub at_capacity: bool,
    pub merge_started: bool,
    pub stats: GraphStats,
}

enum Dispatch {
    Started,
    /// The plan stopped while the agent was being started.
    Abandoned,
}

#[derive(Clone)]
pub struct Dispatcher {
    ctx: Arc<Context>,
}

impl Dispatcher {
    pub fn new(ctx: Arc<Context>) -> Self {
        Self { ctx }
    }

    pub async fn tick(&self, plan_id: &PlanId) -> Result<TickOutcome> {
        let Some(_guard) = self.ctx.try_tick(plan_id) else {
            debug!("tick for plan {} skipped, previous one still running", plan_id.short());
            return Ok(TickOutcome::Skipped);
        };

        let plan = self.ctx.plan(plan_id).await?;
        if !plan.status.is_polling() {
            debug!("plan {} is {}, stopping its poll loop", plan_id.short(), plan.status);
            self.ctx.stop_polling(plan_id).await;
            return Ok(TickOutcome::Stopped);
        }

        let root = plan.dir(&self.ctx.data_root);
        let mut report = TickReport::default();
        let tasks = self.scan_completions(plan_id, &root, &mut report).await?;
        self.requeue_orphans(plan_id, &root, &tasks, &mut report).await?;
        let book = self.ctx.assignments(plan_id).await?;
        let graph = build_graph(&tasks, book.as_slice());
        self.dispatch_ready(&plan, &root, &graph, &mut report).await?;
        self.refresh_graph(plan_id, &tasks, &mut report).await?;
        Ok(TickOutcome::Ran(report))
    }

    /// Slots taken: task worktrees whose agent is still running, whether or
    /// not its task is done, plus the merge agent.
    async fn busy_slots(&self, plan_id: &PlanId) -> Result<usize> {
        let plan = self.ctx.plan(plan_id).await?;
        let mut busy = 0;
        for record in plan.active_worktrees().filter(|w| w.kind == WorktreeKind::Task) {
            if let Some(agent_id) = &record.agent_id {
                if self.ctx.agents.is_live(agent_id).await {
                    busy += 1;
                }
            }
        }
        busy += self
            .ctx
            .agents
            .live_count(plan_id, &[AgentRole::Merge])
            .await;
        Ok(busy)
    }

    /// Put tasks whose agent is gone back on the ready queue. The worktree
    /// is kept for the next agent.
    async fn requeue_orphans(
        &self,
        plan_id: &PlanId,
        root: &Path,
        tasks: &[Task],
        report: &mut TickReport,
    ) -> Result<()> {
        let ctx = &self.ctx;
        let open: HashSet<&str> = tasks
            .iter()
            .filter(|t| !t.is_closed())
            .map(|t| t.id.as_str())
            .collect();
        let book = ctx.assignments(plan_id).await?;
        let mut orphans = Vec::new();
        for assignment in book.iter().filter(|a| a.status.is_open()) {
            if open.contains(assignment.bead_id.as_str()) && !ctx.agents.is_live(&assignment.agent_id).await {
                orphans.push((assignment.bead_id.clone(), assignment.agent_id));
            }
        }
        if orphans.is_empty() {
            return Ok(());
        }

        let requeued: Vec<String> = ctx
            .with_assignments(plan_id, |book| {
                let mut removed = Vec::new();
                for (task_id, agent_id) in &orphans {
                    let still_open = book
                        .get(task_id)
                        .is_some_and(|a| a.agent_id == *agent_id && a.status.is_open());
                    if still_open && book.remove(task_id).is_some() {
                        removed.push(task_id.clone());
                    }
                }
                Ok(removed)
            })
            .await?;

        for task_id in requeued {
            if let Err(e) = ctx
                .tasks
                .update(root, &task_id, &[ctx.labels.ready()], &[ctx.labels.sent()])
                .await
            {
                warn!("failed to relabel {}: {}", task_id, e);
            }
            info!("agent for task {} is gone, requeued", task_id);
            ctx.record(
                *plan_id,
                ActivityKind::Warning,
                format!("Agent for task {} is no longer running; task requeued", task_id),
                Some(json!({ "bead_id": task_id })),
            );
            report.requeued.push(task_id);
        }
        Ok(())
    }

    async fn dispatch_ready(
        &self,
        plan: &Plan,
        root: &Path,
        graph: &TaskGraph,
        report: &mut TickReport,
    ) -> Result<()> {
        let ready = self
            .ctx
            .tasks
            .list(root, &TaskFilter::open_with_label(&self.ctx.labels.ready()))
            .await?;
        let book = self.ctx.assignments(&plan.id).await?;
        let candidates: Vec<Task> = ready
            .into_iter()
            .filter(|t| !t.is_epic() && !book.contains(&t.id))
            .collect();
        if candidates.is_empty() {
            return Ok(());
        }

        let mut free = plan
            .max_parallel_agents
            .saturating_sub(self.busy_slots(&plan.id).await?);
        debug!(
            "plan {}: {} ready task(s), {} free slot(s)",
            plan.id.short(),
            candidates.len(),
            free
        );

        let mut issues: Vec<PlacementIssue> = Vec::new();
        let mut merge_tried = false;
        for task in &candidates {
            if free == 0 {
                report.at_capacity = true;
                break;
            }
            let current = self.ctx.plan(&plan.id).await?;
            if !current.status.is_polling() {
                break;
            }
            if graph
                .node(&task.id)
                .is_some_and(|n| n.status == NodeStatus::Blocked)
            {
                debug!("task {} is labelled ready but still blocked", task.id);
                report.deferred.push(task.id.clone());
                continue;
            }

            let resolved = match placement::resolve(task, &current, &self.ctx.repos) {
                Ok(resolved) => resolved,
                Err(issue) => {
                    report.unplaced.push(task.id.clone());
                    issues.push(issue);
                    continue;
                }
            };

            if let (BranchStrategy::FeatureBranch, Some(feature)) =
                (current.branch_strategy, current.feature_branch.as_deref())
            {
                let pending =
                    merge::unmerged_blockers(&self.ctx, &current, &resolved.repo, task, feature, graph)
                        .await;
                if !pending.is_empty() {
                    report.deferred.push(task.id.clone());
                    if !merge_tried {
                        merge_tried = true;
                        match merge::ensure_merge_agent(&self.ctx, &current, &resolved.repo, feature, &pending)
                            .await
                        {
                            Ok(true) => {
                                report.merge_started = true;
                                free -= 1;
                                self.ctx.record(
                                    plan.id,
                                    ActivityKind::Info,
                                    format!(
                                        "Merging {} branch(es) into {} before {} can start",
                                        pending.len(),
                                        feature,
                                        task.id
                                    ),
                                    Some(json!({ "bead_id": task.id, "branches": pending })),
                                );
                            }
                            Ok(false) => {}
                            Err(e) => self.ctx.record(
                                plan.id,
                                ActivityKind::Warning,
                                format!("Failed to start merge agent: {}", e),
                                None,
                            ),
                        }
                    }
                    continue;
                }
                if let Err(e) = self.ctx.git.fetch_branch(&resolved.repo, feature).await {
                    warn!("fetch of {} in {} failed: {}", feature, resolved.repo.name, e);
                }
            }

            match self.dispatch_task(&plan.id, task, &resolved).await {
                Ok(Dispatch::Started) => {
                    free -= 1;
                    report.dispatched.push(task.id.clone());
                }
                Ok(Dispatch::Abandoned) => break,
                Err(e) => {
                    debug!("dispatch of {} failed: {}", task.id, e);
                    report.failed.push(task.id.clone());
                }
            }
        }

        if !issues.is_empty() {
            let ids: Vec<&str> = issues.iter().map(|i| i.task_id()).collect();
            self.ctx.record(
                plan.id,
                ActivityKind::Warning,
                placement::summarize(&issues),
                Some(json!({ "tasks": ids })),
            );
        }
        Ok(())
    }

    async fn dispatch_task(&self, plan_id: &PlanId, task: &Task, resolved: &Resolved) -> Result<Dispatch> {
        let ctx = &self.ctx;
        let plan = ctx.plan(plan_id).await?;
        let dir_name = format!("{}-{}", resolved.worktree, task.id);
        let branch = git::task_branch(&plan, &resolved.worktree, &task.id);
        let path = plan.worktree_path(&ctx.data_root, &resolved.repo.name, &dir_name);

        ctx.with_assignments(plan_id, |book| {
            book.create(*plan_id, &task.id, AgentId::new())?;
            Ok(())
        })
        .await?;

        let automaton = match self.launch(&plan, task, resolved, &dir_name, &branch, &path).await {
            Ok(Some(automaton)) => automaton,
            Ok(None) => {
                self.abandon(plan_id, task, &resolved.repo, &branch, &path, "plan stopped before the agent started")
                    .await;
                return Ok(Dispatch::Abandoned);
            }
            Err(e) => {
                let reason = e.to_string();
                self.abandon(plan_id, task, &resolved.repo, &branch, &path, &reason)
                    .await;
                ctx.record(
                    *plan_id,
                    ActivityKind::Error,
                    format!("Failed to dispatch task {}: {}", task.id, reason),
                    Some(json!({ "bead_id": task.id })),
                );
                return Err(e);
            }
        };

        let agent_id = automaton.id;
        ctx.with_assignments(plan_id, |book| {
            if let Some(assignment) = book.get_mut(&task.id) {
                assignment.agent_id = agent_id;
                assignment.worktree_path = Some(path.clone());
                assignment.branch = Some(branch.clone());
                assignment.start();
            }
            Ok(())
        })
        .await?;
        ctx.update_plan(plan_id, |p| {
            if let Some(record) = p.worktrees.iter_mut().rev().find(|w| w.path == path) {
                record.agent_id = Some(agent_id);
            }
            if p.status == PlanStatus::Delegating {
                p.transition(PlanStatus::InProgress)?;
            }
            Ok(())
        })
        .await?;

        let root = plan.dir(&ctx.data_root);
        if let Err(e) = ctx
            .tasks
            .update(&root, &task.id, &[ctx.labels.sent()], &[ctx.labels.ready()])
            .await
        {
            warn!("failed to relabel {}: {}", task.id, e);
        }
        info!("task {} dispatched to agent {}", task.id, agent_id.short());
        ctx.record(
            *plan_id,
            ActivityKind::Info,
            format!(
                "Dispatched {} to {}/{}",
                task.id, resolved.repo.name, resolved.worktree
            ),
            Some(json!({ "bead_id": task.id, "agent_id": agent_id, "branch": branch })),
        );

        match ctx.config.dispatch_mode {
            DispatchMode::Headless => self.mark_sent(plan_id, &task.id).await,
            DispatchMode::Interactive => {
                let text = prompt::task_prompt(task, &branch, &root);
                self.deliver_in_background(*plan_id, task.id.clone(), automaton, text);
            }
        }
        Ok(Dispatch::Started)
    }

    /// Create the worktree and start the agent. `None` when the plan
    /// stopped in the meantime.
    async fn launch(
        &self,
        plan: &Plan,
        task: &Task,
        resolved: &Resolved,
        dir_name: &str,
        branch: &str,
        path: &Path,
    ) -> Result<Option<Arc<Automaton>>> {
        let ctx = &self.ctx;
        let repo = &resolved.repo;
        let recorded = plan.active_worktrees().any(|w| w.path == path);
        if recorded && path.exists() {
            debug!("reusing worktree {} for {}", path.display(), task.id);
        } else {
            if recorded {
                let stale = path.to_path_buf();
                ctx.update_plan(&plan.id, |p| {
                    p.mark_worktree_cleaned(&stale);
                    Ok(())
                })
                .await?;
                if let Err(e) = ctx.git.prune_worktrees(repo).await {
                    warn!("prune in {} failed: {}", repo.name, e);
                }
            }
            let base = git::base_branch(plan, repo);
            ctx.git
                .create_worktree(repo, &git::worktree_name(plan, dir_name), branch, path, &base)
                .await?;
            let mut record = WorktreeRecord::new(path.to_path_buf(), branch, &repo.id, WorktreeKind::Task);
            record.task_id = Some(task.id.clone());
            ctx.update_plan(&plan.id, |p| {
                p.worktrees.push(record);
                Ok(())
            })
            .await?;
        }

        let name = format!("foreman-{}-{}", plan.id.short(), slugify(&task.id));
        let spec = match ctx.config.dispatch_mode {
            DispatchMode::Interactive => AutomatonSpec::new(
                name,
                path.to_path_buf(),
                AgentRole::Task,
                Launch::Interactive {
                    shell: ctx.config.effective_shell(),
                    profile: agent_profile(&ctx.config, plan)?,
                    session_key: None,
                },
            )
            .accepting_edits(),
            DispatchMode::Headless => {
                let token = self.credential(&plan.id).await?;
                let text = prompt::task_prompt(task, branch, &plan.dir(&ctx.data_root));
                let command =
                    prompt::render_headless_command(&ctx.config.headless_command, &token, path, &text);
                let mut spec =
                    AutomatonSpec::new(name, path.to_path_buf(), AgentRole::Task, Launch::Direct { command });
                spec.env.push((ctx.config.credential_env.clone(), token));
                spec
            }
        }
        .for_plan(plan.id)
        .for_task(task.id.clone());

        if !ctx.plan(&plan.id).await?.status.is_polling() {
            return Ok(None);
        }
        let automaton = ctx.start_agent(spec).await?;
        if !ctx.plan(&plan.id).await?.status.is_polling() {
            ctx.agents.kill(&automaton.id).await;
            return Ok(None);
        }
        Ok(Some(automaton))
    }

    async fn credential(&self, plan_id: &PlanId) -> Result<String> {
        if let Some(token) = self.ctx.credentials.token() {
            return Ok(token);
        }
        let ctx = &self.ctx;
        let id = *plan_id;
        let progress = |message: &str| ctx.record(id, ActivityKind::Info, message, None);
        ctx.credentials.acquire(&progress).await
    }

    /// Fail the assignment and throw away whatever the attempt created.
    async fn abandon(
        &self,
        plan_id: &PlanId,
        task: &Task,
        repo: &Repository,
        branch: &str,
        path: &Path,
        reason: &str,
    ) {
        let ctx = &self.ctx;
        if let Err(e) = ctx
            .with_assignments(plan_id, |book| {
                if let Some(assignment) = book.get_mut(&task.id) {
                    assignment.fail(reason);
                }
                Ok(())
            })
            .await
        {
            warn!("failed to record failed assignment for {}: {}", task.id, e);
        }

        let created = ctx
            .plan(plan_id)
            .await
            .is_ok_and(|p| p.active_worktrees().any(|w| w.path == path));
        if !created && !path.exists() {
            return;
        }
        if let Err(e) = ctx.git.remove_worktree(repo, path, true).await {
            warn!("failed to remove worktree {}: {}", path.display(), e);
        }
        if let Err(e) = ctx.git.delete_branch(repo, branch).await {
            warn!("failed to delete branch {}: {}", branch, e);
        }
        if created {
            let path = path.to_path_buf();
            if let Err(e) = ctx
                .update_plan(plan_id, |p| {
                    p.mark_worktree_cleaned(&path);
                    Ok(())
                })
                .await
            {
                warn!("failed to mark worktree cleaned: {}", e);
            }
        }
    }

    async fn mark_sent(&self, plan_id: &PlanId, task_id: &str) {
        let result = self
            .ctx
            .with_assignments(plan_id, |book| {
                if let Some(assignment) = book.get_mut(task_id) {
                    assignment.mark_sent();
                }
                Ok(())
            })
            .await;
        if let Err(e) = result {
            warn!("failed to mark {} sent: {}", task_id, e);
        }
    }

    fn deliver_in_background(&self, plan_id: PlanId, task_id: String, automaton: Arc<Automaton>, text: String) {
        let dispatcher = self.clone();
        let timeout = self.ctx.config.automaton.agent_ready_timeout();
        tokio::spawn(async move {
            let ready = prompt::ready_pattern(true);
            match prompt::deliver(&automaton, &text, &ready, timeout).await {
                Ok(()) => dispatcher.mark_sent(&plan_id, &task_id).await,
                Err(e) => {
                    warn!("prompt for {} not delivered: {}", task_id, e);
                    dispatcher.ctx.record(
                        plan_id,
                        ActivityKind::Warning,
                        format!("Prompt for task {} was not delivered: {}", task_id, e),
                        Some(json!({ "bead_id": task_id })),
                    );
                }
            }
        });
    }

    /// Complete assignments whose task was closed. Returns every task of the
    /// plan for the graph rebuild.
    async fn scan_completions(&self, plan_id: &PlanId, root: &Path, report: &mut TickReport) -> Result<Vec<Task>> {
        let ctx = &self.ctx;
        let tasks = ctx.tasks.list(root, &TaskFilter::all()).await?;
        let closed: HashSet<&str> = tasks
            .iter()
            .filter(|t| t.is_closed())
            .map(|t| t.id.as_str())
            .collect();

        let done: Vec<(String, Option<String>)> = ctx
            .with_assignments(plan_id, |book| {
                let mut done = Vec::new();
                for assignment in book.iter_mut().filter(|a| {
                    matches!(a.status, AssignmentStatus::Sent | AssignmentStatus::InProgress)
                        && closed.contains(a.bead_id.as_str())
                }) {
                    assignment.complete();
                    done.push((assignment.bead_id.clone(), assignment.branch.clone()));
                }
                Ok(done)
            })
            .await?;
        if done.is_empty() {
            return Ok(tasks);
        }

        let plan = ctx.plan(plan_id).await?;
        for (task_id, branch) in done {
            info!("task {} completed", task_id);
            ctx.record(
                *plan_id,
                ActivityKind::Success,
                format!("Task {} completed", task_id),
                Some(json!({ "bead_id": task_id })),
            );
            if plan.branch_strategy == BranchStrategy::RaisePrs {
                if let (Some(branch), Some(record)) = (branch, plan.worktree_for_task(&task_id)) {
                    let title = tasks
                        .iter()
                        .find(|t| t.id == task_id)
                        .map_or_else(|| task_id.clone(), |t| t.title.clone());
                    match ctx.repos.get(&record.repository_id) {
                        Ok(repo) => self.publish(&plan, &task_id, title, repo.clone(), branch),
                        Err(e) => warn!("cannot publish {}: {}", task_id, e),
                    }
                }
            }
            report.completed.push(task_id);
        }
        Ok(tasks)
    }

    /// Push a finished task's branch and open its pull request.
    fn publish(&self, plan: &Plan, task_id: &str, title: String, repo: Repository, branch: String) {
        let ctx = self.ctx.clone();
        let plan_id = plan.id;
        let task_id = task_id.to_string();
        let body = format!("Task {} of plan \"{}\".", task_id, plan.title);
        tokio::spawn(async move {
            match ctx.git.push_branch(&repo, &branch).await {
                Ok(false) => debug!("{} has no remote, {} not pushed", repo.name, branch),
                Ok(true) => {
                    if let Err(e) = ctx
                        .update_plan(&plan_id, |p| {
                            p.record_pushed_branch(&repo.id, &branch);
                            Ok(())
                        })
                        .await
                    {
                        warn!("failed to record pushed branch {}: {}", branch, e);
                    }
                    match ctx.git.open_pull_request(&repo, &branch, &title, &body).await {
                        Ok(url) => ctx.record(
                            plan_id,
                            ActivityKind::Success,
                            format!("Opened pull request for {}: {}", task_id, url),
                            Some(json!({ "bead_id": task_id, "url": url })),
                        ),
                        Err(e) => ctx.record(
                            plan_id,
                            ActivityKind::Warning,
                            format!("Failed to open pull request for {}: {}", task_id, e),
                            Some(json!({ "bead_id": task_id })),
                        ),
                    }
                }
                Err(e) => ctx.record(
                    plan_id,
                    ActivityKind::Warning,
                    format!("Failed to push {}: {}", branch, e),
                    Some(json!({ "bead_id": task_id })),
                ),
            }
        });
    }

    async fn refresh_graph(&self, plan_id: &PlanId, tasks: &[Task], report: &mut TickReport) -> Result<()> {
        let book = self.ctx.assignments(plan_id).await?;
        let graph = build_graph(tasks, book.as_slice());
        report.stats = graph.stats;
        self.ctx.events.emit(OrchestratorEvent::GraphUpdated {
            plan_id: *plan_id,
            stats: graph.stats,
        });

        if graph.all_complete() && self.ctx.plan(plan_id).await?.status == PlanStatus::InProgress {
            self.ctx
                .update_plan(plan_id, |p| p.transition(PlanStatus::ReadyForReview))
                .await?;
            info!("plan {} ready for review", plan_id.short());
            self.ctx.record(
                *plan_id,
                ActivityKind::Success,
                format!("All {} tasks completed; plan is ready for review", graph.stats.total),
                None,
            );
        }
        Ok(())
    }
}

/// Start the poll loop of a plan, replacing any running one.
pub async fn start_polling(ctx: &Arc<Context>, plan_id: PlanId) -> JoinHandle<()> {
    let token = CancellationToken::new();
    let generation = ctx.register_poller(&plan_id, token.clone()).await;
    let interval = ctx.config.poll_interval();
    let dispatcher = Dispatcher::new(ctx.clone());
    debug!("poll loop for plan {} every {:?}", plan_id.short(), interval);

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {}
            }
            match dispatcher.tick(&plan_id).await {
                Ok(TickOutcome::Stopped) => break,
                Ok(_) => {}
                Err(e) => warn!("tick for plan {} failed: {}", plan_id.short(), e),
            }
        }
        dispatcher.ctx.poller_finished(&plan_id, generation).await;
        debug!("poll loop for plan {} ended", plan_id.short());
    })
}
