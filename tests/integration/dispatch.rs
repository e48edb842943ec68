//! Dispatcher integration tests: capacity, dependency progression and
//! feature-branch merging, driven through the public orchestrator API.

use std::sync::Arc;
use std::time::Duration;

use foreman::agent::AgentRole;
use foreman::automaton::host::ProcessHandle;
use foreman::config::DispatchMode;
use foreman::core::graph::NodeStatus;
use foreman::core::task::Task;
use foreman::store::labels::{repo_label, worktree_label};
use foreman::{ActivityKind, BranchStrategy, NewPlan, Plan, PlanStatus};

use crate::fixtures::{commit_in, eventually, TestEnv};

async fn running_plan(env: &TestEnv, strategy: BranchStrategy, max: usize) -> Plan {
    let plan = env
        .orch
        .create_plan(NewPlan {
            title: "Checkout flow".to_string(),
            repository_ids: vec!["r1".to_string()],
            max_parallel_agents: Some(max),
            branch_strategy: strategy,
            ..Default::default()
        })
        .await
        .unwrap();
    env.orch.execute_plan(&plan.id, "claude").await.unwrap();
    // Ticks are driven by the tests.
    env.orch.context().stop_polling(&plan.id).await;
    env.orch.get_plan(&plan.id).await.unwrap()
}

/// Given 5 ready tasks and a limit of 2
/// When the dispatcher ticks
/// Then exactly 2 task agents run, and a third starts once one finishes
#[tokio::test]
async fn test_concurrency_bound_two_of_five() {
    let env = TestEnv::new();
    let plan = running_plan(&env, BranchStrategy::RaisePrs, 2).await;
    for i in 1..=5 {
        env.ready_task(&plan, &format!("bd-{}", i), &format!("w{}", i), &[]);
    }

    let report = env.tick(&plan.id).await;
    assert_eq!(report.dispatched, vec!["bd-1", "bd-2"]);
    assert!(report.at_capacity);

    let ctx = env.orch.context().clone();
    assert_eq!(ctx.agents.live_count(&plan.id, &[AgentRole::Task]).await, 2);
    // Orchestrator and planner do not count against the limit.
    assert_eq!(env.host.count(), 4);

    let report = env.tick(&plan.id).await;
    assert!(report.dispatched.is_empty());

    env.close_task(&plan, "bd-1");
    let agent = env
        .host
        .find(&format!("{}-bd-1", plan.id.short()))
        .expect("agent for bd-1");
    agent.exit(0);
    let id = plan.id;
    assert!(
        eventually(Duration::from_secs(2), || {
            let ctx = ctx.clone();
            async move { ctx.agents.live_count(&id, &[AgentRole::Task]).await == 1 }
        })
        .await
    );

    let report = env.tick(&plan.id).await;
    assert_eq!(report.dispatched, vec!["bd-3"]);
    assert_eq!(report.completed, vec!["bd-1"]);
    assert_eq!(ctx.agents.live_count(&plan.id, &[AgentRole::Task]).await, 2);
}

/// Given A, and B and C both blocked by A
/// When A is dispatched and closed
/// Then B and C become ready, and the plan is ready for review once all close
#[tokio::test]
async fn test_dependency_progression() {
    let env = TestEnv::new();
    let plan = running_plan(&env, BranchStrategy::RaisePrs, 3).await;
    let root = env.root(&plan);
    env.ready_task(&plan, "a", "core", &[]);
    for id in ["b", "c"] {
        env.store.put(
            &root,
            Task::new(id, id)
                .with_labels([repo_label("api"), worktree_label(id)])
                .blocked_by(["a"]),
        );
    }

    let report = env.tick(&plan.id).await;
    assert_eq!(report.dispatched, vec!["a"]);
    let graph = env.orch.graph(&plan.id).await.unwrap();
    assert_eq!(graph.node("a").unwrap().depth, Some(0));
    assert_eq!(graph.node("b").unwrap().depth, Some(1));
    assert_eq!(graph.node("c").unwrap().status, NodeStatus::Blocked);

    env.close_task(&plan, "a");
    let report = env.tick(&plan.id).await;
    assert_eq!(report.completed, vec!["a"]);
    assert_eq!(report.stats.completed, 1);
    assert_eq!(report.stats.ready, 2);
    assert_eq!(report.stats.total, 3);
    let graph = env.orch.graph(&plan.id).await.unwrap();
    assert_eq!(graph.node("a").unwrap().status, NodeStatus::Completed);
    assert_eq!(graph.node("b").unwrap().status, NodeStatus::Ready);
    assert_eq!(graph.node("c").unwrap().status, NodeStatus::Ready);

    for id in ["b", "c"] {
        env.ready_task(&plan, id, id, &["a"]);
    }
    let report = env.tick(&plan.id).await;
    assert_eq!(report.dispatched, vec!["b", "c"]);

    env.close_task(&plan, "b");
    env.close_task(&plan, "c");
    env.tick(&plan.id).await;
    let reviewed = env.orch.get_plan(&plan.id).await.unwrap();
    assert_eq!(reviewed.status, PlanStatus::ReadyForReview);

    let done = env.orch.complete_plan(&plan.id).await.unwrap();
    assert_eq!(done.status, PlanStatus::Completed);
    assert!(!env.host.find("-orchestrator").unwrap().is_alive());
    assert!(!env.host.find("-planner").unwrap().is_alive());
}

/// Given a feature-branch plan where B depends on A's unmerged work
/// When the dispatcher ticks
/// Then B waits and a merge agent consolidates A's branch first
#[tokio::test]
async fn test_unmerged_blocker_starts_merge_agent() {
    let env = TestEnv::new();
    let plan = running_plan(&env, BranchStrategy::FeatureBranch, 3).await;
    let feature = plan.feature_branch.clone().unwrap();
    assert!(env.repo.branch_exists(&feature));

    env.ready_task(&plan, "a", "core", &[]);
    assert_eq!(env.tick(&plan.id).await.dispatched, vec!["a"]);
    let book = env.orch.context().assignments(&plan.id).await.unwrap();
    let worktree = book.get("a").unwrap().worktree_path.clone().unwrap();
    commit_in(&worktree, "a.txt", "from a\n");

    // While A is still being worked on, B waits and nothing is merged.
    env.ready_task(&plan, "b", "api", &["a"]);
    let report = env.tick(&plan.id).await;
    assert_eq!(report.deferred, vec!["b"]);
    assert!(!report.merge_started);
    assert!(env.host.find("-merge").is_none());

    env.close_task(&plan, "a");
    env.ready_task(&plan, "b", "api", &["a"]);
    let report = env.tick(&plan.id).await;
    assert_eq!(report.deferred, vec!["b"]);
    assert!(report.merge_started);
    assert!(report.dispatched.is_empty());

    let merge = env.host.find("-merge").expect("merge agent");
    let current = env.orch.get_plan(&plan.id).await.unwrap();
    assert!(current.active_merge_worktree().is_some());

    // One merge agent per plan.
    let report = env.tick(&plan.id).await;
    assert!(!report.merge_started);

    let finished = {
        let merge = Arc::clone(&merge);
        eventually(Duration::from_secs(3), move || {
            let merge = Arc::clone(&merge);
            async move {
                merge.emit("\nFOREMAN_MERGE_COMPLETE\n");
                !merge.is_alive()
            }
        })
        .await
    };
    assert!(finished, "merge agent was not stopped after finishing");

    let orch = env.orch.clone();
    let id = plan.id;
    assert!(
        eventually(Duration::from_secs(2), || {
            let orch = orch.clone();
            async move {
                orch.activities(&id)
                    .unwrap()
                    .iter()
                    .any(|a| a.kind == ActivityKind::Success && a.message.starts_with("Merged 1 branch"))
            }
        })
        .await
    );
    let current = env.orch.get_plan(&plan.id).await.unwrap();
    assert!(current.active_merge_worktree().is_none());
}

/// Headless agents get the credential in their environment and count as
/// sent as soon as they start.
#[tokio::test]
async fn test_headless_dispatch() {
    let env = TestEnv::with_config(|config| {
        config.dispatch_mode = DispatchMode::Headless;
        config.headless_command = "run-agent {workdir} {prompt}".to_string();
    });
    let plan = running_plan(&env, BranchStrategy::RaisePrs, 2).await;
    env.ready_task(&plan, "bd-1", "auth", &[]);

    assert_eq!(env.tick(&plan.id).await.dispatched, vec!["bd-1"]);
    let book = env.orch.context().assignments(&plan.id).await.unwrap();
    assert_eq!(
        book.get("bd-1").unwrap().status,
        foreman::core::assignment::AssignmentStatus::Sent
    );
    let graph = env.orch.graph(&plan.id).await.unwrap();
    assert_eq!(graph.node("bd-1").unwrap().status, NodeStatus::Sent);
}

/// A task agent that crashes fails its assignment with an error activity.
#[tokio::test]
async fn test_crashed_agent_fails_assignment() {
    let env = TestEnv::new();
    let plan = running_plan(&env, BranchStrategy::RaisePrs, 2).await;
    env.ready_task(&plan, "bd-1", "auth", &[]);
    env.tick(&plan.id).await;

    env.host
        .find(&format!("{}-bd-1", plan.id.short()))
        .unwrap()
        .exit(2);

    let ctx = env.orch.context().clone();
    let id = plan.id;
    assert!(
        eventually(Duration::from_secs(2), || {
            let ctx = ctx.clone();
            async move {
                ctx.assignments(&id)
                    .await
                    .unwrap()
                    .get("bd-1")
                    .is_some_and(|a| !a.status.is_open())
            }
        })
        .await
    );
    let graph = env.orch.graph(&plan.id).await.unwrap();
    assert_eq!(graph.node("bd-1").unwrap().status, NodeStatus::Failed);
    assert!(env
        .orch
        .activities(&plan.id)
        .unwrap()
        .iter()
        .any(|a| a.kind == ActivityKind::Error && a.message.contains("exited with code 2")));
}

/// Given 5 ready tasks and a limit of 2
/// When the first two tasks close while their agents keep running
/// Then no third agent starts until one of them exits
#[tokio::test]
async fn test_closed_tasks_with_live_agents_hold_slots() {
    let env = TestEnv::new();
    let plan = running_plan(&env, BranchStrategy::RaisePrs, 2).await;
    for i in 1..=5 {
        env.ready_task(&plan, &format!("bd-{}", i), &format!("w{}", i), &[]);
    }
    assert_eq!(env.tick(&plan.id).await.dispatched, vec!["bd-1", "bd-2"]);

    env.close_task(&plan, "bd-1");
    env.close_task(&plan, "bd-2");
    let report = env.tick(&plan.id).await;
    assert_eq!(report.completed, vec!["bd-1", "bd-2"]);
    assert!(report.dispatched.is_empty());
    assert!(report.at_capacity);
    assert!(env.tick(&plan.id).await.dispatched.is_empty());
    assert_eq!(env.host.count(), 4);

    env.host
        .find(&format!("{}-bd-1", plan.id.short()))
        .unwrap()
        .exit(0);
    let ctx = env.orch.context().clone();
    let id = plan.id;
    assert!(
        eventually(Duration::from_secs(2), || {
            let ctx = ctx.clone();
            async move { ctx.agents.live_count(&id, &[AgentRole::Task]).await == 1 }
        })
        .await
    );
    assert_eq!(env.tick(&plan.id).await.dispatched, vec!["bd-3"]);
}

/// An agent that goes away without closing its task is replaced by a new
/// one in the same worktree on the next tick.
#[tokio::test]
async fn test_vanished_agent_is_respawned() {
    let env = TestEnv::new();
    let plan = running_plan(&env, BranchStrategy::RaisePrs, 2).await;
    env.ready_task(&plan, "bd-1", "auth", &[]);
    assert_eq!(env.tick(&plan.id).await.dispatched, vec!["bd-1"]);
    let book = env.orch.context().assignments(&plan.id).await.unwrap();
    let worktree = book.get("bd-1").unwrap().worktree_path.clone().unwrap();

    let suffix = format!("{}-bd-1", plan.id.short());
    env.host.find(&suffix).unwrap().exit(0);
    let ctx = env.orch.context().clone();
    let id = plan.id;
    assert!(
        eventually(Duration::from_secs(2), || {
            let ctx = ctx.clone();
            async move { ctx.agents.live_count(&id, &[AgentRole::Task]).await == 0 }
        })
        .await
    );

    let report = env.tick(&plan.id).await;
    assert_eq!(report.requeued, vec!["bd-1"]);
    assert_eq!(report.dispatched, vec!["bd-1"]);
    assert_eq!(env.host.count(), 4);
    assert!(env.host.find(&suffix).unwrap().is_alive());

    let current = env.orch.get_plan(&plan.id).await.unwrap();
    assert_eq!(current.active_worktrees().count(), 1);
    let book = env.orch.context().assignments(&plan.id).await.unwrap();
    assert_eq!(book.get("bd-1").unwrap().worktree_path.as_ref(), Some(&worktree));
    assert!(env
        .orch
        .activities(&plan.id)
        .unwrap()
        .iter()
        .any(|a| a.kind == ActivityKind::Warning && a.message.contains("no longer running")));

    // Nothing left to requeue once the new agent runs.
    assert!(env.tick(&plan.id).await.requeued.is_empty());
}
