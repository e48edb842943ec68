//! Plan lifecycle integration tests: idempotent execution, cancellation
//! ordering and restart.

use std::sync::atomic::Ordering;
use std::time::Duration;

use tokio::sync::broadcast::error::TryRecvError;

use foreman::agent::AgentRole;
use foreman::automaton::host::ProcessHandle;
use foreman::{ActivityKind, BranchStrategy, Error, NewPlan, OrchestratorEvent, Plan, PlanStatus};

use crate::fixtures::{eventually, remote_has_branch, TestEnv};

async fn new_plan(env: &TestEnv) -> Plan {
    env.orch
        .create_plan(NewPlan {
            title: "Billing".to_string(),
            repository_ids: vec!["r1".to_string()],
            branch_strategy: BranchStrategy::RaisePrs,
            ..Default::default()
        })
        .await
        .unwrap()
}

/// Given a draft plan
/// When execute_plan is called twice at once
/// Then one orchestrator and one planner are started
#[tokio::test]
async fn test_double_execute_starts_agents_once() {
    let env = TestEnv::new();
    let plan = new_plan(&env).await;

    let (first, second) = tokio::join!(
        env.orch.execute_plan(&plan.id, "claude"),
        env.orch.execute_plan(&plan.id, "claude")
    );
    first.unwrap();
    second.unwrap();

    assert_eq!(env.host.count(), 2);
    let ctx = env.orch.context();
    assert_eq!(
        ctx.agents
            .live_count(&plan.id, &[AgentRole::Orchestrator, AgentRole::Planner])
            .await,
        2
    );

    let again = env.orch.execute_plan(&plan.id, "claude").await.unwrap();
    assert!(matches!(again.status, PlanStatus::Delegating | PlanStatus::InProgress));
    assert_eq!(env.host.count(), 2);
    assert!(!ctx.is_executing(&plan.id).await);
    env.orch.shutdown().await;
}

/// Given a plan with a dispatched task
/// When it is cancelled
/// Then `failed` is published before any worktree is cleaned
#[tokio::test]
async fn test_cancel_fails_before_cleanup() {
    let env = TestEnv::new();
    let plan = new_plan(&env).await;
    env.orch.execute_plan(&plan.id, "claude").await.unwrap();
    env.orch.context().stop_polling(&plan.id).await;
    env.ready_task(&plan, "bd-1", "auth", &[]);
    assert_eq!(env.tick(&plan.id).await.dispatched, vec!["bd-1"]);
    env.wait_sent(&plan.id, "bd-1").await;
    let worktree = env
        .orch
        .get_plan(&plan.id)
        .await
        .unwrap()
        .active_worktrees()
        .next()
        .unwrap()
        .path
        .clone();
    assert!(worktree.exists());

    let mut events = env.orch.subscribe();
    let cancelled = env.orch.cancel_plan(&plan.id).await.unwrap();
    assert_eq!(cancelled.status, PlanStatus::Failed);
    assert_eq!(cancelled.last_error.as_deref(), Some("cancelled"));
    env.orch.context().await_cleanup(&plan.id).await;

    let mut updates = Vec::new();
    loop {
        match events.try_recv() {
            Ok(OrchestratorEvent::PlanUpdated(p)) => updates.push(p),
            Ok(_) | Err(TryRecvError::Lagged(_)) => {}
            Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => break,
        }
    }
    let failed_at = updates
        .iter()
        .position(|p| p.status == PlanStatus::Failed)
        .expect("failed status published");
    let cleaned_at = updates
        .iter()
        .position(|p| p.worktrees.iter().any(|w| !w.is_active()))
        .expect("cleanup published");
    assert!(failed_at < cleaned_at);

    assert!(!worktree.exists());
    assert!(env.orch.context().agents.by_plan(&plan.id).await.is_empty());
    assert!(!env.host.find("-planner").unwrap().is_alive());
    assert!(env
        .orch
        .activities(&plan.id)
        .unwrap()
        .iter()
        .any(|a| a.kind == ActivityKind::Error && a.message == "Plan cancelled"));
}

/// A cancelled plan restarts from draft with its assignments and
/// activities cleared, and can be executed again.
#[tokio::test]
async fn test_restart_after_cancel() {
    let env = TestEnv::new();
    let plan = new_plan(&env).await;
    env.orch.execute_plan(&plan.id, "claude").await.unwrap();
    env.orch.context().stop_polling(&plan.id).await;
    env.ready_task(&plan, "bd-1", "auth", &[]);
    env.tick(&plan.id).await;
    env.wait_sent(&plan.id, "bd-1").await;
    env.orch.cancel_plan(&plan.id).await.unwrap();

    let restarted = env.orch.restart_plan(&plan.id).await.unwrap();
    assert_eq!(restarted.status, PlanStatus::Draft);
    assert_eq!(restarted.active_worktrees().count(), 0);
    // Cleaned worktrees stay on record.
    assert_eq!(restarted.worktrees.len(), 1);
    assert!(restarted.last_error.is_none());
    assert!(env
        .orch
        .context()
        .assignments(&plan.id)
        .await
        .unwrap()
        .is_empty());
    assert_eq!(env.orch.activities(&plan.id).unwrap().len(), 1);

    // Restarting twice is rejected: the plan is no longer failed.
    assert!(matches!(
        env.orch.restart_plan(&plan.id).await,
        Err(Error::InvalidTransition { .. })
    ));

    let running = env.orch.execute_plan(&plan.id, "claude").await.unwrap();
    assert_eq!(running.status, PlanStatus::Delegating);
    env.orch.shutdown().await;
}

/// A spawn failure leaves the plan where it was, with the error recorded.
#[tokio::test]
async fn test_execute_spawn_failure_reverts() {
    let env = TestEnv::new();
    let plan = new_plan(&env).await;
    env.host.fail.store(true, Ordering::SeqCst);

    assert!(env.orch.execute_plan(&plan.id, "claude").await.is_err());
    let reverted = env.orch.get_plan(&plan.id).await.unwrap();
    assert_eq!(reverted.status, PlanStatus::Draft);
    assert!(reverted.last_error.unwrap().contains("no server running"));
    assert!(!env.orch.context().is_polling(&plan.id).await);
}

/// Recovery resumes polling for running plans only.
#[tokio::test]
async fn test_recover_running_plans() {
    let env = TestEnv::new();
    let running = new_plan(&env).await;
    let idle = new_plan(&env).await;
    env.orch.execute_plan(&running.id, "claude").await.unwrap();
    env.orch.shutdown().await;
    assert!(!env.orch.context().is_polling(&running.id).await);

    let resumed = env.orch.recover().await.unwrap();
    assert_eq!(resumed, vec![running.id]);
    assert!(env.orch.context().is_polling(&running.id).await);
    assert!(!env.orch.context().is_polling(&idle.id).await);
    env.orch.shutdown().await;
}

/// Finished task branches of a raise_prs plan are pushed, and restarting
/// the plan deletes them from the remote again.
#[tokio::test]
async fn test_restart_deletes_pushed_branches() {
    let env = TestEnv::new();
    let origin = env.repo.add_origin();
    let plan = new_plan(&env).await;
    env.orch.execute_plan(&plan.id, "claude").await.unwrap();
    env.orch.context().stop_polling(&plan.id).await;
    env.ready_task(&plan, "bd-1", "auth", &[]);
    env.tick(&plan.id).await;
    env.close_task(&plan, "bd-1");
    assert_eq!(env.tick(&plan.id).await.completed, vec!["bd-1"]);

    let orch = env.orch.clone();
    let id = plan.id;
    assert!(
        eventually(Duration::from_secs(5), || {
            let orch = orch.clone();
            async move { !orch.get_plan(&id).await.unwrap().pushed_branches.is_empty() }
        })
        .await,
        "task branch was never pushed"
    );
    let pushed = env.orch.get_plan(&plan.id).await.unwrap().pushed_branches;
    assert_eq!(pushed.len(), 1);
    let branch = pushed[0].branch.clone();
    assert!(remote_has_branch(&origin, &branch));

    env.orch.cancel_plan(&plan.id).await.unwrap();
    env.orch.context().await_cleanup(&plan.id).await;
    let restarted = env.orch.restart_plan(&plan.id).await.unwrap();
    assert!(restarted.pushed_branches.is_empty());
    assert!(!remote_has_branch(&origin, &branch));
}
