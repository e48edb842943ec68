//! Session continuity of long-lived agents.

use std::sync::atomic::Ordering;

use foreman::agent::AgentRole;
use foreman::persist::KvStore;
use foreman::{BranchStrategy, NewPlan, Plan};

use crate::fixtures::TestEnv;

async fn draft(env: &TestEnv) -> Plan {
    env.orch
        .create_plan(NewPlan {
            title: "Search".to_string(),
            repository_ids: vec!["r1".to_string()],
            branch_strategy: BranchStrategy::RaisePrs,
            ..Default::default()
        })
        .await
        .unwrap()
}

async fn discussion_session(env: &TestEnv, plan: &Plan) -> (String, bool) {
    let automaton = env
        .orch
        .context()
        .agents
        .find(&plan.id, AgentRole::Discussion)
        .await
        .expect("discussion agent");
    let session = automaton.session().expect("tracked session");
    (session.id().to_string(), session.is_resume())
}

/// Given a stored session whose transcript exists
/// When the discussion agent starts again
/// Then it resumes that session
#[tokio::test]
async fn test_discussion_resumes_recorded_session() {
    let env = TestEnv::new();
    let plan = draft(&env).await;

    env.orch.start_discussion(&plan.id, "claude").await.unwrap();
    let (first, resumed) = discussion_session(&env, &plan).await;
    assert!(!resumed);
    assert_eq!(
        env.kv.get(&format!("session:{}:discussion", plan.id)).unwrap(),
        Some(first.clone())
    );

    env.orch.cancel_discussion(&plan.id).await.unwrap();
    env.records.present.store(true, Ordering::SeqCst);
    env.orch.start_discussion(&plan.id, "claude").await.unwrap();

    let (second, resumed) = discussion_session(&env, &plan).await;
    assert!(resumed);
    assert_eq!(second, first);
}

/// Given a stored session with no transcript
/// When the discussion agent starts again
/// Then a fresh session replaces it
#[tokio::test]
async fn test_missing_transcript_starts_fresh() {
    let env = TestEnv::new();
    let plan = draft(&env).await;

    env.orch.start_discussion(&plan.id, "claude").await.unwrap();
    let (first, _) = discussion_session(&env, &plan).await;
    env.orch.cancel_discussion(&plan.id).await.unwrap();
    env.orch.start_discussion(&plan.id, "claude").await.unwrap();

    let (second, resumed) = discussion_session(&env, &plan).await;
    assert!(!resumed);
    assert_ne!(second, first);
    assert_eq!(
        env.kv.get(&format!("session:{}:discussion", plan.id)).unwrap(),
        Some(second)
    );
}

/// Orchestrator and planner keep separate sessions, removed with the plan.
#[tokio::test]
async fn test_execution_sessions_are_per_role() {
    let env = TestEnv::new();
    let plan = draft(&env).await;
    env.orch.execute_plan(&plan.id, "claude").await.unwrap();
    env.orch.shutdown().await;

    let keys = env.kv.keys(&format!("session:{}:", plan.id)).unwrap();
    assert_eq!(
        keys,
        vec![
            format!("session:{}:orchestrator", plan.id),
            format!("session:{}:planner", plan.id),
        ]
    );

    env.orch.delete_plan(&plan.id).await.unwrap();
    assert!(env
        .kv
        .keys(&format!("session:{}:", plan.id))
        .unwrap()
        .is_empty());
}
