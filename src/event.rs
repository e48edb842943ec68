//! Events pushed to observers of the orchestrator.
//!
//! The bus is a `tokio::sync::broadcast` channel; slow observers lag and
//! lose old events instead of blocking the dispatcher.

use tokio::sync::broadcast;

use crate::activity::Activity;
use crate::agent::{AgentId, AgentRole};
use crate::core::graph::GraphStats;
use crate::core::plan::{Plan, PlanId};

#[derive(Debug, Clone)]
pub enum OrchestratorEvent {
    /// A plan was created or changed.
    PlanUpdated(Plan),
    /// An activity was appended to a plan's log.
    ActivityAdded {
        plan_id: PlanId,
        activity: Activity,
    },
    /// The dispatcher rebuilt a plan's dependency graph.
    GraphUpdated { plan_id: PlanId, stats: GraphStats },
    /// An agent process ended.
    AgentExited {
        agent_id: AgentId,
        plan_id: Option<PlanId>,
        role: AgentRole,
        code: Option<i32>,
    },
}

#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<OrchestratorEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publish an event. Having no subscriber is not an error.
    pub fn emit(&self, event: OrchestratorEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<OrchestratorEvent> {
        self.tx.subscribe()
    }
}
