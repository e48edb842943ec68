//! Live agents, keyed by id.
//!
//! Every automaton the orchestrator starts is registered here. A watcher task
//! per agent removes it once its process ends and emits
//! [`OrchestratorEvent::AgentExited`], so the dispatcher's next tick sees the
//! freed capacity.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{debug, warn};

use super::Automaton;
use crate::agent::{AgentId, AgentRole};
use crate::core::plan::PlanId;
use crate::event::{EventBus, OrchestratorEvent};

#[derive(Clone)]
pub struct AgentRegistry {
    agents: Arc<RwLock<HashMap<AgentId, Arc<Automaton>>>>,
    events: EventBus,
}

impl AgentRegistry {
    pub fn new(events: EventBus) -> Self {
        Self {
            agents: Arc::new(RwLock::new(HashMap::new())),
            events,
        }
    }

    pub async fn register(&self, automaton: Arc<Automaton>) {
        let id = automaton.id;
        debug!(
            "AgentRegistry::register id={} role={} name={}",
            id.short(),
            automaton.role,
            automaton.name
        );
        self.agents.write().await.insert(id, automaton.clone());

        let agents = self.agents.clone();
        let events = self.events.clone();
        tokio::spawn(async move {
            let code = automaton.wait_exit().await;
            agents.write().await.remove(&id);
            debug!("agent {} ({}) exited with {:?}", id.short(), automaton.name, code);
            events.emit(OrchestratorEvent::AgentExited {
                agent_id: id,
                plan_id: automaton.plan_id,
                role: automaton.role,
                code,
            });
        });
    }

    pub async fn get(&self, id: &AgentId) -> Option<Arc<Automaton>> {
        self.agents.read().await.get(id).cloned()
    }

    pub async fn is_live(&self, id: &AgentId) -> bool {
        self.agents
            .read()
            .await
            .get(id)
            .is_some_and(|a| a.is_alive())
    }

    pub async fn by_plan(&self, plan_id: &PlanId) -> Vec<Arc<Automaton>> {
        self.agents
            .read()
            .await
            .values()
            .filter(|a| a.plan_id.as_ref() == Some(plan_id))
            .cloned()
            .collect()
    }

    pub async fn find(&self, plan_id: &PlanId, role: AgentRole) -> Option<Arc<Automaton>> {
        self.by_plan(plan_id)
            .await
            .into_iter()
            .find(|a| a.role == role && a.is_alive())
    }

    /// Live agents of a plan in any of `roles`.
    pub async fn live_count(&self, plan_id: &PlanId, roles: &[AgentRole]) -> usize {
        self.by_plan(plan_id)
            .await
            .iter()
            .filter(|a| roles.contains(&a.role) && a.is_alive())
            .count()
    }

    /// Kill and forget one agent.
    pub async fn kill(&self, id: &AgentId) {
        let removed = self.agents.write().await.remove(id);
        if let Some(automaton) = removed {
            if let Err(e) = automaton.kill().await {
                warn!("failed to kill agent {}: {}", automaton.name, e);
            }
        }
    }

    /// Kill every agent of `plan_id` in one of `roles` (all roles when empty).
    pub async fn kill_plan(&self, plan_id: &PlanId, roles: &[AgentRole]) -> usize {
        let doomed: Vec<Arc<Automaton>> = {
            let mut agents = self.agents.write().await;
            let ids: Vec<AgentId> = agents
                .values()
                .filter(|a| a.plan_id.as_ref() == Some(plan_id))
                .filter(|a| roles.is_empty() || roles.contains(&a.role))
                .map(|a| a.id)
                .collect();
            ids.iter().filter_map(|id| agents.remove(id)).collect()
        };
        for automaton in &doomed {
            if let Err(e) = automaton.kill().await {
                warn!("failed to kill agent {}: {}", automaton.name, e);
            }
        }
        debug!("killed {} agents of plan {}", doomed.len(), plan_id.short());
        doomed.len()
    }

    pub async fn len(&self) -> usize {
        self.agents.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.agents.read().await.is_empty()
    }
}
