//! Shared state of the orchestrator.
//!
//! Everything the plan lifecycle and the dispatcher touch lives here: the
//! injected collaborators, the in-memory plan and assignment tables (written
//! through to the key-value store on every mutation), the agent registry,
//! and the per-plan bookkeeping for poll loops, tick guards, executing
//! markers and background cleanups.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::activity::{ActivityKind, ActivityLog};
use crate::automaton::session::{SessionRecords, SessionStore};
use crate::automaton::{AgentRegistry, Automaton, AutomatonDeps, AutomatonSpec};
use crate::automaton::host::ProcessHost;
use crate::agent::AgentRole;
use crate::config::Config;
use crate::core::assignment::AssignmentBook;
use crate::core::plan::{Plan, PlanId};
use crate::core::repository::{Repository, RepositoryCatalog};
use crate::credentials::CredentialProvider;
use crate::event::{EventBus, OrchestratorEvent};
use crate::git::WorktreeCoordinator;
use crate::persist::{load_json, save_json, KvStore};
use crate::store::{LabelScheme, TaskStore};
use crate::{Error, Result};

pub fn plan_key(id: &PlanId) -> String {
    format!("plan:{}", id)
}

pub fn assignments_key(id: &PlanId) -> String {
    format!("assignments:{}", id)
}

/// Injected collaborators.
#[derive(Clone)]
pub struct Services {
    pub kv: Arc<dyn KvStore>,
    pub tasks: Arc<dyn TaskStore>,
    pub host: Arc<dyn ProcessHost>,
    pub credentials: Arc<dyn CredentialProvider>,
    pub records: Arc<dyn SessionRecords>,
}

/// Clears a plan's tick flag when the tick ends.
pub struct TickGuard(Arc<AtomicBool>);

impl Drop for TickGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct Context {
    pub config: Config,
    pub data_root: PathBuf,
    pub kv: Arc<dyn KvStore>,
    pub tasks: Arc<dyn TaskStore>,
    pub credentials: Arc<dyn CredentialProvider>,
    pub automata: AutomatonDeps,
    pub agents: AgentRegistry,
    pub repos: RepositoryCatalog,
    pub git: WorktreeCoordinator,
    pub activities: ActivityLog,
    pub events: EventBus,
    pub labels: LabelScheme,
    plans: RwLock<HashMap<PlanId, Plan>>,
    assignments: RwLock<HashMap<PlanId, AssignmentBook>>,
    executing: Mutex<HashSet<PlanId>>,
    pollers: Mutex<HashMap<PlanId, (u64, CancellationToken)>>,
    poller_seq: AtomicU64,
    ticking: std::sync::Mutex<HashMap<PlanId, Arc<AtomicBool>>>,
    cleanups: Mutex<HashMap<PlanId, JoinHandle<()>>>,
}

impl Context {
    pub fn new(config: Config, data_root: PathBuf, services: Services) -> Arc<Self> {
        let events = EventBus::default();
        let automata = AutomatonDeps {
            host: services.host,
            sessions: SessionStore::new(services.kv.clone()),
            records: services.records,
            timing: config.automaton.clone(),
        };
        let ctx = Arc::new(Self {
            repos: RepositoryCatalog::new(config.repositories.clone()),
            labels: LabelScheme::new(&config.label_prefix),
            config,
            data_root,
            activities: ActivityLog::new(services.kv.clone(), events.clone()),
            agents: AgentRegistry::new(events.clone()),
            kv: services.kv,
            tasks: services.tasks,
            credentials: services.credentials,
            automata,
            git: WorktreeCoordinator::new(),
            events,
            plans: RwLock::new(HashMap::new()),
            assignments: RwLock::new(HashMap::new()),
            executing: Mutex::new(HashSet::new()),
            pollers: Mutex::new(HashMap::new()),
            poller_seq: AtomicU64::new(0),
            ticking: std::sync::Mutex::new(HashMap::new()),
            cleanups: Mutex::new(HashMap::new()),
        });

        if tokio::runtime::Handle::try_current().is_ok() {
            tokio::spawn(watch_exits(Arc::downgrade(&ctx), ctx.events.subscribe()));
        }
        ctx
    }

    // Plans

    /// Current state of a plan, loading it from storage on first access.
    pub async fn plan(&self, id: &PlanId) -> Result<Plan> {
        if let Some(plan) = self.plans.read().await.get(id) {
            return Ok(plan.clone());
        }
        let plan: Plan =
            load_json(self.kv.as_ref(), &plan_key(id))?.ok_or(Error::PlanNotFound(*id))?;
        self.plans
            .write()
            .await
            .entry(*id)
            .or_insert_with(|| plan.clone());
        Ok(plan)
    }

    pub async fn insert_plan(&self, plan: Plan) -> Result<()> {
        save_json(self.kv.as_ref(), &plan_key(&plan.id), &plan)?;
        self.plans.write().await.insert(plan.id, plan.clone());
        self.events.emit(OrchestratorEvent::PlanUpdated(plan));
        Ok(())
    }

    /// Apply `f` to a plan, persist and broadcast the result.
    ///
    /// `f` works on a copy; when it fails nothing is written.
    pub async fn update_plan<T>(
        &self,
        id: &PlanId,
        f: impl FnOnce(&mut Plan) -> Result<T>,
    ) -> Result<(Plan, T)> {
        self.plan(id).await?;
        let updated = {
            let mut plans = self.plans.write().await;
            let current = plans.get_mut(id).ok_or(Error::PlanNotFound(*id))?;
            let mut draft = current.clone();
            let out = f(&mut draft)?;
            draft.touch();
            save_json(self.kv.as_ref(), &plan_key(id), &draft)?;
            *current = draft.clone();
            (draft, out)
        };
        self.events
            .emit(OrchestratorEvent::PlanUpdated(updated.0.clone()));
        Ok(updated)
    }

    pub async fn forget_plan(&self, id: &PlanId) -> Result<()> {
        self.plans.write().await.remove(id);
        self.assignments.write().await.remove(id);
        self.kv.delete(&plan_key(id))?;
        self.kv.delete(&assignments_key(id))
    }

    pub async fn loaded_plans(&self) -> Vec<Plan> {
        self.plans.read().await.values().cloned().collect()
    }

    /// Ids of every persisted plan.
    pub fn stored_plan_ids(&self) -> Result<Vec<PlanId>> {
        let mut ids = Vec::new();
        for key in self.kv.keys("plan:")? {
            match key["plan:".len()..].parse::<PlanId>() {
                Ok(id) => ids.push(id),
                Err(_) => warn!("ignoring malformed plan key {}", key),
            }
        }
        Ok(ids)
    }

    /// Repositories a plan works in; every configured one when it names none.
    pub fn plan_repositories(&self, plan: &Plan) -> Result<Vec<Repository>> {
        if plan.repository_ids.is_empty() {
            return Ok(self.repos.all().to_vec());
        }
        plan.repository_ids
            .iter()
            .map(|id| self.repos.get(id).cloned())
            .collect()
    }

    // Assignments

    async fn load_assignments(&self, id: &PlanId) -> Result<()> {
        if self.assignments.read().await.contains_key(id) {
            return Ok(());
        }
        let book: AssignmentBook =
            load_json(self.kv.as_ref(), &assignments_key(id))?.unwrap_or_default();
        self.assignments.write().await.entry(*id).or_insert(book);
        Ok(())
    }

    pub async fn assignments(&self, id: &PlanId) -> Result<AssignmentBook> {
        self.load_assignments(id).await?;
        Ok(self
            .assignments
            .read()
            .await
            .get(id)
            .cloned()
            .unwrap_or_default())
    }

    /// Mutate a plan's assignments and persist them.
    pub async fn with_assignments<T>(
        &self,
        id: &PlanId,
        f: impl FnOnce(&mut AssignmentBook) -> Result<T>,
    ) -> Result<T> {
        self.load_assignments(id).await?;
        let mut books = self.assignments.write().await;
        let current = books.entry(*id).or_default();
        let mut draft = current.clone();
        let out = f(&mut draft)?;
        save_json(self.kv.as_ref(), &assignments_key(id), &draft)?;
        *current = draft;
        Ok(out)
    }

    pub async fn clear_assignments(&self, id: &PlanId) -> Result<()> {
        self.assignments
            .write()
            .await
            .insert(*id, AssignmentBook::new());
        self.kv.delete(&assignments_key(id))
    }

    // Activities

    /// Append an activity; a storage failure is logged, not returned.
    pub fn record(
        &self,
        plan_id: PlanId,
        kind: ActivityKind,
        message: impl Into<String>,
        details: Option<serde_json::Value>,
    ) {
        let message = message.into();
        if let Err(e) = self.activities.add(plan_id, kind, message.clone(), details) {
            warn!("failed to record activity '{}': {}", message, e);
        }
    }

    // Agents

    /// Start an automaton and register it as a live agent.
    pub async fn start_agent(&self, spec: AutomatonSpec) -> Result<Arc<Automaton>> {
        let automaton = Automaton::spawn(&self.automata, spec).await?;
        self.agents.register(automaton.clone()).await;
        Ok(automaton)
    }

    // Executing markers

    /// Returns false when the plan is already marked.
    pub async fn mark_executing(&self, id: &PlanId) -> bool {
        self.executing.lock().await.insert(*id)
    }

    pub async fn release_executing(&self, id: &PlanId) {
        self.executing.lock().await.remove(id);
    }

    pub async fn is_executing(&self, id: &PlanId) -> bool {
        self.executing.lock().await.contains(id)
    }

    // Poll loops

    /// Register the token of a new poll loop, cancelling any previous one.
    /// Returns the loop's generation.
    pub async fn register_poller(&self, id: &PlanId, token: CancellationToken) -> u64 {
        let generation = self.poller_seq.fetch_add(1, Ordering::SeqCst);
        if let Some((_, old)) = self.pollers.lock().await.insert(*id, (generation, token)) {
            old.cancel();
        }
        generation
    }

    pub async fn stop_polling(&self, id: &PlanId) {
        if let Some((_, token)) = self.pollers.lock().await.remove(id) {
            debug!("stopping poll loop for plan {}", id.short());
            token.cancel();
        }
    }

    /// Drop the poller entry if it still belongs to the loop of `generation`.
    pub async fn poller_finished(&self, id: &PlanId, generation: u64) {
        let mut pollers = self.pollers.lock().await;
        if pollers.get(id).is_some_and(|(g, _)| *g == generation) {
            pollers.remove(id);
        }
    }

    pub async fn is_polling(&self, id: &PlanId) -> bool {
        self.pollers
            .lock()
            .await
            .get(id)
            .is_some_and(|(_, t)| !t.is_cancelled())
    }

    pub async fn stop_all_polling(&self) {
        for (_, (_, token)) in self.pollers.lock().await.drain() {
            token.cancel();
        }
    }

    /// Claim the plan's tick flag; `None` when a tick is already running.
    pub fn try_tick(&self, id: &PlanId) -> Option<TickGuard> {
        let flag = self
            .ticking
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(*id)
            .or_default()
            .clone();
        if flag.swap(true, Ordering::SeqCst) {
            return None;
        }
        Some(TickGuard(flag))
    }

    // Background cleanups

    pub async fn set_cleanup(&self, id: &PlanId, handle: JoinHandle<()>) {
        self.cleanups.lock().await.insert(*id, handle);
    }

    /// Wait for a cleanup started by a cancellation to finish.
    pub async fn await_cleanup(&self, id: &PlanId) {
        let handle = self.cleanups.lock().await.remove(id);
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!("background cleanup for plan {} failed: {}", id.short(), e);
            }
        }
    }
}

/// Fail the assignment of a task agent that exited with an error code.
async fn watch_exits(ctx: Weak<Context>, mut rx: broadcast::Receiver<OrchestratorEvent>) {
    loop {
        let event = match rx.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => break,
        };
        let OrchestratorEvent::AgentExited {
            agent_id,
            plan_id: Some(plan_id),
            role: AgentRole::Task,
            code: Some(code),
        } = event
        else {
            continue;
        };
        if code == 0 {
            continue;
        }
        let Some(ctx) = ctx.upgrade() else {
            break;
        };

        let failed = ctx
            .with_assignments(&plan_id, |book| {
                let Some(assignment) = book
                    .iter_mut()
                    .find(|a| a.agent_id == agent_id && a.status.is_open())
                else {
                    return Ok(None);
                };
                assignment.fail(&format!("agent exited with code {}", code));
                Ok(Some(assignment.bead_id.clone()))
            })
            .await;
        match failed {
            Ok(Some(bead_id)) => ctx.record(
                plan_id,
                ActivityKind::Error,
                format!("Agent for task {} exited with code {}", bead_id, code),
                Some(serde_json::json!({ "bead_id": bead_id, "code": code })),
            ),
            Ok(None) => {}
            Err(e) => warn!("failed to record agent exit: {}", e),
        }
    }
}
