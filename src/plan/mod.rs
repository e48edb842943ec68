//! The orchestrator: entry point for everything done to plans.
//!
//! [`Orchestrator`] is a cheap handle over the shared [`Context`]. Queries
//! live here, state-changing operations in [`lifecycle`].

mod lifecycle;

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::activity::{Activity, ActivityKind};
use crate::config::Config;
use crate::context::{Context, Services};
use crate::core::graph::{build_graph, TaskGraph};
use crate::core::plan::{NewPlan, Plan, PlanId};
use crate::dispatch::{self, Dispatcher, TickOutcome};
use crate::event::OrchestratorEvent;
use crate::store::TaskFilter;
use crate::util::slugify;
use crate::{Error, Result};

/// Issue id prefix for a plan's task store.
fn store_prefix(plan: &Plan) -> String {
    slugify(&plan.title)
        .split('-')
        .find(|part| part.chars().next().is_some_and(|c| c.is_ascii_alphabetic()))
        .map(|part| part.chars().take(8).collect())
        .unwrap_or_else(|| "task".to_string())
}

#[derive(Clone)]
pub struct Orchestrator {
    ctx: Arc<Context>,
}

impl Orchestrator {
    pub fn new(config: Config, data_root: PathBuf, services: Services) -> Self {
        Self {
            ctx: Context::new(config, data_root, services),
        }
    }

    pub fn context(&self) -> &Arc<Context> {
        &self.ctx
    }

    pub async fn create_plan(&self, params: NewPlan) -> Result<Plan> {
        if params.title.trim().is_empty() {
            return Err(Error::Validation("plan title must not be empty".to_string()));
        }
        for id in &params.repository_ids {
            self.ctx.repos.get(id)?;
        }

        let plan = Plan::new(params, self.ctx.config.default_max_parallel_agents);
        let root = plan.dir(&self.ctx.data_root);
        tokio::fs::create_dir_all(&root).await?;
        self.ctx.insert_plan(plan.clone()).await?;
        info!("plan {} created: {}", plan.id.short(), plan.title);
        self.ctx.record(
            plan.id,
            ActivityKind::Info,
            format!("Plan \"{}\" created", plan.title),
            None,
        );

        if let Err(e) = self.ctx.tasks.init(&root, &store_prefix(&plan)).await {
            warn!("task store init for plan {} failed: {}", plan.id.short(), e);
            self.ctx.record(
                plan.id,
                ActivityKind::Warning,
                format!("Task store could not be initialized: {}", e),
                None,
            );
        }
        Ok(plan)
    }

    pub async fn get_plan(&self, id: &PlanId) -> Result<Plan> {
        self.ctx.plan(id).await
    }

    /// Every stored plan, oldest first.
    pub async fn list_plans(&self) -> Result<Vec<Plan>> {
        let mut plans = Vec::new();
        for id in self.ctx.stored_plan_ids()? {
            match self.ctx.plan(&id).await {
                Ok(plan) => plans.push(plan),
                Err(e) => warn!("skipping plan {}: {}", id.short(), e),
            }
        }
        plans.sort_by_key(|p| p.created_at);
        Ok(plans)
    }

    pub async fn graph(&self, id: &PlanId) -> Result<TaskGraph> {
        let plan = self.ctx.plan(id).await?;
        let tasks = self
            .ctx
            .tasks
            .list(&plan.dir(&self.ctx.data_root), &TaskFilter::all())
            .await?;
        let book = self.ctx.assignments(id).await?;
        Ok(build_graph(&tasks, book.as_slice()))
    }

    pub fn activities(&self, id: &PlanId) -> Result<Vec<Activity>> {
        self.ctx.activities.list(id)
    }

    /// Run one dispatcher tick outside the poll loop.
    pub async fn tick(&self, id: &PlanId) -> Result<TickOutcome> {
        Dispatcher::new(self.ctx.clone()).tick(id).await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<OrchestratorEvent> {
        self.ctx.events.subscribe()
    }

    /// Resume polling for every stored plan in a polling state.
    ///
    /// Agents of the previous process are not reattached.
    pub async fn recover(&self) -> Result<Vec<PlanId>> {
        let mut resumed = Vec::new();
        for plan in self.list_plans().await? {
            if !plan.status.is_polling() {
                continue;
            }
            debug!("recovering plan {} ({})", plan.id.short(), plan.status);
            self.ctx.assignments(&plan.id).await?;
            dispatch::start_polling(&self.ctx, plan.id).await;
            resumed.push(plan.id);
        }
        if !resumed.is_empty() {
            info!("resumed polling for {} plan(s)", resumed.len());
        }
        Ok(resumed)
    }

    /// Stop every poll loop. Agents keep running.
    pub async fn shutdown(&self) {
        self.ctx.stop_all_polling().await;
    }
}
