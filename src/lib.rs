//! foreman: runs a plan of tasks through a pool of AI coding agents.
//!
//! A plan is discussed with an agent, then handed to an orchestrator and a
//! planner agent that file tasks into a task store. The dispatcher polls the
//! store, places each ready task in its own git worktree and starts a task
//! agent there, bounded by the plan's parallelism.

pub mod activity;
pub mod agent;
pub mod automaton;
pub mod cleanup;
pub mod config;
pub mod context;
pub mod core;
pub mod credentials;
pub mod dispatch;
pub mod error;
pub mod event;
pub mod git;
pub mod log;
pub mod persist;
pub mod plan;
pub mod store;
pub mod util;

pub use activity::{Activity, ActivityKind};
pub use context::Services;
pub use crate::core::{BranchStrategy, NewPlan, Plan, PlanId, PlanStatus, TaskGraph};
pub use error::{Error, Result};
pub use event::OrchestratorEvent;
pub use plan::Orchestrator;
