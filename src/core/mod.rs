//! Core domain models for foreman.
//!
//! Plans, the tasks they are made of, assignment records and the
//! dependency graph derived from them.

pub mod assignment;
pub mod graph;
pub mod plan;
pub mod repository;
pub mod task;

pub use assignment::{AssignmentBook, AssignmentStatus, TaskAssignment};
pub use graph::{build_graph, GraphEdge, GraphStats, NodeStatus, TaskGraph, TaskNode};
pub use plan::{
    BranchStrategy, Discussion, NewPlan, Plan, PlanId, PlanStatus, WorktreeKind, WorktreeRecord,
    WorktreeStatus,
};
pub use repository::{Repository, RepositoryCatalog};
pub use task::{IssueType, Task, TaskState};
