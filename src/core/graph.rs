//! Dependency graph over a plan's tasks.
//!
//! [`build_graph`] turns the flat task list from the store plus the plan's
//! assignment records into a [`TaskGraph`]: derived node status, BFS depth,
//! critical path and per-status counts. The graph is rebuilt from scratch on
//! every query and never mutated by callers.
//!
//! Edges point from blocker to blocked.

use petgraph::algo::{is_cyclic_directed, toposort};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};

use crate::core::assignment::{AssignmentStatus, TaskAssignment};
use crate::core::task::Task;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Completed,
    Pending,
    InProgress,
    Sent,
    Failed,
    Ready,
    Blocked,
}

impl From<AssignmentStatus> for NodeStatus {
    fn from(status: AssignmentStatus) -> Self {
        match status {
            AssignmentStatus::Pending => NodeStatus::Pending,
            AssignmentStatus::InProgress => NodeStatus::InProgress,
            AssignmentStatus::Sent => NodeStatus::Sent,
            AssignmentStatus::Completed => NodeStatus::Completed,
            AssignmentStatus::Failed => NodeStatus::Failed,
        }
    }
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            NodeStatus::Completed => "completed",
            NodeStatus::Pending => "pending",
            NodeStatus::InProgress => "in_progress",
            NodeStatus::Sent => "sent",
            NodeStatus::Failed => "failed",
            NodeStatus::Ready => "ready",
            NodeStatus::Blocked => "blocked",
        };
        write!(f, "{}", name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskNode {
    pub id: String,
    pub title: String,
    pub status: NodeStatus,
    pub blocked_by: Vec<String>,
    pub blocks: Vec<String>,
    /// BFS layer from the roots; `None` when no root reaches the node.
    pub depth: Option<usize>,
    pub is_on_critical_path: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphEdge {
    /// The blocking task.
    pub from: String,
    /// The blocked task.
    pub to: String,
    pub is_on_critical_path: bool,
}

/// Node counts per status. Pending assignments are counted as sent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphStats {
    pub total: usize,
    pub completed: usize,
    pub in_progress: usize,
    pub sent: usize,
    pub failed: usize,
    pub ready: usize,
    pub blocked: usize,
}

impl GraphStats {
    fn count(&mut self, status: NodeStatus) {
        self.total += 1;
        match status {
            NodeStatus::Completed => self.completed += 1,
            NodeStatus::InProgress => self.in_progress += 1,
            NodeStatus::Pending | NodeStatus::Sent => self.sent += 1,
            NodeStatus::Failed => self.failed += 1,
            NodeStatus::Ready => self.ready += 1,
            NodeStatus::Blocked => self.blocked += 1,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskGraph {
    pub nodes: Vec<TaskNode>,
    pub edges: Vec<GraphEdge>,
    /// Longest chain of incomplete tasks, root first.
    pub critical_path: Vec<String>,
    pub stats: GraphStats,
    /// Nodes no root reaches (dangling blockers or cycles).
    pub unreachable: Vec<String>,
    pub has_cycle: bool,
}

impl TaskGraph {
    pub fn node(&self, id: &str) -> Option<&TaskNode> {
        self.nodes.iter().find(|n| n.id == id)
    }

    pub fn ready_ids(&self) -> Vec<&str> {
        self.nodes
            .iter()
            .filter(|n| n.status == NodeStatus::Ready)
            .map(|n| n.id.as_str())
            .collect()
    }

    /// True when the graph has nodes and every one of them is completed.
    pub fn all_complete(&self) -> bool {
        !self.nodes.is_empty() && self.stats.completed == self.stats.total
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

/// Build the dependency graph for `tasks`, deriving status from `assignments`.
///
/// Epics are left out entirely. A blocker id that is unknown or names an epic
/// counts as resolved when deciding readiness.
pub fn build_graph(tasks: &[Task], assignments: &[TaskAssignment]) -> TaskGraph {
    let work: Vec<&Task> = tasks.iter().filter(|t| !t.is_epic()).collect();
    let epic_ids: HashSet<&str> = tasks
        .iter()
        .filter(|t| t.is_epic())
        .map(|t| t.id.as_str())
        .collect();
    let by_id: HashMap<&str, &Task> = work.iter().map(|t| (t.id.as_str(), *t)).collect();
    let assignment_of: HashMap<&str, &TaskAssignment> = assignments
        .iter()
        .map(|a| (a.bead_id.as_str(), a))
        .collect();

    let mut graph: DiGraph<usize, ()> = DiGraph::new();
    let mut index: HashMap<&str, NodeIndex> = HashMap::new();
    let mut nodes = Vec::with_capacity(work.len());

    for task in &work {
        if index.contains_key(task.id.as_str()) {
            continue;
        }
        // Node weight is the position in `nodes`.
        index.insert(task.id.as_str(), graph.add_node(nodes.len()));

        let mut blocked_by: Vec<String> = Vec::new();
        for blocker in &task.blocked_by {
            if !epic_ids.contains(blocker.as_str()) && !blocked_by.contains(blocker) {
                blocked_by.push(blocker.clone());
            }
        }

        let status = derive_status(task, &blocked_by, &by_id, &assignment_of);
        nodes.push(TaskNode {
            id: task.id.clone(),
            title: task.title.clone(),
            status,
            blocked_by,
            blocks: Vec::new(),
            depth: None,
            is_on_critical_path: false,
        });
    }

    let mut edges = Vec::new();
    for i in 0..nodes.len() {
        let id = nodes[i].id.clone();
        let to = index[id.as_str()];
        for blocker in nodes[i].blocked_by.clone() {
            if let Some(&from) = index.get(blocker.as_str()) {
                graph.add_edge(from, to, ());
                let blocker_pos = graph[from];
                nodes[blocker_pos].blocks.push(id.clone());
                edges.push(GraphEdge {
                    from: blocker,
                    to: id.clone(),
                    is_on_critical_path: false,
                });
            }
        }
    }

    assign_depths(&graph, &mut nodes);
    let unreachable = nodes
        .iter()
        .filter(|n| n.depth.is_none())
        .map(|n| n.id.clone())
        .collect();

    let critical_path = critical_path(&graph, &nodes);
    let on_path: HashSet<&str> = critical_path.iter().map(String::as_str).collect();
    for node in nodes.iter_mut() {
        node.is_on_critical_path = on_path.contains(node.id.as_str());
    }
    for edge in edges.iter_mut() {
        edge.is_on_critical_path = critical_path
            .windows(2)
            .any(|pair| pair[0] == edge.from && pair[1] == edge.to);
    }

    let mut stats = GraphStats::default();
    for node in &nodes {
        stats.count(node.status);
    }

    TaskGraph {
        has_cycle: is_cyclic_directed(&graph),
        nodes,
        edges,
        critical_path,
        stats,
        unreachable,
    }
}

fn derive_status(
    task: &Task,
    blocked_by: &[String],
    by_id: &HashMap<&str, &Task>,
    assignment_of: &HashMap<&str, &TaskAssignment>,
) -> NodeStatus {
    if task.is_closed() {
        return NodeStatus::Completed;
    }
    if let Some(assignment) = assignment_of.get(task.id.as_str()) {
        return assignment.status.into();
    }
    let resolved = |id: &str| match by_id.get(id) {
        Some(blocker) => {
            blocker.is_closed()
                || assignment_of
                    .get(id)
                    .is_some_and(|a| a.status == AssignmentStatus::Completed)
        }
        None => true,
    };
    if blocked_by.iter().all(|b| resolved(b)) {
        NodeStatus::Ready
    } else {
        NodeStatus::Blocked
    }
}

fn assign_depths(graph: &DiGraph<usize, ()>, nodes: &mut [TaskNode]) {
    let mut queue = VecDeque::new();
    for idx in graph.node_indices() {
        if nodes[graph[idx]].blocked_by.is_empty() {
            nodes[graph[idx]].depth = Some(0);
            queue.push_back(idx);
        }
    }
    while let Some(idx) = queue.pop_front() {
        let depth = nodes[graph[idx]].depth.unwrap_or(0);
        for next in graph.neighbors_directed(idx, Direction::Outgoing) {
            let node = &mut nodes[graph[next]];
            if node.depth.is_none() {
                node.depth = Some(depth + 1);
                queue.push_back(next);
            }
        }
    }
}

fn critical_path(graph: &DiGraph<usize, ()>, nodes: &[TaskNode]) -> Vec<String> {
    let incomplete = |idx: NodeIndex| nodes[graph[idx]].status != NodeStatus::Completed;

    // Longest chain of incomplete blockers ending at each node, and the
    // blocker it continues through.
    let mut chains = Chains::default();
    match toposort(graph, None) {
        Ok(order) => {
            for idx in order.into_iter().filter(|&idx| incomplete(idx)) {
                let best = best_blocker(graph, idx, &incomplete, |b| chains.length.get(&b).copied());
                chains.record(idx, best);
            }
        }
        Err(_) => {
            let mut on_stack = HashSet::new();
            for idx in graph.node_indices().filter(|&idx| incomplete(idx)) {
                chain_through_cycles(graph, idx, &incomplete, &mut chains, &mut on_stack);
            }
        }
    }

    let mut leaves: Vec<NodeIndex> = graph
        .node_indices()
        .filter(|&idx| incomplete(idx))
        .filter(|&idx| {
            !graph
                .neighbors_directed(idx, Direction::Outgoing)
                .any(incomplete)
        })
        .collect();
    leaves.sort_by_key(|&idx| graph[idx]);

    let mut start: Option<(usize, NodeIndex)> = None;
    for leaf in leaves {
        let length = chains.length.get(&leaf).copied().unwrap_or(1);
        if start.map_or(true, |(best, _)| length > best) {
            start = Some((length, leaf));
        }
    }

    let mut path = Vec::new();
    let mut next = start.map(|(_, leaf)| leaf);
    while let Some(idx) = next {
        path.push(nodes[graph[idx]].id.clone());
        next = chains.via.get(&idx).copied();
    }
    path.reverse();
    path
}

#[derive(Default)]
struct Chains {
    length: HashMap<NodeIndex, usize>,
    via: HashMap<NodeIndex, NodeIndex>,
}

impl Chains {
    fn record(&mut self, idx: NodeIndex, best: Option<(usize, NodeIndex)>) {
        match best {
            Some((length, blocker)) => {
                self.length.insert(idx, length + 1);
                self.via.insert(idx, blocker);
            }
            None => {
                self.length.insert(idx, 1);
            }
        }
    }
}

/// The incomplete blocker of `idx` with the longest known chain. Ties go to
/// the blocker added to the graph first.
fn best_blocker(
    graph: &DiGraph<usize, ()>,
    idx: NodeIndex,
    incomplete: &dyn Fn(NodeIndex) -> bool,
    length_of: impl Fn(NodeIndex) -> Option<usize>,
) -> Option<(usize, NodeIndex)> {
    let mut blockers: Vec<NodeIndex> = graph
        .neighbors_directed(idx, Direction::Incoming)
        .filter(|&b| incomplete(b))
        .collect();
    blockers.sort_by_key(|&b| graph[b]);
    blockers.dedup();

    let mut best: Option<(usize, NodeIndex)> = None;
    for blocker in blockers {
        let Some(length) = length_of(blocker) else {
            continue;
        };
        if best.map_or(true, |(longest, _)| length > longest) {
            best = Some((length, blocker));
        }
    }
    best
}

/// Memoized backward walk for graphs with cycles. Blockers already on the
/// walk are skipped, so every node is expanded once.
fn chain_through_cycles(
    graph: &DiGraph<usize, ()>,
    idx: NodeIndex,
    incomplete: &dyn Fn(NodeIndex) -> bool,
    chains: &mut Chains,
    on_stack: &mut HashSet<NodeIndex>,
) -> usize {
    if let Some(&length) = chains.length.get(&idx) {
        return length;
    }
    on_stack.insert(idx);
    let mut blockers: Vec<NodeIndex> = graph
        .neighbors_directed(idx, Direction::Incoming)
        .filter(|&b| incomplete(b) && !on_stack.contains(&b))
        .collect();
    blockers.sort_by_key(|&b| graph[b]);
    blockers.dedup();

    let mut best: Option<(usize, NodeIndex)> = None;
    for blocker in blockers {
        let length = chain_through_cycles(graph, blocker, incomplete, chains, on_stack);
        if best.map_or(true, |(longest, _)| length > longest) {
            best = Some((length, blocker));
        }
    }
    on_stack.remove(&idx);
    chains.record(idx, best);
    chains.length.get(&idx).copied().unwrap_or(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::AgentId;
    use crate::core::plan::PlanId;
    use crate::core::task::IssueType;

    fn assignment(bead: &str, status: AssignmentStatus) -> TaskAssignment {
        let mut a = TaskAssignment::new(PlanId::new(), bead, AgentId::new());
        a.status = status;
        a
    }

    fn abc() -> Vec<Task> {
        vec![
            Task::new("A", "root"),
            Task::new("B", "left").blocked_by(["A"]),
            Task::new("C", "right").blocked_by(["A"]),
        ]
    }

    fn status(graph: &TaskGraph, id: &str) -> NodeStatus {
        graph.node(id).unwrap().status
    }

    #[test]
    fn test_empty_graph() {
        let graph = build_graph(&[], &[]);
        assert!(graph.is_empty());
        assert!(!graph.all_complete());
        assert!(graph.critical_path.is_empty());
    }

    #[test]
    fn test_abc_initial() {
        let graph = build_graph(&abc(), &[]);
        assert_eq!(graph.node("A").unwrap().depth, Some(0));
        assert_eq!(graph.node("B").unwrap().depth, Some(1));
        assert_eq!(graph.node("C").unwrap().depth, Some(1));
        assert_eq!(status(&graph, "A"), NodeStatus::Ready);
        assert_eq!(status(&graph, "B"), NodeStatus::Blocked);
        assert_eq!(status(&graph, "C"), NodeStatus::Blocked);
        assert_eq!(graph.node("A").unwrap().blocks, vec!["B", "C"]);
    }

    #[test]
    fn test_abc_after_root_closed() {
        let mut tasks = abc();
        tasks[0] = tasks[0].clone().closed();
        let graph = build_graph(&tasks, &[]);
        assert_eq!(status(&graph, "A"), NodeStatus::Completed);
        assert_eq!(status(&graph, "B"), NodeStatus::Ready);
        assert_eq!(status(&graph, "C"), NodeStatus::Ready);
        assert_eq!(graph.stats.completed, 1);
        assert_eq!(graph.stats.ready, 2);
        assert_eq!(graph.stats.total, 3);
    }

    #[test]
    fn test_closed_wins_over_assignment() {
        let tasks = vec![Task::new("A", "merge only").closed()];
        let graph = build_graph(&tasks, &[assignment("A", AssignmentStatus::Failed)]);
        assert_eq!(status(&graph, "A"), NodeStatus::Completed);
    }

    #[test]
    fn test_assignment_status_used() {
        let graph = build_graph(&abc(), &[assignment("A", AssignmentStatus::InProgress)]);
        assert_eq!(status(&graph, "A"), NodeStatus::InProgress);
        assert_eq!(status(&graph, "B"), NodeStatus::Blocked);
    }

    #[test]
    fn test_completed_assignment_unblocks_dependents() {
        let graph = build_graph(&abc(), &[assignment("A", AssignmentStatus::Completed)]);
        assert_eq!(status(&graph, "B"), NodeStatus::Ready);
    }

    #[test]
    fn test_missing_blocker_counts_as_resolved() {
        let tasks = vec![Task::new("X", "stale ref").blocked_by(["gone"])];
        let graph = build_graph(&tasks, &[]);
        assert_eq!(status(&graph, "X"), NodeStatus::Ready);
        // Not reachable from any root, reported as an anomaly.
        assert_eq!(graph.node("X").unwrap().depth, None);
        assert_eq!(graph.unreachable, vec!["X"]);
    }

    #[test]
    fn test_epics_excluded() {
        let tasks = vec![
            Task::new("E", "epic").with_type(IssueType::Epic),
            Task::new("A", "child").blocked_by(["E"]),
        ];
        let graph = build_graph(&tasks, &[]);
        assert!(graph.node("E").is_none());
        assert_eq!(graph.stats.total, 1);
        assert_eq!(status(&graph, "A"), NodeStatus::Ready);
        assert_eq!(graph.node("A").unwrap().depth, Some(0));
    }

    #[test]
    fn test_cycle_is_detected_and_unreachable() {
        let tasks = vec![
            Task::new("A", "a").blocked_by(["B"]),
            Task::new("B", "b").blocked_by(["A"]),
            Task::new("C", "root"),
        ];
        let graph = build_graph(&tasks, &[]);
        assert!(graph.has_cycle);
        assert_eq!(graph.unreachable, vec!["A", "B"]);
        assert_eq!(graph.node("C").unwrap().depth, Some(0));
    }

    #[test]
    fn test_depth_is_shortest_layer() {
        // A -> B -> C and A -> C: C is first reached at layer 1.
        let tasks = vec![
            Task::new("A", "a"),
            Task::new("B", "b").blocked_by(["A"]),
            Task::new("C", "c").blocked_by(["B", "A"]),
        ];
        let graph = build_graph(&tasks, &[]);
        assert_eq!(graph.node("C").unwrap().depth, Some(1));
    }

    #[test]
    fn test_critical_path_is_longest_chain() {
        let tasks = vec![
            Task::new("A", "a"),
            Task::new("B", "b").blocked_by(["A"]),
            Task::new("C", "c").blocked_by(["B", "A"]),
            Task::new("D", "d"),
        ];
        let graph = build_graph(&tasks, &[]);
        assert_eq!(graph.critical_path, vec!["A", "B", "C"]);
        assert!(graph.node("B").unwrap().is_on_critical_path);
        assert!(!graph.node("D").unwrap().is_on_critical_path);
    }

    #[test]
    fn test_critical_edges_must_be_consecutive() {
        let tasks = vec![
            Task::new("A", "a"),
            Task::new("B", "b").blocked_by(["A"]),
            Task::new("C", "c").blocked_by(["B", "A"]),
        ];
        let graph = build_graph(&tasks, &[]);
        let edge = |from: &str, to: &str| {
            graph
                .edges
                .iter()
                .find(|e| e.from == from && e.to == to)
                .unwrap()
                .is_on_critical_path
        };
        assert!(edge("A", "B"));
        assert!(edge("B", "C"));
        assert!(!edge("A", "C"));
    }

    #[test]
    fn test_critical_path_skips_completed_nodes() {
        let tasks = vec![
            Task::new("A", "a").closed(),
            Task::new("B", "b").blocked_by(["A"]),
            Task::new("C", "c").blocked_by(["B"]),
        ];
        let graph = build_graph(&tasks, &[]);
        assert_eq!(graph.critical_path, vec!["B", "C"]);
        assert!(!graph.node("A").unwrap().is_on_critical_path);
    }

    #[test]
    fn test_critical_path_tie_prefers_first_leaf() {
        let graph = build_graph(&abc(), &[]);
        assert_eq!(graph.critical_path, vec!["A", "B"]);
    }

    #[test]
    fn test_stats_bucket_pending_with_sent() {
        let tasks = vec![Task::new("A", "a"), Task::new("B", "b")];
        let graph = build_graph(
            &tasks,
            &[
                assignment("A", AssignmentStatus::Pending),
                assignment("B", AssignmentStatus::Sent),
            ],
        );
        assert_eq!(graph.stats.sent, 2);
        assert_eq!(graph.stats.total, 2);
    }

    #[test]
    fn test_closing_unassigned_task_moves_one_bucket() {
        let mut tasks = vec![
            Task::new("A", "a"),
            Task::new("B", "b").blocked_by(["A"]),
            Task::new("C", "c"),
        ];
        let before = build_graph(&tasks, &[]).stats;
        tasks[2] = tasks[2].clone().closed();
        let after = build_graph(&tasks, &[]).stats;
        assert_eq!(after.total, before.total);
        assert_eq!(after.completed, before.completed + 1);
        assert_eq!(after.ready + 1, before.ready);
        assert_eq!(after.blocked, before.blocked);
    }

    #[test]
    fn test_all_complete() {
        let tasks = vec![Task::new("A", "a").closed(), Task::new("B", "b").closed()];
        assert!(build_graph(&tasks, &[]).all_complete());
    }

    #[test]
    fn test_critical_path_on_wide_layered_graph() {
        // 20 layers of 3 tasks, each blocked by every task of the layer above.
        let mut tasks = Vec::new();
        for layer in 0..20 {
            for i in 0..3 {
                let id = format!("L{}-{}", layer, i);
                let task = if layer == 0 {
                    Task::new(&id, &id)
                } else {
                    Task::new(&id, &id).blocked_by((0..3).map(|j| format!("L{}-{}", layer - 1, j)))
                };
                tasks.push(task);
            }
        }
        let graph = build_graph(&tasks, &[]);
        assert_eq!(graph.critical_path.len(), 20);
        assert_eq!(graph.critical_path.first().map(String::as_str), Some("L0-0"));
        assert_eq!(graph.critical_path.last().map(String::as_str), Some("L19-0"));
    }

    #[test]
    fn test_critical_path_with_cycle_terminates() {
        let tasks = vec![
            Task::new("A", "a"),
            Task::new("B", "b").blocked_by(["A", "C"]),
            Task::new("C", "c").blocked_by(["B"]),
            Task::new("D", "d").blocked_by(["C"]),
        ];
        let graph = build_graph(&tasks, &[]);
        assert!(graph.has_cycle);
        assert_eq!(graph.critical_path.last().map(String::as_str), Some("D"));
        for pair in graph.critical_path.windows(2) {
            let node = graph.node(&pair[1]).unwrap();
            assert!(node.blocked_by.contains(&pair[0]));
        }
    }

    #[test]
    fn test_duplicate_blockers_collapse() {
        let tasks = vec![Task::new("A", "a"), Task::new("B", "b").blocked_by(["A", "A"])];
        let graph = build_graph(&tasks, &[]);
        assert_eq!(graph.edges.len(), 1);
        assert_eq!(graph.node("B").unwrap().blocked_by, vec!["A"]);
    }
}
