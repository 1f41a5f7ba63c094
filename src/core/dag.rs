//! Dependency graph for provisioning tasks.
//!
//! `DependencyGraph` stores every task as a node of a petgraph `DiGraph`
//! with an edge `prerequisite -> dependent` for each declared prerequisite.
//! Node indices follow insertion order, which is the declaration order used
//! to break ties between equally ready tasks.

use crate::core::task::{Task, TaskId};
use crate::error::{Error, Result};
use petgraph::algo::tarjan_scc;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use std::collections::{HashMap, HashSet, VecDeque};

/// The task dependency graph.
///
/// Built with [`DependencyGraph::build`], which rejects duplicate ids,
/// unknown prerequisites and cycles. A graph obtained that way is always
/// a DAG.
pub struct DependencyGraph {
    /// The underlying directed graph; edges point from prerequisite to dependent.
    graph: DiGraph<Task, ()>,
    /// Index mapping from TaskId to NodeIndex for fast lookups.
    task_index: HashMap<TaskId, NodeIndex>,
}

impl DependencyGraph {
    /// Create a new empty graph.
    pub fn new() -> Self {
        Self {
            graph: DiGraph::new(),
            task_index: HashMap::new(),
        }
    }

    /// Build and validate a graph from a finite task set.
    ///
    /// # Errors
    /// `DuplicateTask`, `UnknownPrerequisite` or `CycleDetected`.
    pub fn build(tasks: impl IntoIterator<Item = Task>) -> Result<Self> {
        let mut graph = Self::new();
        for task in tasks {
            graph.add(task)?;
        }
        graph.validate()?;
        Ok(graph)
    }

    /// Add a task to the graph.
    ///
    /// Edges are wired in both directions as far as the endpoints are
    /// known, so tasks may be added in any order.
    ///
    /// # Errors
    /// Returns `DuplicateTask` if a task with the same id exists.
    pub fn add(&mut self, task: Task) -> Result<NodeIndex> {
        if self.task_index.contains_key(task.id()) {
            return Err(Error::DuplicateTask(task.id().clone()));
        }

        let task = task.normalized();
        let id = task.id().clone();
        let prerequisites = task.prerequisites().to_vec();
        let index = self.graph.add_node(task);
        self.task_index.insert(id.clone(), index);

        for prerequisite in &prerequisites {
            if let Some(&from) = self.task_index.get(prerequisite) {
                self.graph.add_edge(from, index, ());
            }
        }

        let waiting: Vec<NodeIndex> = self
            .graph
            .node_indices()
            .filter(|&other| other != index)
            .filter(|&other| self.graph[other].prerequisites().contains(&id))
            .collect();
        for dependent in waiting {
            self.graph.add_edge(index, dependent, ());
        }

        Ok(index)
    }

    /// Check that every prerequisite exists and the graph is acyclic.
    ///
    /// # Errors
    /// `UnknownPrerequisite` for a dangling reference, `CycleDetected` with
    /// the cycle path (first id repeated at the end) otherwise.
    pub fn validate(&self) -> Result<()> {
        for task in self.graph.node_weights() {
            if let Some(missing) = task
                .prerequisites()
                .iter()
                .find(|p| !self.task_index.contains_key(*p))
            {
                return Err(Error::UnknownPrerequisite {
                    task: task.id().clone(),
                    prerequisite: missing.clone(),
                });
            }
        }

        if let Some(cycle) = self.find_cycle() {
            return Err(Error::CycleDetected { cycle });
        }
        Ok(())
    }

    fn find_cycle(&self) -> Option<Vec<TaskId>> {
        for component in tarjan_scc(&self.graph) {
            if component.len() == 1 {
                let node = component[0];
                if self.graph.contains_edge(node, node) {
                    let id = self.graph[node].id().clone();
                    return Some(vec![id.clone(), id]);
                }
                continue;
            }

            // Every node of a non-trivial SCC has a successor inside it, so
            // following those successors must revisit a node.
            let members: HashSet<NodeIndex> = component.iter().copied().collect();
            let start = component.iter().copied().min()?;
            let mut path = vec![start];
            let mut current = start;
            loop {
                let next = self
                    .graph
                    .neighbors_directed(current, Direction::Outgoing)
                    .filter(|n| members.contains(n))
                    .min()?;
                if let Some(pos) = path.iter().position(|&n| n == next) {
                    let mut cycle: Vec<TaskId> = path[pos..]
                        .iter()
                        .map(|&n| self.graph[n].id().clone())
                        .collect();
                    cycle.push(self.graph[next].id().clone());
                    return Some(cycle);
                }
                path.push(next);
                current = next;
            }
        }
        None
    }

    /// Get a reference to a task by its ID.
    pub fn get(&self, id: &TaskId) -> Option<&Task> {
        self.task_index
            .get(id)
            .and_then(|&index| self.graph.node_weight(index))
    }

    /// Check if the graph contains a task.
    pub fn contains(&self, id: &TaskId) -> bool {
        self.task_index.contains_key(id)
    }

    /// Get the number of tasks.
    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    /// Get the number of dependency edges.
    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    /// All tasks in declaration order.
    pub fn tasks(&self) -> impl Iterator<Item = &Task> {
        self.graph.node_indices().map(move |i| &self.graph[i])
    }

    /// Tasks the given task depends on, in declaration order.
    pub fn prerequisites(&self, id: &TaskId) -> Vec<&Task> {
        self.neighbors(id, Direction::Incoming)
    }

    /// Tasks that directly depend on the given task, in declaration order.
    pub fn dependents(&self, id: &TaskId) -> Vec<&Task> {
        self.neighbors(id, Direction::Outgoing)
    }

    fn neighbors(&self, id: &TaskId, direction: Direction) -> Vec<&Task> {
        let Some(&index) = self.task_index.get(id) else {
            return Vec::new();
        };
        let mut nodes: Vec<NodeIndex> = self.graph.neighbors_directed(index, direction).collect();
        nodes.sort();
        nodes.dedup();
        nodes.into_iter().map(|n| &self.graph[n]).collect()
    }

    /// Every task reachable through dependent edges, breadth first.
    pub fn transitive_dependents(&self, id: &TaskId) -> Vec<&Task> {
        let Some(&start) = self.task_index.get(id) else {
            return Vec::new();
        };
        let mut seen = HashSet::from([start]);
        let mut queue = VecDeque::from([start]);
        let mut result = Vec::new();
        while let Some(node) = queue.pop_front() {
            let mut next: Vec<NodeIndex> = self
                .graph
                .neighbors_directed(node, Direction::Outgoing)
                .filter(|n| seen.insert(*n))
                .collect();
            next.sort();
            for n in next {
                result.push(&self.graph[n]);
                queue.push_back(n);
            }
        }
        result
    }

    // ========== Scheduling Operations ==========

    /// Get all tasks ready to execute.
    ///
    /// A task is ready if every prerequisite is in `completed` and the task
    /// itself is not. Computed from scratch on each call, in declaration
    /// order.
    pub fn ready<'a>(&'a self, completed: &HashSet<TaskId>) -> Vec<&'a Task> {
        self.graph
            .node_indices()
            .filter_map(|index| {
                let task = &self.graph[index];
                if completed.contains(task.id()) {
                    return None;
                }
                let satisfied = self
                    .graph
                    .neighbors_directed(index, Direction::Incoming)
                    .all(|dep| completed.contains(self.graph[dep].id()));
                satisfied.then_some(task)
            })
            .collect()
    }

    /// Check if every task is in the completed set.
    pub fn all_complete(&self, completed: &HashSet<TaskId>) -> bool {
        self.task_index.keys().all(|id| completed.contains(id))
    }

    /// Tasks in an order where each comes after all of its prerequisites.
    ///
    /// Kahn's algorithm over declaration order, so the result is stable.
    pub fn topological_order(&self) -> Vec<&Task> {
        let mut completed = HashSet::new();
        let mut order = Vec::with_capacity(self.len());
        loop {
            let ready = self.ready(&completed);
            if ready.is_empty() {
                break;
            }
            for task in ready {
                completed.insert(task.id().clone());
                order.push(task);
            }
        }
        order
    }
}

impl Default for DependencyGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for DependencyGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DependencyGraph")
            .field("tasks", &self.len())
            .field("dependencies", &self.edge_count())
            .finish()
    }
}
