//! Task graph validation, cycle reporting, and topological batch computation.
//!
//! Uses `petgraph` to model task dependencies as a directed graph with an
//! edge from each dependency to its dependent. Topological sort detects
//! cycles; the offending cycle is then extracted from the strongly connected
//! component that contains it so the error names every task on the loop.
//! Depth-based grouping produces the batches the executor runs in order.

use std::collections::{HashMap, HashSet, VecDeque};

use petgraph::Direction;
use petgraph::algo::{tarjan_scc, toposort};
use petgraph::graph::{DiGraph, NodeIndex};
use thiserror::Error;
use xskynet_types::plan::{Task, TaskId};

/// Structural problems that make a plan impossible to execute.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PlanError {
    #[error("duplicate task id '{0}'")]
    DuplicateTask(TaskId),

    #[error("task '{task}' declares duplicate step id '{step}'")]
    DuplicateStep { task: TaskId, step: String },

    #[error("task '{task}' depends on unknown task '{dependency}'")]
    UnknownDependency { task: TaskId, dependency: TaskId },

    /// Each task in `cycle` depends on the next; the last depends on the first.
    #[error("dependency cycle detected: {}", format_cycle(.cycle))]
    Cycle { cycle: Vec<TaskId> },
}

fn format_cycle(cycle: &[TaskId]) -> String {
    let mut path = cycle.join(" -> ");
    if let Some(first) = cycle.first() {
        path.push_str(" -> ");
        path.push_str(first);
    }
    path
}

// ---------------------------------------------------------------------------
// Graph construction
// ---------------------------------------------------------------------------

/// Dependency graph over a task slice. Node `i` is `tasks[i]`.
struct TaskGraph<'a> {
    tasks: &'a [Task],
    graph: DiGraph<usize, ()>,
    nodes: Vec<NodeIndex>,
}

impl<'a> TaskGraph<'a> {
    fn build(tasks: &'a [Task]) -> Result<Self, PlanError> {
        let mut id_to_idx: HashMap<&str, usize> = HashMap::with_capacity(tasks.len());
        for (idx, task) in tasks.iter().enumerate() {
            if id_to_idx.insert(task.id.as_str(), idx).is_some() {
                return Err(PlanError::DuplicateTask(task.id.clone()));
            }
            let mut step_ids = HashSet::with_capacity(task.steps.len());
            for step in &task.steps {
                if !step_ids.insert(step.id.as_str()) {
                    return Err(PlanError::DuplicateStep {
                        task: task.id.clone(),
                        step: step.id.clone(),
                    });
                }
            }
        }

        let mut graph = DiGraph::<usize, ()>::with_capacity(tasks.len(), tasks.len());
        let nodes: Vec<_> = (0..tasks.len()).map(|i| graph.add_node(i)).collect();

        for (to_idx, task) in tasks.iter().enumerate() {
            for dep in &task.depends_on {
                let from_idx = id_to_idx.get(dep.as_str()).ok_or_else(|| {
                    PlanError::UnknownDependency {
                        task: task.id.clone(),
                        dependency: dep.clone(),
                    }
                })?;
                graph.update_edge(nodes[*from_idx], nodes[to_idx], ());
            }
        }

        Ok(Self {
            tasks,
            graph,
            nodes,
        })
    }

    /// Topological order of task indices, or the cycle that prevents one.
    fn sorted(&self) -> Result<Vec<usize>, PlanError> {
        toposort(&self.graph, None)
            .map(|order| order.into_iter().map(|n| self.graph[n]).collect())
            .map_err(|_| PlanError::Cycle {
                cycle: self.find_cycle(),
            })
    }

    /// Extract one concrete cycle, following `depends_on` edges.
    ///
    /// Picks the cyclic component holding the earliest-declared task and
    /// starts the path there, so the result is stable for a given plan.
    fn find_cycle(&self) -> Vec<TaskId> {
        let cyclic = tarjan_scc(&self.graph).into_iter().filter(|scc| {
            scc.len() > 1 || self.graph.contains_edge(scc[0], scc[0])
        });
        let Some(component) = cyclic.min_by_key(|scc| scc.iter().map(|n| self.graph[*n]).min())
        else {
            return Vec::new();
        };

        let members: HashSet<NodeIndex> = component.iter().copied().collect();
        let start = component
            .iter()
            .copied()
            .min_by_key(|n| self.graph[*n])
            .unwrap_or(component[0]);

        // BFS along dependency edges (incoming) until we return to `start`.
        let mut parent: HashMap<NodeIndex, NodeIndex> = HashMap::new();
        let mut queue = VecDeque::from([start]);
        while let Some(current) = queue.pop_front() {
            let mut deps: Vec<NodeIndex> = self
                .graph
                .neighbors_directed(current, Direction::Incoming)
                .filter(|n| members.contains(n))
                .collect();
            deps.sort_by_key(|n| self.graph[*n]);

            for dep in deps {
                if dep == start {
                    let mut path = vec![current];
                    let mut node = current;
                    while node != start {
                        node = parent[&node];
                        path.push(node);
                    }
                    path.reverse();
                    return path
                        .into_iter()
                        .map(|n| self.tasks[self.graph[n]].id.clone())
                        .collect();
                }
                if !parent.contains_key(&dep) {
                    parent.insert(dep, current);
                    queue.push_back(dep);
                }
            }
        }

        component
            .iter()
            .map(|n| self.tasks[self.graph[*n]].id.clone())
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Validate that tasks form a DAG with unique ids and resolvable dependencies.
pub fn validate_plan(tasks: &[Task]) -> Result<(), PlanError> {
    TaskGraph::build(tasks)?.sorted().map(|_| ())
}

/// Group tasks into topological batches.
///
/// A task's batch is one past the deepest batch among its dependencies, so
/// every dependency of a task in batch N sits in a batch before N. Within a
/// batch, tasks keep their declaration order.
pub fn build_batches(tasks: &[Task]) -> Result<Vec<Vec<&Task>>, PlanError> {
    if tasks.is_empty() {
        return Ok(vec![]);
    }

    let graph = TaskGraph::build(tasks)?;
    let sorted = graph.sorted()?;

    let mut depths = vec![0usize; tasks.len()];
    for idx in sorted {
        depths[idx] = graph
            .graph
            .neighbors_directed(graph.nodes[idx], Direction::Incoming)
            .map(|dep| depths[graph.graph[dep]] + 1)
            .max()
            .unwrap_or(0);
    }

    let max_depth = depths.iter().copied().max().unwrap_or(0);
    let mut batches: Vec<Vec<&Task>> = vec![vec![]; max_depth + 1];
    for (idx, task) in tasks.iter().enumerate() {
        batches[depths[idx]].push(task);
    }

    Ok(batches)
}

/// Transitive closure of the tasks `task_id` depends on.
///
/// Returns an empty vec for an unknown task.
pub fn dependencies_of<'a>(task_id: &str, tasks: &'a [Task]) -> Vec<&'a str> {
    let task_map: HashMap<&str, &Task> = tasks.iter().map(|t| (t.id.as_str(), t)).collect();

    let mut visited = HashSet::new();
    let mut stack = vec![task_id];
    while let Some(current) = stack.pop() {
        if let Some(task) = task_map.get(current) {
            for dep in &task.depends_on {
                if visited.insert(dep.as_str()) {
                    stack.push(dep.as_str());
                }
            }
        }
    }

    visited.into_iter().collect()
}

/// Transitive closure of the tasks that depend on `task_id`.
///
/// Returned in declaration order.
pub fn dependents_of<'a>(task_id: &str, tasks: &'a [Task]) -> Vec<&'a str> {
    let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
    for task in tasks {
        for dep in &task.depends_on {
            dependents
                .entry(dep.as_str())
                .or_default()
                .push(task.id.as_str());
        }
    }

    let mut visited: HashSet<&str> = HashSet::new();
    let mut stack = vec![task_id];
    while let Some(current) = stack.pop() {
        if let Some(children) = dependents.get(current) {
            for child in children {
                if visited.insert(child) {
                    stack.push(child);
                }
            }
        }
    }

    tasks
        .iter()
        .map(|t| t.id.as_str())
        .filter(|id| visited.contains(id))
        .collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
