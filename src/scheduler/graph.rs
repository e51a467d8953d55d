//! Dependency graph construction and validation for task sets.
//!
//! Builds forward/reverse edge lists from declared dependencies and rejects
//! invalid inputs (duplicate ids, dangling references, cycles) before any
//! task runs.

use crate::errors::SchedulerError;
use crate::scheduler::TaskSpec;
use std::collections::{HashMap, HashSet};

/// Index into the task list.
pub type TaskIndex = usize;

/// A validated directed acyclic graph over one scheduling batch.
#[derive(Debug)]
pub struct TaskGraph {
    ids: Vec<String>,
    index_map: HashMap<String, TaskIndex>,
    /// index -> tasks that depend on it
    dependents: Vec<Vec<TaskIndex>>,
    /// index -> tasks it depends on
    dependencies: Vec<Vec<TaskIndex>>,
}

impl TaskGraph {
    /// Build and validate a graph from task specs.
    ///
    /// Every dependency must reference a task in the same batch, ids must be
    /// unique, and the graph must be acyclic (a self-dependency is a cycle).
    pub fn build(specs: &[TaskSpec]) -> Result<Self, SchedulerError> {
        let mut index_map = HashMap::new();
        for (i, spec) in specs.iter().enumerate() {
            if index_map.insert(spec.id.clone(), i).is_some() {
                return Err(SchedulerError::DuplicateTask {
                    id: spec.id.clone(),
                });
            }
        }

        let mut dependents: Vec<Vec<TaskIndex>> = vec![Vec::new(); specs.len()];
        let mut dependencies: Vec<Vec<TaskIndex>> = vec![Vec::new(); specs.len()];

        for (to, spec) in specs.iter().enumerate() {
            for dep in &spec.depends_on {
                let from = *index_map.get(dep).ok_or_else(|| {
                    SchedulerError::UnknownDependency {
                        task: spec.id.clone(),
                        dependency: dep.clone(),
                    }
                })?;
                dependents[from].push(to);
                dependencies[to].push(from);
            }
        }

        let graph = Self {
            ids: specs.iter().map(|s| s.id.clone()).collect(),
            index_map,
            dependents,
            dependencies,
        };
        graph.validate_acyclic()?;
        Ok(graph)
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn id(&self, index: TaskIndex) -> &str {
        &self.ids[index]
    }

    pub fn index_of(&self, id: &str) -> Option<TaskIndex> {
        self.index_map.get(id).copied()
    }

    pub fn dependencies(&self, index: TaskIndex) -> &[TaskIndex] {
        &self.dependencies[index]
    }

    pub fn dependents(&self, index: TaskIndex) -> &[TaskIndex] {
        &self.dependents[index]
    }

    /// Check if all of a task's dependencies are in the completed set.
    pub fn dependencies_satisfied(
        &self,
        index: TaskIndex,
        completed: &HashSet<TaskIndex>,
    ) -> bool {
        self.dependencies[index].iter().all(|d| completed.contains(d))
    }

    /// Kahn's algorithm; if some node is never drained, it sits on a cycle.
    fn validate_acyclic(&self) -> Result<(), SchedulerError> {
        let mut in_degree: Vec<usize> = self.dependencies.iter().map(|d| d.len()).collect();
        let mut queue: Vec<TaskIndex> = in_degree
            .iter()
            .enumerate()
            .filter(|&(_, deg)| *deg == 0)
            .map(|(i, _)| i)
            .collect();

        let mut processed = 0;
        while let Some(node) = queue.pop() {
            processed += 1;
            for &dependent in &self.dependents[node] {
                in_degree[dependent] -= 1;
                if in_degree[dependent] == 0 {
                    queue.push(dependent);
                }
            }
        }

        if processed != self.len() {
            let tasks: Vec<String> = in_degree
                .iter()
                .enumerate()
                .filter(|&(_, deg)| *deg > 0)
                .map(|(i, _)| self.ids[i].clone())
                .collect();
            return Err(SchedulerError::Cycle { tasks });
        }
        Ok(())
    }

    /// Longest dependency chain through each task, in task count.
    ///
    /// chain(i) = longest ancestor chain + longest descendant chain + 1,
    /// memoized over both edge directions. The maximum over all tasks is
    /// the critical-path length under the unit-duration assumption.
    pub fn chain_lengths(&self) -> Vec<usize> {
        let mut up = vec![None; self.len()];
        let mut down = vec![None; self.len()];
        (0..self.len())
            .map(|i| {
                self.longest(i, &mut up, |g, i| &g.dependencies[i])
                    + self.longest(i, &mut down, |g, i| &g.dependents[i])
                    + 1
            })
            .collect()
    }

    fn longest(
        &self,
        index: TaskIndex,
        memo: &mut Vec<Option<usize>>,
        edges: fn(&Self, TaskIndex) -> &Vec<TaskIndex>,
    ) -> usize {
        if let Some(cached) = memo[index] {
            return cached;
        }
        let next_edges = edges(self, index).clone();
        let depth = next_edges
            .iter()
            .map(|&next| self.longest(next, memo, edges) + 1)
            .max()
            .unwrap_or(0);
        memo[index] = Some(depth);
        depth
    }
}
