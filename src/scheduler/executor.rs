//! Bounded-concurrency execution of a dependency-linked task set.
//!
//! The scheduler validates the task graph up front, then repeatedly admits
//! ready tasks (dependencies completed) up to the concurrency bound, highest
//! priority first, re-evaluating readiness after every single completion so
//! freed slots are never left idle waiting on a whole batch.

use crate::errors::SchedulerError;
use crate::scheduler::graph::{TaskGraph, TaskIndex};
use crate::scheduler::{ScheduledTask, TaskResult};
use futures::FutureExt;
use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Priority bonus applied to tasks on a maximum-length dependency chain.
pub const CRITICAL_PATH_BONUS: i32 = 100;

pub struct Scheduler {
    max_concurrency: usize,
}

impl Scheduler {
    pub fn new(max_concurrency: usize) -> Self {
        Self {
            max_concurrency: max_concurrency.max(1),
        }
    }

    /// Critical-path priority boost: every task lying on a dependency chain
    /// of maximum length gets a fixed bonus, so the longest chain starts as
    /// early as available slots allow.
    ///
    /// This is a heuristic with a unit-duration assumption, not
    /// duration-weighted CPM.
    pub fn optimize(tasks: &mut [ScheduledTask]) -> Result<(), SchedulerError> {
        let specs: Vec<_> = tasks.iter().map(|t| t.spec.clone()).collect();
        let graph = TaskGraph::build(&specs)?;
        if graph.is_empty() {
            return Ok(());
        }

        let chains = graph.chain_lengths();
        let longest = *chains.iter().max().expect("non-empty graph");
        for (task, chain) in tasks.iter_mut().zip(&chains) {
            if *chain == longest {
                task.spec.priority += CRITICAL_PATH_BONUS;
            }
        }
        Ok(())
    }

    /// Execute the task set, honoring dependencies, priorities and per-task
    /// timeouts. Returns a result for every task.
    ///
    /// Structural problems (dangling or cyclic dependencies, a loop that can
    /// no longer make progress with nothing to blame) are errors; individual
    /// task failures and timeouts are recorded as failed `TaskResult`s and
    /// fan out to dependents without aborting the batch.
    pub async fn execute(
        &self,
        tasks: Vec<ScheduledTask>,
    ) -> Result<HashMap<String, TaskResult>, SchedulerError> {
        let specs: Vec<_> = tasks.iter().map(|t| t.spec.clone()).collect();
        let graph = TaskGraph::build(&specs)?;

        let mut ops: Vec<Option<_>> = tasks.into_iter().map(|t| Some(t.op)).collect();
        let mut pending: HashSet<TaskIndex> = (0..graph.len()).collect();
        let mut in_progress: HashSet<TaskIndex> = HashSet::new();
        let mut completed: HashSet<TaskIndex> = HashSet::new();
        let mut failed: HashSet<TaskIndex> = HashSet::new();
        let mut results: HashMap<String, TaskResult> = HashMap::new();

        let (result_tx, mut result_rx) = mpsc::channel::<(TaskIndex, TaskResult)>(graph.len().max(1));

        while !pending.is_empty() || !in_progress.is_empty() {
            // Ready set: pending tasks whose whole dependency set completed,
            // highest priority first, insertion order on ties (stable sort).
            let mut ready: Vec<TaskIndex> = pending
                .iter()
                .copied()
                .filter(|&i| graph.dependencies_satisfied(i, &completed))
                .collect();
            ready.sort_unstable();
            ready.sort_by_key(|&i| std::cmp::Reverse(specs[i].priority));

            if ready.is_empty() && in_progress.is_empty() {
                let blocked_by_failure = pending
                    .iter()
                    .any(|&i| graph.dependencies(i).iter().any(|d| failed.contains(d)));
                if !blocked_by_failure {
                    // A cycle slipped past validation or the loop is buggy.
                    let mut remaining: Vec<String> =
                        pending.iter().map(|&i| graph.id(i).to_string()).collect();
                    remaining.sort();
                    return Err(SchedulerError::Deadlock { pending: remaining });
                }

                // Upstream failure: resolve everything still pending to a
                // failed result without invoking its operation.
                for &i in &pending {
                    let causes: Vec<&str> = graph
                        .dependencies(i)
                        .iter()
                        .filter(|d| failed.contains(d))
                        .map(|&d| graph.id(d))
                        .collect();
                    let cause = if causes.is_empty() {
                        "transitive dependency failure".to_string()
                    } else {
                        format!("dependency failure: {}", causes.join(", "))
                    };
                    warn!(task = graph.id(i), %cause, "Task blocked by upstream failure");
                    results.insert(
                        graph.id(i).to_string(),
                        TaskResult::failure(graph.id(i), cause, std::time::Duration::ZERO),
                    );
                }
                failed.extend(pending.drain());
                continue;
            }

            // Admit into the free slots.
            for index in ready {
                if in_progress.len() >= self.max_concurrency {
                    break;
                }
                pending.remove(&index);
                in_progress.insert(index);

                let op = ops[index].take().expect("operation admitted twice");
                let spec = specs[index].clone();
                let tx = result_tx.clone();
                debug!(task = %spec.id, priority = spec.priority, "Admitting task");

                tokio::spawn(async move {
                    let start = Instant::now();
                    let outcome =
                        tokio::time::timeout(spec.timeout, AssertUnwindSafe(op()).catch_unwind())
                            .await;
                    let result = match outcome {
                        Ok(Ok(Ok(output))) => {
                            TaskResult::success(&spec.id, output, start.elapsed())
                        }
                        Ok(Ok(Err(e))) => {
                            TaskResult::failure(&spec.id, format!("{e:#}"), start.elapsed())
                        }
                        Ok(Err(_panic)) => TaskResult::failure(
                            &spec.id,
                            "task operation panicked",
                            start.elapsed(),
                        ),
                        Err(_) => TaskResult::failure(
                            &spec.id,
                            format!("timed out after {:?}", spec.timeout),
                            start.elapsed(),
                        ),
                    };
                    tx.send((index, result)).await.ok();
                });
            }

            // Await a single completion, then re-evaluate readiness.
            if !in_progress.is_empty() {
                let (index, result) = result_rx
                    .recv()
                    .await
                    .expect("scheduler holds a live sender");
                in_progress.remove(&index);
                if result.success {
                    completed.insert(index);
                } else {
                    failed.insert(index);
                }
                debug!(
                    task = graph.id(index),
                    success = result.success,
                    duration_ms = result.duration.as_millis() as u64,
                    "Task finished"
                );
                results.insert(graph.id(index).to_string(), result);
            }
        }

        Ok(results)
    }
}
