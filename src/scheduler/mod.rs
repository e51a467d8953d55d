//! Dependency-aware task scheduling.
//!
//! Given a set of tasks with declared dependencies, priorities and timeouts,
//! the scheduler executes them with bounded concurrency in topological
//! order, optionally biasing priority toward the critical path, and turns
//! partial failure into per-task results rather than aborted batches.
//!
//! ## Example
//!
//! ```no_run
//! use gantry::scheduler::{ScheduledTask, Scheduler, TaskFn, TaskSpec};
//! use futures::FutureExt;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let op: TaskFn = Arc::new(|| async { Ok(serde_json::json!("done")) }.boxed());
//! let tasks = vec![
//!     ScheduledTask {
//!         spec: TaskSpec {
//!             id: "t1".into(),
//!             depends_on: vec![],
//!             priority: 0,
//!             timeout: Duration::from_secs(600),
//!         },
//!         op: op.clone(),
//!     },
//!     ScheduledTask {
//!         spec: TaskSpec {
//!             id: "t2".into(),
//!             depends_on: vec!["t1".into()],
//!             priority: 0,
//!             timeout: Duration::from_secs(600),
//!         },
//!         op,
//!     },
//! ];
//! let results = Scheduler::new(4).execute(tasks).await?;
//! assert!(results["t2"].success);
//! # Ok(())
//! # }
//! ```

mod executor;
mod graph;

pub use executor::{CRITICAL_PATH_BONUS, Scheduler};
pub use graph::{TaskGraph, TaskIndex};

use futures::future::BoxFuture;
use std::sync::Arc;
use std::time::Duration;

/// The async operation behind a task. Invoked at most once, when the task
/// is admitted; never invoked for tasks blocked by an upstream failure.
pub type TaskFn =
    Arc<dyn Fn() -> BoxFuture<'static, anyhow::Result<serde_json::Value>> + Send + Sync>;

/// A unit of schedulable work within one batch.
#[derive(Debug, Clone)]
pub struct TaskSpec {
    /// Unique within the batch.
    pub id: String,
    /// Task ids in the same batch that must complete first.
    pub depends_on: Vec<String>,
    /// Higher runs first; ties break by insertion order.
    pub priority: i32,
    pub timeout: Duration,
}

/// A task spec paired with its operation.
pub struct ScheduledTask {
    pub spec: TaskSpec,
    pub op: TaskFn,
}

/// Outcome of one task execution. Scheduler-internal; the orchestrator
/// folds these back into the persisted task states.
#[derive(Debug, Clone)]
pub struct TaskResult {
    pub task_id: String,
    pub success: bool,
    pub output: Option<serde_json::Value>,
    pub error: Option<String>,
    pub duration: Duration,
}

impl TaskResult {
    pub fn success(task_id: &str, output: serde_json::Value, duration: Duration) -> Self {
        Self {
            task_id: task_id.to_string(),
            success: true,
            output: Some(output),
            error: None,
            duration,
        }
    }

    pub fn failure(task_id: &str, error: impl Into<String>, duration: Duration) -> Self {
        Self {
            task_id: task_id.to_string(),
            success: false,
            output: None,
            error: Some(error.into()),
            duration,
        }
    }
}
