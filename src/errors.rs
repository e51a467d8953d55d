//! Typed error hierarchy for the Gantry orchestrator.
//!
//! Three top-level enums cover the three subsystems:
//! - `SchedulerError`: task-graph validation and scheduling-loop failures
//! - `StateError`: persistent state store I/O failures
//! - `StageError`: per-stage pipeline execution failures

use thiserror::Error;

/// Errors from the dependency-aware scheduler.
///
/// All variants are structural: they mean the task set itself is invalid or
/// the scheduling loop can no longer make progress. Individual task failures
/// are never surfaced here; they become failed `TaskResult`s instead.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("Task '{task}' depends on unknown task '{dependency}'")]
    UnknownDependency { task: String, dependency: String },

    #[error("Duplicate task id: {id}")]
    DuplicateTask { id: String },

    #[error("Cycle detected in task dependencies. Involved tasks: {tasks:?}")]
    Cycle { tasks: Vec<String> },

    #[error(
        "Scheduling deadlock: no ready tasks, none in progress, no failed dependencies to blame. \
         Remaining: {pending:?}"
    )]
    Deadlock { pending: Vec<String> },
}

/// Errors from the persistent state store.
///
/// Propagated to the caller of load/save/transaction with no automatic retry.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("Failed to read state file at {path}: {source}")]
    ReadFailed {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write state file at {path}: {source}")]
    WriteFailed {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to rename {from} over {to}: {source}")]
    RenameFailed {
        from: std::path::PathBuf,
        to: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed state file at {path}: {source}")]
    ParseFailed {
        path: std::path::PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Failed to create state directory {path}: {source}")]
    DirFailed {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// A pipeline stage's side-effecting work failed unrecoverably.
///
/// The orchestrator catches this, posts a diagnostic comment on the work
/// unit, attaches the attention label, then re-raises to its own caller.
#[derive(Debug, Error)]
#[error("Stage '{stage}' failed for work unit #{unit}: {source}")]
pub struct StageError {
    pub stage: &'static str,
    pub unit: u64,
    #[source]
    pub source: anyhow::Error,
}

impl StageError {
    pub fn new(stage: &'static str, unit: u64, source: anyhow::Error) -> Self {
        Self { stage, unit, source }
    }
}
