//! Persisted execution state for a plan.
//!
//! One `ExecutionState` record per plan, serialized as JSON. The four
//! top-level shapes (plan_id, status, stages, tasks) are the on-disk
//! contract and must round-trip exactly.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::str::FromStr;

/// Pipeline stages every plan starts with, all pending.
pub const KNOWN_STAGES: &[&str] = &[
    "proposal",
    "approval",
    "task_execution",
    "pr_review",
    "pr_fix",
    "fix_execution",
    "qa",
    "merge",
];

/// Status of a stage or task within a plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    #[default]
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// Check if this status is terminal.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl FromStr for StepStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "in_progress" => Ok(Self::InProgress),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Invalid status: {}", s)),
        }
    }
}

/// State of one pipeline stage within a plan.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct StageState {
    pub status: StepStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Stage-specific output payload (e.g. the proposed task breakdown).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,
}

impl StageState {
    /// Mark the stage started now.
    pub fn start(&mut self) {
        self.status = StepStatus::InProgress;
        self.started_at = Some(Utc::now());
    }

    /// Mark the stage completed now, clearing any previous error.
    pub fn complete(&mut self) {
        self.status = StepStatus::Completed;
        self.completed_at = Some(Utc::now());
        self.error = None;
    }

    /// Mark the stage failed now with the given error text.
    pub fn fail(&mut self, error: impl Into<String>) {
        self.status = StepStatus::Failed;
        self.completed_at = Some(Utc::now());
        self.error = Some(error.into());
    }
}

/// State of one schedulable task within a plan.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TaskState {
    pub status: StepStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pr_url: Option<String>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
    /// Higher runs first. Defaults to 0 for plans written before priorities.
    #[serde(default)]
    pub priority: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
}

/// The root persisted record for one plan.
///
/// `status` is derived: it is recomputed from the stage statuses on every
/// save and never set directly by callers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionState {
    pub plan_id: String,
    pub status: StepStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub stages: BTreeMap<String, StageState>,
    pub tasks: BTreeMap<String, TaskState>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl ExecutionState {
    /// Create a fresh state with all known stages pending.
    pub fn new(plan_id: &str) -> Self {
        let now = Utc::now();
        let stages = KNOWN_STAGES
            .iter()
            .map(|name| (name.to_string(), StageState::default()))
            .collect();
        Self {
            plan_id: plan_id.to_string(),
            status: StepStatus::Pending,
            created_at: now,
            updated_at: now,
            stages,
            tasks: BTreeMap::new(),
            metadata: BTreeMap::new(),
        }
    }

    /// Derived overall status, in priority order: any failed stage wins,
    /// then all-completed, then any in-progress, otherwise pending.
    /// An empty stage set is vacuously completed.
    pub fn compute_status(&self) -> StepStatus {
        let statuses: Vec<StepStatus> = self.stages.values().map(|s| s.status).collect();
        if statuses.iter().any(|s| *s == StepStatus::Failed) {
            StepStatus::Failed
        } else if statuses.iter().all(|s| *s == StepStatus::Completed) {
            StepStatus::Completed
        } else if statuses.iter().any(|s| *s == StepStatus::InProgress) {
            StepStatus::InProgress
        } else {
            StepStatus::Pending
        }
    }

    /// Get a stage, creating a pending entry if the name is new.
    pub fn stage_mut(&mut self, name: &str) -> &mut StageState {
        self.stages.entry(name.to_string()).or_default()
    }

    pub fn stage_status(&self, name: &str) -> StepStatus {
        self.stages.get(name).map(|s| s.status).unwrap_or_default()
    }

    /// Set a task's status, creating the entry lazily on first use.
    pub fn set_task_status(&mut self, task_id: &str, status: StepStatus) -> &mut TaskState {
        let task = self.tasks.entry(task_id.to_string()).or_default();
        task.status = status;
        task.updated_at = Some(Utc::now());
        task
    }

    pub fn task_status(&self, task_id: &str) -> Option<StepStatus> {
        self.tasks.get(task_id).map(|t| t.status)
    }
}
