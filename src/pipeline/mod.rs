//! Pipeline stages and label-driven routing.
//!
//! A work unit's current labels select exactly one stage through an ordered
//! rule list (first match wins). Stages are polymorphic handlers sharing the
//! `Stage` contract; the registry maps stage names to handlers and is built
//! once at startup.

mod stages;

pub use stages::{
    ApprovalStage, FixExecutionStage, MergeStage, PlannedTask, PrFixStage, PrReviewStage,
    ProposalStage, QaStage, TaskExecutionStage,
};

use crate::agent::AgentRunner;
use crate::config::{Config, LabelConfig};
use crate::errors::StageError;
use crate::github::{GitProvider, Issue};
use crate::state::StateStore;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Stage names. These match the keys seeded into every new plan state.
pub mod stage {
    pub const PROPOSAL: &str = "proposal";
    pub const APPROVAL: &str = "approval";
    pub const TASK_EXECUTION: &str = "task_execution";
    pub const PR_REVIEW: &str = "pr_review";
    pub const PR_FIX: &str = "pr_fix";
    pub const FIX_EXECUTION: &str = "fix_execution";
    pub const QA: &str = "qa";
    pub const MERGE: &str = "merge";
}

/// Shared collaborators handed to every stage execution.
#[derive(Clone)]
pub struct StageContext {
    pub github: Arc<dyn GitProvider>,
    pub agent: Arc<dyn AgentRunner>,
    pub store: Arc<StateStore>,
    pub config: Arc<Config>,
}

/// The plan id for a work unit, derived from its number.
pub fn plan_id_for(unit: &Issue) -> String {
    format!("issue-{}", unit.number)
}

/// A single-responsibility handler advancing a work unit one step.
#[async_trait]
pub trait Stage: Send + Sync {
    fn name(&self) -> &'static str;

    /// Advance the work unit. Unrecoverable problems surface as
    /// `StageError`; the orchestrator owns the comment/label fallout.
    async fn execute(&self, ctx: &StageContext, unit: &Issue) -> Result<(), StageError>;
}

/// Label predicate evaluated against a work unit's label set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LabelPredicate {
    /// The label is present.
    Has(String),
    /// Every listed label is present.
    All(Vec<String>),
    /// At least one listed label is present.
    Any(Vec<String>),
}

impl LabelPredicate {
    pub fn matches(&self, labels: &HashSet<&str>) -> bool {
        match self {
            Self::Has(label) => labels.contains(label.as_str()),
            Self::All(required) => required.iter().all(|l| labels.contains(l.as_str())),
            Self::Any(options) => options.iter().any(|l| labels.contains(l.as_str())),
        }
    }
}

/// One routing rule: predicate -> stage name.
#[derive(Debug, Clone)]
pub struct RouteRule {
    pub predicate: LabelPredicate,
    pub stage: &'static str,
}

/// Ordered label-to-stage dispatch. The rule order is load-bearing: rules
/// are evaluated top to bottom and the first match wins, so e.g. a unit
/// carrying both "proposed" and "execute"+"task" goes to approval.
pub struct StageRouter {
    rules: Vec<RouteRule>,
}

impl StageRouter {
    pub fn new(labels: &LabelConfig) -> Self {
        let ns = |label: &str| {
            LabelPredicate::Any(vec![label.to_string(), labels.namespaced(label)])
        };
        let rules = vec![
            RouteRule {
                predicate: LabelPredicate::Has("proposed".to_string()),
                stage: stage::APPROVAL,
            },
            RouteRule {
                predicate: LabelPredicate::All(vec!["execute".to_string(), "task".to_string()]),
                stage: stage::TASK_EXECUTION,
            },
            RouteRule {
                predicate: LabelPredicate::Has(labels.needs_planning.clone()),
                stage: stage::PROPOSAL,
            },
            RouteRule {
                predicate: ns("needs-review"),
                stage: stage::PR_REVIEW,
            },
            RouteRule {
                predicate: ns("needs-fix"),
                stage: stage::PR_FIX,
            },
            RouteRule {
                predicate: LabelPredicate::All(vec![
                    "approved".to_string(),
                    "fix-proposal".to_string(),
                ]),
                stage: stage::FIX_EXECUTION,
            },
            RouteRule {
                predicate: ns("requires-qa"),
                stage: stage::QA,
            },
            // Legacy configured labels route onto the modern handlers.
            RouteRule {
                predicate: LabelPredicate::Has(labels.plan_review.clone()),
                stage: stage::APPROVAL,
            },
            RouteRule {
                predicate: LabelPredicate::Has(labels.code_review.clone()),
                stage: stage::PR_REVIEW,
            },
            RouteRule {
                predicate: LabelPredicate::Has(labels.merge_ready.clone()),
                stage: stage::MERGE,
            },
        ];
        Self { rules }
    }

    /// Select the single stage responsible for advancing this work unit.
    /// Pure function of the label set; `None` means the unit is skipped.
    pub fn select_stage(&self, unit: &Issue) -> Option<&'static str> {
        let labels = unit.label_set();
        self.rules
            .iter()
            .find(|rule| rule.predicate.matches(&labels))
            .map(|rule| rule.stage)
    }

    pub fn rules(&self) -> &[RouteRule] {
        &self.rules
    }
}

/// Build the stage registry: one handler per stage name, constructed once
/// at startup. Uniform dispatch, no reflection.
pub fn build_registry() -> HashMap<&'static str, Arc<dyn Stage>> {
    let stages: Vec<Arc<dyn Stage>> = vec![
        Arc::new(ProposalStage),
        Arc::new(ApprovalStage),
        Arc::new(TaskExecutionStage),
        Arc::new(PrReviewStage),
        Arc::new(PrFixStage),
        Arc::new(FixExecutionStage),
        Arc::new(QaStage),
        Arc::new(MergeStage),
    ];
    stages.into_iter().map(|s| (s.name(), s)).collect()
}
