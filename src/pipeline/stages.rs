//! Concrete stage handlers.
//!
//! Each stage owns one step of the issue-to-merge flow. Handlers are
//! stateless; everything they need arrives through the `StageContext`, and
//! everything durable goes through the state store or the Git provider.

use super::{Stage, StageContext, plan_id_for, stage};
use crate::agent::{AgentRequest, extract_json};
use crate::errors::StageError;
use crate::github::Issue;
use crate::orchestrator::PlanExecutor;
use crate::scheduler::{TaskGraph, TaskSpec};
use crate::state::StepStatus;
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Bound on diff text fed into agent prompts.
const MAX_DIFF_CHARS: usize = 60_000;

fn stage_err(stage: &'static str, unit: u64) -> impl Fn(anyhow::Error) -> StageError {
    move |e| StageError::new(stage, unit, e)
}

/// One task in an agent-proposed plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlannedTask {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub priority: i32,
}

fn parse_planned_tasks(value: &serde_json::Value) -> Result<Vec<PlannedTask>> {
    let tasks_value = if value.is_array() {
        value
    } else {
        value
            .get("tasks")
            .context("Plan JSON has no 'tasks' array")?
    };
    let tasks: Vec<PlannedTask> =
        serde_json::from_value(tasks_value.clone()).context("Malformed task entries in plan")?;
    anyhow::ensure!(!tasks.is_empty(), "Agent proposed an empty plan");
    Ok(tasks)
}

/// Interpret an agent's review/QA output as a pass-or-fail verdict plus a
/// human-readable summary. JSON verdicts win; otherwise fall back to a
/// keyword scan of the prose.
fn parse_verdict(output: &str) -> (bool, String) {
    if let Some(value) = extract_json(output) {
        if let Some(verdict) = value.get("verdict").and_then(|v| v.as_str()) {
            let approved = matches!(verdict, "approve" | "pass");
            let summary = value
                .get("summary")
                .and_then(|s| s.as_str())
                .unwrap_or(output)
                .to_string();
            return (approved, summary);
        }
    }
    let upper = output.to_uppercase();
    let approved = (upper.contains("APPROVE") || upper.contains("LGTM"))
        && !upper.contains("REQUEST_CHANGES")
        && !upper.contains("NOT APPROVE");
    (approved, output.trim().to_string())
}

/// Truncate to at most `max` bytes on a char boundary.
fn clip(text: &str, max: usize) -> &str {
    if text.len() <= max {
        return text;
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

fn agent_request(ctx: &StageContext, prompt: String) -> AgentRequest {
    let mut request = AgentRequest::new(prompt, ctx.config.task_timeout);
    request.working_dir = Some(ctx.config.project_dir.clone());
    request
}

/// Decompose an issue into a dependency-ordered task plan.
///
/// Seeds the plan's tasks in the state store, posts the plan back on the
/// issue, and swaps the planning label for `proposed`.
pub struct ProposalStage;

#[async_trait]
impl Stage for ProposalStage {
    fn name(&self) -> &'static str {
        stage::PROPOSAL
    }

    async fn execute(&self, ctx: &StageContext, unit: &Issue) -> Result<(), StageError> {
        let err = stage_err(stage::PROPOSAL, unit.number);
        let plan_id = plan_id_for(unit);
        info!(unit = unit.number, "Generating task proposal");

        let unit_number = unit.number;
        ctx.store
            .transaction(&plan_id, |state| {
                state.stage_mut(stage::PROPOSAL).start();
                state
                    .metadata
                    .insert("source_issue".to_string(), serde_json::json!(unit_number));
                Ok(())
            })
            .await
            .map_err(&err)?;

        let prompt = format!(
            "Decompose the following issue into independent implementation tasks.\n\n\
             Issue #{number}: {title}\n\n{body}\n\n\
             Respond with JSON only, in this shape:\n\
             {{\"tasks\": [{{\"id\": \"task-1\", \"title\": \"...\", \"description\": \"...\", \
             \"depends_on\": [], \"priority\": 0}}]}}\n\n\
             Task ids must be unique. depends_on may only reference ids in this plan. \
             Higher priority runs first.",
            number = unit.number,
            title = unit.title,
            body = unit.body.as_deref().unwrap_or("(no description)"),
        );
        let outcome = ctx.agent.run(agent_request(ctx, prompt)).await.map_err(&err)?;

        let planned = outcome.into_output().and_then(|output| {
            let value = extract_json(&output).context("No JSON plan found in agent output")?;
            parse_planned_tasks(&value)
        });
        let planned = match planned {
            Ok(planned) => planned,
            Err(e) => {
                let message = e.to_string();
                ctx.store
                    .transaction(&plan_id, |state| {
                        state.stage_mut(stage::PROPOSAL).fail(&message);
                        Ok(())
                    })
                    .await
                    .map_err(&err)?;
                return Err(err(e));
            }
        };

        // Reject plans the scheduler would refuse before persisting anything.
        let specs: Vec<TaskSpec> = planned
            .iter()
            .map(|task| TaskSpec {
                id: task.id.clone(),
                depends_on: task.depends_on.clone(),
                priority: task.priority,
                timeout: ctx.config.task_timeout,
            })
            .collect();
        if let Err(e) = TaskGraph::build(&specs) {
            let message = e.to_string();
            ctx.store
                .transaction(&plan_id, |state| {
                    state.stage_mut(stage::PROPOSAL).fail(&message);
                    Ok(())
                })
                .await
                .map_err(&err)?;
            return Err(err(e.into()));
        }

        let stage_output = serde_json::json!({ "tasks": &planned });
        ctx.store
            .transaction(&plan_id, |state| {
                for task in &planned {
                    let entry = state.set_task_status(&task.id, StepStatus::Pending);
                    entry.depends_on = task.depends_on.clone();
                    entry.priority = task.priority;
                }
                let proposal = state.stage_mut(stage::PROPOSAL);
                proposal.output = Some(stage_output);
                proposal.complete();
                Ok(())
            })
            .await
            .map_err(&err)?;

        let mut comment = String::from("## Proposed plan\n\n");
        for task in &planned {
            comment.push_str(&format!(
                "- **{}**: {}{}\n",
                task.id,
                task.title.as_deref().unwrap_or("(untitled)"),
                if task.depends_on.is_empty() {
                    String::new()
                } else {
                    format!(" _(after {})_", task.depends_on.join(", "))
                },
            ));
        }
        comment.push_str("\nComment `/approve` to start execution.");
        ctx.github
            .add_comment(unit.number, &comment)
            .await
            .map_err(&err)?;
        ctx.github
            .add_labels(unit.number, &["proposed"])
            .await
            .map_err(&err)?;
        ctx.github
            .remove_label(unit.number, &ctx.config.labels.needs_planning)
            .await
            .map_err(&err)?;

        info!(unit = unit.number, tasks = planned.len(), "Plan proposed");
        Ok(())
    }
}

/// Wait for a human `/approve` comment on a proposed plan.
///
/// Without an approval comment this is a no-op, not an error; the poll loop
/// will revisit the unit.
pub struct ApprovalStage;

#[async_trait]
impl Stage for ApprovalStage {
    fn name(&self) -> &'static str {
        stage::APPROVAL
    }

    async fn execute(&self, ctx: &StageContext, unit: &Issue) -> Result<(), StageError> {
        let err = stage_err(stage::APPROVAL, unit.number);
        let comments = ctx.github.list_comments(unit.number).await.map_err(&err)?;
        let approved = comments
            .iter()
            .any(|c| c.body.trim().starts_with("/approve"));
        if !approved {
            debug!(unit = unit.number, "No approval comment yet");
            return Ok(());
        }

        let plan_id = plan_id_for(unit);
        ctx.store
            .transaction(&plan_id, |state| {
                state.stage_mut(stage::APPROVAL).complete();
                Ok(())
            })
            .await
            .map_err(&err)?;

        ctx.github
            .add_labels(unit.number, &["execute", "task"])
            .await
            .map_err(&err)?;
        ctx.github
            .remove_label(unit.number, "proposed")
            .await
            .map_err(&err)?;
        ctx.github
            .remove_label(unit.number, &ctx.config.labels.plan_review)
            .await
            .map_err(&err)?;

        info!(unit = unit.number, "Plan approved");
        Ok(())
    }
}

/// Execute an approved plan's tasks through the scheduler.
pub struct TaskExecutionStage;

#[async_trait]
impl Stage for TaskExecutionStage {
    fn name(&self) -> &'static str {
        stage::TASK_EXECUTION
    }

    async fn execute(&self, ctx: &StageContext, unit: &Issue) -> Result<(), StageError> {
        let err = stage_err(stage::TASK_EXECUTION, unit.number);
        PlanExecutor::new(ctx.clone())
            .execute_plan(unit)
            .await
            .map_err(&err)
    }
}

/// Agent code review of a pull request diff.
///
/// An approve verdict moves the unit toward merge; a request-changes verdict
/// sends it to the fix stage. Either verdict is a stage success.
pub struct PrReviewStage;

#[async_trait]
impl Stage for PrReviewStage {
    fn name(&self) -> &'static str {
        stage::PR_REVIEW
    }

    async fn execute(&self, ctx: &StageContext, unit: &Issue) -> Result<(), StageError> {
        let err = stage_err(stage::PR_REVIEW, unit.number);
        let diff = ctx
            .github
            .pull_request_diff(unit.number)
            .await
            .map_err(&err)?;

        let prompt = format!(
            "Review this pull request.\n\nPR #{number}: {title}\n\n\
             ```diff\n{diff}\n```\n\n\
             Respond with JSON only: {{\"verdict\": \"approve\" | \"request_changes\", \
             \"summary\": \"...\"}}",
            number = unit.number,
            title = unit.title,
            diff = clip(&diff, MAX_DIFF_CHARS),
        );
        let output = ctx
            .agent
            .run(agent_request(ctx, prompt))
            .await
            .map_err(&err)?
            .into_output()
            .map_err(&err)?;
        let (approved, summary) = parse_verdict(&output);

        ctx.github
            .add_comment(unit.number, &format!("## Review\n\n{}", summary))
            .await
            .map_err(&err)?;
        let namespaced = ctx.config.labels.namespaced("needs-review");
        for label in [
            "needs-review",
            namespaced.as_str(),
            ctx.config.labels.code_review.as_str(),
        ] {
            ctx.github
                .remove_label(unit.number, label)
                .await
                .map_err(&err)?;
        }
        let next = if approved { "approved" } else { "needs-fix" };
        ctx.github
            .add_labels(unit.number, &[next])
            .await
            .map_err(&err)?;

        let plan_id = plan_id_for(unit);
        ctx.store
            .transaction(&plan_id, |state| {
                let review = state.stage_mut(stage::PR_REVIEW);
                review.output = Some(serde_json::json!({
                    "verdict": if approved { "approve" } else { "request_changes" },
                    "summary": summary,
                }));
                review.complete();
                Ok(())
            })
            .await
            .map_err(&err)?;

        info!(unit = unit.number, approved, "Review complete");
        Ok(())
    }
}

/// Apply requested review changes to a pull request's branch.
pub struct PrFixStage;

#[async_trait]
impl Stage for PrFixStage {
    fn name(&self) -> &'static str {
        stage::PR_FIX
    }

    async fn execute(&self, ctx: &StageContext, unit: &Issue) -> Result<(), StageError> {
        let err = stage_err(stage::PR_FIX, unit.number);
        let diff = ctx
            .github
            .pull_request_diff(unit.number)
            .await
            .map_err(&err)?;
        let comments = ctx.github.list_comments(unit.number).await.map_err(&err)?;
        let feedback: String = comments
            .iter()
            .rev()
            .take(5)
            .map(|c| format!("{}: {}\n", c.user.login, c.body))
            .collect();

        let prompt = format!(
            "Address the review feedback on this pull request and commit the fixes \
             to its branch.\n\nPR #{number}: {title}\n\n\
             Recent feedback:\n{feedback}\n\n\
             Current diff:\n```diff\n{diff}\n```",
            number = unit.number,
            title = unit.title,
            feedback = feedback,
            diff = clip(&diff, MAX_DIFF_CHARS),
        );
        let outcome = ctx.agent.run(agent_request(ctx, prompt)).await.map_err(&err)?;
        let plan_id = plan_id_for(unit);
        if !outcome.success {
            let message = outcome
                .error
                .clone()
                .unwrap_or_else(|| "fix agent failed".to_string());
            ctx.store
                .transaction(&plan_id, |state| {
                    state.stage_mut(stage::PR_FIX).fail(&message);
                    Ok(())
                })
                .await
                .map_err(&err)?;
            return Err(err(anyhow::anyhow!(message)));
        }

        ctx.github
            .add_comment(unit.number, "Applied review fixes; re-requesting review.")
            .await
            .map_err(&err)?;
        let namespaced = ctx.config.labels.namespaced("needs-fix");
        for label in ["needs-fix", namespaced.as_str()] {
            ctx.github
                .remove_label(unit.number, label)
                .await
                .map_err(&err)?;
        }
        ctx.github
            .add_labels(unit.number, &["needs-review"])
            .await
            .map_err(&err)?;

        ctx.store
            .transaction(&plan_id, |state| {
                state.stage_mut(stage::PR_FIX).complete();
                Ok(())
            })
            .await
            .map_err(&err)?;
        Ok(())
    }
}

/// Implement an approved fix proposal on a fresh branch and open a PR.
pub struct FixExecutionStage;

#[async_trait]
impl Stage for FixExecutionStage {
    fn name(&self) -> &'static str {
        stage::FIX_EXECUTION
    }

    async fn execute(&self, ctx: &StageContext, unit: &Issue) -> Result<(), StageError> {
        let err = stage_err(stage::FIX_EXECUTION, unit.number);
        let base = ctx.github.default_branch().await.map_err(&err)?;
        let branch = format!("gantry/fix-{}", unit.number);
        ctx.github
            .create_branch(&branch, &base)
            .await
            .map_err(&err)?;

        let prompt = format!(
            "Implement the approved fix described below on branch '{branch}', \
             committing and pushing your changes there.\n\n\
             Issue #{number}: {title}\n\n{body}",
            branch = branch,
            number = unit.number,
            title = unit.title,
            body = unit.body.as_deref().unwrap_or("(no description)"),
        );
        ctx.agent
            .run(agent_request(ctx, prompt))
            .await
            .map_err(&err)?
            .into_output()
            .map_err(&err)?;

        let pr = ctx
            .github
            .create_pull(
                &branch,
                &base,
                &format!("Fix: {}", unit.title),
                &format!("Implements the approved fix from #{}.", unit.number),
            )
            .await
            .map_err(&err)?;
        ctx.github
            .add_labels(pr.number, &["needs-review"])
            .await
            .map_err(&err)?;

        ctx.github
            .add_comment(unit.number, &format!("Opened fix PR: {}", pr.html_url))
            .await
            .map_err(&err)?;
        for label in ["approved", "fix-proposal"] {
            ctx.github
                .remove_label(unit.number, label)
                .await
                .map_err(&err)?;
        }

        let plan_id = plan_id_for(unit);
        ctx.store
            .transaction(&plan_id, |state| {
                let fix = state.stage_mut(stage::FIX_EXECUTION);
                fix.output = Some(serde_json::json!({ "pr_url": pr.html_url }));
                fix.complete();
                Ok(())
            })
            .await
            .map_err(&err)?;

        info!(unit = unit.number, pr = pr.number, "Fix PR opened");
        Ok(())
    }
}

/// Agent QA pass over a work unit. A failing verdict routes the unit to the
/// fix stage; the stage itself still succeeds.
pub struct QaStage;

#[async_trait]
impl Stage for QaStage {
    fn name(&self) -> &'static str {
        stage::QA
    }

    async fn execute(&self, ctx: &StageContext, unit: &Issue) -> Result<(), StageError> {
        let err = stage_err(stage::QA, unit.number);
        let subject = if unit.pull_request.is_some() {
            let diff = ctx
                .github
                .pull_request_diff(unit.number)
                .await
                .map_err(&err)?;
            format!("```diff\n{}\n```", clip(&diff, MAX_DIFF_CHARS))
        } else {
            unit.body.clone().unwrap_or_else(|| "(no description)".to_string())
        };

        let prompt = format!(
            "Run a QA pass on this change: check the acceptance criteria, look for \
             regressions, and verify the tests cover the change.\n\n\
             #{number}: {title}\n\n{subject}\n\n\
             Respond with JSON only: {{\"verdict\": \"pass\" | \"fail\", \"summary\": \"...\"}}",
            number = unit.number,
            title = unit.title,
            subject = subject,
        );
        let output = ctx
            .agent
            .run(agent_request(ctx, prompt))
            .await
            .map_err(&err)?
            .into_output()
            .map_err(&err)?;
        let (passed, summary) = parse_verdict(&output);

        ctx.github
            .add_comment(unit.number, &format!("## QA report\n\n{}", summary))
            .await
            .map_err(&err)?;
        let namespaced = ctx.config.labels.namespaced("requires-qa");
        for label in ["requires-qa", namespaced.as_str()] {
            ctx.github
                .remove_label(unit.number, label)
                .await
                .map_err(&err)?;
        }
        let next = if passed { "qa-passed" } else { "needs-fix" };
        ctx.github
            .add_labels(unit.number, &[next])
            .await
            .map_err(&err)?;

        let plan_id = plan_id_for(unit);
        ctx.store
            .transaction(&plan_id, |state| {
                let qa = state.stage_mut(stage::QA);
                qa.output = Some(serde_json::json!({
                    "verdict": if passed { "pass" } else { "fail" },
                    "summary": summary,
                }));
                qa.complete();
                Ok(())
            })
            .await
            .map_err(&err)?;

        info!(unit = unit.number, passed, "QA complete");
        Ok(())
    }
}

/// Merge a ready pull request.
pub struct MergeStage;

#[async_trait]
impl Stage for MergeStage {
    fn name(&self) -> &'static str {
        stage::MERGE
    }

    async fn execute(&self, ctx: &StageContext, unit: &Issue) -> Result<(), StageError> {
        let err = stage_err(stage::MERGE, unit.number);
        if unit.pull_request.is_none() {
            return Err(err(anyhow::anyhow!(
                "work unit #{} is not a pull request",
                unit.number
            )));
        }

        ctx.github.merge_pull(unit.number).await.map_err(&err)?;
        ctx.github
            .remove_label(unit.number, &ctx.config.labels.merge_ready)
            .await
            .map_err(&err)?;
        ctx.github
            .add_comment(unit.number, "Merged.")
            .await
            .map_err(&err)?;

        let plan_id = plan_id_for(unit);
        ctx.store
            .transaction(&plan_id, |state| {
                state.stage_mut(stage::MERGE).complete();
                Ok(())
            })
            .await
            .map_err(&err)?;

        info!(unit = unit.number, "Merged");
        Ok(())
    }
}
