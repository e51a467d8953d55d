//! Plan execution: turn a plan's persisted tasks into a scheduled batch,
//! run it, and fold the results back into durable state.

use crate::agent::AgentRequest;
use crate::pipeline::{PrReviewStage, Stage, StageContext, plan_id_for, stage};
use crate::scheduler::{ScheduledTask, Scheduler, TaskFn, TaskSpec};
use crate::state::StepStatus;
use anyhow::{Context, Result};
use futures::FutureExt;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Attempts to observe our own write before declaring it lost.
const VISIBILITY_RETRIES: u32 = 3;
const VISIBILITY_RETRY_DELAY: Duration = Duration::from_millis(50);

/// Executes one approved plan end to end.
///
/// Completed tasks are excluded from the batch, so re-running a partially
/// failed plan only retries the incomplete work.
pub struct PlanExecutor {
    ctx: StageContext,
}

/// Per-task detail carried from the proposal output into task prompts.
#[derive(Debug, Clone, Default)]
struct TaskDetail {
    title: Option<String>,
    description: Option<String>,
}

impl PlanExecutor {
    pub fn new(ctx: StageContext) -> Self {
        Self { ctx }
    }

    pub async fn execute_plan(&self, unit: &crate::github::Issue) -> Result<()> {
        let plan_id = plan_id_for(unit);
        let state = self.ctx.store.load(&plan_id).await?;
        anyhow::ensure!(
            state.stage_status(stage::PROPOSAL) == StepStatus::Completed,
            "Plan '{}' has no completed proposal; refusing to execute",
            plan_id
        );

        let details = proposal_details(&state);
        let mut batch: Vec<ScheduledTask> = Vec::new();
        let batch_ids: Vec<String> = state
            .tasks
            .iter()
            .filter(|(_, t)| t.status != StepStatus::Completed)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &batch_ids {
            let task = &state.tasks[id];
            // Dependencies completed in a previous run are satisfied and
            // dropped from the batch. Ids that exist nowhere in the plan are
            // kept so graph validation rejects them before anything runs.
            let depends_on: Vec<String> = task
                .depends_on
                .iter()
                .filter(|d| {
                    !state
                        .tasks
                        .get(d.as_str())
                        .is_some_and(|t| t.status == StepStatus::Completed)
                })
                .cloned()
                .collect();
            let spec = TaskSpec {
                id: id.clone(),
                depends_on,
                priority: task.priority,
                timeout: self.ctx.config.task_timeout,
            };
            let op = self.task_op(&plan_id, id, details.get(id).cloned().unwrap_or_default(), unit);
            batch.push(ScheduledTask { spec, op });
        }

        if batch.is_empty() {
            debug!(plan = %plan_id, "No incomplete tasks; plan is already done");
            self.finish_plan(unit, &plan_id, &[], 0).await?;
            return Ok(());
        }

        self.ctx
            .store
            .transaction(&plan_id, |state| {
                state.stage_mut(stage::TASK_EXECUTION).start();
                Ok(())
            })
            .await?;

        let scheduler = Scheduler::new(self.ctx.config.max_concurrency);
        if self.ctx.config.critical_path_boost {
            Scheduler::optimize(&mut batch)?;
        }
        info!(plan = %plan_id, tasks = batch.len(), "Executing plan");
        let results = scheduler.execute(batch).await?;

        let mut failed: Vec<String> = Vec::new();
        let mut pr_urls: Vec<String> = Vec::new();
        let results_for_state = results.clone();
        self.ctx
            .store
            .transaction(&plan_id, |state| {
                for (id, result) in &results_for_state {
                    let status = if result.success {
                        StepStatus::Completed
                    } else {
                        StepStatus::Failed
                    };
                    let task = state.set_task_status(id, status);
                    task.error = result.error.clone();
                    if let Some(output) = &result.output {
                        if let Some(url) = output.get("pr_url").and_then(|u| u.as_str()) {
                            task.pr_url = Some(url.to_string());
                        }
                        if let Some(branch) = output.get("branch").and_then(|b| b.as_str()) {
                            task.branch = Some(branch.to_string());
                        }
                        task.result = Some(output.clone());
                    }
                }
                Ok(())
            })
            .await?;
        for (id, result) in &results {
            if result.success {
                if let Some(url) = result
                    .output
                    .as_ref()
                    .and_then(|o| o.get("pr_url"))
                    .and_then(|u| u.as_str())
                {
                    pr_urls.push(url.to_string());
                }
            } else {
                failed.push(id.clone());
            }
        }

        if failed.is_empty() {
            self.finish_plan(unit, &plan_id, &pr_urls, results.len()).await?;
            Ok(())
        } else {
            failed.sort();
            let message = format!(
                "{} of {} tasks failed: {}",
                failed.len(),
                results.len(),
                failed.join(", ")
            );
            self.ctx
                .store
                .transaction(&plan_id, |state| {
                    state.stage_mut(stage::TASK_EXECUTION).fail(&message);
                    Ok(())
                })
                .await?;
            anyhow::bail!("Plan '{}' execution failed: {}", plan_id, message)
        }
    }

    /// Mark the execution stage complete, report back on the issue, and
    /// drop the routing labels so the unit is not picked up again.
    async fn finish_plan(
        &self,
        unit: &crate::github::Issue,
        plan_id: &str,
        pr_urls: &[String],
        task_count: usize,
    ) -> Result<()> {
        self.ctx
            .store
            .transaction(plan_id, |state| {
                state.stage_mut(stage::TASK_EXECUTION).complete();
                Ok(())
            })
            .await?;

        let mut comment = format!("## Plan executed\n\n{} task(s) completed.\n", task_count);
        if !pr_urls.is_empty() {
            comment.push_str("\nPull requests:\n");
            for url in pr_urls {
                comment.push_str(&format!("- {}\n", url));
            }
        }
        self.ctx.github.add_comment(unit.number, &comment).await?;
        self.ctx.github.remove_label(unit.number, "execute").await?;
        self.ctx.github.remove_label(unit.number, "task").await?;
        info!(plan = %plan_id, tasks = task_count, "Plan complete");
        Ok(())
    }

    /// Build the scheduler operation for one task. The closure owns clones
    /// of everything it touches so the future is 'static.
    fn task_op(
        &self,
        plan_id: &str,
        task_id: &str,
        detail: TaskDetail,
        unit: &crate::github::Issue,
    ) -> TaskFn {
        let ctx = self.ctx.clone();
        let plan_id = plan_id.to_string();
        let task_id = task_id.to_string();
        let unit_number = unit.number;
        let unit_title = unit.title.clone();
        Arc::new(move || {
            let ctx = ctx.clone();
            let plan_id = plan_id.clone();
            let task_id = task_id.clone();
            let detail = detail.clone();
            let unit_title = unit_title.clone();
            async move { run_task(ctx, plan_id, task_id, detail, unit_number, unit_title).await }
                .boxed()
        })
    }
}

/// Titles and descriptions from the persisted proposal output, keyed by
/// task id. Missing entries degrade to id-only prompts.
fn proposal_details(state: &crate::state::ExecutionState) -> BTreeMap<String, TaskDetail> {
    let mut details = BTreeMap::new();
    let Some(tasks) = state
        .stages
        .get(stage::PROPOSAL)
        .and_then(|s| s.output.as_ref())
        .and_then(|o| o.get("tasks"))
        .and_then(|t| t.as_array())
    else {
        return details;
    };
    for task in tasks {
        let Some(id) = task.get("id").and_then(|i| i.as_str()) else {
            continue;
        };
        details.insert(
            id.to_string(),
            TaskDetail {
                title: task
                    .get("title")
                    .and_then(|t| t.as_str())
                    .map(str::to_string),
                description: task
                    .get("description")
                    .and_then(|d| d.as_str())
                    .map(str::to_string),
            },
        );
    }
    details
}

/// Execute one task: implement on a branch, open a PR, confirm the recorded
/// task state is readable back, then run the review stage on the PR.
async fn run_task(
    ctx: StageContext,
    plan_id: String,
    task_id: String,
    detail: TaskDetail,
    unit_number: u64,
    unit_title: String,
) -> Result<serde_json::Value> {
    ctx.store
        .transaction(&plan_id, |state| {
            state.set_task_status(&task_id, StepStatus::InProgress);
            Ok(())
        })
        .await?;

    let base = ctx.github.default_branch().await?;
    let branch = format!("gantry/{}/{}", plan_id, task_id);
    ctx.github.create_branch(&branch, &base).await?;

    let prompt = format!(
        "Implement the task below on branch '{branch}', committing and pushing \
         your changes there.\n\n\
         Parent issue #{unit_number}: {unit_title}\n\
         Task: {task_id}{title}\n\n{description}",
        branch = branch,
        unit_number = unit_number,
        unit_title = unit_title,
        task_id = task_id,
        title = detail
            .title
            .as_deref()
            .map(|t| format!(" ({})", t))
            .unwrap_or_default(),
        description = detail.description.as_deref().unwrap_or("(no description)"),
    );
    let mut request = AgentRequest::new(prompt, ctx.config.task_timeout);
    request.working_dir = Some(ctx.config.project_dir.clone());
    ctx.agent.run(request).await?.into_output()?;

    let pr = ctx
        .github
        .create_pull(
            &branch,
            &base,
            &format!(
                "{}: {}",
                task_id,
                detail.title.as_deref().unwrap_or(&unit_title)
            ),
            &format!("Task `{}` of #{}.", task_id, unit_number),
        )
        .await?;

    ctx.store
        .transaction(&plan_id, |state| {
            let task = state
                .tasks
                .get_mut(&task_id)
                .with_context(|| format!("Task '{}' missing from plan '{}'", task_id, plan_id))?;
            task.branch = Some(branch.clone());
            task.pr_url = Some(pr.html_url.clone());
            Ok(())
        })
        .await?;
    confirm_task_visible(&ctx, &plan_id, &task_id, &branch).await?;

    ctx.github.add_labels(pr.number, &["needs-review"]).await?;
    debug!(plan = %plan_id, task = %task_id, pr = pr.number, "Task PR opened");

    // Implementation then review, back to back; the confirmation above
    // guarantees the review step sees the recorded task state.
    let pr_unit = ctx.github.get_issue(pr.number).await?;
    PrReviewStage.execute(&ctx, &pr_unit).await?;

    Ok(serde_json::json!({ "branch": branch, "pr_url": pr.html_url }))
}

/// Read the task record back and verify the branch we just recorded is
/// visible, retrying briefly. Catches a lost write before the review step
/// depends on it.
async fn confirm_task_visible(
    ctx: &StageContext,
    plan_id: &str,
    task_id: &str,
    branch: &str,
) -> Result<()> {
    for attempt in 0..VISIBILITY_RETRIES {
        let state = ctx.store.load(plan_id).await?;
        let visible = state
            .tasks
            .get(task_id)
            .is_some_and(|t| t.branch.as_deref() == Some(branch) && t.pr_url.is_some());
        if visible {
            return Ok(());
        }
        warn!(
            plan = %plan_id,
            task = %task_id,
            attempt,
            "Recorded task state not yet visible; retrying"
        );
        tokio::time::sleep(VISIBILITY_RETRY_DELAY).await;
    }
    anyhow::bail!(
        "Task '{}' state for plan '{}' was persisted but never became visible",
        task_id,
        plan_id
    )
}
