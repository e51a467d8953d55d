//! Work-unit polling and stage dispatch.
//!
//! The orchestrator asks the Git provider for open work units, routes each
//! through the label rules, and runs the selected stage. One unit's failure
//! never aborts the sweep: the unit gets a diagnostic comment and the
//! attention label, and the loop moves on.

use crate::errors::StageError;
use crate::github::Issue;
use crate::orchestrator::PlanExecutor;
use crate::pipeline::{Stage, StageContext, StageRouter, build_registry, plan_id_for, stage};
use crate::state::StepStatus;
use anyhow::{Context, Result};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Outcome of one full sweep over the open work units.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ProcessSummary {
    pub processed: usize,
    pub skipped: usize,
    pub failed: usize,
}

pub struct Orchestrator {
    ctx: StageContext,
    router: StageRouter,
    registry: HashMap<&'static str, Arc<dyn Stage>>,
}

impl Orchestrator {
    pub fn new(ctx: StageContext) -> Self {
        let router = StageRouter::new(&ctx.config.labels);
        Self {
            ctx,
            router,
            registry: build_registry(),
        }
    }

    /// Sweep all open work units in ascending number order, optionally
    /// restricted to units carrying a label.
    pub async fn process_all(&self, label: Option<&str>) -> Result<ProcessSummary> {
        let mut units = self
            .ctx
            .github
            .list_open_issues(label)
            .await
            .context("Failed to list open work units")?;
        units.sort_by_key(|u| u.number);

        let mut summary = ProcessSummary::default();
        for unit in &units {
            match self.process_one(unit).await {
                Ok(Some(_)) => summary.processed += 1,
                Ok(None) => summary.skipped += 1,
                Err(e) => {
                    warn!(unit = unit.number, error = %e, "Work unit failed; continuing sweep");
                    summary.failed += 1;
                }
            }
        }
        info!(
            processed = summary.processed,
            skipped = summary.skipped,
            failed = summary.failed,
            "Sweep complete"
        );
        Ok(summary)
    }

    /// Route one work unit and run its stage. Returns the stage name that
    /// ran, or `None` when no label rule matched.
    pub async fn process_one(&self, unit: &Issue) -> Result<Option<&'static str>> {
        let Some(stage_name) = self.router.select_stage(unit) else {
            debug!(unit = unit.number, "No matching label rule; skipping");
            return Ok(None);
        };
        let handler = self
            .registry
            .get(stage_name)
            .with_context(|| format!("No handler registered for stage '{}'", stage_name))?;

        info!(unit = unit.number, stage = stage_name, "Dispatching");
        match handler.execute(&self.ctx, unit).await {
            Ok(()) => Ok(Some(stage_name)),
            Err(e) => {
                self.flag_attention(unit, &e).await;
                Err(e.into())
            }
        }
    }

    /// Fetch a single work unit by number and process it.
    pub async fn process_issue(&self, number: u64) -> Result<Option<&'static str>> {
        let unit = self
            .ctx
            .github
            .get_issue(number)
            .await
            .with_context(|| format!("Failed to fetch work unit #{}", number))?;
        self.process_one(&unit).await
    }

    /// Execute the plan for an issue directly, bypassing label routing.
    /// A plan whose proposal stage has not completed is not an error; there
    /// is simply nothing to execute yet.
    pub async fn process_plan(&self, number: u64) -> Result<()> {
        let unit = self
            .ctx
            .github
            .get_issue(number)
            .await
            .with_context(|| format!("Failed to fetch work unit #{}", number))?;
        let plan_id = plan_id_for(&unit);
        let state = self.ctx.store.load(&plan_id).await?;
        if state.stage_status(stage::PROPOSAL) != StepStatus::Completed {
            info!(plan = %plan_id, "Planning stage not completed; nothing to execute");
            return Ok(());
        }
        PlanExecutor::new(self.ctx.clone()).execute_plan(&unit).await
    }

    /// Poll loop: sweep, sleep, repeat until ctrl-c.
    pub async fn run_daemon(&self) -> Result<()> {
        info!(
            interval = ?self.ctx.config.poll_interval,
            "Daemon started"
        );
        loop {
            if let Err(e) = self.process_all(None).await {
                warn!(error = %e, "Sweep failed; will retry next interval");
            }
            tokio::select! {
                _ = tokio::time::sleep(self.ctx.config.poll_interval) => {}
                _ = tokio::signal::ctrl_c() => {
                    info!("Shutdown signal received");
                    return Ok(());
                }
            }
        }
    }

    /// Best-effort failure surfacing on the work unit itself. Reporting
    /// failures are logged, never propagated over the original error.
    async fn flag_attention(&self, unit: &Issue, error: &StageError) {
        let comment = format!(
            "⚠️ Stage `{}` failed on this work unit:\n\n```\n{:#}\n```",
            error.stage, error.source
        );
        if let Err(e) = self.ctx.github.add_comment(unit.number, &comment).await {
            warn!(unit = unit.number, error = %e, "Failed to post failure comment");
        }
        let attention = self.ctx.config.labels.attention.clone();
        if let Err(e) = self
            .ctx
            .github
            .add_labels(unit.number, &[attention.as_str()])
            .await
        {
            warn!(unit = unit.number, error = %e, "Failed to add attention label");
        }
    }
}
