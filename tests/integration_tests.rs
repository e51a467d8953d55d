//! Integration tests for Gantry.
//!
//! The end-to-end tests drive the orchestrator against in-memory doubles of
//! the Git provider and the agent; the CLI tests exercise the binary for the
//! commands that work without a GitHub token.

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use async_trait::async_trait;
use predicates::prelude::*;
use tempfile::TempDir;

use anyhow::Result;
use gantry::agent::{AgentOutcome, AgentRequest, AgentRunner};
use gantry::config::{Config, LabelConfig};
use gantry::github::{
    CommentAuthor, GitProvider, Issue, IssueComment, Label, PullRef, PullRequest,
};
use gantry::orchestrator::Orchestrator;
use gantry::pipeline::StageContext;
use gantry::state::{StateStore, StepStatus};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn gantry() -> Command {
    cargo_bin_cmd!("gantry")
}

// =============================================================================
// Test doubles
// =============================================================================

#[derive(Default)]
struct FakeGitHubState {
    issues: Vec<Issue>,
    comments: HashMap<u64, Vec<IssueComment>>,
    branches: Vec<String>,
    pulls: Vec<PullRequest>,
    merged: Vec<u64>,
    diffs: HashMap<u64, String>,
    next_pr_number: u64,
}

/// In-memory Git provider. Labels mutate the stored issues; created PRs get
/// numbers from 100 up.
struct FakeGitHub {
    state: Mutex<FakeGitHubState>,
}

impl FakeGitHub {
    fn new(issues: Vec<Issue>) -> Self {
        Self {
            state: Mutex::new(FakeGitHubState {
                issues,
                next_pr_number: 100,
                ..Default::default()
            }),
        }
    }

    fn labels_of(&self, number: u64) -> Vec<String> {
        let state = self.state.lock().unwrap();
        state
            .issues
            .iter()
            .find(|i| i.number == number)
            .map(|i| i.labels.iter().map(|l| l.name.clone()).collect())
            .unwrap_or_default()
    }

    fn comments_of(&self, number: u64) -> Vec<String> {
        let state = self.state.lock().unwrap();
        state
            .comments
            .get(&number)
            .map(|c| c.iter().map(|c| c.body.clone()).collect())
            .unwrap_or_default()
    }

    fn push_comment(&self, number: u64, login: &str, body: &str) {
        let mut state = self.state.lock().unwrap();
        let comments = state.comments.entry(number).or_default();
        let id = comments.len() as u64 + 1;
        comments.push(IssueComment {
            id,
            body: body.to_string(),
            user: CommentAuthor {
                login: login.to_string(),
            },
        });
    }

    fn set_diff(&self, number: u64, diff: &str) {
        self.state
            .lock()
            .unwrap()
            .diffs
            .insert(number, diff.to_string());
    }

    fn pulls(&self) -> Vec<PullRequest> {
        self.state.lock().unwrap().pulls.clone()
    }

    fn merged(&self) -> Vec<u64> {
        self.state.lock().unwrap().merged.clone()
    }
}

#[async_trait]
impl GitProvider for FakeGitHub {
    async fn list_open_issues(&self, label: Option<&str>) -> Result<Vec<Issue>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .issues
            .iter()
            .filter(|i| label.is_none_or(|l| i.has_label(l)))
            .cloned()
            .collect())
    }

    async fn get_issue(&self, number: u64) -> Result<Issue> {
        let state = self.state.lock().unwrap();
        state
            .issues
            .iter()
            .find(|i| i.number == number)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("no such issue #{number}"))
    }

    async fn add_comment(&self, number: u64, body: &str) -> Result<()> {
        self.push_comment(number, "gantry[bot]", body);
        Ok(())
    }

    async fn list_comments(&self, number: u64) -> Result<Vec<IssueComment>> {
        let state = self.state.lock().unwrap();
        Ok(state.comments.get(&number).cloned().unwrap_or_default())
    }

    async fn add_labels(&self, number: u64, labels: &[&str]) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if let Some(issue) = state.issues.iter_mut().find(|i| i.number == number) {
            for label in labels {
                if !issue.has_label(label) {
                    issue.labels.push(Label {
                        name: label.to_string(),
                    });
                }
            }
        }
        Ok(())
    }

    async fn remove_label(&self, number: u64, label: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if let Some(issue) = state.issues.iter_mut().find(|i| i.number == number) {
            issue.labels.retain(|l| l.name != label);
        }
        Ok(())
    }

    async fn default_branch(&self) -> Result<String> {
        Ok("main".to_string())
    }

    async fn create_branch(&self, name: &str, _from_branch: &str) -> Result<()> {
        self.state.lock().unwrap().branches.push(name.to_string());
        Ok(())
    }

    async fn create_pull(
        &self,
        head: &str,
        base: &str,
        _title: &str,
        _body: &str,
    ) -> Result<PullRequest> {
        let mut state = self.state.lock().unwrap();
        let number = state.next_pr_number;
        state.next_pr_number += 1;
        let pr = PullRequest {
            number,
            html_url: format!("https://github.com/octo/repo/pull/{number}"),
            head: PullRef {
                branch: head.to_string(),
            },
            base: PullRef {
                branch: base.to_string(),
            },
        };
        state.pulls.push(pr.clone());
        // PRs are also work units; register them so label calls resolve.
        state.issues.push(Issue {
            number,
            title: format!("PR {number}"),
            body: None,
            state: "open".to_string(),
            labels: Vec::new(),
            html_url: format!("https://github.com/octo/repo/pull/{number}"),
            pull_request: Some(serde_json::json!({})),
        });
        Ok(pr)
    }

    async fn pull_request_diff(&self, number: u64) -> Result<String> {
        let state = self.state.lock().unwrap();
        Ok(state
            .diffs
            .get(&number)
            .cloned()
            .unwrap_or_else(|| "diff --git a/x b/x".to_string()))
    }

    async fn merge_pull(&self, number: u64) -> Result<()> {
        self.state.lock().unwrap().merged.push(number);
        Ok(())
    }
}

/// Agent double that replays a fixed queue of outputs.
struct ScriptedAgent {
    outputs: Mutex<Vec<String>>,
}

impl ScriptedAgent {
    fn new(outputs: &[&str]) -> Self {
        let mut queue: Vec<String> = outputs.iter().map(|s| s.to_string()).collect();
        queue.reverse();
        Self {
            outputs: Mutex::new(queue),
        }
    }
}

#[async_trait]
impl AgentRunner for ScriptedAgent {
    async fn run(&self, _request: AgentRequest) -> Result<AgentOutcome> {
        let output = self
            .outputs
            .lock()
            .unwrap()
            .pop()
            .expect("ScriptedAgent ran out of outputs");
        Ok(AgentOutcome {
            success: true,
            output,
            error: None,
        })
    }
}

fn issue(number: u64, title: &str, labels: &[&str]) -> Issue {
    Issue {
        number,
        title: title.to_string(),
        body: Some(format!("Body of {title}")),
        state: "open".to_string(),
        labels: labels
            .iter()
            .map(|l| Label {
                name: l.to_string(),
            })
            .collect(),
        html_url: format!("https://github.com/octo/repo/issues/{number}"),
        pull_request: None,
    }
}

fn pr_unit(number: u64, title: &str, labels: &[&str]) -> Issue {
    let mut unit = issue(number, title, labels);
    unit.pull_request = Some(serde_json::json!({}));
    unit
}

fn test_config(dir: &TempDir) -> Config {
    Config {
        project_dir: dir.path().to_path_buf(),
        repo: "octo/repo".to_string(),
        state_dir: dir.path().join("state"),
        agent_cmd: "unused".to_string(),
        agent_args: Vec::new(),
        max_concurrency: 2,
        task_timeout: Duration::from_secs(10),
        poll_interval: Duration::from_secs(1),
        critical_path_boost: false,
        labels: LabelConfig::default(),
        verbose: false,
    }
}

fn context(dir: &TempDir, github: Arc<FakeGitHub>, agent: Arc<ScriptedAgent>) -> StageContext {
    StageContext {
        github,
        agent,
        store: Arc::new(StateStore::new(dir.path().join("state"))),
        config: Arc::new(test_config(dir)),
    }
}

// =============================================================================
// End-to-end pipeline tests
// =============================================================================

mod pipeline {
    use super::*;

    #[tokio::test]
    async fn proposal_seeds_plan_and_swaps_labels() {
        let dir = TempDir::new().unwrap();
        let github = Arc::new(FakeGitHub::new(vec![issue(
            7,
            "Add caching",
            &["needs-planning"],
        )]));
        let agent = Arc::new(ScriptedAgent::new(&[r#"Here you go:
{"tasks": [
  {"id": "t1", "title": "Schema", "description": "Define cache schema"},
  {"id": "t2", "title": "Wire up", "depends_on": ["t1"], "priority": 2}
]}"#]));
        let ctx = context(&dir, github.clone(), agent);
        let orchestrator = Orchestrator::new(ctx.clone());

        let stage = orchestrator
            .process_one(&github.get_issue(7).await.unwrap())
            .await
            .unwrap();
        assert_eq!(stage, Some("proposal"));

        let state = ctx.store.load("issue-7").await.unwrap();
        assert_eq!(state.stage_status("proposal"), StepStatus::Completed);
        assert_eq!(state.task_status("t1"), Some(StepStatus::Pending));
        assert_eq!(state.task_status("t2"), Some(StepStatus::Pending));
        assert_eq!(state.tasks["t2"].depends_on, vec!["t1"]);
        assert_eq!(state.tasks["t2"].priority, 2);

        let labels = github.labels_of(7);
        assert!(labels.contains(&"proposed".to_string()));
        assert!(!labels.contains(&"needs-planning".to_string()));
        let comments = github.comments_of(7);
        assert!(comments.iter().any(|c| c.contains("/approve")));
    }

    #[tokio::test]
    async fn proposal_with_cyclic_plan_fails_and_flags_attention() {
        let dir = TempDir::new().unwrap();
        let github = Arc::new(FakeGitHub::new(vec![issue(8, "Bad plan", &["needs-planning"])]));
        let agent = Arc::new(ScriptedAgent::new(&[
            r#"{"tasks": [{"id": "a", "depends_on": ["b"]}, {"id": "b", "depends_on": ["a"]}]}"#,
        ]));
        let ctx = context(&dir, github.clone(), agent);
        let orchestrator = Orchestrator::new(ctx.clone());

        let result = orchestrator
            .process_one(&github.get_issue(8).await.unwrap())
            .await;
        assert!(result.is_err());

        let state = ctx.store.load("issue-8").await.unwrap();
        assert_eq!(state.stage_status("proposal"), StepStatus::Failed);
        assert!(state.tasks.is_empty());
        assert!(github.labels_of(8).contains(&"needs-attention".to_string()));
        assert!(
            github
                .comments_of(8)
                .iter()
                .any(|c| c.contains("proposal"))
        );
    }

    #[tokio::test]
    async fn approval_waits_for_approve_comment() {
        let dir = TempDir::new().unwrap();
        let github = Arc::new(FakeGitHub::new(vec![issue(9, "Feature", &["proposed"])]));
        let agent = Arc::new(ScriptedAgent::new(&[]));
        let ctx = context(&dir, github.clone(), agent);
        let orchestrator = Orchestrator::new(ctx.clone());

        // No approval comment yet: stage runs but changes nothing.
        let unit = github.get_issue(9).await.unwrap();
        assert_eq!(orchestrator.process_one(&unit).await.unwrap(), Some("approval"));
        assert!(github.labels_of(9).contains(&"proposed".to_string()));
        assert!(!github.labels_of(9).contains(&"execute".to_string()));

        github.push_comment(9, "maintainer", "/approve");
        let unit = github.get_issue(9).await.unwrap();
        assert_eq!(orchestrator.process_one(&unit).await.unwrap(), Some("approval"));

        let labels = github.labels_of(9);
        assert!(labels.contains(&"execute".to_string()));
        assert!(labels.contains(&"task".to_string()));
        assert!(!labels.contains(&"proposed".to_string()));
        let state = ctx.store.load("issue-9").await.unwrap();
        assert_eq!(state.stage_status("approval"), StepStatus::Completed);
    }

    #[tokio::test]
    async fn task_execution_runs_plan_and_opens_prs() {
        let dir = TempDir::new().unwrap();
        let github = Arc::new(FakeGitHub::new(vec![issue(
            10,
            "Two tasks",
            &["execute", "task"],
        )]));
        // Per task: one implementation output, then one review verdict.
        let agent = Arc::new(ScriptedAgent::new(&[
            "done t1",
            r#"{"verdict": "approve", "summary": "t1 fine"}"#,
            "done t2",
            r#"{"verdict": "approve", "summary": "t2 fine"}"#,
        ]));
        let ctx = context(&dir, github.clone(), agent);

        // Seed an approved plan.
        ctx.store
            .transaction("issue-10", |state| {
                state.stage_mut("proposal").complete();
                state.stage_mut("approval").complete();
                state.set_task_status("t1", StepStatus::Pending);
                let t2 = state.set_task_status("t2", StepStatus::Pending);
                t2.depends_on = vec!["t1".to_string()];
                Ok(())
            })
            .await
            .unwrap();

        let orchestrator = Orchestrator::new(ctx.clone());
        let unit = github.get_issue(10).await.unwrap();
        assert_eq!(
            orchestrator.process_one(&unit).await.unwrap(),
            Some("task_execution")
        );

        let state = ctx.store.load("issue-10").await.unwrap();
        assert_eq!(state.stage_status("task_execution"), StepStatus::Completed);
        assert_eq!(state.task_status("t1"), Some(StepStatus::Completed));
        assert_eq!(state.task_status("t2"), Some(StepStatus::Completed));
        assert!(state.tasks["t1"].pr_url.is_some());
        assert!(state.tasks["t1"].branch.as_deref() == Some("gantry/issue-10/t1"));

        // Two PRs opened and reviewed in the same pass: the review verdict
        // swapped needs-review for approved.
        let pulls = github.pulls();
        assert_eq!(pulls.len(), 2);
        for pr in &pulls {
            let labels = github.labels_of(pr.number);
            assert!(labels.contains(&"approved".to_string()));
            assert!(!labels.contains(&"needs-review".to_string()));
        }
        let labels = github.labels_of(10);
        assert!(!labels.contains(&"execute".to_string()));
        assert!(!labels.contains(&"task".to_string()));
    }

    #[tokio::test]
    async fn rerun_skips_completed_tasks() {
        let dir = TempDir::new().unwrap();
        let github = Arc::new(FakeGitHub::new(vec![issue(
            11,
            "Partial",
            &["execute", "task"],
        )]));
        // Only the incomplete task should consume agent runs.
        let agent = Arc::new(ScriptedAgent::new(&[
            "done t2",
            r#"{"verdict": "approve", "summary": "fine"}"#,
        ]));
        let ctx = context(&dir, github.clone(), agent);

        ctx.store
            .transaction("issue-11", |state| {
                state.stage_mut("proposal").complete();
                state.set_task_status("t1", StepStatus::Completed);
                let t2 = state.set_task_status("t2", StepStatus::Pending);
                t2.depends_on = vec!["t1".to_string()];
                Ok(())
            })
            .await
            .unwrap();

        let orchestrator = Orchestrator::new(ctx.clone());
        let unit = github.get_issue(11).await.unwrap();
        orchestrator.process_one(&unit).await.unwrap();

        let state = ctx.store.load("issue-11").await.unwrap();
        assert_eq!(state.task_status("t2"), Some(StepStatus::Completed));
        assert_eq!(github.pulls().len(), 1);
    }

    #[tokio::test]
    async fn dangling_task_dependency_rejects_plan_before_any_task_runs() {
        let dir = TempDir::new().unwrap();
        let github = Arc::new(FakeGitHub::new(vec![issue(
            12,
            "Broken plan",
            &["execute", "task"],
        )]));
        // Empty script: no agent operation may ever be invoked.
        let agent = Arc::new(ScriptedAgent::new(&[]));
        let ctx = context(&dir, github.clone(), agent);

        ctx.store
            .transaction("issue-12", |state| {
                state.stage_mut("proposal").complete();
                let t1 = state.set_task_status("t1", StepStatus::Pending);
                t1.depends_on = vec!["ghost".to_string()];
                Ok(())
            })
            .await
            .unwrap();

        let orchestrator = Orchestrator::new(ctx.clone());
        let unit = github.get_issue(12).await.unwrap();
        let err = orchestrator.process_one(&unit).await.unwrap_err();
        let chain = format!("{err:#}");
        assert!(chain.contains("unknown task"), "unexpected error: {chain}");
        assert!(chain.contains("ghost"), "unexpected error: {chain}");

        // Nothing executed: no branches, no PRs, the task never started.
        assert!(github.pulls().is_empty());
        let state = ctx.store.load("issue-12").await.unwrap();
        assert_eq!(state.task_status("t1"), Some(StepStatus::Pending));
    }

    #[tokio::test]
    async fn review_approve_swaps_labels() {
        let dir = TempDir::new().unwrap();
        let github = Arc::new(FakeGitHub::new(vec![pr_unit(
            100,
            "t1: Schema",
            &["needs-review"],
        )]));
        github.set_diff(100, "diff --git a/schema.rs b/schema.rs\n+pub struct Cache;");
        let agent = Arc::new(ScriptedAgent::new(&[
            r#"{"verdict": "approve", "summary": "Clean change."}"#,
        ]));
        let ctx = context(&dir, github.clone(), agent);
        let orchestrator = Orchestrator::new(ctx.clone());

        let unit = github.get_issue(100).await.unwrap();
        assert_eq!(
            orchestrator.process_one(&unit).await.unwrap(),
            Some("pr_review")
        );

        let labels = github.labels_of(100);
        assert!(labels.contains(&"approved".to_string()));
        assert!(!labels.contains(&"needs-review".to_string()));
        assert!(
            github
                .comments_of(100)
                .iter()
                .any(|c| c.contains("Clean change."))
        );
        let state = ctx.store.load("issue-100").await.unwrap();
        assert_eq!(state.stage_status("pr_review"), StepStatus::Completed);
    }

    #[tokio::test]
    async fn review_request_changes_routes_to_fix() {
        let dir = TempDir::new().unwrap();
        let github = Arc::new(FakeGitHub::new(vec![pr_unit(
            101,
            "t2: Wire up",
            &["needs-review"],
        )]));
        let agent = Arc::new(ScriptedAgent::new(&[
            r#"{"verdict": "request_changes", "summary": "Missing tests."}"#,
        ]));
        let ctx = context(&dir, github.clone(), agent);
        let orchestrator = Orchestrator::new(ctx);

        let unit = github.get_issue(101).await.unwrap();
        orchestrator.process_one(&unit).await.unwrap();

        let labels = github.labels_of(101);
        assert!(labels.contains(&"needs-fix".to_string()));
        assert!(!labels.contains(&"needs-review".to_string()));
    }

    #[tokio::test]
    async fn merge_stage_merges_and_unlabels() {
        let dir = TempDir::new().unwrap();
        let github = Arc::new(FakeGitHub::new(vec![pr_unit(
            102,
            "Ready",
            &["merge-ready"],
        )]));
        let agent = Arc::new(ScriptedAgent::new(&[]));
        let ctx = context(&dir, github.clone(), agent);
        let orchestrator = Orchestrator::new(ctx);

        let unit = github.get_issue(102).await.unwrap();
        assert_eq!(orchestrator.process_one(&unit).await.unwrap(), Some("merge"));
        assert_eq!(github.merged(), vec![102]);
        assert!(!github.labels_of(102).contains(&"merge-ready".to_string()));
    }

    #[tokio::test]
    async fn merge_refuses_plain_issue() {
        let dir = TempDir::new().unwrap();
        let github = Arc::new(FakeGitHub::new(vec![issue(
            103,
            "Not a PR",
            &["merge-ready"],
        )]));
        let agent = Arc::new(ScriptedAgent::new(&[]));
        let ctx = context(&dir, github.clone(), agent);
        let orchestrator = Orchestrator::new(ctx);

        let unit = github.get_issue(103).await.unwrap();
        assert!(orchestrator.process_one(&unit).await.is_err());
        assert!(github.merged().is_empty());
    }

    #[tokio::test]
    async fn sweep_isolates_failures_and_counts_skips() {
        let dir = TempDir::new().unwrap();
        let github = Arc::new(FakeGitHub::new(vec![
            issue(20, "Bad", &["needs-planning"]),
            issue(21, "Unlabeled", &[]),
            pr_unit(22, "Good", &["merge-ready"]),
        ]));
        // Garbage output fails the proposal for #20.
        let agent = Arc::new(ScriptedAgent::new(&["no json here"]));
        let ctx = context(&dir, github.clone(), agent);
        let orchestrator = Orchestrator::new(ctx);

        let summary = orchestrator.process_all(None).await.unwrap();
        assert_eq!(summary.processed, 1);
        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.failed, 1);
        // The failing unit did not stop the merge of #22.
        assert_eq!(github.merged(), vec![22]);
    }

    #[tokio::test]
    async fn process_plan_without_proposal_is_a_no_op() {
        let dir = TempDir::new().unwrap();
        let github = Arc::new(FakeGitHub::new(vec![issue(30, "No plan", &[])]));
        let agent = Arc::new(ScriptedAgent::new(&[]));
        let ctx = context(&dir, github.clone(), agent);
        let orchestrator = Orchestrator::new(ctx);

        orchestrator.process_plan(30).await.unwrap();
        assert!(github.pulls().is_empty());
        assert!(github.comments_of(30).is_empty());
    }
}

// =============================================================================
// CLI tests (commands that work without a GitHub token)
// =============================================================================

mod cli {
    use super::*;

    #[test]
    fn help_and_version() {
        gantry().arg("--help").assert().success();
        gantry().arg("--version").assert().success();
    }

    #[test]
    fn plans_on_empty_project() {
        let dir = TempDir::new().unwrap();
        gantry()
            .current_dir(dir.path())
            .arg("plans")
            .assert()
            .success()
            .stdout(predicate::str::contains("No plans found"));
    }

    #[test]
    fn status_shows_stages() {
        let dir = TempDir::new().unwrap();
        gantry()
            .current_dir(dir.path())
            .args(["status", "issue-1"])
            .assert()
            .success()
            .stdout(predicate::str::contains("proposal"))
            .stdout(predicate::str::contains("pending"));
        // The synthesized plan is now listed.
        gantry()
            .current_dir(dir.path())
            .arg("plans")
            .assert()
            .success()
            .stdout(predicate::str::contains("issue-1"));
    }

    #[test]
    fn cleanup_is_idempotent() {
        let dir = TempDir::new().unwrap();
        gantry()
            .current_dir(dir.path())
            .args(["cleanup", "issue-404"])
            .assert()
            .success();
        gantry()
            .current_dir(dir.path())
            .args(["cleanup", "issue-404"])
            .assert()
            .success();
    }

    #[test]
    fn daemon_accepts_interval_flag() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("gantry.toml"), "repo = \"octo/repo\"\n").unwrap();
        // The flag parses; startup then stops at the missing token, before
        // any polling begins.
        gantry()
            .current_dir(dir.path())
            .env_remove("GITHUB_TOKEN")
            .env_remove("GANTRY_GITHUB_TOKEN")
            .args(["daemon", "--interval", "5"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("GITHUB_TOKEN"));
    }

    #[test]
    fn run_without_token_fails_with_hint() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("gantry.toml"), "repo = \"octo/repo\"\n").unwrap();
        gantry()
            .current_dir(dir.path())
            .env_remove("GITHUB_TOKEN")
            .env_remove("GANTRY_GITHUB_TOKEN")
            .arg("run")
            .assert()
            .failure()
            .stderr(predicate::str::contains("GITHUB_TOKEN"));
    }
}
