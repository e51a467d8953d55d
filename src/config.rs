//! Runtime configuration for Gantry.
//!
//! Settings layer as: built-in defaults, then `gantry.toml` in the project
//! directory, then environment variables, then CLI flags. The GitHub token
//! comes from the environment only and never from the config file.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_MAX_CONCURRENCY: usize = 4;
pub const DEFAULT_TASK_TIMEOUT_SECS: u64 = 1800;
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 300;

/// Labels that drive stage routing. The first five are configurable per
/// deployment; `namespace` prefixes the namespaced variants
/// (`<namespace>:<label>`).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LabelConfig {
    pub needs_planning: String,
    pub plan_review: String,
    pub code_review: String,
    pub merge_ready: String,
    pub attention: String,
    pub namespace: String,
}

impl Default for LabelConfig {
    fn default() -> Self {
        Self {
            needs_planning: "needs-planning".to_string(),
            plan_review: "plan-review".to_string(),
            code_review: "code-review".to_string(),
            merge_ready: "merge-ready".to_string(),
            attention: "needs-attention".to_string(),
            namespace: "gantry".to_string(),
        }
    }
}

impl LabelConfig {
    /// The namespaced variant of a label, e.g. `gantry:needs-review`.
    pub fn namespaced(&self, label: &str) -> String {
        format!("{}:{}", self.namespace, label)
    }
}

/// Shape of `gantry.toml`. All fields optional; defaults fill the gaps.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct FileConfig {
    repo: Option<String>,
    state_dir: Option<PathBuf>,
    agent_cmd: Option<String>,
    agent_args: Option<Vec<String>>,
    max_concurrency: Option<usize>,
    task_timeout_secs: Option<u64>,
    poll_interval_secs: Option<u64>,
    critical_path_boost: Option<bool>,
    labels: Option<LabelConfig>,
}

/// Resolved runtime configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub project_dir: PathBuf,
    /// `owner/repo` slug of the repository under automation.
    pub repo: String,
    pub state_dir: PathBuf,
    pub agent_cmd: String,
    pub agent_args: Vec<String>,
    pub max_concurrency: usize,
    pub task_timeout: Duration,
    pub poll_interval: Duration,
    pub critical_path_boost: bool,
    pub labels: LabelConfig,
    pub verbose: bool,
}

impl Config {
    /// Load configuration for a project directory.
    pub fn load(project_dir: PathBuf, verbose: bool) -> Result<Self> {
        let project_dir = project_dir
            .canonicalize()
            .context("Failed to resolve project directory")?;

        let config_path = project_dir.join("gantry.toml");
        let file: FileConfig = if config_path.exists() {
            let raw = std::fs::read_to_string(&config_path)
                .with_context(|| format!("Failed to read {}", config_path.display()))?;
            toml::from_str(&raw)
                .with_context(|| format!("Failed to parse {}", config_path.display()))?
        } else {
            FileConfig::default()
        };

        let repo = std::env::var("GANTRY_REPO")
            .ok()
            .or(file.repo)
            .unwrap_or_default();

        let state_dir = std::env::var("GANTRY_STATE_DIR")
            .ok()
            .map(PathBuf::from)
            .or(file.state_dir)
            .unwrap_or_else(|| project_dir.join(".gantry").join("state"));

        let agent_cmd = std::env::var("GANTRY_AGENT_CMD")
            .ok()
            .or(file.agent_cmd)
            .unwrap_or_else(|| "claude".to_string());

        Ok(Self {
            project_dir,
            repo,
            state_dir,
            agent_cmd,
            agent_args: file.agent_args.unwrap_or_default(),
            max_concurrency: file.max_concurrency.unwrap_or(DEFAULT_MAX_CONCURRENCY).max(1),
            task_timeout: Duration::from_secs(
                file.task_timeout_secs.unwrap_or(DEFAULT_TASK_TIMEOUT_SECS),
            ),
            poll_interval: Duration::from_secs(
                file.poll_interval_secs.unwrap_or(DEFAULT_POLL_INTERVAL_SECS),
            ),
            critical_path_boost: file.critical_path_boost.unwrap_or(false),
            labels: file.labels.unwrap_or_default(),
            verbose,
        })
    }

    /// GitHub token from the environment (`GANTRY_GITHUB_TOKEN` wins over
    /// `GITHUB_TOKEN`). Never read from the config file.
    pub fn github_token() -> Result<String> {
        std::env::var("GANTRY_GITHUB_TOKEN")
            .or_else(|_| std::env::var("GITHUB_TOKEN"))
            .context("No GitHub token found. Set GANTRY_GITHUB_TOKEN or GITHUB_TOKEN")
    }

    /// Log directory for daemon-mode file logging.
    pub fn log_dir(&self) -> PathBuf {
        self.project_dir.join(".gantry").join("logs")
    }
}
