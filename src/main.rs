use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use console::style;
use gantry::agent::CommandAgent;
use gantry::config::Config;
use gantry::github::GitHubClient;
use gantry::orchestrator::Orchestrator;
use gantry::pipeline::StageContext;
use gantry::state::{StateStore, StepStatus};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "gantry")]
#[command(version, about = "Label-driven GitHub workflow automation")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Sweep all open work units once
    Run {
        /// Only process units carrying this label
        #[arg(long)]
        label: Option<String>,
    },
    /// Process a single work unit by number
    Issue { number: u64 },
    /// Execute the approved plan for an issue, bypassing label routing
    Plan { number: u64 },
    /// List known plans
    Plans,
    /// Show the execution state of a plan
    Status { plan_id: String },
    /// Poll continuously until interrupted
    Daemon {
        /// Poll interval in seconds (overrides gantry.toml)
        #[arg(long)]
        interval: Option<u64>,
    },
    /// Delete a plan's persisted state
    Cleanup { plan_id: String },
}

fn init_tracing(
    config: &Config,
    daemon: bool,
) -> Result<Option<tracing_appender::non_blocking::WorkerGuard>> {
    let default = if config.verbose {
        "gantry=debug"
    } else {
        "gantry=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    if daemon {
        let log_dir = config.log_dir();
        std::fs::create_dir_all(&log_dir)
            .with_context(|| format!("Failed to create log directory {}", log_dir.display()))?;
        let appender = tracing_appender::rolling::daily(log_dir, "gantry.log");
        let (writer, guard) = tracing_appender::non_blocking(appender);
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(writer)
            .init();
        Ok(Some(guard))
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
        Ok(None)
    }
}

/// Wire up the live collaborators. Requires a repo slug and a GitHub token.
fn build_context(config: Config) -> Result<StageContext> {
    let token = Config::github_token()?;
    let github = GitHubClient::new(&token, &config.repo)?;
    let agent = CommandAgent::new(&config.agent_cmd, &config.agent_args);
    let store = StateStore::new(&config.state_dir);
    Ok(StageContext {
        github: Arc::new(github),
        agent: Arc::new(agent),
        store: Arc::new(store),
        config: Arc::new(config),
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };
    let config = Config::load(project_dir, cli.verbose)?;
    let _log_guard = init_tracing(&config, matches!(cli.command, Commands::Daemon { .. }))?;

    match cli.command {
        Commands::Run { label } => {
            let orchestrator = Orchestrator::new(build_context(config)?);
            let summary = orchestrator.process_all(label.as_deref()).await?;
            println!(
                "{} processed, {} skipped, {} failed",
                style(summary.processed).green(),
                summary.skipped,
                if summary.failed > 0 {
                    style(summary.failed).red()
                } else {
                    style(summary.failed)
                },
            );
        }
        Commands::Issue { number } => {
            let orchestrator = Orchestrator::new(build_context(config)?);
            match orchestrator.process_issue(number).await? {
                Some(stage) => println!("#{number}: ran stage {}", style(stage).cyan()),
                None => println!("#{number}: no matching label rule"),
            }
        }
        Commands::Plan { number } => {
            let orchestrator = Orchestrator::new(build_context(config)?);
            orchestrator.process_plan(number).await?;
            println!("{}", style(format!("Plan for #{number} executed")).green());
        }
        Commands::Plans => {
            let store = StateStore::new(&config.state_dir);
            let plans = store.list_plans()?;
            if plans.is_empty() {
                println!("No plans found in {}", config.state_dir.display());
            }
            for plan in plans {
                let state = store.load(&plan).await?;
                println!("{}  {}", style(&plan).bold(), status_badge(state.status));
            }
        }
        Commands::Status { plan_id } => {
            let store = StateStore::new(&config.state_dir);
            let state = store.load(&plan_id).await?;
            println!(
                "{}  {}  (updated {})",
                style(&state.plan_id).bold(),
                status_badge(state.status),
                state.updated_at.format("%Y-%m-%d %H:%M:%S UTC"),
            );
            println!("\nStages:");
            for (name, stage) in &state.stages {
                print!("  {:16} {}", name, status_badge(stage.status));
                if let Some(error) = &stage.error {
                    print!("  {}", style(error).red());
                }
                println!();
            }
            if !state.tasks.is_empty() {
                println!("\nTasks:");
                for (id, task) in &state.tasks {
                    print!("  {:16} {}", id, status_badge(task.status));
                    if let Some(url) = &task.pr_url {
                        print!("  {}", url);
                    }
                    if let Some(error) = &task.error {
                        print!("  {}", style(error).red());
                    }
                    println!();
                }
            }
        }
        Commands::Daemon { interval } => {
            let mut config = config;
            if let Some(secs) = interval {
                config.poll_interval = std::time::Duration::from_secs(secs);
            }
            let orchestrator = Orchestrator::new(build_context(config)?);
            orchestrator.run_daemon().await?;
        }
        Commands::Cleanup { plan_id } => {
            let store = StateStore::new(&config.state_dir);
            store.delete(&plan_id).await?;
            println!("Deleted state for plan '{plan_id}'");
        }
    }

    Ok(())
}

fn status_badge(status: StepStatus) -> console::StyledObject<&'static str> {
    match status {
        StepStatus::Pending => style("pending").dim(),
        StepStatus::InProgress => style("in_progress").yellow(),
        StepStatus::Completed => style("completed").green(),
        StepStatus::Failed => style("failed").red(),
    }
}
