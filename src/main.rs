use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod cmd;

#[derive(Parser)]
#[command(name = "stagewarden")]
#[command(version, about = "Pipeline state & safety engine for staged agent pipelines")]
pub struct Cli {
    /// Debug logging (overridden by RUST_LOG)
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Project-data root. Overrides the config file and STAGEWARDEN_ROOT.
    #[arg(long, global = true)]
    pub root: Option<PathBuf>,

    /// Config file. Defaults to .stagewarden/stagewarden.toml in the working directory.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Print machine-readable JSON instead of text
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create a new project at the first stage
    Init { project_id: String },
    /// Show a project's current state
    Status { project_id: String },
    /// Merge a JSON object into a project's metadata
    Update {
        project_id: String,
        /// JSON merge patch, e.g. '{"owner": "ops"}'
        patch: String,
    },
    /// List retained checkpoints, oldest first
    Checkpoints { project_id: String },
    /// List dead letters of failed attempts
    DeadLetters {
        project_id: String,
        #[arg(long)]
        stage: Option<String>,
        #[arg(long)]
        agent: Option<String>,
        /// Show counts by stage and agent instead of the letters
        #[arg(long)]
        stats: bool,
    },
    /// Query the transition audit log
    Transitions {
        project_id: String,
        #[arg(long)]
        stage: Option<String>,
        #[arg(long)]
        event: Option<String>,
        /// Keep only the most recent N records
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Restore progress from the most recent checkpoint
    Recover { project_id: String },
    /// Dispatch one stage through the configured agent command
    Run {
        project_id: String,
        /// Stage to run (defaults to the project's current stage)
        #[arg(short, long)]
        stage: Option<String>,
        /// Extra context files for the agent (must live under the root)
        #[arg(long = "context")]
        context_files: Vec<PathBuf>,
    },
    /// Recover, then dispatch stages until the project completes, fails or escalates
    RunAll { project_id: String },
    /// Inspect or reset circuit breaker ceilings
    Breaker {
        #[command(subcommand)]
        command: BreakerCommands,
    },
    /// Inspect or resolve the feedback loop
    Feedback {
        #[command(subcommand)]
        command: FeedbackCommands,
    },
    /// Check a task-graph JSON file for cycles, orphans, missing dependencies and estimate outliers
    ValidateGraph { file: PathBuf },
    /// Model usage report for a project
    Usage { project_id: String },
    /// View, validate or create configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum BreakerCommands {
    /// Show counters against their ceilings
    Status { project_id: String },
    /// Reset one ceiling: invocations, comment_rate or consecutive_failures
    Reset { project_id: String, ceiling: String },
    /// Check and count one guarded action: invoke or comment
    Check { project_id: String, action: String },
}

#[derive(Subcommand, Clone)]
pub enum FeedbackCommands {
    /// Show iterations used and remaining
    Status { project_id: String },
    /// Clear a feedback-loop escalation so the validate stage can run again
    Resolve { project_id: String },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show the effective configuration
    Show,
    /// Validate the configuration file
    Validate,
    /// Write a default stagewarden.toml
    Init,
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default.into()),
        )
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let base_dir = std::env::current_dir().context("Failed to get current directory")?;

    match &cli.command {
        Commands::Config { command } => {
            cmd::cmd_config(&cli, &base_dir, command.clone().unwrap_or(ConfigCommands::Show))?
        }
        Commands::ValidateGraph { file } => cmd::cmd_validate_graph(&cli, &base_dir, file)?,
        command => {
            let engine = cmd::Engine::open(&cli, &base_dir)?;
            match command {
                Commands::Init { project_id } => cmd::cmd_init(&engine, project_id)?,
                Commands::Status { project_id } => cmd::cmd_status(&engine, &cli, project_id)?,
                Commands::Update { project_id, patch } => {
                    cmd::cmd_update(&engine, &cli, project_id, patch)?
                }
                Commands::Checkpoints { project_id } => {
                    cmd::cmd_checkpoints(&engine, &cli, project_id)?
                }
                Commands::DeadLetters {
                    project_id,
                    stage,
                    agent,
                    stats,
                } => cmd::cmd_dead_letters(
                    &engine,
                    &cli,
                    project_id,
                    stage.as_deref(),
                    agent.clone(),
                    *stats,
                )?,
                Commands::Transitions {
                    project_id,
                    stage,
                    event,
                    limit,
                } => cmd::cmd_transitions(
                    &engine,
                    &cli,
                    project_id,
                    stage.as_deref(),
                    event.as_deref(),
                    *limit,
                )?,
                Commands::Recover { project_id } => cmd::cmd_recover(&engine, project_id)?,
                Commands::Run {
                    project_id,
                    stage,
                    context_files,
                } => {
                    cmd::cmd_run(&engine, project_id, stage.as_deref(), context_files.clone())
                        .await?
                }
                Commands::RunAll { project_id } => cmd::cmd_run_all(&engine, project_id).await?,
                Commands::Breaker { command } => cmd::cmd_breaker(&engine, &cli, command.clone())?,
                Commands::Feedback { command } => {
                    cmd::cmd_feedback(&engine, &cli, command.clone())?
                }
                Commands::Usage { project_id } => cmd::cmd_usage(&engine, &cli, project_id)?,
                Commands::Config { .. } | Commands::ValidateGraph { .. } => {}
            }
        }
    }

    Ok(())
}
