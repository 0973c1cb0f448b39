//! CLI command implementations.
//!
//! Each submodule owns one or more related `Commands` variants:
//!
//! | Module     | Commands handled                                   |
//! |------------|----------------------------------------------------|
//! | `project`  | `Init`, `Status`, `Update`, `Recover`              |
//! | `history`  | `Checkpoints`, `DeadLetters`, `Transitions`        |
//! | `run`      | `Run`, `RunAll`                                    |
//! | `safety`   | `Breaker`, `Feedback`                              |
//! | `graph`    | `ValidateGraph`                                    |
//! | `usage`    | `Usage`                                            |
//! | `config`   | `Config`                                           |

pub mod config;
pub mod graph;
pub mod history;
pub mod project;
pub mod run;
pub mod safety;
pub mod usage;

pub use config::cmd_config;
pub use graph::cmd_validate_graph;
pub use history::{cmd_checkpoints, cmd_dead_letters, cmd_transitions};
pub use project::{cmd_init, cmd_recover, cmd_status, cmd_update};
pub use run::{cmd_run, cmd_run_all};
pub use safety::{cmd_breaker, cmd_feedback};
pub use usage::cmd_usage;

use anyhow::{Context, Result};
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;

use stagewarden::breaker::CircuitBreaker;
use stagewarden::config::EngineConfig;
use stagewarden::dispatch::{CommandInvoker, Dispatcher};
use stagewarden::feedback::FeedbackLoopController;
use stagewarden::notify::{LogSink, NotificationSink};
use stagewarden::state::{ProjectId, StateManager};

use super::Cli;

/// Resolve configuration from the config file, environment and CLI flags.
pub fn load_config(cli: &Cli, base_dir: &Path) -> Result<EngineConfig> {
    EngineConfig::resolve(base_dir, cli.config.as_deref(), cli.root.clone())
        .context("Failed to load configuration")
}

/// Engine components shared by the project commands.
pub struct Engine {
    pub config: Arc<EngineConfig>,
    pub state: Arc<StateManager>,
    pub notifier: Arc<dyn NotificationSink>,
}

impl Engine {
    pub fn open(cli: &Cli, base_dir: &Path) -> Result<Self> {
        let config = Arc::new(load_config(cli, base_dir)?);
        let state = Arc::new(StateManager::open(config.clone()).with_context(|| {
            format!("Failed to open project store at {}", config.store.root.display())
        })?);
        let notifier: Arc<dyn NotificationSink> =
            Arc::new(LogSink::new(config.escalation.notify.clone()));
        Ok(Self {
            config,
            state,
            notifier,
        })
    }

    pub fn breaker(&self) -> CircuitBreaker {
        CircuitBreaker::new(self.state.clone(), self.notifier.clone())
    }

    pub fn feedback(&self) -> FeedbackLoopController {
        FeedbackLoopController::new(self.state.clone(), self.notifier.clone())
    }

    /// Dispatcher backed by the configured `[invoker]` command.
    pub fn dispatcher(&self) -> Result<Dispatcher> {
        let invoker = CommandInvoker::from_config(&self.config.invoker).context(
            "No agent command configured. Set [invoker] command in stagewarden.toml",
        )?;
        Ok(Dispatcher::new(
            self.state.clone(),
            Arc::new(invoker),
            self.notifier.clone(),
        )?)
    }
}

pub fn parse_id(raw: &str) -> Result<ProjectId> {
    Ok(ProjectId::parse(raw)?)
}

pub fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
