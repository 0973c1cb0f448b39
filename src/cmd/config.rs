//! Configuration view and validation commands — `stagewarden config`.

use anyhow::{Context, Result, bail};
use console::style;
use std::path::{Path, PathBuf};

use stagewarden::config::{CONFIG_DIR, CONFIG_FILE, EngineConfig};

use super::load_config;
use crate::{Cli, ConfigCommands};

fn config_path(cli: &Cli, base_dir: &Path) -> PathBuf {
    cli.config
        .clone()
        .unwrap_or_else(|| base_dir.join(CONFIG_DIR).join(CONFIG_FILE))
}

pub fn cmd_config(cli: &Cli, base_dir: &Path, command: ConfigCommands) -> Result<()> {
    let path = config_path(cli, base_dir);
    match command {
        ConfigCommands::Show => {
            if path.exists() {
                println!("# Config file: {}", path.display());
            } else {
                println!("# No config file at {}; showing defaults", path.display());
            }
            let config = load_config(cli, base_dir)?;
            let rendered =
                toml::to_string_pretty(&config).context("Failed to render configuration")?;
            println!("{}", rendered);
        }
        ConfigCommands::Validate => {
            if !path.exists() {
                println!("No config file at {}; defaults apply.", path.display());
                return Ok(());
            }
            let config = EngineConfig::load(&path)?;
            println!("{} {}", style("Configuration is valid:").green(), path.display());
            println!(
                "  ceilings: {} invocations, {} comments/hour, {} consecutive failures",
                config.limits.max_agent_invocations,
                config.limits.max_comments_per_hour,
                config.limits.max_consecutive_failures
            );
            let (refine, validate) = config.feedback_pair();
            println!(
                "  feedback: {} -> {}, at most {} revision(s)",
                refine, validate, config.feedback.max_iterations
            );
            if config.invoker.command.is_none() {
                println!(
                    "  {} no [invoker] command set; `run` and `run-all` are unavailable",
                    style("note:").yellow()
                );
            }
        }
        ConfigCommands::Init => {
            if path.exists() {
                bail!("Config file already exists at {}", path.display());
            }
            EngineConfig::default().save(&path)?;
            println!("Wrote default configuration to {}", path.display());
        }
    }
    Ok(())
}
