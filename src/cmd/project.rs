//! Project lifecycle commands.

use anyhow::{Context, Result};
use console::style;

use stagewarden::state::{Project, ProjectStatus};

use super::{Engine, parse_id, print_json};
use crate::Cli;

pub fn cmd_init(engine: &Engine, raw_id: &str) -> Result<()> {
    let project = engine.state.initialize_project(raw_id)?;
    println!(
        "Initialized {} at stage '{}'",
        style(&project.id).bold(),
        project.current_stage
    );
    Ok(())
}

pub fn cmd_status(engine: &Engine, cli: &Cli, raw_id: &str) -> Result<()> {
    let project = engine.state.get_state(&parse_id(raw_id)?)?;
    if cli.json {
        return print_json(&project);
    }
    print_project(&project);
    Ok(())
}

pub fn cmd_update(engine: &Engine, cli: &Cli, raw_id: &str, patch: &str) -> Result<()> {
    let id = parse_id(raw_id)?;
    let patch: serde_json::Value =
        serde_json::from_str(patch).context("Patch is not valid JSON")?;
    let project = engine.state.update_state(&id, &patch)?;
    if cli.json {
        return print_json(&project.metadata);
    }
    println!("Updated metadata for {}", id);
    Ok(())
}

pub fn cmd_recover(engine: &Engine, raw_id: &str) -> Result<()> {
    let project = engine.state.recover(&parse_id(raw_id)?)?;
    println!(
        "Recovered {}: status {}, resume from {}",
        style(&project.id).bold(),
        status_label(project.status),
        project
            .recovery_info
            .resume_from_stage
            .map(|s| s.to_string())
            .unwrap_or_else(|| "-".to_string())
    );
    if let Some(checkpoint) = &project.recovery_info.last_checkpoint {
        println!("  checkpoint: {}", checkpoint);
    }
    Ok(())
}

fn status_label(status: ProjectStatus) -> String {
    let label = status.as_str();
    match status {
        ProjectStatus::Completed => style(label).green().to_string(),
        ProjectStatus::Failed => style(label).red().to_string(),
        ProjectStatus::Escalated => style(label).yellow().bold().to_string(),
        ProjectStatus::InProgress => style(label).cyan().to_string(),
        ProjectStatus::Pending => label.to_string(),
    }
}

fn print_project(project: &Project) {
    println!();
    println!("{}", style(&project.id).bold());
    println!("  status:        {}", status_label(project.status));
    if let Some(reason) = &project.status_reason {
        println!("  reason:        {}", reason);
    }
    println!("  current stage: {}", project.current_stage);
    println!("  invocations:   {}", project.agent_invocations);
    println!("  errors:        {}", project.errors.len());
    println!("  created:       {}", project.created_at.format("%Y-%m-%d %H:%M:%S UTC"));
    println!("  updated:       {}", project.last_updated.format("%Y-%m-%d %H:%M:%S UTC"));
    if let Some(checkpoint) = &project.recovery_info.last_checkpoint {
        println!("  checkpoint:    {}", checkpoint);
    }
    println!();

    println!("{:<10} {:<10} {:<12} {:<9} Duration", "Stage", "State", "Agent", "Attempts");
    println!("{:<10} {:<10} {:<12} {:<9} --------", "-----", "-----", "-----", "--------");
    for stage in stagewarden::stage::Stage::ALL {
        let record = project.stages.get(&stage);
        let state = if project.has_completed(stage) {
            style("done").green().to_string()
        } else if stage == project.current_stage && !project.is_completed() {
            style("current").cyan().to_string()
        } else {
            style("-").dim().to_string()
        };
        println!(
            "{:<10} {:<10} {:<12} {:<9} {}",
            stage,
            state,
            record.and_then(|r| r.agent.as_deref()).unwrap_or("-"),
            record.map(|r| r.attempts).unwrap_or(0),
            record
                .and_then(|r| r.duration_secs)
                .map(|d| format!("{:.1}s", d))
                .unwrap_or_else(|| "-".to_string())
        );
    }

    if let Some(escalation) = &project.escalation {
        println!();
        println!(
            "{} {} (at stage '{}')",
            style("Escalated:").yellow().bold(),
            escalation.reason,
            escalation.stage
        );
    }
    if let Some(error) = project.errors.last() {
        println!();
        println!("Last error ({}): {}", error.stage, error.message);
    }
    println!();
}
