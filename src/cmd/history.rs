//! Checkpoint, dead-letter and audit-log inspection.

use anyhow::Result;
use console::style;

use stagewarden::stage::Stage;
use stagewarden::state::{DeadLetterFilter, TransitionEvent, TransitionQuery};

use super::{Engine, parse_id, print_json};
use crate::Cli;

pub fn cmd_checkpoints(engine: &Engine, cli: &Cli, raw_id: &str) -> Result<()> {
    let checkpoints = engine.state.list_checkpoints(&parse_id(raw_id)?)?;
    if cli.json {
        return print_json(&checkpoints);
    }
    if checkpoints.is_empty() {
        println!("No checkpoints yet.");
        return Ok(());
    }
    println!("{:<6} {:<14} {:<10} {:<10} Created", "Seq", "Id", "Stage", "Resume");
    println!("{:<6} {:<14} {:<10} {:<10} -------", "---", "--", "-----", "------");
    for checkpoint in &checkpoints {
        println!(
            "{:<6} {:<14} {:<10} {:<10} {}",
            checkpoint.seq,
            checkpoint.id,
            checkpoint.stage,
            checkpoint
                .state
                .recovery_info
                .resume_from_stage
                .map(|s| s.to_string())
                .unwrap_or_else(|| "-".to_string()),
            checkpoint.created_at.format("%Y-%m-%d %H:%M:%S")
        );
    }
    Ok(())
}

pub fn cmd_dead_letters(
    engine: &Engine,
    cli: &Cli,
    raw_id: &str,
    stage: Option<&str>,
    agent: Option<String>,
    stats: bool,
) -> Result<()> {
    let id = parse_id(raw_id)?;
    if stats {
        let stats = engine.state.dead_letter_stats(&id)?;
        if cli.json {
            return print_json(&stats);
        }
        println!("Dead letters: {}", stats.total);
        for (stage, count) in &stats.by_stage {
            println!("  stage {:<10} {}", stage, count);
        }
        for (agent, count) in &stats.by_agent {
            println!("  agent {:<10} {}", agent, count);
        }
        return Ok(());
    }

    let filter = DeadLetterFilter {
        stage: stage.map(str::parse::<Stage>).transpose()?,
        agent,
    };
    let letters = engine.state.list_dead_letters(&id, &filter)?;
    if cli.json {
        return print_json(&letters);
    }
    if letters.is_empty() {
        println!("No dead letters.");
        return Ok(());
    }
    for letter in &letters {
        let kind = if letter.retryable {
            style("retryable").yellow()
        } else {
            style("fatal").red()
        };
        println!(
            "#{} {} {} attempt {} by {} [{}]",
            letter.seq,
            letter.timestamp.format("%Y-%m-%d %H:%M:%S"),
            letter.stage,
            letter.attempt,
            letter.agent,
            kind
        );
        println!("    {}", letter.error);
    }
    Ok(())
}

pub fn cmd_transitions(
    engine: &Engine,
    cli: &Cli,
    raw_id: &str,
    stage: Option<&str>,
    event: Option<&str>,
    limit: Option<usize>,
) -> Result<()> {
    let query = TransitionQuery {
        event: event
            .map(str::parse::<TransitionEvent>)
            .transpose()
            .map_err(anyhow::Error::msg)?,
        stage: stage.map(str::parse::<Stage>).transpose()?,
        limit,
    };
    let transitions = engine.state.get_transitions(&parse_id(raw_id)?, &query)?;
    if cli.json {
        return print_json(&transitions);
    }
    for transition in &transitions {
        println!(
            "{} {:<20} {:<10} {}{}",
            transition.timestamp.format("%Y-%m-%d %H:%M:%S%.3f"),
            transition.event_type,
            transition.stage,
            transition.agent.as_deref().unwrap_or("-"),
            transition
                .details
                .as_ref()
                .map(|d| format!(" {}", style(d).dim()))
                .unwrap_or_default()
        );
    }
    Ok(())
}
