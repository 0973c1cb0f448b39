//! Circuit breaker and feedback loop commands.

use anyhow::{Result, bail};
use console::style;

use stagewarden::breaker::{ActionKind, Decision, parse_ceiling};

use super::{Engine, parse_id, print_json};
use crate::{BreakerCommands, Cli, FeedbackCommands};

pub fn cmd_breaker(engine: &Engine, cli: &Cli, command: BreakerCommands) -> Result<()> {
    let breaker = engine.breaker();
    match command {
        BreakerCommands::Status { project_id } => {
            let status = breaker.status(&parse_id(&project_id)?)?;
            if cli.json {
                return print_json(&status);
            }
            println!(
                "invocations:          {}/{} ({} lifetime)",
                status.invocations_used, status.invocation_limit, status.lifetime_invocations
            );
            println!(
                "comments (last hour): {}/{}",
                status.comments_last_hour, status.comment_limit
            );
            if status.consecutive_failures.is_empty() {
                println!("consecutive failures: none");
            }
            for (stage, count) in &status.consecutive_failures {
                println!(
                    "consecutive failures: {} at '{}' (limit {})",
                    count, stage, status.failure_limit
                );
            }
            if status.is_tripped() {
                let tripped: Vec<String> = status.tripped.iter().map(|c| c.to_string()).collect();
                println!("{} {}", style("TRIPPED:").red().bold(), tripped.join(", "));
            }
            if let Some(reason) = &status.escalation_reason {
                println!("escalation: {}", reason);
            }
        }
        BreakerCommands::Reset {
            project_id,
            ceiling,
        } => {
            let ceiling = parse_ceiling(&ceiling)?;
            let project = breaker.reset(&parse_id(&project_id)?, ceiling)?;
            println!(
                "Reset '{}' for {}; status is now {}",
                ceiling, project.id, project.status
            );
        }
        BreakerCommands::Check { project_id, action } => {
            let action = match action.as_str() {
                "invoke" => ActionKind::Invoke,
                "comment" => ActionKind::Comment,
                other => bail!("Unknown action '{}' (expected invoke or comment)", other),
            };
            match breaker.check_and_increment(&parse_id(&project_id)?, action)? {
                Decision::Allowed => println!("allowed"),
                Decision::Denied { reason } => bail!("Denied: {}", reason),
            }
        }
    }
    Ok(())
}

pub fn cmd_feedback(engine: &Engine, cli: &Cli, command: FeedbackCommands) -> Result<()> {
    let feedback = engine.feedback();
    match command {
        FeedbackCommands::Status { project_id } => {
            let stats = feedback.stats(&parse_id(&project_id)?)?;
            if cli.json {
                return print_json(&stats);
            }
            println!(
                "loop {} -> {}: {} of {} revision(s) used, {} remaining{}",
                stats.refine_stage,
                stats.validate_stage,
                stats.iterations_used,
                stats.max_iterations,
                stats.remaining,
                if stats.active { "" } else { " (inactive)" }
            );
            for finding in &stats.findings {
                println!("  - {}", finding);
            }
            if stats.archived_loops > 0 {
                println!("{} finished loop(s) archived", stats.archived_loops);
            }
        }
        FeedbackCommands::Resolve { project_id } => {
            let project = feedback.resolve(&parse_id(&project_id)?)?;
            println!(
                "Resolved feedback escalation for {}; resume at '{}' ({})",
                project.id, project.current_stage, project.status
            );
        }
    }
    Ok(())
}
