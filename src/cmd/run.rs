//! Stage dispatch commands.

use anyhow::{Result, bail};
use console::style;
use std::path::PathBuf;

use stagewarden::dispatch::{DispatchOutcome, DispatchRequest};
use stagewarden::stage::Stage;
use stagewarden::state::ProjectStatus;

use super::Engine;

pub async fn cmd_run(
    engine: &Engine,
    raw_id: &str,
    stage: Option<&str>,
    context_files: Vec<PathBuf>,
) -> Result<()> {
    let dispatcher = engine.dispatcher()?;
    let mut request = DispatchRequest::new(raw_id).with_context_files(context_files);
    if let Some(stage) = stage {
        request = request.with_stage(stage.parse::<Stage>()?);
    }

    let outcome = dispatcher.dispatch(&request).await?;
    report(&outcome);
    match outcome {
        DispatchOutcome::Failed { stage, reason } => {
            bail!("Stage '{}' failed: {}", stage, reason)
        }
        DispatchOutcome::Escalated { reason } => bail!("Project escalated: {}", reason),
        _ => Ok(()),
    }
}

pub async fn cmd_run_all(engine: &Engine, raw_id: &str) -> Result<()> {
    let dispatcher = engine.dispatcher()?;
    let summary = dispatcher.run_to_completion(raw_id).await?;
    for outcome in &summary.dispatches {
        report(outcome);
    }

    let project = &summary.project;
    println!();
    println!(
        "{}: {} after {} dispatch(es), {} agent invocation(s)",
        project.id,
        project.status,
        summary.dispatches.len(),
        project.agent_invocations
    );
    match project.status {
        ProjectStatus::Completed => Ok(()),
        ProjectStatus::Escalated => bail!(
            "Project escalated: {}",
            project
                .escalation
                .as_ref()
                .map(|e| e.reason.as_str())
                .unwrap_or("no reason recorded")
        ),
        ProjectStatus::Failed => bail!(
            "Project failed: {}",
            project.status_reason.as_deref().unwrap_or("no reason recorded")
        ),
        status => bail!("Project stopped while {}", status),
    }
}

fn report(outcome: &DispatchOutcome) {
    let line = outcome.to_string();
    let styled = match outcome {
        DispatchOutcome::Completed { .. } | DispatchOutcome::AlreadyCompleted { .. } => {
            style(line).green()
        }
        DispatchOutcome::Revised { .. } | DispatchOutcome::RetryPermitted { .. } => {
            style(line).yellow()
        }
        DispatchOutcome::Failed { .. } | DispatchOutcome::Escalated { .. } => {
            style(line).red().bold()
        }
    };
    println!("{}", styled);
    if let DispatchOutcome::Completed { artifact, .. } = outcome {
        println!("  artifact: {}", artifact.display());
    }
}
