//! Task-graph validation — `stagewarden validate-graph`.

use anyhow::{Context, Result, bail};
use console::style;
use std::path::Path;

use stagewarden::feedback::SimulationReport;
use stagewarden::feedback::graph::{GraphReport, TaskGraph};

use super::{load_config, print_json};
use crate::Cli;

/// Accepts either a bare task graph or a simulation report carrying one.
fn read_graph(file: &Path) -> Result<TaskGraph> {
    let content = std::fs::read_to_string(file)
        .with_context(|| format!("Failed to read {}", file.display()))?;
    if let Ok(graph) = serde_json::from_str::<TaskGraph>(&content) {
        return Ok(graph);
    }
    let report: SimulationReport = serde_json::from_str(&content)
        .with_context(|| format!("{} is not a task graph or simulation report", file.display()))?;
    report
        .task_graph
        .with_context(|| format!("{} carries no task_graph", file.display()))
}

pub fn cmd_validate_graph(cli: &Cli, base_dir: &Path, file: &Path) -> Result<()> {
    let config = load_config(cli, base_dir)?;
    let graph = read_graph(file)?;
    let report = GraphReport::analyze(&graph, &config.feedback.estimates);

    if cli.json {
        print_json(&report)?;
    } else {
        println!("{} task(s) checked", graph.tasks.len());
        for finding in report.blocking_findings() {
            println!("{} {}", style("error:").red().bold(), finding);
        }
        for advisory in report.advisories() {
            println!("{} {}", style("warning:").yellow(), advisory);
        }
        if !report.is_blocking() {
            println!("{}", style("No structural problems found.").green());
        }
    }

    if report.is_blocking() {
        bail!(
            "Task graph has {} structural problem(s)",
            report.blocking_findings().len()
        );
    }
    Ok(())
}
