//! Usage report — `stagewarden usage`.

use anyhow::Result;

use stagewarden::usage::UsageTracker;

use super::{Engine, parse_id, print_json};
use crate::Cli;

pub fn cmd_usage(engine: &Engine, cli: &Cli, raw_id: &str) -> Result<()> {
    let report = UsageTracker::new(engine.state.clone()).report(&parse_id(raw_id)?)?;
    if cli.json {
        return print_json(&report);
    }
    if report.totals.requests == 0 {
        println!("No usage recorded.");
        return Ok(());
    }

    println!(
        "{:<24} {:>8} {:>9} {:>12} {:>10}",
        "Model", "Requests", "Success", "Tokens", "Time"
    );
    for (model, totals) in &report.by_model {
        println!(
            "{:<24} {:>8} {:>8.0}% {:>12} {:>9.1}s",
            model,
            totals.requests,
            totals.success_rate() * 100.0,
            totals.total_tokens(),
            totals.duration_secs
        );
    }
    let totals = &report.totals;
    println!(
        "{:<24} {:>8} {:>8.0}% {:>12} {:>9.1}s",
        "total",
        totals.requests,
        totals.success_rate() * 100.0,
        totals.total_tokens(),
        totals.duration_secs
    );
    Ok(())
}
