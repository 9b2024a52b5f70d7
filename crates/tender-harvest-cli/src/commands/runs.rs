//! `tender-harvest runs`: list persisted runs.

use anyhow::{anyhow, Result};

use tender_harvest::store::RunFilter;
use tender_harvest::types::{Run, RunStatus};

use super::Context;
use crate::output;

pub fn parse_status(raw: &str) -> Result<RunStatus, String> {
    RunStatus::parse(raw).ok_or_else(|| {
        format!("unknown status {raw:?} (running, completed, timeout_auto_cleaned, cancelled, error)")
    })
}

pub fn run(ctx: &Context, filter: RunFilter) -> Result<Vec<Run>> {
    let store = ctx.open_store()?;
    let runs = store.list_runs(&filter)?;

    if output::is_json() {
        output::print_json(&runs);
    } else if runs.is_empty() {
        output::say("No runs.");
    } else {
        output::say(output::run_table_header());
        for run in &runs {
            output::say(output::format_run_row(run));
        }
    }
    Ok(runs)
}

/// `runs show <id>`.
pub fn show(ctx: &Context, run_id: i64) -> Result<Run> {
    let store = ctx.open_store()?;
    let run = store
        .get_run(run_id)?
        .ok_or_else(|| anyhow!("no run with id {run_id}"))?;

    if output::is_json() {
        output::print_json(&run);
    } else {
        output::say(output::run_table_header());
        output::say(output::format_run_row(&run));
        if let Some(done) = run.completed_at {
            output::say(format!(
                "  completed {} after {}",
                done.format("%Y-%m-%d %H:%M"),
                output::format_elapsed(done - run.started_at)
            ));
        }
    }
    Ok(run)
}
