//! `tender-harvest checkpoint`: inspect or discard saved progress.

use anyhow::Result;
use serde_json::json;

use tender_harvest::checkpoint::{CheckpointState, LoadOutcome};

use super::Context;
use crate::output;

pub fn show(ctx: &Context, target: &str) -> Result<()> {
    let manager = ctx.checkpoints();
    let path = manager.path_for(target);
    match manager.inspect(target) {
        LoadOutcome::Absent => {
            if output::is_json() {
                output::print_json(&json!({"target": target, "state": "absent"}));
            } else {
                output::say(format!("No checkpoint for {target:?} ({})", path.display()));
            }
        }
        LoadOutcome::Corrupt(reason) => {
            if output::is_json() {
                output::print_json(&json!({"target": target, "state": "corrupt", "reason": reason}));
            } else {
                output::say(format!(
                    "Checkpoint for {target:?} is corrupt and will be ignored: {reason}"
                ));
            }
        }
        LoadOutcome::Loaded(state) => {
            if output::is_json() {
                output::print_json(&json!({
                    "target": target,
                    "state": "loaded",
                    "checkpoint": describe(&state),
                }));
            } else {
                output::say(format!("Checkpoint for {target:?} ({})", path.display()));
                output::say(format_state(&state));
            }
        }
    }
    Ok(())
}

pub fn list(ctx: &Context) -> Result<Vec<CheckpointState>> {
    let states = ctx.checkpoints().list()?;
    if output::is_json() {
        output::print_json(&states.iter().map(describe).collect::<Vec<_>>());
    } else if states.is_empty() {
        output::say("No checkpoints.");
    } else {
        for state in &states {
            output::say(format!("{}:", state.target));
            output::say(format_state(state));
        }
    }
    Ok(states)
}

pub fn clear(ctx: &Context, target: &str) -> Result<()> {
    ctx.checkpoints().clear(target)?;
    output::say(format!("Checkpoint for {target:?} cleared."));
    Ok(())
}

fn describe(state: &CheckpointState) -> serde_json::Value {
    json!({
        "target": state.target,
        "run_id": state.run_id,
        "saved_at": state.saved_at,
        "processed_units": state.processed_units,
        "records": state.accumulated.len(),
        "skipped": state.skipped_ids.len(),
        "errors": state.errors,
    })
}

fn format_state(state: &CheckpointState) -> String {
    let units: Vec<&str> = state.processed_units.iter().map(String::as_str).collect();
    format!(
        "  run        {}\n  saved      {}\n  records    {}\n  skipped    {}\n  errors     {}\n  units      {}",
        state
            .run_id
            .map(|id| id.to_string())
            .unwrap_or_else(|| "-".into()),
        state.saved_at.format("%Y-%m-%d %H:%M:%S"),
        state.accumulated.len(),
        state.skipped_ids.len(),
        state.errors,
        if units.is_empty() { "-".to_string() } else { units.join(", ") },
    )
}
