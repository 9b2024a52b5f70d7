//! `tender-harvest reclaim`: move dead `running` rows to
//! `timeout_auto_cleaned`.

use anyhow::Result;
use chrono::Utc;

use tender_harvest::reclaim::{reclaim, ReclaimMode, ReclaimPolicy, ReclaimReport};

use super::Context;
use crate::confirm::Prompt;
use crate::output;

pub fn run(ctx: &Context, mode: ReclaimMode, min_age_hours: Option<i64>) -> Result<ReclaimReport> {
    let policy = match min_age_hours {
        Some(hours) => ReclaimPolicy::with_min_age_hours(hours)?,
        None => ReclaimPolicy::default(),
    };
    let store = ctx.open_store()?;
    let checkpoints = ctx.checkpoints();

    let mut prompt = match mode {
        ReclaimMode::Interactive => Some(Prompt::new()?),
        _ => None,
    };
    let report = reclaim(&store, &checkpoints, &policy, mode, Utc::now(), |candidate| {
        let question = format!(
            "Reclaim run {} ({}, started {}, {}h old)?",
            candidate.run.id,
            candidate.run.target,
            candidate.run.started_at.format("%Y-%m-%d %H:%M"),
            candidate.age_hours
        );
        prompt.as_mut().is_some_and(|p| p.confirm(&question))
    })?;

    print_report(&report, mode, &policy);
    Ok(report)
}

fn print_report(report: &ReclaimReport, mode: ReclaimMode, policy: &ReclaimPolicy) {
    if output::is_json() {
        output::print_json(report);
        return;
    }

    output::say(format!(
        "Stale runs older than {}h: {} dead, {} resumable",
        policy.min_age().num_hours(),
        report.candidates.len(),
        report.resumable.len()
    ));
    for candidate in &report.candidates {
        let action = if report.reclaimed.contains(&candidate.run.id) {
            "reclaimed"
        } else if mode == ReclaimMode::DryRun {
            "would reclaim"
        } else {
            "left running"
        };
        output::say(format!(
            "  run {:>6}  {:<24} {:>4}h  {action}",
            candidate.run.id, candidate.run.target, candidate.age_hours
        ));
    }
    for id in &report.resumable {
        output::say(format!("  run {id:>6}  resumable, left alone"));
    }
}
