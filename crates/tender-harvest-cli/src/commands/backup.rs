//! `tender-harvest backup`: run a sweep now, or list artifacts.

use anyhow::Result;
use chrono::Utc;

use tender_harvest::backup::{backup_sweep, list_artifacts, BackupArtifact, SweepReport};

use super::Context;
use crate::output;

pub fn sweep(ctx: &Context) -> Result<SweepReport> {
    let store = ctx.open_store()?;
    let root = ctx.config.backup_dir();
    let report = backup_sweep(&store, &root, &ctx.config.backup_policy, Utc::now())?;

    if output::is_json() {
        output::print_json(&report);
    } else {
        for artifact in &report.created {
            output::say(format!("  created  {}", artifact.path.display()));
        }
        for artifact in &report.pruned {
            output::say(format!("  pruned   {}", artifact.path.display()));
        }
        output::say(format!(
            "Backups under {}: {} created, {} pruned, {} retained",
            root.display(),
            report.created.len(),
            report.pruned.len(),
            report.retained
        ));
    }
    Ok(report)
}

pub fn list(ctx: &Context) -> Result<Vec<BackupArtifact>> {
    let artifacts = list_artifacts(&ctx.config.backup_dir())?;
    if output::is_json() {
        output::print_json(&artifacts);
    } else if artifacts.is_empty() {
        output::say("No backups.");
    } else {
        for a in &artifacts {
            output::say(format!(
                "  {:<8} {}  {}",
                a.tier.as_str(),
                a.created_at.format("%Y-%m-%d"),
                a.path.display()
            ));
        }
    }
    Ok(artifacts)
}
