//! `tender-harvest run`: execute one target.

use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context as _, Result};
use tokio_util::sync::CancellationToken;

use tender_harvest::config::TargetConfig;
use tender_harvest::delta::VerifyMode;
use tender_harvest::renderer::{default_launcher, Launcher};
use tender_harvest::types::{RunStatus, RunSummary, WorkUnit};
use tender_harvest::Orchestrator;

use super::Context;
use crate::output;
use crate::progress::ProgressObserver;

#[derive(Debug, Clone, Default)]
pub struct RunArgs {
    pub concurrency: Option<usize>,
    pub verify: Option<VerifyMode>,
    /// Restrict the run to these unit names.
    pub only_units: Vec<String>,
}

/// clap value parser for `--verify`.
pub fn parse_verify(raw: &str) -> Result<VerifyMode, String> {
    VerifyMode::parse(raw).ok_or_else(|| format!("unknown verify mode {raw:?} (none, quick, full, both)"))
}

/// Units to run: the target's listing, optionally narrowed by name.
pub fn select_units(target: &TargetConfig, only: &[String]) -> Result<Vec<WorkUnit>> {
    if only.is_empty() {
        return Ok(target.units.clone());
    }
    if let Some(unknown) = only.iter().find(|n| !target.units.iter().any(|u| u.name == **n)) {
        bail!("target {:?} has no unit named {unknown:?}", target.name);
    }
    Ok(target
        .units
        .iter()
        .filter(|u| only.contains(&u.name))
        .cloned()
        .collect())
}

pub async fn run(ctx: &Context, target_file: &Path, args: RunArgs) -> Result<RunSummary> {
    run_with_launcher(ctx, target_file, args, default_launcher()).await
}

pub async fn run_with_launcher(
    ctx: &Context,
    target_file: &Path,
    args: RunArgs,
    launcher: Arc<dyn Launcher>,
) -> Result<RunSummary> {
    let target = TargetConfig::load(target_file)
        .with_context(|| format!("loading target {}", target_file.display()))?;
    let units = select_units(&target, &args.only_units)?;

    let mut config = ctx.config.clone();
    if let Some(mode) = args.verify {
        config.verify_mode = mode;
    }
    let concurrency = args.concurrency.unwrap_or(config.default_concurrency).max(1);

    let observer = if output::is_quiet() || output::is_json() {
        ProgressObserver::hidden()
    } else {
        ProgressObserver::new(units.len() as u64, &target.name)
    };
    let store = Context::from_config(config.clone()).open_store()?;
    let orchestrator = Orchestrator::new(config, store, launcher).with_observer(Arc::new(observer));

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received; stopping after the current units");
            on_interrupt.cancel();
        }
    });

    let summary = orchestrator
        .execute_with_cancel(&target, &units, concurrency, cancel)
        .await;
    interrupt.abort();
    let summary = summary?;

    if output::is_json() {
        output::print_json(&summary);
    } else {
        output::say(output::format_summary(&summary));
    }

    if summary.status == RunStatus::Error {
        bail!(
            "run {} ended in error: {}",
            summary.run_id,
            summary.failure.as_deref().unwrap_or("unknown failure")
        );
    }
    Ok(summary)
}
