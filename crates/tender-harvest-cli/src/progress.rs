//! Terminal progress for `run`.

use std::time::Duration;

use indicatif::{ProgressBar, ProgressStyle};

use tender_harvest::observer::{LogLevel, RunObserver};
use tender_harvest::types::{RunSummary, UnitCounts};

/// Drives a progress bar with one tick per finished unit. Log lines are
/// printed above the bar.
pub struct ProgressObserver {
    bar: ProgressBar,
}

impl ProgressObserver {
    pub fn new(units: u64, target: &str) -> Self {
        let bar = ProgressBar::new(units);
        bar.set_style(
            ProgressStyle::default_bar()
                .template("{msg}\n{spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {pos}/{len} units")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("#>-"),
        );
        bar.set_message(format!("Harvesting {target}"));
        bar.enable_steady_tick(Duration::from_millis(100));
        Self { bar }
    }

    /// A bar that never draws, for `--quiet` and `--json`.
    pub fn hidden() -> Self {
        Self {
            bar: ProgressBar::hidden(),
        }
    }
}

impl RunObserver for ProgressObserver {
    fn on_unit_start(&self, unit: &str) {
        tracing::debug!(unit, "unit started");
    }

    fn on_unit_done(&self, unit: &str, counts: &UnitCounts) {
        self.bar.inc(1);
        tracing::info!(
            unit,
            raw = counts.raw,
            new = counts.new,
            skipped = counts.skipped_existing,
            reprocessed = counts.reprocessed,
            "unit done"
        );
    }

    fn on_run_done(&self, summary: &RunSummary) {
        self.bar
            .finish_with_message(format!("{}: {}", summary.target, summary.status));
    }

    fn on_log(&self, level: LogLevel, message: &str) {
        match level {
            LogLevel::Warn | LogLevel::Error => self.bar.println(format!("  ! {message}")),
            _ => tracing::debug!("{message}"),
        }
    }
}
