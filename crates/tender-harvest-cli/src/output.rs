//! Output helpers shared by every command.
//!
//! Global flags are mirrored into `HARVEST_JSON` / `HARVEST_QUIET` by `main`
//! so handlers can check them without threading the flags through.

use serde::Serialize;

use tender_harvest::types::{Run, RunSummary};

pub fn is_json() -> bool {
    std::env::var("HARVEST_JSON").is_ok_and(|v| v == "1")
}

pub fn is_quiet() -> bool {
    std::env::var("HARVEST_QUIET").is_ok_and(|v| v == "1")
}

pub fn print_json<T: Serialize + ?Sized>(value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(text) => println!("{text}"),
        Err(e) => eprintln!("  Error: could not encode output: {e}"),
    }
}

/// Print `text` unless `--quiet` or `--json` is set.
pub fn say(text: impl AsRef<str>) {
    if !is_quiet() && !is_json() {
        println!("{}", text.as_ref());
    }
}

/// Human-readable run summary block.
pub fn format_summary(summary: &RunSummary) -> String {
    let mut out = format!(
        "Run {} ({}) finished: {}\n",
        summary.run_id, summary.target, summary.status
    );
    out.push_str(&format!(
        "  units     attempted {:>6}   resumed {:>6}\n",
        summary.attempted, summary.resumed
    ));
    out.push_str(&format!(
        "  records   expected  {:>6}   extracted {:>4}   skipped {:>4}   reprocessed {:>4}\n",
        summary.expected, summary.extracted, summary.skipped_existing, summary.reprocessed
    ));
    out.push_str(&format!("  errors    {:>6}\n", summary.errors));
    if !summary.requeued_units.is_empty() {
        out.push_str(&format!("  requeued  {}\n", summary.requeued_units.join(", ")));
    }
    if !summary.missing_units.is_empty() {
        out.push_str(&format!("  missing   {}\n", summary.missing_units.join(", ")));
    }
    if let Some(failure) = &summary.failure {
        out.push_str(&format!("  failure   {failure}\n"));
    }
    out.push_str(&format!(
        "  elapsed   {}",
        format_elapsed(summary.completed_at - summary.started_at)
    ));
    out
}

/// One table line per run.
pub fn format_run_row(run: &Run) -> String {
    format!(
        "{:>6}  {:<24} {:<20} {}  {:>6} {:>6} {:>6} {:>6} {:>4}",
        run.id,
        truncate(&run.target, 24),
        run.status.as_str(),
        run.started_at.format("%Y-%m-%d %H:%M"),
        run.expected_count,
        run.extracted_count,
        run.skipped_existing_count,
        run.reprocessed_count,
        run.error_count,
    )
}

pub fn run_table_header() -> String {
    format!(
        "{:>6}  {:<24} {:<20} {:<16}  {:>6} {:>6} {:>6} {:>6} {:>4}",
        "ID", "TARGET", "STATUS", "STARTED", "EXPECT", "EXTR", "SKIP", "REPR", "ERR"
    )
}

pub fn format_elapsed(d: chrono::Duration) -> String {
    let secs = d.num_seconds().max(0);
    if secs >= 3600 {
        format!("{}h{:02}m", secs / 3600, (secs % 3600) / 60)
    } else if secs >= 60 {
        format!("{}m{:02}s", secs / 60, secs % 60)
    } else {
        format!("{secs}s")
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let mut cut: String = s.chars().take(max.saturating_sub(1)).collect();
        cut.push('…');
        cut
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_elapsed() {
        assert_eq!(format_elapsed(chrono::Duration::seconds(42)), "42s");
        assert_eq!(format_elapsed(chrono::Duration::seconds(125)), "2m05s");
        assert_eq!(format_elapsed(chrono::Duration::seconds(3_720)), "1h02m");
        assert_eq!(format_elapsed(chrono::Duration::seconds(-5)), "0s");
    }

    #[test]
    fn test_truncate_long_target_names() {
        assert_eq!(truncate("kpwd", 24), "kpwd");
        let cut = truncate("Central Public Procurement Portal", 10);
        assert_eq!(cut.chars().count(), 10);
        assert!(cut.ends_with('…'));
    }
}
