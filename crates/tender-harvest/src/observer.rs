//! Run observer interface and the stock implementations.
//!
//! The orchestrator reports progress only through [`RunObserver`]; this is
//! its sole coupling to any UI. [`BroadcastObserver`] fans events out over a
//! `tokio::sync::broadcast` channel; when nobody subscribes, events are
//! dropped.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::types::{RunSummary, UnitCounts};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// Receives progress from an executing run.
pub trait RunObserver: Send + Sync {
    fn on_unit_start(&self, unit: &str);
    fn on_unit_done(&self, unit: &str, counts: &UnitCounts);
    fn on_run_done(&self, summary: &RunSummary);
    fn on_log(&self, level: LogLevel, message: &str);
}

/// Discards everything.
pub struct NullObserver;

impl RunObserver for NullObserver {
    fn on_unit_start(&self, _unit: &str) {}
    fn on_unit_done(&self, _unit: &str, _counts: &UnitCounts) {}
    fn on_run_done(&self, _summary: &RunSummary) {}
    fn on_log(&self, _level: LogLevel, _message: &str) {}
}

/// Forwards every callback to `tracing`.
pub struct TracingObserver;

impl RunObserver for TracingObserver {
    fn on_unit_start(&self, unit: &str) {
        tracing::info!(unit, "unit started");
    }

    fn on_unit_done(&self, unit: &str, counts: &UnitCounts) {
        tracing::info!(
            unit,
            raw = counts.raw,
            new = counts.new,
            skipped = counts.skipped_existing,
            reprocessed = counts.reprocessed,
            rejected = counts.rejected,
            "unit done"
        );
    }

    fn on_run_done(&self, summary: &RunSummary) {
        tracing::info!(
            run_id = summary.run_id,
            status = %summary.status,
            extracted = summary.extracted,
            skipped = summary.skipped_existing,
            reprocessed = summary.reprocessed,
            errors = summary.errors,
            "run finished"
        );
    }

    fn on_log(&self, level: LogLevel, message: &str) {
        match level {
            LogLevel::Debug => tracing::debug!("{message}"),
            LogLevel::Info => tracing::info!("{message}"),
            LogLevel::Warn => tracing::warn!("{message}"),
            LogLevel::Error => tracing::error!("{message}"),
        }
    }
}

/// A progress event with its position in the stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressEvent {
    /// The target being harvested.
    pub target: String,
    /// Monotonically increasing sequence number.
    pub seq: u64,
    pub event: ProgressEventKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ProgressEventKind {
    UnitStarted { unit: String },
    UnitDone { unit: String, counts: UnitCounts },
    RunDone { summary: Box<RunSummary> },
    Log { level: LogLevel, message: String },
}

/// Create a progress broadcast channel.
pub fn channel() -> (broadcast::Sender<ProgressEvent>, broadcast::Receiver<ProgressEvent>) {
    broadcast::channel(256)
}

/// Publishes observer callbacks as [`ProgressEvent`]s.
pub struct BroadcastObserver {
    target: String,
    seq: AtomicU64,
    tx: broadcast::Sender<ProgressEvent>,
}

impl BroadcastObserver {
    pub fn new(target: impl Into<String>, tx: broadcast::Sender<ProgressEvent>) -> Self {
        Self {
            target: target.into(),
            seq: AtomicU64::new(0),
            tx,
        }
    }

    fn emit(&self, event: ProgressEventKind) {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        // Ignore send errors (no active receivers).
        let _ = self.tx.send(ProgressEvent {
            target: self.target.clone(),
            seq,
            event,
        });
    }
}

impl RunObserver for BroadcastObserver {
    fn on_unit_start(&self, unit: &str) {
        self.emit(ProgressEventKind::UnitStarted { unit: unit.into() });
    }

    fn on_unit_done(&self, unit: &str, counts: &UnitCounts) {
        self.emit(ProgressEventKind::UnitDone {
            unit: unit.into(),
            counts: *counts,
        });
    }

    fn on_run_done(&self, summary: &RunSummary) {
        self.emit(ProgressEventKind::RunDone {
            summary: Box::new(summary.clone()),
        });
    }

    fn on_log(&self, level: LogLevel, message: &str) {
        self.emit(ProgressEventKind::Log {
            level,
            message: message.into(),
        });
    }
}
