//! Core data types shared by every component: runs, units, records, summaries.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle state of a persisted run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    TimeoutAutoCleaned,
    Cancelled,
    Error,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::TimeoutAutoCleaned => "timeout_auto_cleaned",
            Self::Cancelled => "cancelled",
            Self::Error => "error",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "timeout_auto_cleaned" => Some(Self::TimeoutAutoCleaned),
            "cancelled" => Some(Self::Cancelled),
            "error" => Some(Self::Error),
            _ => None,
        }
    }

    /// A run is terminal once it has left `running`.
    pub fn is_terminal(self) -> bool {
        self != Self::Running
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A persisted extraction run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: i64,
    pub target: String,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub expected_count: u64,
    pub extracted_count: u64,
    pub skipped_existing_count: u64,
    pub reprocessed_count: u64,
    pub error_count: u64,
}

impl Run {
    /// Time elapsed since the run started.
    pub fn age(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.started_at
    }
}

/// Monotonic counters written to a run row while it is in progress.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunCounters {
    pub expected: u64,
    pub extracted: u64,
    pub skipped_existing: u64,
    pub reprocessed: u64,
    pub errors: u64,
}

/// One organizational subdivision's listing within a target.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkUnit {
    pub name: String,
    #[serde(default)]
    pub url: Option<String>,
}

impl WorkUnit {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            url: None,
        }
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }
}

/// A row as handed over by an adapter, before normalization.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawRecord {
    /// Identifier text exactly as rendered on the page.
    pub id_text: String,
    /// Closing date text exactly as rendered on the page.
    pub closing_date_text: String,
    /// Every other column, keyed by the adapter's column names.
    #[serde(default)]
    pub fields: BTreeMap<String, String>,
}

impl RawRecord {
    pub fn new(id_text: impl Into<String>, closing_date_text: impl Into<String>) -> Self {
        Self {
            id_text: id_text.into(),
            closing_date_text: closing_date_text.into(),
            fields: BTreeMap::new(),
        }
    }

    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }
}

/// A normalized record, keyed by (target, canonical_id).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub target: String,
    pub canonical_id: String,
    pub closing_date: String,
    #[serde(default)]
    pub raw_fields: BTreeMap<String, String>,
    #[serde(default)]
    pub source_unit: Option<String>,
    #[serde(default)]
    pub last_seen_run_id: Option<i64>,
}

/// Outcome of comparing a record against the known snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Classification {
    New,
    SkipExisting,
    ReprocessExtended,
}

impl Classification {
    /// Whether the record must be written to the store.
    pub fn is_capture(self) -> bool {
        !matches!(self, Self::SkipExisting)
    }
}

/// A record kept by the run together with how it was classified on capture.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapturedRecord {
    pub record: Record,
    pub classification: Classification,
}

/// Per-unit tallies reported to the observer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitCounts {
    pub raw: usize,
    pub new: usize,
    pub skipped_existing: usize,
    pub reprocessed: usize,
    pub rejected: usize,
}

/// Final report of a run. Always produced, even on partial failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: i64,
    pub target: String,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    /// Units attempted by this execution (seeded units excluded).
    pub attempted: u64,
    /// Units carried over from a checkpoint.
    pub resumed: u64,
    pub expected: u64,
    pub extracted: u64,
    pub skipped_existing: u64,
    pub reprocessed: u64,
    pub errors: u64,
    /// Units re-extracted during the second pass.
    #[serde(default)]
    pub requeued_units: Vec<String>,
    /// Units seen in the first pass that vanished from the second listing.
    #[serde(default)]
    pub missing_units: Vec<String>,
    /// Human-readable reason when the run ended in `error`.
    #[serde(default)]
    pub failure: Option<String>,
}

impl RunSummary {
    pub fn counters(&self) -> RunCounters {
        RunCounters {
            expected: self.expected,
            extracted: self.extracted,
            skipped_existing: self.skipped_existing,
            reprocessed: self.reprocessed,
            errors: self.errors,
        }
    }
}
