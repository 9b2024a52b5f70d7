//! Second-pass strategies: which units to revisit after the first pass.
//!
//! - **Quick** compares `(unit_name, raw_record_count)` against the first pass
//!   and re-queues only mismatches. Cost is one count per unit.
//! - **Full** re-extracts every unit and classifies every record against the
//!   state the run has already reached. Cost is one classification per record.
//!
//! When both run, the Full results replace the Quick ones for every unit they
//! cover.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::identity::{classify, KnownSnapshot};
use crate::types::{Classification, Record};

/// Which verification pass the orchestrator runs after the first pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerifyMode {
    #[default]
    None,
    Quick,
    Full,
    Both,
}

impl VerifyMode {
    pub fn runs_quick(self) -> bool {
        matches!(self, Self::Quick | Self::Both)
    }

    pub fn runs_full(self) -> bool {
        matches!(self, Self::Full | Self::Both)
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "none" | "off" => Some(Self::None),
            "quick" => Some(Self::Quick),
            "full" => Some(Self::Full),
            "both" => Some(Self::Both),
            _ => None,
        }
    }
}

/// Result of comparing unit counts between two listings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuickDelta {
    /// Units whose count differs, or that were not in the prior listing.
    pub requeue: BTreeSet<String>,
    /// Units present in the prior listing but absent now. Their records are
    /// kept; they are only reported.
    pub missing: BTreeSet<String>,
}

impl QuickDelta {
    pub fn is_clean(&self) -> bool {
        self.requeue.is_empty() && self.missing.is_empty()
    }
}

/// Compare per-unit raw counts of the prior pass with the current listing.
pub fn quick_delta(
    prior: &BTreeMap<String, usize>,
    current: &BTreeMap<String, usize>,
) -> QuickDelta {
    let requeue = current
        .iter()
        .filter(|(name, count)| prior.get(*name) != Some(*count))
        .map(|(name, _)| name.clone())
        .collect();

    let missing = prior
        .keys()
        .filter(|name| !current.contains_key(*name))
        .cloned()
        .collect();

    QuickDelta { requeue, missing }
}

/// Classification tallies of a Full pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FullTally {
    pub new: usize,
    pub skipped_existing: usize,
    pub reprocessed: usize,
}

impl FullTally {
    pub fn add(&mut self, classification: Classification) {
        match classification {
            Classification::New => self.new += 1,
            Classification::SkipExisting => self.skipped_existing += 1,
            Classification::ReprocessExtended => self.reprocessed += 1,
        }
    }

    /// Whether the Full pass found anything the first pass missed.
    pub fn found_changes(&self) -> bool {
        self.new > 0 || self.reprocessed > 0
    }
}

/// Classify every re-extracted record against `effective`, the known
/// snapshot overlaid with everything the run already captured.
pub fn full_verify<'a>(
    effective: &KnownSnapshot,
    records: impl IntoIterator<Item = &'a Record>,
) -> (FullTally, Vec<(&'a Record, Classification)>) {
    let mut tally = FullTally::default();
    let mut changed = Vec::new();
    for record in records {
        let class = classify(effective, record);
        tally.add(class);
        if class.is_capture() {
            changed.push((record, class));
        }
    }
    (tally, changed)
}

/// Records re-extracted during the second pass, keyed by unit.
///
/// Quick results go in first; Full results overwrite any unit they cover.
#[derive(Debug, Default)]
pub struct SecondPass {
    by_unit: BTreeMap<String, PassEntry>,
}

#[derive(Debug)]
struct PassEntry {
    strategy: Strategy,
    records: Vec<Record>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Strategy {
    Quick,
    Full,
}

impl SecondPass {
    pub fn record_quick(&mut self, unit: &str, records: Vec<Record>) {
        let entry = self.by_unit.entry(unit.to_string()).or_insert(PassEntry {
            strategy: Strategy::Quick,
            records: Vec::new(),
        });
        if entry.strategy == Strategy::Quick {
            entry.records = records;
        }
    }

    pub fn record_full(&mut self, unit: &str, records: Vec<Record>) {
        self.by_unit.insert(
            unit.to_string(),
            PassEntry {
                strategy: Strategy::Full,
                records,
            },
        );
    }

    pub fn units(&self) -> impl Iterator<Item = &str> {
        self.by_unit.keys().map(String::as_str)
    }

    /// Whether the unit's final records came from a Full pass.
    pub fn is_full(&self, unit: &str) -> bool {
        self.by_unit
            .get(unit)
            .map(|e| e.strategy == Strategy::Full)
            .unwrap_or(false)
    }

    /// Final records per unit after precedence is applied.
    pub fn into_records(self) -> impl Iterator<Item = (String, Vec<Record>)> {
        self.by_unit.into_iter().map(|(unit, e)| (unit, e.records))
    }
}
