//! Mutable state of one executing run.
//!
//! Workers fold unit results in; the checkpoint timer snapshots it. Nothing
//! here is process-wide: the orchestrator owns one `RunState` per execution
//! and hands it around behind a `tokio::sync::Mutex`.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};

use crate::checkpoint::CheckpointState;
use crate::identity::{classify, KnownSnapshot};
use crate::types::{CapturedRecord, Classification, Record, RunCounters, UnitCounts};

#[derive(Debug)]
pub struct RunState {
    target: String,
    run_id: i64,
    instance_id: String,
    /// Records that must be written, keyed by canonical id.
    captured: BTreeMap<String, CapturedRecord>,
    /// Identities seen unchanged against the known snapshot.
    skipped: BTreeSet<String>,
    processed_units: BTreeSet<String>,
    /// Raw row count per unit from the first pass.
    unit_counts: BTreeMap<String, usize>,
    errors: u64,
    attempted: u64,
    resumed: u64,
    /// Captures since the last store flush.
    dirty: bool,
}

impl RunState {
    pub fn new(target: impl Into<String>, run_id: i64, instance_id: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            run_id,
            instance_id: instance_id.into(),
            captured: BTreeMap::new(),
            skipped: BTreeSet::new(),
            processed_units: BTreeSet::new(),
            unit_counts: BTreeMap::new(),
            errors: 0,
            attempted: 0,
            resumed: 0,
            dirty: false,
        }
    }

    /// Seed from a checkpoint left by an earlier execution.
    pub fn seed(&mut self, checkpoint: CheckpointState) {
        self.resumed = checkpoint.processed_units.len() as u64;
        self.errors = checkpoint.errors;
        self.processed_units = checkpoint.processed_units;
        self.unit_counts = checkpoint.unit_counts;
        self.skipped = checkpoint.skipped_ids;
        for captured in checkpoint.accumulated {
            self.captured
                .insert(captured.record.canonical_id.clone(), captured);
        }
        self.dirty = !self.captured.is_empty();
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn run_id(&self) -> i64 {
        self.run_id
    }

    pub fn is_processed(&self, unit: &str) -> bool {
        self.processed_units.contains(unit)
    }

    pub fn processed_units(&self) -> &BTreeSet<String> {
        &self.processed_units
    }

    pub fn unit_counts(&self) -> &BTreeMap<String, usize> {
        &self.unit_counts
    }

    pub fn begin_unit(&mut self) {
        self.attempted += 1;
    }

    pub fn record_error(&mut self) {
        self.errors += 1;
    }

    /// Classify `records` from `unit` and fold them in.
    ///
    /// An identity already captured by this run keeps its first
    /// classification; its record content is refreshed.
    pub fn absorb(
        &mut self,
        snapshot: &KnownSnapshot,
        records: impl IntoIterator<Item = Record>,
    ) -> UnitCounts {
        let mut counts = UnitCounts::default();
        for mut record in records {
            record.last_seen_run_id = Some(self.run_id);
            if let Some(existing) = self.captured.get_mut(&record.canonical_id) {
                tally(&mut counts, existing.classification);
                existing.record = record;
                self.dirty = true;
                continue;
            }
            let classification = classify(snapshot, &record);
            tally(&mut counts, classification);
            self.capture(record, classification);
        }
        counts
    }

    /// Fold in a record with a classification decided elsewhere.
    pub fn capture(&mut self, record: Record, classification: Classification) {
        if classification.is_capture() {
            self.captured.insert(
                record.canonical_id.clone(),
                CapturedRecord {
                    record,
                    classification,
                },
            );
            self.dirty = true;
        } else {
            self.skipped.insert(record.canonical_id);
        }
    }

    pub fn mark_processed(&mut self, unit: &str, raw_count: usize) {
        self.processed_units.insert(unit.to_string());
        self.unit_counts.entry(unit.to_string()).or_insert(raw_count);
    }

    /// Replace a unit's listed row count after it was re-extracted.
    pub fn update_unit_count(&mut self, unit: &str, raw_count: usize) {
        self.unit_counts.insert(unit.to_string(), raw_count);
    }

    /// Known snapshot overlaid with everything this run captured.
    pub fn effective_snapshot(&self, known: &KnownSnapshot) -> KnownSnapshot {
        let mut effective = known.clone();
        for captured in self.captured.values() {
            effective.insert(
                captured.record.canonical_id.clone(),
                captured.record.closing_date.clone(),
            );
        }
        effective
    }

    pub fn counters(&self) -> RunCounters {
        let reprocessed = self
            .captured
            .values()
            .filter(|c| c.classification == Classification::ReprocessExtended)
            .count() as u64;
        let skipped = self
            .skipped
            .iter()
            .filter(|id| !self.captured.contains_key(*id))
            .count() as u64;
        RunCounters {
            expected: self.unit_counts.values().sum::<usize>() as u64,
            extracted: self.captured.len() as u64,
            skipped_existing: skipped,
            reprocessed,
            errors: self.errors,
        }
    }

    pub fn attempted(&self) -> u64 {
        self.attempted
    }

    pub fn resumed(&self) -> u64 {
        self.resumed
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    /// Records to hand to the store, clearing the dirty flag.
    pub fn take_flush(&mut self) -> Vec<Record> {
        self.dirty = false;
        self.captured.values().map(|c| c.record.clone()).collect()
    }

    /// Checkpoint image of the current state.
    pub fn to_checkpoint(&self, target_slug: &str, saved_at: DateTime<Utc>) -> CheckpointState {
        CheckpointState {
            target_slug: target_slug.to_string(),
            target: self.target.clone(),
            run_id: Some(self.run_id),
            instance_id: Some(self.instance_id.clone()),
            accumulated: self.captured.values().cloned().collect(),
            processed_units: self.processed_units.clone(),
            unit_counts: self.unit_counts.clone(),
            skipped_ids: self.skipped.clone(),
            errors: self.errors,
            saved_at,
        }
    }
}

fn tally(counts: &mut UnitCounts, classification: Classification) {
    counts.raw += 1;
    match classification {
        Classification::New => counts.new += 1,
        Classification::SkipExisting => counts.skipped_existing += 1,
        Classification::ReprocessExtended => counts.reprocessed += 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::canonicalize;
    use crate::types::RawRecord;

    fn rec(id: &str, date: &str) -> Record {
        canonicalize("kpwd", "Roads", &RawRecord::new(id, date)).unwrap()
    }

    #[test]
    fn test_absorb_classifies_against_snapshot() {
        let mut known = KnownSnapshot::new("kpwd");
        known.insert("a-1", "2026-01-15");
        known.insert("b-2", "2026-01-15");

        let mut state = RunState::new("kpwd", 3, "inst");
        let counts = state.absorb(
            &known,
            vec![
                rec("A 1", "15-Jan-2026"),
                rec("B 2", "20-Jan-2026"),
                rec("C 3", "20-Jan-2026"),
            ],
        );
        assert_eq!(counts.raw, 3);
        assert_eq!((counts.new, counts.skipped_existing, counts.reprocessed), (1, 1, 1));

        let c = state.counters();
        assert_eq!(c.extracted, 2);
        assert_eq!(c.reprocessed, 1);
        assert_eq!(c.skipped_existing, 1);
    }

    #[test]
    fn test_captured_identity_keeps_first_classification() {
        let known = KnownSnapshot::new("kpwd");
        let mut state = RunState::new("kpwd", 3, "inst");
        state.absorb(&known, vec![rec("A 1", "15-Jan-2026")]);

        // The store now knows A-1; a later sighting is still this run's NEW.
        let mut flushed = KnownSnapshot::new("kpwd");
        flushed.insert("a-1", "2026-01-15");
        let counts = state.absorb(&flushed, vec![rec("a_1", "15/01/2026")]);
        assert_eq!(counts.new, 1);
        assert_eq!(state.counters().extracted, 1);
        assert_eq!(state.counters().skipped_existing, 0);
    }

    #[test]
    fn test_checkpoint_seed_roundtrip_preserves_counts() {
        let known = KnownSnapshot::new("kpwd");
        let mut state = RunState::new("kpwd", 9, "inst");
        state.absorb(&known, vec![rec("A 1", "15-Jan-2026")]);
        state.mark_processed("Roads", 1);
        state.record_error();

        let image = state.to_checkpoint("kpwd", Utc::now());
        let mut resumed = RunState::new("kpwd", 9, "other");
        resumed.seed(image);

        assert!(resumed.is_processed("Roads"));
        assert_eq!(resumed.resumed(), 1);
        assert_eq!(resumed.counters(), state.counters());
        assert!(resumed.is_dirty());
    }

    #[test]
    fn test_take_flush_clears_dirty_and_stamps_run() {
        let mut state = RunState::new("kpwd", 4, "inst");
        state.absorb(&KnownSnapshot::new("kpwd"), vec![rec("A 1", "15-Jan-2026")]);
        assert!(state.is_dirty());
        let flushed = state.take_flush();
        assert_eq!(flushed[0].last_seen_run_id, Some(4));
        assert!(!state.is_dirty());
    }
}
