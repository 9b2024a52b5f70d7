//! SQLite-backed persistence: runs, records, and the known-identity snapshot.
//!
//! ## Invariants
//!
//! - `UNIQUE(target, canonical_id, closing_date)` on `records`; a conflicting
//!   write replaces the prior row's mutable fields.
//! - At most one live row per `(target, canonical_id)`: a changed closing date
//!   updates the existing row in place.
//! - Rows whose identifier normalizes to empty or to a sentinel never reach
//!   the table.
//!
//! All writes go through one connection behind a mutex, so the store is its
//! own single writer.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

use crate::error::PersistenceError;
use crate::identity::{is_sentinel, normalize_id, KnownSnapshot};
use crate::types::{Record, Run, RunCounters, RunStatus, RunSummary};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS runs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    target TEXT NOT NULL,
    status TEXT NOT NULL,
    started_at TEXT NOT NULL,
    completed_at TEXT,
    expected INTEGER NOT NULL DEFAULT 0,
    extracted INTEGER NOT NULL DEFAULT 0,
    skipped_existing INTEGER NOT NULL DEFAULT 0,
    reprocessed INTEGER NOT NULL DEFAULT 0,
    errors INTEGER NOT NULL DEFAULT 0
);
CREATE INDEX IF NOT EXISTS idx_runs_status ON runs(status);
CREATE INDEX IF NOT EXISTS idx_runs_target ON runs(target);

CREATE TABLE IF NOT EXISTS records (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    target TEXT NOT NULL,
    canonical_id TEXT NOT NULL,
    closing_date TEXT NOT NULL,
    raw_fields TEXT NOT NULL DEFAULT '{}',
    source_unit TEXT,
    last_seen_run_id INTEGER,
    updated_at TEXT NOT NULL,
    UNIQUE(target, canonical_id, closing_date)
);
CREATE INDEX IF NOT EXISTS idx_records_identity ON records(target, canonical_id);
CREATE INDEX IF NOT EXISTS idx_records_run ON records(target, last_seen_run_id);
";

/// Outcome of an [`Store::upsert`] batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpsertReport {
    /// Identities seen for the first time.
    pub inserted: usize,
    /// Same identity and closing date; mutable fields replaced.
    pub refreshed: usize,
    /// Same identity, new closing date; row updated in place.
    pub extended: usize,
    /// Dropped because the identifier is empty or a sentinel.
    pub rejected: usize,
}

/// Filter for [`Store::list_runs`].
#[derive(Debug, Clone, Default)]
pub struct RunFilter {
    pub target: Option<String>,
    pub status: Option<RunStatus>,
    pub limit: Option<usize>,
}

/// Durable store for runs and records.
pub struct Store {
    conn: Mutex<Connection>,
    path: Option<PathBuf>,
}

impl Store {
    /// Open or create a store at `path`.
    pub fn open(path: &Path) -> Result<Self, PersistenceError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        Self::bootstrap(&conn)?;
        tracing::debug!("store opened at {}", path.display());
        Ok(Self {
            conn: Mutex::new(conn),
            path: Some(path.to_path_buf()),
        })
    }

    /// Open a throwaway in-memory store.
    pub fn in_memory() -> Result<Self, PersistenceError> {
        let conn = Connection::open_in_memory()?;
        Self::bootstrap(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            path: None,
        })
    }

    fn bootstrap(conn: &Connection) -> Result<(), PersistenceError> {
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch(SCHEMA)?;
        Ok(())
    }

    /// Location of the database file, if any.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    // ── Runs ─────────────────────────────────

    /// Open a new run in status `running`.
    pub fn create_run(&self, target: &str, started_at: DateTime<Utc>) -> Result<Run, PersistenceError> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO runs (target, status, started_at) VALUES (?1, ?2, ?3)",
            params![target, RunStatus::Running.as_str(), started_at.to_rfc3339()],
        )?;
        let id = conn.last_insert_rowid();
        tracing::info!(run_id = id, target, "run opened");
        Ok(Run {
            id,
            target: target.to_string(),
            status: RunStatus::Running,
            started_at,
            completed_at: None,
            expected_count: 0,
            extracted_count: 0,
            skipped_existing_count: 0,
            reprocessed_count: 0,
            error_count: 0,
        })
    }

    pub fn get_run(&self, run_id: i64) -> Result<Option<Run>, PersistenceError> {
        let conn = self.conn();
        let row = conn
            .query_row(
                "SELECT id, target, status, started_at, completed_at, expected, extracted,
                        skipped_existing, reprocessed, errors
                 FROM runs WHERE id = ?1",
                params![run_id],
                RunRow::from_row,
            )
            .optional()?;
        row.map(RunRow::into_run).transpose()
    }

    /// Runs, newest first.
    pub fn list_runs(&self, filter: &RunFilter) -> Result<Vec<Run>, PersistenceError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, target, status, started_at, completed_at, expected, extracted,
                    skipped_existing, reprocessed, errors
             FROM runs
             WHERE (?1 IS NULL OR target = ?1) AND (?2 IS NULL OR status = ?2)
             ORDER BY id DESC
             LIMIT ?3",
        )?;
        let limit = filter.limit.map(|l| l as i64).unwrap_or(-1);
        let rows = stmt.query_map(
            params![
                filter.target.as_deref(),
                filter.status.map(RunStatus::as_str),
                limit
            ],
            RunRow::from_row,
        )?;

        let mut runs = Vec::new();
        for row in rows {
            runs.push(row?.into_run()?);
        }
        Ok(runs)
    }

    /// Raise a running run's counters. Counters never decrease.
    pub fn update_progress(&self, run_id: i64, counters: RunCounters) -> Result<(), PersistenceError> {
        let conn = self.conn();
        conn.execute(
            "UPDATE runs SET
                expected = MAX(expected, ?2),
                extracted = MAX(extracted, ?3),
                skipped_existing = MAX(skipped_existing, ?4),
                reprocessed = MAX(reprocessed, ?5),
                errors = MAX(errors, ?6)
             WHERE id = ?1 AND status = 'running'",
            params![
                run_id,
                counters.expected as i64,
                counters.extracted as i64,
                counters.skipped_existing as i64,
                counters.reprocessed as i64,
                counters.errors as i64
            ],
        )?;
        Ok(())
    }

    /// Move a running run into its terminal status with final counters.
    pub fn finalize_run(&self, run_id: i64, summary: &RunSummary) -> Result<(), PersistenceError> {
        let counters = summary.counters();
        let changed = {
            let conn = self.conn();
            conn.execute(
                "UPDATE runs SET
                    status = ?2,
                    completed_at = ?3,
                    expected = MAX(expected, ?4),
                    extracted = MAX(extracted, ?5),
                    skipped_existing = MAX(skipped_existing, ?6),
                    reprocessed = MAX(reprocessed, ?7),
                    errors = MAX(errors, ?8)
                 WHERE id = ?1 AND status = 'running'",
                params![
                    run_id,
                    summary.status.as_str(),
                    summary.completed_at.to_rfc3339(),
                    counters.expected as i64,
                    counters.extracted as i64,
                    counters.skipped_existing as i64,
                    counters.reprocessed as i64,
                    counters.errors as i64
                ],
            )?
        };

        if changed == 0 {
            match self.get_run(run_id)? {
                None => return Err(PersistenceError::RunNotFound(run_id)),
                Some(run) => tracing::warn!(
                    run_id,
                    status = %run.status,
                    "finalize skipped: run already terminal"
                ),
            }
        }
        Ok(())
    }

    /// Mark a stuck run `timeout_auto_cleaned`. Returns false when the run
    /// was no longer running.
    pub fn mark_timeout_cleaned(&self, run_id: i64, now: DateTime<Utc>) -> Result<bool, PersistenceError> {
        let conn = self.conn();
        let changed = conn.execute(
            "UPDATE runs SET status = ?2, completed_at = ?3 WHERE id = ?1 AND status = 'running'",
            params![
                run_id,
                RunStatus::TimeoutAutoCleaned.as_str(),
                now.to_rfc3339()
            ],
        )?;
        Ok(changed > 0)
    }

    // ── Records ──────────────────────────────

    /// Write a batch of records in one transaction.
    pub fn upsert(&self, records: &[Record], run_id: Option<i64>) -> Result<UpsertReport, PersistenceError> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let mut report = UpsertReport::default();
        let now = Utc::now().to_rfc3339();

        for record in records {
            let canonical_id = normalize_id(&record.canonical_id);
            if is_sentinel(&canonical_id) {
                tracing::warn!(
                    target = %record.target,
                    raw_id = %record.canonical_id,
                    "rejecting record without a usable identifier"
                );
                report.rejected += 1;
                continue;
            }

            let raw_fields = serde_json::to_string(&record.raw_fields)
                .map_err(|e| PersistenceError::Rejected(format!("raw fields: {e}")))?;
            let seen_in = run_id.or(record.last_seen_run_id);

            let existing: Option<(i64, String)> = tx
                .query_row(
                    "SELECT id, closing_date FROM records
                     WHERE target = ?1 AND canonical_id = ?2
                     ORDER BY updated_at DESC, id DESC LIMIT 1",
                    params![record.target, canonical_id],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;

            match existing {
                None => {
                    tx.execute(
                        "INSERT INTO records
                            (target, canonical_id, closing_date, raw_fields, source_unit, last_seen_run_id, updated_at)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                         ON CONFLICT(target, canonical_id, closing_date) DO UPDATE SET
                            raw_fields = excluded.raw_fields,
                            source_unit = excluded.source_unit,
                            last_seen_run_id = COALESCE(excluded.last_seen_run_id, records.last_seen_run_id),
                            updated_at = excluded.updated_at",
                        params![
                            record.target,
                            canonical_id,
                            record.closing_date,
                            raw_fields,
                            record.source_unit,
                            seen_in,
                            now
                        ],
                    )?;
                    report.inserted += 1;
                }
                Some((row_id, known_date)) => {
                    // UPDATE OR REPLACE keeps the triple unique even when a
                    // legacy row already holds the new closing date.
                    tx.execute(
                        "UPDATE OR REPLACE records SET
                            closing_date = ?2,
                            raw_fields = ?3,
                            source_unit = ?4,
                            last_seen_run_id = COALESCE(?5, last_seen_run_id),
                            updated_at = ?6
                         WHERE id = ?1",
                        params![
                            row_id,
                            record.closing_date,
                            raw_fields,
                            record.source_unit,
                            seen_in,
                            now
                        ],
                    )?;
                    if known_date == record.closing_date {
                        report.refreshed += 1;
                    } else {
                        report.extended += 1;
                    }
                }
            }
        }

        tx.commit()?;
        tracing::debug!(
            inserted = report.inserted,
            refreshed = report.refreshed,
            extended = report.extended,
            rejected = report.rejected,
            "upsert batch committed"
        );
        Ok(report)
    }

    /// Latest known closing date per identity for `target`.
    pub fn known_snapshot(&self, target: &str) -> Result<KnownSnapshot, PersistenceError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT canonical_id, closing_date FROM records
             WHERE target = ?1
             ORDER BY updated_at ASC, id ASC",
        )?;
        let rows = stmt.query_map(params![target], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;

        let mut snapshot = KnownSnapshot::new(target);
        for row in rows {
            let (id, date) = row?;
            snapshot.insert(id, date);
        }
        Ok(snapshot)
    }

    /// Records last written by `run_id`, used to reseed a lost checkpoint.
    pub fn records_for_run(&self, target: &str, run_id: i64) -> Result<Vec<Record>, PersistenceError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT canonical_id, closing_date, raw_fields, source_unit, last_seen_run_id
             FROM records
             WHERE target = ?1 AND last_seen_run_id = ?2
             ORDER BY id ASC",
        )?;
        let rows = stmt.query_map(params![target, run_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, Option<String>>(3)?,
                row.get::<_, Option<i64>>(4)?,
            ))
        })?;

        let mut records = Vec::new();
        for row in rows {
            let (canonical_id, closing_date, raw, source_unit, last_seen_run_id) = row?;
            let raw_fields = serde_json::from_str(&raw).map_err(|e| {
                PersistenceError::CorruptRow(format!("raw_fields of {canonical_id}: {e}"))
            })?;
            records.push(Record {
                target: target.to_string(),
                canonical_id,
                closing_date,
                raw_fields,
                source_unit,
                last_seen_run_id,
            });
        }
        Ok(records)
    }

    pub fn count_records(&self, target: &str) -> Result<usize, PersistenceError> {
        let conn = self.conn();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM records WHERE target = ?1",
            params![target],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    /// Copy the whole database into a fresh file at `dest`.
    ///
    /// Reads the live database only; `dest` must not exist.
    pub fn vacuum_into(&self, dest: &Path) -> Result<(), PersistenceError> {
        if let Some(path) = &self.path {
            if path == dest {
                return Err(PersistenceError::Io(std::io::Error::other(
                    "backup destination is the live database",
                )));
            }
        }
        let conn = self.conn();
        conn.execute("VACUUM INTO ?1", params![dest.to_string_lossy()])?;
        Ok(())
    }
}

struct RunRow {
    id: i64,
    target: String,
    status: String,
    started_at: String,
    completed_at: Option<String>,
    expected: i64,
    extracted: i64,
    skipped_existing: i64,
    reprocessed: i64,
    errors: i64,
}

impl RunRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            target: row.get(1)?,
            status: row.get(2)?,
            started_at: row.get(3)?,
            completed_at: row.get(4)?,
            expected: row.get(5)?,
            extracted: row.get(6)?,
            skipped_existing: row.get(7)?,
            reprocessed: row.get(8)?,
            errors: row.get(9)?,
        })
    }

    fn into_run(self) -> Result<Run, PersistenceError> {
        let status = RunStatus::parse(&self.status).ok_or_else(|| {
            PersistenceError::CorruptRow(format!("run {} has status {:?}", self.id, self.status))
        })?;
        let started_at = parse_timestamp(&self.started_at, self.id)?;
        let completed_at = self
            .completed_at
            .as_deref()
            .map(|raw| parse_timestamp(raw, self.id))
            .transpose()?;

        Ok(Run {
            id: self.id,
            target: self.target,
            status,
            started_at,
            completed_at,
            expected_count: self.expected.max(0) as u64,
            extracted_count: self.extracted.max(0) as u64,
            skipped_existing_count: self.skipped_existing.max(0) as u64,
            reprocessed_count: self.reprocessed.max(0) as u64,
            error_count: self.errors.max(0) as u64,
        })
    }
}

fn parse_timestamp(raw: &str, run_id: i64) -> Result<DateTime<Utc>, PersistenceError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| PersistenceError::CorruptRow(format!("run {run_id} timestamp {raw:?}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::canonicalize;
    use crate::types::RawRecord;

    fn rec(target: &str, id: &str, date: &str) -> Record {
        canonicalize(target, "Roads", &RawRecord::new(id, date)).unwrap()
    }

    fn duplicate_triples(store: &Store) -> i64 {
        let conn = store.conn();
        conn.query_row(
            "SELECT COUNT(*) FROM (
                SELECT target, canonical_id, closing_date, COUNT(*) AS n
                FROM records GROUP BY target, canonical_id, closing_date HAVING n > 1
             )",
            [],
            |row| row.get(0),
        )
        .unwrap()
    }

    #[test]
    fn test_upsert_sequence_keeps_triples_unique() {
        let store = Store::in_memory().unwrap();
        let batches = vec![
            vec![rec("kpwd", "A 1", "15-Jan-2026"), rec("kpwd", "B 2", "15-Jan-2026")],
            vec![rec("kpwd", "a_1", "15/01/2026"), rec("kpwd", "A-1", "20-Jan-2026")],
            vec![rec("kpwd", "A 1", "15-Jan-2026"), rec("other", "A 1", "15-Jan-2026")],
            vec![rec("kpwd", "B 2", "15-Jan-2026"), rec("kpwd", "B 2", "15-Jan-2026")],
        ];
        for batch in &batches {
            store.upsert(batch, Some(1)).unwrap();
            assert_eq!(duplicate_triples(&store), 0);
        }
        // One live row per identity and target.
        assert_eq!(store.count_records("kpwd").unwrap(), 2);
        assert_eq!(store.count_records("other").unwrap(), 1);
    }

    #[test]
    fn test_changed_closing_date_updates_in_place() {
        let store = Store::in_memory().unwrap();
        let first = store
            .upsert(&[rec("kpwd", "A 1", "15-Jan-2026")], Some(1))
            .unwrap();
        assert_eq!(first.inserted, 1);

        let second = store
            .upsert(&[rec("kpwd", "Tender ID: A-1", "22-Jan-2026")], Some(2))
            .unwrap();
        assert_eq!(second.extended, 1);
        assert_eq!(store.count_records("kpwd").unwrap(), 1);

        let snapshot = store.known_snapshot("kpwd").unwrap();
        assert_eq!(snapshot.get("a-1"), Some("2026-01-22"));
    }

    #[test]
    fn test_sentinel_ids_are_rejected() {
        let store = Store::in_memory().unwrap();
        let mut bad = rec("kpwd", "A 1", "15-Jan-2026");
        bad.canonical_id = "NULL".to_string();
        let mut empty = rec("kpwd", "A 1", "15-Jan-2026");
        empty.canonical_id = " ".to_string();

        let report = store
            .upsert(&[bad, empty, rec("kpwd", "C 3", "15-Jan-2026")], None)
            .unwrap();
        assert_eq!(report.rejected, 2);
        assert_eq!(report.inserted, 1);
        assert_eq!(store.count_records("kpwd").unwrap(), 1);
    }

    #[test]
    fn test_stored_key_matches_classification_key() {
        let store = Store::in_memory().unwrap();
        let r = rec("kpwd", "\"ID#5\"", "15-Jan-2026");
        store.upsert(std::slice::from_ref(&r), Some(1)).unwrap();

        let known = store.known_snapshot("kpwd").unwrap();
        assert_eq!(known.get(&r.canonical_id), Some("2026-01-15"));
        assert_eq!(
            crate::identity::classify(&known, &r),
            crate::types::Classification::SkipExisting
        );
    }

    #[test]
    fn test_records_for_run_reseeds_fields() {
        let store = Store::in_memory().unwrap();
        let mut r = rec("kpwd", "A 1", "15-Jan-2026");
        r.raw_fields.insert("title".into(), "Bridge".into());
        store.upsert(&[r], Some(7)).unwrap();
        store.upsert(&[rec("kpwd", "B 2", "15-Jan-2026")], Some(8)).unwrap();

        let seeded = store.records_for_run("kpwd", 7).unwrap();
        assert_eq!(seeded.len(), 1);
        assert_eq!(seeded[0].canonical_id, "a-1");
        assert_eq!(seeded[0].source_unit.as_deref(), Some("Roads"));
        assert_eq!(seeded[0].raw_fields["title"], "Bridge");
    }

    #[test]
    fn test_run_lifecycle_and_monotonic_counters() {
        let store = Store::in_memory().unwrap();
        let run = store.create_run("kpwd", Utc::now()).unwrap();

        store
            .update_progress(run.id, RunCounters { extracted: 5, expected: 9, ..Default::default() })
            .unwrap();
        store
            .update_progress(run.id, RunCounters { extracted: 3, expected: 4, ..Default::default() })
            .unwrap();
        let loaded = store.get_run(run.id).unwrap().unwrap();
        assert_eq!(loaded.extracted_count, 5);
        assert_eq!(loaded.expected_count, 9);
        assert_eq!(loaded.status, RunStatus::Running);

        assert!(store.mark_timeout_cleaned(run.id, Utc::now()).unwrap());
        assert!(!store.mark_timeout_cleaned(run.id, Utc::now()).unwrap());
        let loaded = store.get_run(run.id).unwrap().unwrap();
        assert_eq!(loaded.status, RunStatus::TimeoutAutoCleaned);
        assert!(loaded.completed_at.is_some());
    }

    #[test]
    fn test_list_runs_filters() {
        let store = Store::in_memory().unwrap();
        store.create_run("kpwd", Utc::now()).unwrap();
        let other = store.create_run("cppp", Utc::now()).unwrap();
        store.mark_timeout_cleaned(other.id, Utc::now()).unwrap();

        let running = store
            .list_runs(&RunFilter { status: Some(RunStatus::Running), ..Default::default() })
            .unwrap();
        assert_eq!(running.len(), 1);
        assert_eq!(running[0].target, "kpwd");

        let all = store.list_runs(&RunFilter::default()).unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].id, other.id);
    }

    #[test]
    fn test_vacuum_into_copies_without_touching_live_data() {
        let dir = tempfile::tempdir().unwrap();
        let live = dir.path().join("harvest.sqlite3");
        let store = Store::open(&live).unwrap();
        store.upsert(&[rec("kpwd", "A 1", "15-Jan-2026")], None).unwrap();

        let copy = dir.path().join("copy.sqlite3");
        store.vacuum_into(&copy).unwrap();
        assert!(store.vacuum_into(&live).is_err());

        let restored = Store::open(&copy).unwrap();
        assert_eq!(restored.count_records("kpwd").unwrap(), 1);
        assert_eq!(store.count_records("kpwd").unwrap(), 1);
    }
}
