//! Canonical identity: identifier/date normalization and NEW / SKIP / REPROCESS
//! classification against the known snapshot.
//!
//! Listing pages render the same tender identifier in many shapes
//! (`Tender ID: 2026-DCKUL-128804/1`, `2026_dckul_128804_1`, ...). Everything
//! here is pure: no I/O, no shared state.

use std::collections::HashMap;
use std::sync::OnceLock;

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use regex::Regex;

use crate::error::PersistenceError;
use crate::types::{Classification, RawRecord, Record};

/// Canonical ids that stand for "no value" in exported spreadsheets and
/// half-rendered tables. Rows carrying them are never persisted.
pub const SENTINEL_IDS: &[&str] = &["nan", "none", "null", "nil", "na", "n-a", "undefined"];

const DATETIME_FORMATS: &[&str] = &[
    "%d-%b-%Y %I:%M %p",
    "%d-%b-%Y %H:%M:%S",
    "%d-%b-%Y %H:%M",
    "%d %b %Y %I:%M %p",
    "%d %b %Y %H:%M",
    "%d %B %Y %H:%M",
    "%d/%m/%Y %I:%M %p",
    "%d/%m/%Y %H:%M:%S",
    "%d/%m/%Y %H:%M",
    "%d-%m-%Y %I:%M %p",
    "%d-%m-%Y %H:%M:%S",
    "%d-%m-%Y %H:%M",
    "%d.%m.%Y %H:%M",
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%d %H:%M",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%dT%H:%M",
];

const DATE_FORMATS: &[&str] = &[
    "%d-%b-%Y",
    "%d %b %Y",
    "%d %B %Y",
    "%b %d, %Y",
    "%B %d, %Y",
    "%d/%m/%Y",
    "%d-%m-%Y",
    "%d.%m.%Y",
    "%Y-%m-%d",
    "%Y/%m/%d",
];

fn id_label_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?i)^\s*(?:(?:e-?)?(?:tender|bid|nit)\s*(?:id|no\.?|number|ref(?:erence)?(?:\s*no\.?)?)|ref(?:erence)?\s*(?:no\.?|number)?|id)\s*(?:[:#]\s*|\s+)",
        )
        .expect("id label regex is valid")
    })
}

fn date_label_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?i)^\s*(?:(?:bid\s*)?(?:submission\s*)?(?:closing|end|due|last)\s*date(?:\s*(?:and|&)\s*time)?(?:\s*(?:of|for)\s*submission)?)\s*(?:[:#]\s*|\s+)",
        )
        .expect("date label regex is valid")
    })
}

fn separator_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[\s_\-/\\.|:,;#]+").expect("separator regex is valid"))
}

fn meridiem_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)(\d)\s*([ap])\.?m\.?$").expect("meridiem regex is valid"))
}

fn zone_suffix_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)\s*(?:hrs|hours|ist)\.?$").expect("zone regex is valid"))
}

/// Canonical form of a rendered identifier.
///
/// Strips enclosing quotes or brackets and leading labels, case-folds, and
/// collapses every run of separators and whitespace into a single `-`.
/// Applying it to its own output is a no-op.
pub fn normalize_id(raw: &str) -> String {
    let mut text = raw
        .trim_matches(|c: char| c.is_whitespace() || is_wrapper(c))
        .to_string();
    while let Some(m) = id_label_re().find(&text) {
        if m.end() == 0 {
            break;
        }
        text = text[m.end()..].to_string();
    }

    separator_re()
        .replace_all(&text.to_lowercase(), "-")
        .trim_matches(|c: char| c == '-' || is_wrapper(c))
        .to_string()
}

fn is_wrapper(c: char) -> bool {
    matches!(c, '"' | '\'' | '[' | ']' | '(' | ')' | '{' | '}')
}

/// Whether a canonical id is empty or one of [`SENTINEL_IDS`].
pub fn is_sentinel(canonical_id: &str) -> bool {
    canonical_id.is_empty() || SENTINEL_IDS.contains(&canonical_id)
}

/// Canonical form of a rendered closing date.
///
/// Parsable values become `YYYY-MM-DD HH:MM` (or `YYYY-MM-DD` when no time was
/// shown). Anything else falls back to lowercase text with collapsed
/// whitespace, so two identical unparsable renderings still compare equal.
pub fn normalize_date(raw: &str) -> String {
    let unlabeled = date_label_re().replace(raw.trim(), "");
    let collapsed = unlabeled.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.is_empty() {
        return String::new();
    }

    let trimmed = zone_suffix_re().replace(&collapsed, "");
    let text = meridiem_re().replace(trimmed.trim(), "$1 ${2}M").to_string();

    if let Ok(dt) = DateTime::parse_from_rfc3339(&text) {
        return dt.naive_local().format("%Y-%m-%d %H:%M").to_string();
    }
    for fmt in DATETIME_FORMATS {
        if let Ok(dt) = NaiveDateTime::parse_from_str(&text, fmt) {
            return dt.format("%Y-%m-%d %H:%M").to_string();
        }
    }
    for fmt in DATE_FORMATS {
        if let Ok(d) = NaiveDate::parse_from_str(&text, fmt) {
            return d.format("%Y-%m-%d").to_string();
        }
    }

    collapsed.to_lowercase()
}

/// Normalize an adapter row into a [`Record`] for `target`.
///
/// Rows whose identifier normalizes to empty or to a sentinel are rejected.
pub fn canonicalize(
    target: &str,
    unit: &str,
    raw: &RawRecord,
) -> Result<Record, PersistenceError> {
    let canonical_id = normalize_id(&raw.id_text);
    if is_sentinel(&canonical_id) {
        return Err(PersistenceError::Rejected(format!(
            "identifier {:?} has no usable canonical form",
            raw.id_text
        )));
    }

    Ok(Record {
        target: target.to_string(),
        canonical_id,
        closing_date: normalize_date(&raw.closing_date_text),
        raw_fields: raw.fields.clone(),
        source_unit: Some(unit.to_string()),
        last_seen_run_id: None,
    })
}

/// Per-target mapping canonical_id → last known canonical closing date.
#[derive(Debug, Clone, Default)]
pub struct KnownSnapshot {
    target: String,
    entries: HashMap<String, String>,
}

impl KnownSnapshot {
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            entries: HashMap::new(),
        }
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn insert(&mut self, canonical_id: impl Into<String>, closing_date: impl Into<String>) {
        self.entries.insert(canonical_id.into(), closing_date.into());
    }

    pub fn get(&self, canonical_id: &str) -> Option<&str> {
        self.entries.get(canonical_id).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Classify a normalized record against the snapshot.
pub fn classify(snapshot: &KnownSnapshot, record: &Record) -> Classification {
    match snapshot.get(&record.canonical_id) {
        None => Classification::New,
        Some(known) if known == record.closing_date => Classification::SkipExisting,
        Some(_) => Classification::ReprocessExtended,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_label_case_and_separator_variants_collapse() {
        let expected = "2026-dckul-128804-1";
        assert_eq!(normalize_id("Tender ID: 2026-DCKUL-128804/1"), expected);
        assert_eq!(normalize_id("2026_dckul_128804_1"), expected);
        assert_eq!(normalize_id("2026 DCKUL 128804 1"), expected);
        assert_eq!(normalize_id("  tender no. 2026/DCKUL/128804/1 "), expected);
        assert_eq!(normalize_id("Ref No: 2026.DCKUL.128804.1"), expected);
        assert_eq!(normalize_id("ID 2026 - DCKUL - 128804 - 1"), expected);
    }

    #[test]
    fn test_normalize_id_is_idempotent() {
        for raw in [
            "Tender ID: 2026-DCKUL-128804/1",
            "id-77",
            "REF-no-5",
            "[KPWD/2026/17]",
            "\"ID#5\"",
            "[Tender ID: 5]",
            "(-x)",
            "NIT #2026#4",
            "'ref no. 9'",
        ] {
            let once = normalize_id(raw);
            assert_eq!(normalize_id(&once), once, "raw = {raw}");
        }
    }

    #[test]
    fn test_quoted_and_hashed_ids_share_one_form() {
        assert_eq!(normalize_id("ID#5"), "5");
        assert_eq!(normalize_id("\"ID#5\""), "5");
        assert_eq!(normalize_id("[ID: 5]"), "5");
        assert_eq!(normalize_id("KPWD#2026#17"), "kpwd-2026-17");
    }

    #[test]
    fn test_hyphenated_label_lookalikes_are_kept() {
        assert_eq!(normalize_id("ID-123"), "id-123");
        assert_eq!(normalize_id("Ref-9"), "ref-9");
    }

    #[test]
    fn test_sentinels() {
        assert!(is_sentinel(&normalize_id("NaN")));
        assert!(is_sentinel(&normalize_id(" None ")));
        assert!(is_sentinel(&normalize_id("null")));
        assert!(is_sentinel(&normalize_id("N/A")));
        assert!(is_sentinel(&normalize_id("Tender ID:")));
        assert!(is_sentinel(&normalize_id("")));
        assert!(!is_sentinel(&normalize_id("nano-1")));
    }

    #[test]
    fn test_date_renderings_agree() {
        let expected = "2026-01-15 15:00";
        assert_eq!(normalize_date("15-Jan-2026 03:00 PM"), expected);
        assert_eq!(normalize_date("Closing Date: 15-JAN-2026 03:00PM"), expected);
        assert_eq!(normalize_date("15/01/2026 15:00"), expected);
        assert_eq!(normalize_date("2026-01-15T15:00:00"), expected);
        assert_eq!(normalize_date("15-01-2026  15:00 hrs"), expected);
    }

    #[test]
    fn test_date_without_time() {
        assert_eq!(normalize_date("15-Jan-2026"), "2026-01-15");
        assert_eq!(normalize_date("January 15, 2026"), "2026-01-15");
    }

    #[test]
    fn test_unparsable_date_falls_back_to_folded_text() {
        assert_eq!(normalize_date("  To be  Announced "), "to be announced");
        assert_eq!(normalize_date(""), "");
    }

    #[test]
    fn test_canonicalize_rejects_sentinel_rows() {
        let raw = RawRecord::new("nan", "15-Jan-2026");
        assert!(canonicalize("kpwd", "Roads", &raw).is_err());

        let raw = RawRecord::new("Tender ID: 7", "15-Jan-2026").with_field("title", "Bridge");
        let record = canonicalize("kpwd", "Roads", &raw).unwrap();
        assert_eq!(record.canonical_id, "7");
        assert_eq!(record.closing_date, "2026-01-15");
        assert_eq!(record.source_unit.as_deref(), Some("Roads"));
        assert_eq!(record.raw_fields.get("title").map(String::as_str), Some("Bridge"));
    }

    fn record(id: &str, date: &str) -> Record {
        canonicalize("kpwd", "Roads", &RawRecord::new(id, date)).unwrap()
    }

    #[test]
    fn test_classify_three_outcomes() {
        let mut snapshot = KnownSnapshot::new("kpwd");
        snapshot.insert("2026-dckul-128804-1", "2026-01-15 15:00");

        assert_eq!(
            classify(&snapshot, &record("T-999", "15-Jan-2026 03:00 PM")),
            Classification::New
        );
        assert_eq!(
            classify(&snapshot, &record("Tender ID: 2026-DCKUL-128804/1", "15-Jan-2026 03:00 PM")),
            Classification::SkipExisting
        );
        assert_eq!(
            classify(&snapshot, &record("2026 DCKUL 128804 1", "22-Jan-2026 03:00 PM")),
            Classification::ReprocessExtended
        );
    }

    #[test]
    fn test_classify_is_idempotent() {
        let mut snapshot = KnownSnapshot::new("kpwd");
        snapshot.insert("a-1", "2026-01-15");
        let r = record("A 1", "16-Jan-2026");

        let first = classify(&snapshot, &r);
        let second = classify(&snapshot, &r);
        assert_eq!(first, second);
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot.get("a-1"), Some("2026-01-15"));
    }
}
