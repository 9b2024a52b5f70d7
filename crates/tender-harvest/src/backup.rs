//! Tiered backup retention for the store.
//!
//! A sweep copies the live database into one artifact per tier and period
//! (`daily/store-2026-10-19.sqlite3`, `weekly/store-2026-W42.sqlite3`,
//! `monthly/store-2026-10.sqlite3`, `yearly/store-2026.sqlite3`) and then
//! prunes artifacts older than the tier's retention window. An artifact that
//! already exists for the current period is left alone, so repeated sweeps
//! on the same day are no-ops. Files that do not follow the naming scheme are
//! never touched.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Datelike, Duration, Months, NaiveDate, TimeZone, Utc, Weekday};
use serde::{Deserialize, Serialize};

use crate::error::PersistenceError;
use crate::store::Store;

const ARTIFACT_PREFIX: &str = "store-";
const ARTIFACT_SUFFIX: &str = ".sqlite3";

/// Minimum number of daily artifacts kept, whatever the configuration says.
pub const MIN_DAILY_RETENTION_DAYS: u32 = 7;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupTier {
    Daily,
    Weekly,
    Monthly,
    Yearly,
}

impl BackupTier {
    pub const ALL: [BackupTier; 4] = [Self::Daily, Self::Weekly, Self::Monthly, Self::Yearly];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Daily => "daily",
            Self::Weekly => "weekly",
            Self::Monthly => "monthly",
            Self::Yearly => "yearly",
        }
    }

    /// Period key of `now` for this tier.
    pub fn period_key(self, now: DateTime<Utc>) -> String {
        match self {
            Self::Daily => now.format("%Y-%m-%d").to_string(),
            Self::Weekly => {
                let week = now.iso_week();
                format!("{}-W{:02}", week.year(), week.week())
            }
            Self::Monthly => now.format("%Y-%m").to_string(),
            Self::Yearly => now.format("%Y").to_string(),
        }
    }

    /// Start of the period named by `key`.
    pub fn period_start(self, key: &str) -> Option<DateTime<Utc>> {
        let date = match self {
            Self::Daily => NaiveDate::parse_from_str(key, "%Y-%m-%d").ok()?,
            Self::Weekly => {
                let (year, week) = key.split_once("-W")?;
                NaiveDate::from_isoywd_opt(year.parse().ok()?, week.parse().ok()?, Weekday::Mon)?
            }
            Self::Monthly => {
                let (year, month) = key.split_once('-')?;
                NaiveDate::from_ymd_opt(year.parse().ok()?, month.parse().ok()?, 1)?
            }
            Self::Yearly => NaiveDate::from_ymd_opt(key.parse().ok()?, 1, 1)?,
        };
        Some(Utc.from_utc_datetime(&date.and_hms_opt(0, 0, 0)?))
    }
}

impl std::fmt::Display for BackupTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Retention window per tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupPolicy {
    pub daily_days: u32,
    pub weekly_weeks: u32,
    pub monthly_months: u32,
    pub yearly_years: u32,
}

impl Default for BackupPolicy {
    fn default() -> Self {
        Self {
            daily_days: MIN_DAILY_RETENTION_DAYS,
            weekly_weeks: 16,
            monthly_months: 24,
            yearly_years: 7,
        }
    }
}

impl BackupPolicy {
    /// Default policy with a custom daily window, never below seven days.
    pub fn with_daily_days(days: u32) -> Self {
        Self {
            daily_days: days.max(MIN_DAILY_RETENTION_DAYS),
            ..Self::default()
        }
    }

    /// Oldest period start still retained for `tier`.
    pub fn cutoff(&self, tier: BackupTier, now: DateTime<Utc>) -> DateTime<Utc> {
        let today = Utc.from_utc_datetime(
            &now.date_naive()
                .and_hms_opt(0, 0, 0)
                .unwrap_or_default(),
        );
        match tier {
            BackupTier::Daily => {
                today - Duration::days(i64::from(self.daily_days.max(MIN_DAILY_RETENTION_DAYS)))
            }
            BackupTier::Weekly => today - Duration::weeks(i64::from(self.weekly_weeks)),
            BackupTier::Monthly => today
                .checked_sub_months(Months::new(self.monthly_months))
                .unwrap_or(DateTime::<Utc>::MIN_UTC),
            BackupTier::Yearly => today
                .checked_sub_months(Months::new(self.yearly_years.saturating_mul(12)))
                .unwrap_or(DateTime::<Utc>::MIN_UTC),
        }
    }
}

/// One backup file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupArtifact {
    pub tier: BackupTier,
    pub created_at: DateTime<Utc>,
    pub path: PathBuf,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SweepReport {
    pub created: Vec<BackupArtifact>,
    pub pruned: Vec<BackupArtifact>,
    pub retained: usize,
}

/// Create this period's artifacts and prune expired ones under `root`.
pub fn backup_sweep(
    store: &Store,
    root: &Path,
    policy: &BackupPolicy,
    now: DateTime<Utc>,
) -> Result<SweepReport, PersistenceError> {
    let mut report = SweepReport::default();

    for tier in BackupTier::ALL {
        let dir = root.join(tier.as_str());
        std::fs::create_dir_all(&dir)?;

        let key = tier.period_key(now);
        let path = dir.join(artifact_name(&key));
        if !path.exists() {
            let tmp = dir.join(format!(".{}.tmp", artifact_name(&key)));
            if tmp.exists() {
                std::fs::remove_file(&tmp)?;
            }
            store.vacuum_into(&tmp)?;
            std::fs::rename(&tmp, &path)?;
            tracing::info!(tier = tier.as_str(), path = %path.display(), "backup artifact created");
            report.created.push(BackupArtifact {
                tier,
                created_at: tier.period_start(&key).unwrap_or(now),
                path,
            });
        }

        let cutoff = policy.cutoff(tier, now);
        for artifact in list_tier(root, tier)? {
            if artifact.created_at < cutoff {
                std::fs::remove_file(&artifact.path)?;
                tracing::info!(
                    tier = tier.as_str(),
                    path = %artifact.path.display(),
                    "backup artifact pruned"
                );
                report.pruned.push(artifact);
            } else {
                report.retained += 1;
            }
        }
    }

    Ok(report)
}

/// Every artifact under `root`, oldest first within each tier.
pub fn list_artifacts(root: &Path) -> Result<Vec<BackupArtifact>, PersistenceError> {
    let mut all = Vec::new();
    for tier in BackupTier::ALL {
        all.extend(list_tier(root, tier)?);
    }
    Ok(all)
}

fn list_tier(root: &Path, tier: BackupTier) -> Result<Vec<BackupArtifact>, PersistenceError> {
    let dir = root.join(tier.as_str());
    if !dir.exists() {
        return Ok(Vec::new());
    }

    let mut artifacts = Vec::new();
    for entry in std::fs::read_dir(&dir)? {
        let path = entry?.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        let Some(key) = name
            .strip_prefix(ARTIFACT_PREFIX)
            .and_then(|rest| rest.strip_suffix(ARTIFACT_SUFFIX))
        else {
            continue;
        };
        if let Some(created_at) = tier.period_start(key) {
            artifacts.push(BackupArtifact {
                tier,
                created_at,
                path,
            });
        }
    }
    artifacts.sort_by_key(|a| a.created_at);
    Ok(artifacts)
}

fn artifact_name(key: &str) -> String {
    format!("{ARTIFACT_PREFIX}{key}{ARTIFACT_SUFFIX}")
}
