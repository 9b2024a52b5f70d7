//! Out-of-band reclamation of stuck runs.
//!
//! A run is dead when it is still `running`, older than the age threshold,
//! has extracted and skipped nothing, and no checkpoint with data exists for
//! its target. Dead runs are moved to `timeout_auto_cleaned`; rows are never
//! deleted. Anything with progress or a checkpoint is resumable and left
//! alone.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::checkpoint::CheckpointManager;
use crate::error::{HarvestError, HarvestResult};
use crate::store::{RunFilter, Store};
use crate::types::{Run, RunStatus};

/// Smallest age threshold accepted.
pub const MIN_RECLAIM_AGE_HOURS: i64 = 12;
pub const DEFAULT_RECLAIM_AGE_HOURS: i64 = 24;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReclaimPolicy {
    min_age: Duration,
}

impl Default for ReclaimPolicy {
    fn default() -> Self {
        Self {
            min_age: Duration::hours(DEFAULT_RECLAIM_AGE_HOURS),
        }
    }
}

impl ReclaimPolicy {
    /// Policy with a custom age threshold. Thresholds under twelve hours are
    /// rejected.
    pub fn with_min_age_hours(hours: i64) -> HarvestResult<Self> {
        if hours < MIN_RECLAIM_AGE_HOURS {
            return Err(HarvestError::InvalidConfig(format!(
                "reclaim age threshold {hours}h is below the {MIN_RECLAIM_AGE_HOURS}h minimum"
            )));
        }
        Ok(Self {
            min_age: Duration::hours(hours),
        })
    }

    pub fn min_age(&self) -> Duration {
        self.min_age
    }
}

/// Whether `run` is dead under `policy`.
pub fn is_dead(run: &Run, now: DateTime<Utc>, has_checkpoint_data: bool, policy: &ReclaimPolicy) -> bool {
    run.status == RunStatus::Running
        && run.age(now) > policy.min_age
        && run.extracted_count == 0
        && run.skipped_existing_count == 0
        && !has_checkpoint_data
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReclaimMode {
    /// Report only.
    DryRun,
    /// Ask before each run.
    Interactive,
    /// Reclaim every dead run.
    Automatic,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReclaimCandidate {
    pub run: Run,
    pub age_hours: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReclaimReport {
    /// Dead runs found.
    pub candidates: Vec<ReclaimCandidate>,
    /// Run ids moved to `timeout_auto_cleaned`.
    pub reclaimed: Vec<i64>,
    /// Dead runs left alone (dry run or declined).
    pub skipped: Vec<i64>,
    /// Stuck `running` rows not reclaimed because they can still resume.
    pub resumable: Vec<i64>,
}

/// Running runs past the age threshold, split into dead and resumable.
pub fn find_stale_runs(
    store: &Store,
    checkpoints: &CheckpointManager,
    policy: &ReclaimPolicy,
    now: DateTime<Utc>,
) -> HarvestResult<(Vec<ReclaimCandidate>, Vec<Run>)> {
    let running = store.list_runs(&RunFilter {
        status: Some(RunStatus::Running),
        ..RunFilter::default()
    })?;

    let mut dead = Vec::new();
    let mut resumable = Vec::new();
    for run in running {
        if run.age(now) <= policy.min_age() {
            continue;
        }
        if is_dead(&run, now, checkpoints.has_data(&run.target), policy) {
            let age_hours = run.age(now).num_hours();
            dead.push(ReclaimCandidate { run, age_hours });
        } else {
            resumable.push(run);
        }
    }
    Ok((dead, resumable))
}

/// Reclaim dead runs. `confirm` is consulted in [`ReclaimMode::Interactive`]
/// only.
pub fn reclaim<F>(
    store: &Store,
    checkpoints: &CheckpointManager,
    policy: &ReclaimPolicy,
    mode: ReclaimMode,
    now: DateTime<Utc>,
    mut confirm: F,
) -> HarvestResult<ReclaimReport>
where
    F: FnMut(&ReclaimCandidate) -> bool,
{
    let (candidates, resumable) = find_stale_runs(store, checkpoints, policy, now)?;
    let mut report = ReclaimReport {
        resumable: resumable.iter().map(|r| r.id).collect(),
        ..ReclaimReport::default()
    };

    for candidate in &candidates {
        let run_id = candidate.run.id;
        tracing::info!(
            "{}",
            HarvestError::StaleRunDetected {
                run_id,
                target: candidate.run.target.clone(),
            }
        );

        let proceed = match mode {
            ReclaimMode::DryRun => false,
            ReclaimMode::Automatic => true,
            ReclaimMode::Interactive => confirm(candidate),
        };
        if !proceed {
            report.skipped.push(run_id);
            continue;
        }

        if store.mark_timeout_cleaned(run_id, now)? {
            tracing::info!(run_id, "run marked timeout_auto_cleaned");
            report.reclaimed.push(run_id);
        } else {
            // Finished between listing and update.
            report.skipped.push(run_id);
        }
    }

    report.candidates = candidates;
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::CheckpointState;
    use crate::types::RunCounters;

    fn run(age_hours: i64, extracted: u64, skipped: u64, now: DateTime<Utc>) -> Run {
        Run {
            id: 1,
            target: "kpwd".into(),
            status: RunStatus::Running,
            started_at: now - Duration::hours(age_hours),
            completed_at: None,
            expected_count: 0,
            extracted_count: extracted,
            skipped_existing_count: skipped,
            reprocessed_count: 0,
            error_count: 0,
        }
    }

    #[test]
    fn test_dead_run_definition() {
        let now = Utc::now();
        let policy = ReclaimPolicy::default();
        assert!(is_dead(&run(25, 0, 0, now), now, false, &policy));
        assert!(!is_dead(&run(25, 1, 0, now), now, false, &policy));
        assert!(!is_dead(&run(25, 0, 3, now), now, false, &policy));
        assert!(!is_dead(&run(25, 0, 0, now), now, true, &policy));
        assert!(!is_dead(&run(23, 0, 0, now), now, false, &policy));

        let mut done = run(25, 0, 0, now);
        done.status = RunStatus::Completed;
        assert!(!is_dead(&done, now, false, &policy));
    }

    #[test]
    fn test_threshold_floor() {
        assert!(ReclaimPolicy::with_min_age_hours(11).is_err());
        assert_eq!(
            ReclaimPolicy::with_min_age_hours(12).unwrap().min_age(),
            Duration::hours(12)
        );
    }

    fn setup() -> (tempfile::TempDir, Store, CheckpointManager) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(&dir.path().join("db.sqlite3")).unwrap();
        let checkpoints = CheckpointManager::new(dir.path().join("checkpoints"));
        (dir, store, checkpoints)
    }

    #[test]
    fn test_reclaim_modes() {
        let (_dir, store, checkpoints) = setup();
        let now = Utc::now();
        let old = now - Duration::hours(30);

        let dead = store.create_run("kpwd", old).unwrap();
        let progressed = store.create_run("cppp", old).unwrap();
        store
            .update_progress(progressed.id, RunCounters { extracted: 1, ..Default::default() })
            .unwrap();
        let checkpointed = store.create_run("gem", old).unwrap();
        checkpoints
            .save(
                "gem",
                &CheckpointState {
                    target_slug: "gem".into(),
                    target: "gem".into(),
                    run_id: Some(checkpointed.id),
                    instance_id: None,
                    accumulated: vec![],
                    processed_units: ["Roads".to_string()].into(),
                    unit_counts: Default::default(),
                    skipped_ids: Default::default(),
                    errors: 0,
                    saved_at: now,
                },
            )
            .unwrap();
        let fresh = store.create_run("kpwd", now).unwrap();

        let policy = ReclaimPolicy::default();
        let dry = reclaim(&store, &checkpoints, &policy, ReclaimMode::DryRun, now, |_| true).unwrap();
        assert_eq!(dry.candidates.len(), 1);
        assert_eq!(dry.skipped, vec![dead.id]);
        assert!(dry.reclaimed.is_empty());
        let mut resumable = dry.resumable.clone();
        resumable.sort();
        assert_eq!(resumable, vec![progressed.id, checkpointed.id]);

        let declined =
            reclaim(&store, &checkpoints, &policy, ReclaimMode::Interactive, now, |_| false).unwrap();
        assert!(declined.reclaimed.is_empty());

        let auto = reclaim(&store, &checkpoints, &policy, ReclaimMode::Automatic, now, |_| false).unwrap();
        assert_eq!(auto.reclaimed, vec![dead.id]);

        let reclaimed = store.get_run(dead.id).unwrap().unwrap();
        assert_eq!(reclaimed.status, RunStatus::TimeoutAutoCleaned);
        assert!(reclaimed.completed_at.is_some());
        for id in [progressed.id, checkpointed.id, fresh.id] {
            assert_eq!(store.get_run(id).unwrap().unwrap().status, RunStatus::Running);
        }
    }
}
