//! Checkpoint files and the background timer that writes them.
//!
//! One file per target, `{slug}.checkpoint.json`, written atomically
//! (temp file, fsync, rename). A missing, partial or unparseable file reads
//! as "no checkpoint"; [`CheckpointManager::load_or_reseed`] can rebuild the
//! seed from the store when the file is damaged.
//!
//! Only the [`CheckpointTimer`] writes checkpoints during a run. Workers
//! never touch the file.

use std::collections::{BTreeMap, BTreeSet};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{HarvestError, HarvestResult};
use crate::state::RunState;
use crate::store::{RunFilter, Store};
use crate::types::{CapturedRecord, Classification, RunStatus};

const CHECKPOINT_SUFFIX: &str = ".checkpoint.json";

/// Serialized partial progress of one target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointState {
    pub target_slug: String,
    pub target: String,
    #[serde(default)]
    pub run_id: Option<i64>,
    #[serde(default)]
    pub instance_id: Option<String>,
    #[serde(default)]
    pub accumulated: Vec<CapturedRecord>,
    #[serde(default)]
    pub processed_units: BTreeSet<String>,
    #[serde(default)]
    pub unit_counts: BTreeMap<String, usize>,
    #[serde(default)]
    pub skipped_ids: BTreeSet<String>,
    #[serde(default)]
    pub errors: u64,
    pub saved_at: DateTime<Utc>,
}

impl CheckpointState {
    pub fn has_data(&self) -> bool {
        !self.accumulated.is_empty() || !self.processed_units.is_empty()
    }
}

/// What was found on disk for a target.
#[derive(Debug)]
pub enum LoadOutcome {
    Absent,
    Corrupt(String),
    Loaded(Box<CheckpointState>),
}

/// Reads and writes checkpoint files under one directory.
#[derive(Debug, Clone)]
pub struct CheckpointManager {
    dir: PathBuf,
}

impl CheckpointManager {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, target: &str) -> PathBuf {
        self.dir.join(format!("{}{CHECKPOINT_SUFFIX}", slug(target)))
    }

    /// Write `state` for `target` atomically.
    pub fn save(&self, target: &str, state: &CheckpointState) -> HarvestResult<()> {
        std::fs::create_dir_all(&self.dir)?;
        let path = self.path_for(target);
        let tmp = path.with_extension("json.tmp");
        let payload = serde_json::to_vec_pretty(state)?;

        let mut file = std::fs::File::create(&tmp)?;
        file.write_all(&payload)?;
        file.sync_all()?;
        drop(file);
        std::fs::rename(&tmp, &path)?;

        tracing::debug!(
            target_name = target,
            records = state.accumulated.len(),
            units = state.processed_units.len(),
            "checkpoint saved"
        );
        Ok(())
    }

    pub fn inspect(&self, target: &str) -> LoadOutcome {
        let path = self.path_for(target);
        let bytes = match std::fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return LoadOutcome::Absent,
            Err(e) => return LoadOutcome::Corrupt(format!("unreadable: {e}")),
        };
        match serde_json::from_slice::<CheckpointState>(&bytes) {
            Ok(state) if state.target_slug != slug(target) => LoadOutcome::Corrupt(format!(
                "belongs to {:?}, expected {:?}",
                state.target_slug,
                slug(target)
            )),
            Ok(state) => LoadOutcome::Loaded(Box::new(state)),
            Err(e) => LoadOutcome::Corrupt(format!("unparseable: {e}")),
        }
    }

    /// Checkpoint for `target`, or `None` if absent or damaged.
    pub fn load(&self, target: &str) -> Option<CheckpointState> {
        match self.inspect(target) {
            LoadOutcome::Loaded(state) => Some(*state),
            LoadOutcome::Absent => None,
            LoadOutcome::Corrupt(reason) => {
                let err = HarvestError::CheckpointCorruption {
                    target: target.to_string(),
                    reason,
                };
                tracing::warn!("{err}; treating as absent");
                None
            }
        }
    }

    /// Like [`load`](Self::load), but rebuilds a damaged checkpoint from the
    /// records the interrupted run already flushed to the store.
    pub fn load_or_reseed(&self, target: &str, store: &Store) -> HarvestResult<Option<CheckpointState>> {
        let reason = match self.inspect(target) {
            LoadOutcome::Loaded(state) => return Ok(Some(*state)),
            LoadOutcome::Absent => return Ok(None),
            LoadOutcome::Corrupt(reason) => reason,
        };
        tracing::warn!(
            "{}; reseeding from store",
            HarvestError::CheckpointCorruption {
                target: target.to_string(),
                reason,
            }
        );

        let interrupted = store.list_runs(&RunFilter {
            target: Some(target.to_string()),
            status: Some(RunStatus::Running),
            limit: Some(1),
        })?;
        let Some(run) = interrupted.into_iter().next() else {
            return Ok(None);
        };

        let records = store.records_for_run(target, run.id)?;
        if records.is_empty() {
            return Ok(None);
        }
        let processed_units = records
            .iter()
            .filter_map(|r| r.source_unit.clone())
            .collect();
        // Per-record classification is lost with the file; flushed records
        // are counted as this run's new captures.
        let accumulated = records
            .into_iter()
            .map(|record| CapturedRecord {
                record,
                classification: Classification::New,
            })
            .collect::<Vec<_>>();

        tracing::info!(
            run_id = run.id,
            records = accumulated.len(),
            "checkpoint reseeded from store"
        );
        Ok(Some(CheckpointState {
            target_slug: slug(target),
            target: target.to_string(),
            run_id: Some(run.id),
            instance_id: None,
            accumulated,
            processed_units,
            unit_counts: BTreeMap::new(),
            skipped_ids: BTreeSet::new(),
            errors: 0,
            saved_at: Utc::now(),
        }))
    }

    pub fn has_data(&self, target: &str) -> bool {
        self.load(target).map(|s| s.has_data()).unwrap_or(false)
    }

    /// Remove the checkpoint for `target`. Missing files are not an error.
    pub fn clear(&self, target: &str) -> HarvestResult<()> {
        let path = self.path_for(target);
        for p in [path.with_extension("json.tmp"), path] {
            match std::fs::remove_file(&p) {
                Ok(()) => tracing::debug!("removed {}", p.display()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// Every checkpoint file in the directory.
    pub fn list(&self) -> HarvestResult<Vec<CheckpointState>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }
        let mut out = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let path = entry?.path();
            let is_checkpoint = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.ends_with(CHECKPOINT_SUFFIX));
            if !is_checkpoint {
                continue;
            }
            match std::fs::read(&path)
                .ok()
                .and_then(|b| serde_json::from_slice::<CheckpointState>(&b).ok())
            {
                Some(state) => out.push(state),
                None => tracing::warn!("skipping unreadable checkpoint {}", path.display()),
            }
        }
        out.sort_by(|a, b| a.target_slug.cmp(&b.target_slug));
        Ok(out)
    }
}

/// File-name slug of a target name.
pub fn slug(target: &str) -> String {
    let mut out = String::with_capacity(target.len());
    for c in target.trim().chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c.to_ascii_lowercase());
        } else if !out.ends_with('_') {
            out.push('_');
        }
    }
    let trimmed = out.trim_matches('_');
    if trimmed.is_empty() {
        "target".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Background task that periodically saves the run's checkpoint and flushes
/// captured records to the store.
pub struct CheckpointTimer {
    handle: JoinHandle<()>,
    cancel: CancellationToken,
    flusher: Arc<Flusher>,
}

struct Flusher {
    manager: CheckpointManager,
    store: Arc<Store>,
    state: Arc<Mutex<RunState>>,
}

impl Flusher {
    async fn flush(&self) -> HarvestResult<()> {
        let (target, image, records, counters, run_id) = {
            let mut state = self.state.lock().await;
            let target = state.target().to_string();
            let image = state.to_checkpoint(&slug(&target), Utc::now());
            let records = state.is_dirty().then(|| state.take_flush());
            (target, image, records, state.counters(), state.run_id())
        };

        self.manager.save(&target, &image)?;
        if let Some(records) = records {
            if let Err(e) = self.store.upsert(&records, Some(run_id)) {
                // Keep the records pending for the next flush.
                self.state.lock().await.mark_dirty();
                return Err(e.into());
            }
        }
        self.store.update_progress(run_id, counters)?;
        Ok(())
    }
}

impl CheckpointTimer {
    /// Start the timer. It stops when `parent` is cancelled or on
    /// [`shutdown`](Self::shutdown).
    pub fn spawn(
        manager: CheckpointManager,
        store: Arc<Store>,
        state: Arc<Mutex<RunState>>,
        every: Duration,
        parent: &CancellationToken,
    ) -> Self {
        let cancel = parent.child_token();
        let flusher = Arc::new(Flusher {
            manager,
            store,
            state,
        });

        let task_cancel = cancel.clone();
        let task_flusher = flusher.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = task_cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = task_flusher.flush().await {
                            tracing::warn!("checkpoint tick failed: {e}");
                        }
                    }
                }
            }
            tracing::debug!("checkpoint timer stopped");
        });

        tracing::debug!(interval_secs = every.as_secs_f64(), "checkpoint timer started");
        Self {
            handle,
            cancel,
            flusher,
        }
    }

    /// Save once now, outside the tick schedule.
    pub async fn flush_now(&self) -> HarvestResult<()> {
        self.flusher.flush().await
    }

    /// Stop and join the timer; with `final_save` write one last checkpoint.
    pub async fn shutdown(self, final_save: bool) -> HarvestResult<()> {
        self.cancel.cancel();
        if let Err(e) = self.handle.await {
            tracing::warn!("checkpoint timer join failed: {e}");
        }
        if final_save {
            self.flusher.flush().await?;
        }
        Ok(())
    }
}
