//! Drives one run of one target end to end.
//!
//! ## Flow
//!
//! 1. Load the target's checkpoint (or reseed it from the store) and the
//!    known-identity snapshot. Units the checkpoint already processed are
//!    dropped from the queue.
//! 2. Acquire the session pool and start the checkpoint timer and watchdog.
//! 3. Workers pull units from a shared queue; each unit is extracted inside
//!    the worker's exclusive view, normalized, classified, and folded into
//!    the [`RunState`]. A stalled unit gets a fresh view and goes back on the
//!    queue, up to `max_unit_attempts`.
//! 4. Optionally run the Quick and/or Full verification pass.
//! 5. Stop the background tasks, flush to the store, finalize the run,
//!    clear the checkpoint on a clean finish, and sweep backups.
//!
//! Unit-level failures only bump counters. Loss of the rendering session or
//! a store failure ends the run in `error`; the checkpoint then stays behind
//! as the seed for the next execution.

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::Arc;

use chrono::Utc;
use futures::FutureExt;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::adapter::{AdapterRegistry, ExtractionAdapter};
use crate::backup::backup_sweep;
use crate::checkpoint::{CheckpointManager, CheckpointState, CheckpointTimer};
use crate::config::{HarvestConfig, TargetConfig};
use crate::coordinator::SessionCoordinator;
use crate::delta::{full_verify, quick_delta, SecondPass};
use crate::error::{AdapterError, HarvestError, HarvestResult, SessionError};
use crate::identity::{canonicalize, KnownSnapshot};
use crate::observer::{LogLevel, RunObserver, TracingObserver};
use crate::renderer::Launcher;
use crate::state::RunState;
use crate::store::{RunFilter, Store};
use crate::types::{RawRecord, Record, Run, RunStatus, RunSummary, UnitCounts, WorkUnit};
use crate::watchdog::Watchdog;

/// Runs targets against one store and one kind of rendering session.
pub struct Orchestrator {
    config: HarvestConfig,
    store: Arc<Store>,
    checkpoints: CheckpointManager,
    launcher: Arc<dyn Launcher>,
    adapters: Arc<AdapterRegistry>,
    observer: Arc<dyn RunObserver>,
    active: Arc<std::sync::Mutex<HashSet<String>>>,
    instance_id: String,
}

impl Orchestrator {
    pub fn new(config: HarvestConfig, store: Arc<Store>, launcher: Arc<dyn Launcher>) -> Self {
        Self {
            checkpoints: CheckpointManager::new(config.checkpoint_dir()),
            config,
            store,
            launcher,
            adapters: Arc::new(AdapterRegistry::with_builtin()),
            observer: Arc::new(TracingObserver),
            active: Arc::new(std::sync::Mutex::new(HashSet::new())),
            instance_id: uuid::Uuid::new_v4().to_string(),
        }
    }

    pub fn with_adapters(mut self, adapters: AdapterRegistry) -> Self {
        self.adapters = Arc::new(adapters);
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn RunObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn config(&self) -> &HarvestConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub fn checkpoints(&self) -> &CheckpointManager {
        &self.checkpoints
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Run `units` of `target` with up to `concurrency` workers.
    pub async fn execute(
        &self,
        target: &TargetConfig,
        units: &[WorkUnit],
        concurrency: usize,
    ) -> HarvestResult<RunSummary> {
        self.execute_with_cancel(target, units, concurrency, CancellationToken::new())
            .await
    }

    /// Like [`execute`](Self::execute), stopping at the next unit boundary or
    /// lock acquisition once `cancel` fires.
    pub async fn execute_with_cancel(
        &self,
        target: &TargetConfig,
        units: &[WorkUnit],
        concurrency: usize,
        cancel: CancellationToken,
    ) -> HarvestResult<RunSummary> {
        self.config.validate()?;
        target.validate()?;
        let adapter = self.adapters.build(target)?;
        let _lease = TargetLease::claim(&self.active, &target.name)?;

        // Background tasks hang off this token; dropping the guard (for
        // instance when this future is aborted) stops them.
        let run_token = cancel.child_token();
        let _stop_background = run_token.clone().drop_guard();

        let seed = self.checkpoints.load_or_reseed(&target.name, &self.store)?;
        let run = self.open_run(&target.name, seed.as_ref())?;
        let mut state = RunState::new(&target.name, run.id, &self.instance_id);
        if let Some(seed) = seed {
            tracing::info!(
                run_id = run.id,
                units = seed.processed_units.len(),
                records = seed.accumulated.len(),
                "resuming from checkpoint"
            );
            state.seed(seed);
        }

        let known = self.store.known_snapshot(&target.name)?;
        let listing = dedupe_units(units);
        let queue: VecDeque<Queued> = listing
            .iter()
            .filter(|u| !state.is_processed(&u.name))
            .map(|u| Queued {
                unit: u.clone(),
                attempts: 0,
            })
            .collect();
        tracing::info!(
            target_name = %target.name,
            run_id = run.id,
            queued = queue.len(),
            skipped_by_checkpoint = listing.len() - queue.len(),
            known = known.len(),
            "run starting"
        );
        let state = Arc::new(Mutex::new(state));

        let verify = self.config.verify_mode;
        let needs_session = !queue.is_empty() || verify.runs_quick() || verify.runs_full();
        let coordinator = if needs_session {
            let workers = concurrency.max(1).min(queue.len().max(1));
            match SessionCoordinator::acquire(self.launcher.clone(), workers, self.config.coordinator()).await {
                Ok(c) => Some(Arc::new(c)),
                Err(e) => {
                    self.observer
                        .on_log(LogLevel::Error, &format!("session acquisition failed: {e}"));
                    let outcome = Outcome::failed(e.to_string());
                    return self.finish(&run, &state, outcome, None).await;
                }
            }
        } else {
            None
        };

        let timer = CheckpointTimer::spawn(
            self.checkpoints.clone(),
            self.store.clone(),
            state.clone(),
            self.config.checkpoint_interval,
            &run_token,
        );
        let watchdog = coordinator.as_ref().map(|c| {
            Watchdog::spawn(
                c.health(),
                self.config.stall_timeout,
                self.config.watchdog_tick,
                &run_token,
            )
        });

        let mut outcome = Outcome::default();
        if let Some(coordinator) = &coordinator {
            let pass = Pass {
                target: &target.name,
                coordinator,
                adapter: &adapter,
                state: &state,
                known: &known,
                observer: self.observer.as_ref(),
                cancel: &run_token,
                fatal: std::sync::Mutex::new(None),
                max_attempts: self.config.max_unit_attempts,
                queue: std::sync::Mutex::new(queue),
            };

            let workers = (0..coordinator.concurrency()).map(|w| pass.worker(w));
            futures::future::join_all(workers).await;

            if pass.fatal_error().is_none() && !run_token.is_cancelled() {
                pass.verify(&listing, &self.config, &mut outcome).await;
            }
            if let Some(fatal) = pass.fatal_error() {
                outcome.failure = Some(fatal);
            }
        }
        outcome.cancelled = cancel.is_cancelled();

        if let Some(watchdog) = watchdog {
            watchdog.shutdown().await;
        }
        let clean = outcome.failure.is_none() && !outcome.cancelled;
        if let Err(e) = timer.shutdown(!clean).await {
            tracing::error!("final checkpoint save failed: {e}");
        }

        self.finish(&run, &state, outcome, coordinator).await
    }

    /// Adopt the checkpoint's run if it is still open, else open a new one.
    fn open_run(&self, target: &str, seed: Option<&CheckpointState>) -> HarvestResult<Run> {
        let adopted = match seed.and_then(|s| s.run_id) {
            Some(id) => self
                .store
                .get_run(id)?
                .filter(|r| r.status == RunStatus::Running && r.target == target),
            None => None,
        };

        let others = self.store.list_runs(&RunFilter {
            target: Some(target.to_string()),
            status: Some(RunStatus::Running),
            limit: None,
        })?;
        for other in others
            .iter()
            .filter(|r| Some(r.id) != adopted.as_ref().map(|a| a.id))
        {
            tracing::warn!(
                "{}; leaving it for reclamation",
                HarvestError::StaleRunDetected {
                    run_id: other.id,
                    target: target.to_string(),
                }
            );
        }

        match adopted {
            Some(run) => {
                tracing::info!(run_id = run.id, "adopting interrupted run");
                Ok(run)
            }
            None => Ok(self.store.create_run(target, Utc::now())?),
        }
    }

    async fn finish(
        &self,
        run: &Run,
        state: &Arc<Mutex<RunState>>,
        mut outcome: Outcome,
        coordinator: Option<Arc<SessionCoordinator>>,
    ) -> HarvestResult<RunSummary> {
        let (records, counters, attempted, resumed) = {
            let mut st = state.lock().await;
            (st.take_flush(), st.counters(), st.attempted(), st.resumed())
        };

        if !records.is_empty() {
            match self.store.upsert(&records, Some(run.id)) {
                Ok(report) => tracing::debug!(
                    inserted = report.inserted,
                    extended = report.extended,
                    rejected = report.rejected,
                    "final flush"
                ),
                Err(e) => {
                    tracing::error!("final flush failed: {e}");
                    if outcome.failure.is_none() {
                        outcome.failure = Some(format!("store write failed: {e}"));
                        self.save_checkpoint(state).await;
                    }
                }
            }
        }

        let status = if outcome.failure.is_some() {
            RunStatus::Error
        } else if outcome.cancelled {
            RunStatus::Cancelled
        } else {
            RunStatus::Completed
        };

        let mut summary = RunSummary {
            run_id: run.id,
            target: run.target.clone(),
            status,
            started_at: run.started_at,
            completed_at: Utc::now(),
            attempted,
            resumed,
            expected: counters.expected,
            extracted: counters.extracted,
            skipped_existing: counters.skipped_existing,
            reprocessed: counters.reprocessed,
            errors: counters.errors,
            requeued_units: outcome.requeued,
            missing_units: outcome.missing,
            failure: outcome.failure,
        };

        if let Err(e) = self.store.finalize_run(run.id, &summary) {
            tracing::error!(run_id = run.id, "finalize failed: {e}");
            summary.status = RunStatus::Error;
            summary.failure.get_or_insert_with(|| format!("finalize failed: {e}"));
        }

        if summary.status == RunStatus::Completed {
            if let Err(e) = self.checkpoints.clear(&run.target) {
                tracing::warn!("checkpoint clear failed: {e}");
            }
            self.sweep_backups().await;
        }

        if let Some(coordinator) = coordinator {
            coordinator.shutdown().await;
        }
        self.observer.on_run_done(&summary);
        Ok(summary)
    }

    async fn save_checkpoint(&self, state: &Arc<Mutex<RunState>>) {
        let (target, image) = {
            let st = state.lock().await;
            let slug = crate::checkpoint::slug(st.target());
            (st.target().to_string(), st.to_checkpoint(&slug, Utc::now()))
        };
        if let Err(e) = self.checkpoints.save(&target, &image) {
            tracing::error!("checkpoint save failed: {e}");
        }
    }

    async fn sweep_backups(&self) {
        if !self.config.backups_enabled {
            return;
        }
        let store = self.store.clone();
        let root = self.config.backup_dir();
        let policy = self.config.backup_policy;
        let sweep =
            tokio::task::spawn_blocking(move || backup_sweep(&store, &root, &policy, Utc::now())).await;
        match sweep {
            Ok(Ok(report)) => tracing::info!(
                created = report.created.len(),
                pruned = report.pruned.len(),
                retained = report.retained,
                "backup sweep done"
            ),
            Ok(Err(e)) => tracing::warn!("backup sweep failed: {e}"),
            Err(e) => tracing::warn!("backup sweep task failed: {e}"),
        }
    }
}

/// How the passes ended, before it is turned into a status.
#[derive(Debug, Default)]
struct Outcome {
    failure: Option<String>,
    cancelled: bool,
    requeued: Vec<String>,
    missing: Vec<String>,
}

impl Outcome {
    fn failed(reason: String) -> Self {
        Self {
            failure: Some(reason),
            ..Self::default()
        }
    }
}

struct Queued {
    unit: WorkUnit,
    attempts: u32,
}

/// Shared context of the workers of one pass.
struct Pass<'a> {
    target: &'a str,
    coordinator: &'a SessionCoordinator,
    adapter: &'a Arc<dyn ExtractionAdapter>,
    state: &'a Mutex<RunState>,
    known: &'a KnownSnapshot,
    observer: &'a dyn RunObserver,
    cancel: &'a CancellationToken,
    fatal: std::sync::Mutex<Option<SessionError>>,
    max_attempts: u32,
    queue: std::sync::Mutex<VecDeque<Queued>>,
}

enum Listed {
    Count(usize),
    Rows(Vec<RawRecord>),
    Gone,
}

impl Pass<'_> {
    fn next(&self) -> Option<Queued> {
        if self.cancel.is_cancelled() {
            return None;
        }
        self.queue
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .pop_front()
    }

    fn requeue(&self, item: Queued) {
        self.queue
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push_back(item);
    }

    fn fail(&self, error: SessionError) {
        tracing::error!("run-level session failure: {error}");
        self.observer.on_log(LogLevel::Error, &error.to_string());
        let mut fatal = self.fatal.lock().unwrap_or_else(|p| p.into_inner());
        fatal.get_or_insert(error);
        drop(fatal);
        self.cancel.cancel();
    }

    fn fatal_error(&self) -> Option<String> {
        self.fatal
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .as_ref()
            .map(|e| e.to_string())
    }

    fn warn(&self, message: String) {
        tracing::warn!("{message}");
        self.observer.on_log(LogLevel::Warn, &message);
    }

    /// Get a stalled worker a fresh view. `false` when the worker must stop.
    async fn recover(&self, worker: usize) -> bool {
        match self.coordinator.recreate_context(worker, self.cancel).await {
            Ok(()) => true,
            Err(SessionError::Cancelled) => false,
            Err(e) => {
                self.fail(e);
                false
            }
        }
    }

    async fn extract(
        &self,
        worker: usize,
        unit: &WorkUnit,
    ) -> Result<Result<Vec<RawRecord>, AdapterError>, SessionError> {
        let adapter = self.adapter.clone();
        let unit = unit.clone();
        self.coordinator
            .with_exclusive_context(worker, self.cancel, move |view| {
                async move { adapter.extract(&unit, view).await }.boxed()
            })
            .await
    }

    async fn list(
        &self,
        worker: usize,
        unit: &WorkUnit,
    ) -> Result<Result<Listed, AdapterError>, SessionError> {
        let adapter = self.adapter.clone();
        let unit = unit.clone();
        self.coordinator
            .with_exclusive_context(worker, self.cancel, move |view| {
                async move {
                    let counted = adapter.count(&unit, &mut *view).await;
                    let listed = match counted {
                        Ok(Some(n)) => Ok(Listed::Count(n)),
                        Ok(None) => adapter.extract(&unit, view).await.map(Listed::Rows),
                        Err(e) => Err(e),
                    };
                    match listed {
                        Err(AdapterError::DeadEnd(_)) => Ok(Listed::Gone),
                        other => other,
                    }
                }
                .boxed()
            })
            .await
    }

    fn canonical(&self, unit: &str, rows: &[RawRecord]) -> (Vec<Record>, usize) {
        let mut records = Vec::with_capacity(rows.len());
        let mut rejected = 0;
        for row in rows {
            match canonicalize(self.target, unit, row) {
                Ok(record) => records.push(record),
                Err(e) => {
                    tracing::debug!(unit, "{e}");
                    rejected += 1;
                }
            }
        }
        (records, rejected)
    }

    async fn worker(&self, worker: usize) {
        tracing::debug!(worker, "worker started");
        while let Some(mut item) = self.next() {
            item.attempts += 1;
            if item.attempts == 1 {
                self.observer.on_unit_start(&item.unit.name);
                self.state.lock().await.begin_unit();
            }

            match self.extract(worker, &item.unit).await {
                Ok(Ok(rows)) => {
                    let (records, rejected) = self.canonical(&item.unit.name, &rows);
                    let counts = {
                        let mut st = self.state.lock().await;
                        let mut counts = st.absorb(self.known, records);
                        st.mark_processed(&item.unit.name, rows.len());
                        counts.raw = rows.len();
                        counts.rejected = rejected;
                        counts
                    };
                    self.observer.on_unit_done(&item.unit.name, &counts);
                }
                Ok(Err(e)) => {
                    self.state.lock().await.record_error();
                    self.warn(format!("unit {:?} skipped: {e}", item.unit.name));
                }
                Err(SessionError::Cancelled) => break,
                Err(e) if e.is_stall() => {
                    self.warn(format!(
                        "unit {:?} stalled on worker {worker} (attempt {}): {e}",
                        item.unit.name, item.attempts
                    ));
                    let recovered = self.recover(worker).await;
                    if item.attempts < self.max_attempts {
                        self.requeue(item);
                    } else {
                        self.state.lock().await.record_error();
                        self.warn(format!(
                            "unit {:?} given up after {} attempts",
                            item.unit.name, item.attempts
                        ));
                    }
                    if !recovered {
                        break;
                    }
                }
                Err(e) => {
                    self.fail(e);
                    break;
                }
            }
        }
        tracing::debug!(worker, "worker finished");
    }

    /// Second pass over the full listing, on worker 0.
    async fn verify(&self, listing: &[WorkUnit], config: &HarvestConfig, outcome: &mut Outcome) {
        let mode = config.verify_mode;
        if !mode.runs_quick() && !mode.runs_full() {
            return;
        }
        let mut second = SecondPass::default();
        let mut missing = std::collections::BTreeSet::new();

        if mode.runs_quick() {
            let prior = self.state.lock().await.unit_counts().clone();
            let mut current = BTreeMap::new();
            let mut rows_by_unit = BTreeMap::new();
            for unit in listing {
                match self.with_retry(move || self.list(0, unit)).await {
                    Some(Ok(Listed::Count(n))) => {
                        current.insert(unit.name.clone(), n);
                    }
                    Some(Ok(Listed::Rows(rows))) => {
                        current.insert(unit.name.clone(), rows.len());
                        rows_by_unit.insert(unit.name.clone(), rows);
                    }
                    Some(Ok(Listed::Gone)) => {}
                    Some(Err(e)) => {
                        self.warn(format!("quick count of {:?} failed: {e}", unit.name));
                        current.insert(unit.name.clone(), usize::MAX);
                    }
                    None => return,
                }
            }

            let delta = quick_delta(&prior, &current);
            tracing::info!(
                requeue = delta.requeue.len(),
                missing = delta.missing.len(),
                "quick verification"
            );
            missing.extend(delta.missing);
            for name in &delta.requeue {
                let Some(unit) = listing.iter().find(|u| &u.name == name) else {
                    continue;
                };
                let rows = match rows_by_unit.remove(name) {
                    Some(rows) => rows,
                    None => match self.with_retry(move || self.extract(0, unit)).await {
                        Some(Ok(rows)) => rows,
                        Some(Err(e)) => {
                            self.state.lock().await.record_error();
                            self.warn(format!("re-extraction of {name:?} failed: {e}"));
                            continue;
                        }
                        None => return,
                    },
                };
                self.state.lock().await.update_unit_count(name, rows.len());
                let (records, _) = self.canonical(name, &rows);
                second.record_quick(name, records);
            }
        }

        if mode.runs_full() {
            for unit in listing {
                match self.with_retry(move || self.extract(0, unit)).await {
                    Some(Ok(rows)) => {
                        self.state.lock().await.update_unit_count(&unit.name, rows.len());
                        let (records, _) = self.canonical(&unit.name, &rows);
                        second.record_full(&unit.name, records);
                    }
                    Some(Err(AdapterError::DeadEnd(_))) => {
                        missing.insert(unit.name.clone());
                    }
                    Some(Err(e)) => {
                        self.state.lock().await.record_error();
                        self.warn(format!("full verification of {:?} failed: {e}", unit.name));
                    }
                    None => return,
                }
            }
        }

        let requeued: Vec<String> = second.units().map(str::to_string).collect();
        for (unit, records) in second.into_records() {
            let mut st = self.state.lock().await;
            let effective = st.effective_snapshot(self.known);
            let (tally, _) = full_verify(&effective, &records);
            if tally.found_changes() {
                tracing::info!(
                    unit = %unit,
                    new = tally.new,
                    extended = tally.reprocessed,
                    "verification found changes"
                );
            }
            let counts: UnitCounts = st.absorb(self.known, records);
            st.mark_processed(&unit, counts.raw);
        }

        outcome.requeued = requeued;
        outcome.missing = missing.into_iter().collect();
    }

    /// Run a session interaction for the second pass, retrying stalls.
    /// `None` means the pass must stop.
    async fn with_retry<T, F, Fut>(&self, mut op: F) -> Option<Result<T, AdapterError>>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<Result<T, AdapterError>, SessionError>>,
    {
        for attempt in 1..=self.max_attempts {
            match op().await {
                Ok(result) => return Some(result),
                Err(SessionError::Cancelled) => return None,
                Err(e) if e.is_stall() => {
                    self.warn(format!("verification interaction stalled (attempt {attempt}): {e}"));
                    if !self.recover(0).await {
                        return None;
                    }
                }
                Err(e) => {
                    self.fail(e);
                    return None;
                }
            }
        }
        Some(Err(AdapterError::Navigation(format!(
            "view stalled {} times",
            self.max_attempts
        ))))
    }
}

/// Units in first-seen order, duplicates by name dropped.
fn dedupe_units(units: &[WorkUnit]) -> Vec<WorkUnit> {
    let mut seen = HashSet::new();
    units
        .iter()
        .filter(|u| seen.insert(u.name.clone()))
        .cloned()
        .collect()
}

/// Exclusive claim on a target within this orchestrator.
struct TargetLease {
    active: Arc<std::sync::Mutex<HashSet<String>>>,
    slug: String,
}

impl TargetLease {
    fn claim(active: &Arc<std::sync::Mutex<HashSet<String>>>, target: &str) -> HarvestResult<Self> {
        let slug = crate::checkpoint::slug(target);
        let mut set = active.lock().unwrap_or_else(|p| p.into_inner());
        if !set.insert(slug.clone()) {
            return Err(HarvestError::TargetBusy(target.to_string()));
        }
        Ok(Self {
            active: active.clone(),
            slug,
        })
    }
}

impl Drop for TargetLease {
    fn drop(&mut self) {
        self.active
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(&self.slug);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dedupe_keeps_first_occurrence() {
        let units = vec![
            WorkUnit::new("Roads"),
            WorkUnit::new("Bridges"),
            WorkUnit::new("Roads").with_url("https://dup"),
        ];
        let out = dedupe_units(&units);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].url, None);
    }

    #[test]
    fn test_target_lease_is_exclusive_and_released() {
        let active = Arc::new(std::sync::Mutex::new(HashSet::new()));
        let lease = TargetLease::claim(&active, "Kerala PWD").unwrap();
        assert!(matches!(
            TargetLease::claim(&active, "kerala pwd"),
            Err(HarvestError::TargetBusy(_))
        ));
        drop(lease);
        assert!(TargetLease::claim(&active, "Kerala PWD").is_ok());
    }
}
