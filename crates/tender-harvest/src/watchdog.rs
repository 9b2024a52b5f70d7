//! Per-worker liveness tracking.
//!
//! Each worker reports its phase on a shared [`HealthBoard`]. Every call a
//! worker makes into its view context counts as a heartbeat. The
//! [`Watchdog`] task flags a worker that is `Busy` and has been silent
//! longer than the stall timeout; the worker's in-flight interaction is then
//! interrupted through [`WorkerHealth::stalled`].
//!
//! A worker waiting for the session lock is `Waiting`, never stalled.

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::futures::Notified;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WorkerPhase {
    Idle = 0,
    Waiting = 1,
    Busy = 2,
    Stalled = 3,
}

impl WorkerPhase {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => Self::Waiting,
            2 => Self::Busy,
            3 => Self::Stalled,
            _ => Self::Idle,
        }
    }
}

#[derive(Debug)]
pub struct WorkerHealth {
    epoch: Instant,
    phase: AtomicU8,
    last_beat_ms: AtomicU64,
    stall: Notify,
}

impl WorkerHealth {
    fn new(epoch: Instant) -> Self {
        Self {
            epoch,
            phase: AtomicU8::new(WorkerPhase::Idle as u8),
            last_beat_ms: AtomicU64::new(0),
            stall: Notify::new(),
        }
    }

    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    pub fn beat(&self) {
        self.last_beat_ms.store(self.now_ms(), Ordering::Relaxed);
    }

    pub fn phase(&self) -> WorkerPhase {
        WorkerPhase::from_u8(self.phase.load(Ordering::Acquire))
    }

    fn set(&self, phase: WorkerPhase) {
        self.phase.store(phase as u8, Ordering::Release);
    }

    pub fn set_idle(&self) {
        self.set(WorkerPhase::Idle);
    }

    pub fn set_waiting(&self) {
        self.set(WorkerPhase::Waiting);
    }

    pub fn set_busy(&self) {
        self.beat();
        self.set(WorkerPhase::Busy);
    }

    pub fn silent_for(&self) -> Duration {
        let last = self.last_beat_ms.load(Ordering::Relaxed);
        Duration::from_millis(self.now_ms().saturating_sub(last))
    }

    /// Future resolved when the watchdog flags this worker. Obtain it before
    /// entering `Busy`.
    pub fn stalled(&self) -> Notified<'_> {
        self.stall.notified()
    }

    fn flag_if_stalled(&self, stall_timeout: Duration) -> bool {
        if self.phase() != WorkerPhase::Busy || self.silent_for() <= stall_timeout {
            return false;
        }
        let flagged = self
            .phase
            .compare_exchange(
                WorkerPhase::Busy as u8,
                WorkerPhase::Stalled as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok();
        if flagged {
            self.stall.notify_waiters();
        }
        flagged
    }
}

/// Health slots for every worker of one pool.
#[derive(Debug)]
pub struct HealthBoard {
    workers: Vec<WorkerHealth>,
}

impl HealthBoard {
    pub fn new(workers: usize) -> Self {
        let epoch = Instant::now();
        Self {
            workers: (0..workers).map(|_| WorkerHealth::new(epoch)).collect(),
        }
    }

    pub fn worker(&self, index: usize) -> Option<&WorkerHealth> {
        self.workers.get(index)
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Flag every busy worker silent longer than `stall_timeout`. Returns
    /// the indices flagged by this call.
    pub fn sweep(&self, stall_timeout: Duration) -> Vec<usize> {
        self.workers
            .iter()
            .enumerate()
            .filter(|(_, w)| w.flag_if_stalled(stall_timeout))
            .map(|(i, _)| i)
            .collect()
    }
}

/// Background task sweeping a [`HealthBoard`] on a fixed tick.
pub struct Watchdog {
    handle: JoinHandle<()>,
    cancel: CancellationToken,
}

impl Watchdog {
    pub fn spawn(
        board: Arc<HealthBoard>,
        stall_timeout: Duration,
        tick: Duration,
        parent: &CancellationToken,
    ) -> Self {
        let cancel = parent.child_token();
        let task_cancel = cancel.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(tick);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = task_cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        for worker in board.sweep(stall_timeout) {
                            tracing::warn!(
                                worker,
                                stall_timeout_ms = stall_timeout.as_millis() as u64,
                                "worker stalled"
                            );
                        }
                    }
                }
            }
        });
        Self { handle, cancel }
    }

    pub async fn shutdown(self) {
        self.cancel.cancel();
        if let Err(e) = self.handle.await {
            tracing::warn!("watchdog join failed: {e}");
        }
    }
}
