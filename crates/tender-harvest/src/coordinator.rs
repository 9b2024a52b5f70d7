//! Worker pool over one shared rendering session.
//!
//! The session can service one interaction at a time, so every interaction
//! runs under a session-wide lock: a worker takes the lock, switches the
//! session to its own view, interacts, and releases. Work done outside
//! [`SessionCoordinator::with_exclusive_context`] runs unserialized.
//!
//! Each worker owns a stable view slot. A view that stops responding is
//! recreated in place; if the session itself will not hand out views any
//! more, it is re-launched once before the coordinator gives up.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use tokio::sync::futures::Notified;
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;

use crate::error::SessionError;
use crate::renderer::{Launcher, NavigationResult, RenderContext, Renderer};
use crate::watchdog::{HealthBoard, WorkerHealth};

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Upper bound on one interaction.
    pub interaction_timeout: Duration,
    /// Upper bound on launching a session or creating a view.
    pub launch_timeout: Duration,
    /// Session re-launches allowed before the session counts as lost.
    pub max_reacquisitions: u32,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            interaction_timeout: Duration::from_secs(90),
            launch_timeout: Duration::from_secs(60),
            max_reacquisitions: 1,
        }
    }
}

struct Slot {
    ctx: Option<Box<dyn RenderContext>>,
    generation: u64,
}

pub struct SessionCoordinator {
    launcher: Arc<dyn Launcher>,
    session: RwLock<Arc<dyn Renderer>>,
    generation: AtomicU64,
    reacquisitions: AtomicU32,
    interaction: Mutex<()>,
    slots: Vec<Mutex<Slot>>,
    health: Arc<HealthBoard>,
    cfg: CoordinatorConfig,
}

impl SessionCoordinator {
    /// Launch a session and pre-create `workers` views.
    ///
    /// If any view beyond the first cannot be created the pool degrades to a
    /// single worker.
    pub async fn acquire(
        launcher: Arc<dyn Launcher>,
        workers: usize,
        cfg: CoordinatorConfig,
    ) -> Result<Self, SessionError> {
        let workers = workers.max(1);
        let session = launch(launcher.as_ref(), cfg.launch_timeout).await?;

        let mut contexts = Vec::with_capacity(workers);
        for index in 0..workers {
            match new_view(session.as_ref(), cfg.launch_timeout).await {
                Ok(ctx) => contexts.push(ctx),
                Err(e) if index == 0 => {
                    let _ = session.shutdown().await;
                    return Err(e);
                }
                Err(e) => {
                    tracing::warn!(
                        requested = workers,
                        "view creation failed ({e}); degrading to one worker"
                    );
                    for extra in contexts.drain(1..) {
                        let _ = extra.close().await;
                    }
                    break;
                }
            }
        }

        let slots = contexts
            .into_iter()
            .map(|ctx| {
                Mutex::new(Slot {
                    ctx: Some(ctx),
                    generation: 0,
                })
            })
            .collect::<Vec<_>>();
        tracing::info!(workers = slots.len(), "session pool acquired");

        Ok(Self {
            launcher,
            session: RwLock::new(session),
            generation: AtomicU64::new(0),
            reacquisitions: AtomicU32::new(0),
            interaction: Mutex::new(()),
            health: Arc::new(HealthBoard::new(slots.len())),
            slots,
            cfg,
        })
    }

    /// Number of workers the pool can serve.
    pub fn concurrency(&self) -> usize {
        self.slots.len()
    }

    pub fn health(&self) -> Arc<HealthBoard> {
        self.health.clone()
    }

    /// Run `f` against worker `worker`'s view while holding the session.
    ///
    /// `cancel` is only observed while waiting for the lock; once `f` has
    /// started it runs until it returns, times out, or the watchdog flags it.
    /// Stalls (timeout, watchdog flag, dead view) come back as
    /// [`SessionError`]s for which [`SessionError::is_stall`] holds.
    pub async fn with_exclusive_context<R, F>(
        &self,
        worker: usize,
        cancel: &CancellationToken,
        f: F,
    ) -> Result<R, SessionError>
    where
        F: for<'c> FnOnce(&'c mut dyn RenderContext) -> BoxFuture<'c, R>,
    {
        let health = self
            .health
            .worker(worker)
            .ok_or(SessionError::UnknownWorker(worker))?;
        let slot = self
            .slots
            .get(worker)
            .ok_or(SessionError::UnknownWorker(worker))?;

        health.set_waiting();
        let _session = tokio::select! {
            guard = self.interaction.lock() => guard,
            _ = cancel.cancelled() => {
                health.set_idle();
                return Err(SessionError::Cancelled);
            }
        };

        let stalled = health.stalled();
        health.set_busy();
        let result = self.interact(worker, slot, health, stalled, f).await;
        health.set_idle();
        result
    }

    async fn interact<R, F>(
        &self,
        worker: usize,
        slot: &Mutex<Slot>,
        health: &WorkerHealth,
        stalled: Notified<'_>,
        f: F,
    ) -> Result<R, SessionError>
    where
        F: for<'c> FnOnce(&'c mut dyn RenderContext) -> BoxFuture<'c, R>,
    {
        let mut slot = slot.lock().await;
        let ctx = self.ensure_view(worker, &mut slot).await?;

        match tokio::time::timeout(self.cfg.interaction_timeout, ctx.activate()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                return Err(SessionError::ContextUnresponsive {
                    worker,
                    reason: e.to_string(),
                })
            }
            Err(_) => {
                return Err(SessionError::ContextUnresponsive {
                    worker,
                    reason: "activation timed out".into(),
                })
            }
        }

        let mut tracked = Tracked { inner: ctx, health };
        tokio::select! {
            out = tokio::time::timeout(self.cfg.interaction_timeout, f(&mut tracked)) => {
                out.map_err(|_| SessionError::InteractionTimeout {
                    worker,
                    timeout_ms: self.cfg.interaction_timeout.as_millis() as u64,
                })
            }
            _ = stalled => Err(SessionError::Stalled {
                worker,
                silent_ms: health.silent_for().as_millis() as u64,
            }),
        }
    }

    /// Replace worker `worker`'s view with a fresh one, re-launching the
    /// session if it no longer hands out views.
    pub async fn recreate_context(
        &self,
        worker: usize,
        cancel: &CancellationToken,
    ) -> Result<(), SessionError> {
        let slot = self
            .slots
            .get(worker)
            .ok_or(SessionError::UnknownWorker(worker))?;
        let _session = tokio::select! {
            guard = self.interaction.lock() => guard,
            _ = cancel.cancelled() => return Err(SessionError::Cancelled),
        };

        let mut slot = slot.lock().await;
        if let Some(old) = slot.ctx.take() {
            if tokio::time::timeout(self.cfg.launch_timeout, old.close())
                .await
                .is_err()
            {
                tracing::debug!(worker, "closing stale view timed out");
            }
        }

        let session = self.session.read().await.clone();
        match new_view(session.as_ref(), self.cfg.launch_timeout).await {
            Ok(ctx) => {
                slot.ctx = Some(ctx);
                slot.generation = self.generation.load(Ordering::Acquire);
                tracing::info!(worker, "view recreated");
                Ok(())
            }
            Err(e) => {
                tracing::warn!(worker, "view recreation failed: {e}");
                let ctx = self.reacquire(e.to_string()).await?;
                slot.ctx = Some(ctx);
                slot.generation = self.generation.load(Ordering::Acquire);
                Ok(())
            }
        }
    }

    /// Re-launch the session. Caller holds the interaction lock.
    async fn reacquire(&self, reason: String) -> Result<Box<dyn RenderContext>, SessionError> {
        let attempts = self.reacquisitions.fetch_add(1, Ordering::AcqRel) + 1;
        if attempts > self.cfg.max_reacquisitions {
            return Err(SessionError::SessionLost {
                attempts: attempts - 1,
                reason,
            });
        }

        tracing::warn!(attempt = attempts, "re-acquiring rendering session: {reason}");
        let lost = |e: SessionError| SessionError::SessionLost {
            attempts,
            reason: e.to_string(),
        };
        let fresh = launch(self.launcher.as_ref(), self.cfg.launch_timeout)
            .await
            .map_err(lost)?;
        let ctx = new_view(fresh.as_ref(), self.cfg.launch_timeout)
            .await
            .map_err(lost)?;

        let old = {
            let mut session = self.session.write().await;
            std::mem::replace(&mut *session, fresh)
        };
        self.generation.fetch_add(1, Ordering::AcqRel);
        if let Err(e) = old.shutdown().await {
            tracing::debug!("old session shutdown failed: {e}");
        }
        tracing::info!("rendering session re-acquired");
        Ok(ctx)
    }

    /// View for `worker`, creating it if missing or left over from a
    /// previous session.
    async fn ensure_view<'s>(
        &self,
        worker: usize,
        slot: &'s mut Slot,
    ) -> Result<&'s mut Box<dyn RenderContext>, SessionError> {
        let current = self.generation.load(Ordering::Acquire);
        if slot.generation != current {
            if let Some(stale) = slot.ctx.take() {
                let _ = tokio::time::timeout(self.cfg.launch_timeout, stale.close()).await;
            }
        }
        if slot.ctx.is_none() {
            let session = self.session.read().await.clone();
            let ctx = new_view(session.as_ref(), self.cfg.launch_timeout)
                .await
                .map_err(|e| SessionError::ContextUnresponsive {
                    worker,
                    reason: e.to_string(),
                })?;
            slot.generation = current;
            slot.ctx = Some(ctx);
        }
        match slot.ctx.as_mut() {
            Some(ctx) => Ok(ctx),
            None => Err(SessionError::ContextUnresponsive {
                worker,
                reason: "no view".into(),
            }),
        }
    }

    /// Close every view and the session.
    pub async fn shutdown(&self) {
        for slot in &self.slots {
            if let Some(ctx) = slot.lock().await.ctx.take() {
                let _ = tokio::time::timeout(self.cfg.launch_timeout, ctx.close()).await;
            }
        }
        let session = self.session.read().await.clone();
        if let Err(e) = session.shutdown().await {
            tracing::debug!("session shutdown failed: {e}");
        }
        tracing::debug!("session pool shut down");
    }
}

async fn launch(launcher: &dyn Launcher, limit: Duration) -> Result<Arc<dyn Renderer>, SessionError> {
    match tokio::time::timeout(limit, launcher.launch()).await {
        Ok(Ok(session)) => Ok(session),
        Ok(Err(e)) => Err(SessionError::Launch(e.to_string())),
        Err(_) => Err(SessionError::Launch(format!(
            "timed out after {}ms",
            limit.as_millis()
        ))),
    }
}

async fn new_view(session: &dyn Renderer, limit: Duration) -> Result<Box<dyn RenderContext>, SessionError> {
    match tokio::time::timeout(limit, session.new_context()).await {
        Ok(Ok(ctx)) => Ok(ctx),
        Ok(Err(e)) => Err(SessionError::ContextCreation(e.to_string())),
        Err(_) => Err(SessionError::ContextCreation(format!(
            "timed out after {}ms",
            limit.as_millis()
        ))),
    }
}

/// A borrowed view that reports every call as worker activity.
struct Tracked<'a> {
    inner: &'a mut Box<dyn RenderContext>,
    health: &'a WorkerHealth,
}

#[async_trait]
impl<'a> RenderContext for Tracked<'a> {
    async fn activate(&mut self) -> anyhow::Result<()> {
        self.health.beat();
        let out = self.inner.activate().await;
        self.health.beat();
        out
    }

    async fn navigate(&mut self, url: &str, timeout_ms: u64) -> anyhow::Result<NavigationResult> {
        self.health.beat();
        let out = self.inner.navigate(url, timeout_ms).await;
        self.health.beat();
        out
    }

    async fn execute_js(&self, script: &str) -> anyhow::Result<serde_json::Value> {
        self.health.beat();
        let out = self.inner.execute_js(script).await;
        self.health.beat();
        out
    }

    async fn close(self: Box<Self>) -> anyhow::Result<()> {
        Err(anyhow::anyhow!("views are closed by the coordinator"))
    }
}
