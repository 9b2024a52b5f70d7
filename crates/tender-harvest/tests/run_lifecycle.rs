//! End-to-end runs against a scripted portal and an in-process renderer.
//!
//! Covers crash/resume, pool degradation, stall recovery (timeout and
//! watchdog), re-classification across runs, the verification passes, and
//! session loss.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use tender_harvest::adapter::{AdapterRegistry, ExtractionAdapter};
use tender_harvest::checkpoint::CheckpointManager;
use tender_harvest::delta::VerifyMode;
use tender_harvest::observer::{LogLevel, NullObserver, RunObserver};
use tender_harvest::renderer::{Launcher, NavigationResult, RenderContext, Renderer};
use tender_harvest::store::Store;
use tender_harvest::types::*;
use tender_harvest::{AdapterError, HarvestConfig, Orchestrator, TargetConfig};

// ─────────────────────── renderer ───────────────────────

#[derive(Default)]
struct FakeRenderer {
    created: AtomicUsize,
    /// Refuse every context after this many.
    max_contexts: Option<usize>,
}

struct FakeView;

#[async_trait]
impl RenderContext for FakeView {
    async fn activate(&mut self) -> anyhow::Result<()> {
        Ok(())
    }
    async fn navigate(&mut self, url: &str, _timeout_ms: u64) -> anyhow::Result<NavigationResult> {
        Ok(NavigationResult {
            final_url: url.to_string(),
            load_time_ms: 1,
        })
    }
    async fn execute_js(&self, _script: &str) -> anyhow::Result<serde_json::Value> {
        Ok(serde_json::Value::Null)
    }
    async fn close(self: Box<Self>) -> anyhow::Result<()> {
        Ok(())
    }
}

#[async_trait]
impl Renderer for FakeRenderer {
    async fn new_context(&self) -> anyhow::Result<Box<dyn RenderContext>> {
        let n = self.created.fetch_add(1, Ordering::SeqCst);
        if self.max_contexts.is_some_and(|max| n >= max) {
            anyhow::bail!("context limit reached");
        }
        Ok(Box::new(FakeView))
    }
    async fn shutdown(&self) -> anyhow::Result<()> {
        Ok(())
    }
    fn active_contexts(&self) -> usize {
        0
    }
}

struct FakeLauncher {
    renderer: Arc<FakeRenderer>,
    fail: bool,
    launches: AtomicUsize,
}

impl FakeLauncher {
    fn new(renderer: FakeRenderer) -> Arc<Self> {
        Arc::new(Self {
            renderer: Arc::new(renderer),
            fail: false,
            launches: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl Launcher for FakeLauncher {
    async fn launch(&self) -> anyhow::Result<Arc<dyn Renderer>> {
        self.launches.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            anyhow::bail!("no browser");
        }
        Ok(self.renderer.clone())
    }
}

// ─────────────────────── portal ───────────────────────

/// What the n-th extraction of a unit sees. The last page repeats.
#[derive(Clone)]
enum Page {
    Rows(Vec<(&'static str, &'static str)>),
    Hang,
    Gone,
    Broken,
}

#[derive(Default)]
struct Portal {
    pages: Mutex<HashMap<String, Vec<Page>>>,
    calls: Mutex<HashMap<String, usize>>,
}

impl Portal {
    fn with(units: &[(&str, Vec<Page>)]) -> Arc<Self> {
        let portal = Portal::default();
        {
            let mut pages = portal.pages.lock().unwrap();
            for (name, script) in units {
                pages.insert(name.to_string(), script.clone());
            }
        }
        Arc::new(portal)
    }

    fn set(&self, unit: &str, script: Vec<Page>) {
        self.pages.lock().unwrap().insert(unit.to_string(), script);
        self.calls.lock().unwrap().remove(unit);
    }

    fn calls(&self, unit: &str) -> usize {
        self.calls.lock().unwrap().get(unit).copied().unwrap_or(0)
    }

    fn next_page(&self, unit: &str) -> Page {
        let mut calls = self.calls.lock().unwrap();
        let n = calls.entry(unit.to_string()).or_insert(0);
        let pages = self.pages.lock().unwrap();
        let script = pages.get(unit).cloned().unwrap_or_default();
        let page = script
            .get(*n)
            .or_else(|| script.last())
            .cloned()
            .unwrap_or(Page::Gone);
        *n += 1;
        page
    }
}

struct PortalAdapter(Arc<Portal>);

#[async_trait]
impl ExtractionAdapter for PortalAdapter {
    fn family(&self) -> &str {
        "portal"
    }

    async fn extract(
        &self,
        unit: &WorkUnit,
        ctx: &mut dyn RenderContext,
    ) -> Result<Vec<RawRecord>, AdapterError> {
        ctx.navigate(&format!("https://portal.test/{}", unit.name), 1_000)
            .await?;
        match self.0.next_page(&unit.name) {
            Page::Rows(rows) => Ok(rows
                .into_iter()
                .map(|(id, date)| RawRecord::new(id, date).with_field("unit", unit.name.clone()))
                .collect()),
            Page::Hang => {
                tokio::time::sleep(Duration::from_secs(3_600)).await;
                Ok(vec![])
            }
            Page::Gone => Err(AdapterError::DeadEnd(format!("{} delisted", unit.name))),
            Page::Broken => Err(AdapterError::Malformed("table without header".into())),
        }
    }
}

// ─────────────────────── helpers ───────────────────────

/// Reports finished unit names.
struct DoneFeed(mpsc::UnboundedSender<String>);

impl RunObserver for DoneFeed {
    fn on_unit_start(&self, _unit: &str) {}
    fn on_unit_done(&self, unit: &str, _counts: &UnitCounts) {
        let _ = self.0.send(unit.to_string());
    }
    fn on_run_done(&self, _summary: &RunSummary) {}
    fn on_log(&self, _level: LogLevel, _message: &str) {}
}

fn config(dir: &tempfile::TempDir) -> HarvestConfig {
    HarvestConfig {
        checkpoint_interval: Duration::from_millis(20),
        interaction_timeout: Duration::from_secs(30),
        launch_timeout: Duration::from_secs(5),
        stall_timeout: Duration::from_secs(30),
        watchdog_tick: Duration::from_millis(10),
        backups_enabled: false,
        ..HarvestConfig::default().with_data_dir(dir.path())
    }
}

fn target(units: &[&str]) -> TargetConfig {
    TargetConfig {
        name: "Kerala PWD".into(),
        layout: "portal".into(),
        units: units.iter().map(|u| WorkUnit::new(*u)).collect(),
        options: serde_json::Value::Null,
    }
}

fn orchestrator(
    cfg: HarvestConfig,
    launcher: Arc<dyn Launcher>,
    portal: &Arc<Portal>,
) -> Orchestrator {
    let store = Arc::new(Store::open(&cfg.db_path()).unwrap());
    let mut adapters = AdapterRegistry::empty();
    adapters.register_adapter(Arc::new(PortalAdapter(portal.clone())));
    Orchestrator::new(cfg, store, launcher)
        .with_adapters(adapters)
        .with_observer(Arc::new(NullObserver))
}

fn rows(pairs: &[(&'static str, &'static str)]) -> Page {
    Page::Rows(pairs.to_vec())
}

// ─────────────────────── tests ───────────────────────

#[tokio::test]
async fn test_resume_after_crash_does_not_recount() {
    let dir = tempfile::tempdir().unwrap();
    let portal = Portal::with(&[
        ("Roads", vec![rows(&[("RD/001", "15-Jan-2026")])]),
        ("Bridges", vec![Page::Hang]),
    ]);
    let t = target(&["Roads", "Bridges"]);

    // First process: Roads finishes, Bridges hangs, the process dies.
    let (tx, mut done) = mpsc::unbounded_channel();
    let first = orchestrator(config(&dir), FakeLauncher::new(FakeRenderer::default()), &portal)
        .with_observer(Arc::new(DoneFeed(tx)));
    let units = t.units.clone();
    let first_target = t.clone();
    let handle = tokio::spawn(async move { first.execute(&first_target, &units, 1).await });
    assert_eq!(done.recv().await.unwrap(), "Roads");
    tokio::time::sleep(Duration::from_millis(150)).await;
    handle.abort();
    let _ = handle.await;

    let checkpoints = CheckpointManager::new(config(&dir).checkpoint_dir());
    let seed = checkpoints.load(&t.name).expect("checkpoint left behind");
    assert!(seed.processed_units.contains("Roads"));
    let crashed_run = seed.run_id.unwrap();

    // Second process: Bridges is reachable now.
    portal.set("Bridges", vec![rows(&[("BR/007", "20-Jan-2026")])]);
    let second = orchestrator(config(&dir), FakeLauncher::new(FakeRenderer::default()), &portal);
    let summary = second.execute(&t, &t.units, 1).await.unwrap();

    assert_eq!(summary.status, RunStatus::Completed);
    assert_eq!(summary.run_id, crashed_run);
    assert_eq!(summary.extracted, 2);
    assert_eq!(summary.skipped_existing, 0);
    assert_eq!(summary.resumed, 1);
    assert_eq!(portal.calls("Roads"), 1);
    assert_eq!(second.store().count_records(&t.name).unwrap(), 2);
    assert!(!checkpoints.has_data(&t.name));

    let run = second.store().get_run(crashed_run).unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.extracted_count, 2);
}

#[tokio::test]
async fn test_second_run_skips_unchanged_and_reprocesses_extended() {
    let dir = tempfile::tempdir().unwrap();
    let portal = Portal::with(&[
        ("Roads", vec![rows(&[("RD/001", "15-Jan-2026"), ("RD/002", "16-Jan-2026")])]),
        ("Bridges", vec![rows(&[("BR/007", "20-Jan-2026")])]),
    ]);
    let t = target(&["Roads", "Bridges"]);
    let launcher = FakeLauncher::new(FakeRenderer::default());
    let orch = orchestrator(config(&dir), launcher, &portal);

    let first = orch.execute(&t, &t.units, 2).await.unwrap();
    assert_eq!(first.extracted, 3);
    assert_eq!(first.expected, 3);

    let second = orch.execute(&t, &t.units, 2).await.unwrap();
    assert_eq!(second.extracted, 0);
    assert_eq!(second.skipped_existing, 3);

    // Closing date pushed back on one tender.
    portal.set("Roads", vec![rows(&[("rd 001", "22/01/2026"), ("RD/002", "16-Jan-2026")])]);
    let third = orch.execute(&t, &t.units, 2).await.unwrap();
    assert_eq!(third.extracted, 1);
    assert_eq!(third.reprocessed, 1);
    assert_eq!(third.skipped_existing, 2);

    assert_eq!(orch.store().count_records(&t.name).unwrap(), 3);
    let known = orch.store().known_snapshot(&t.name).unwrap();
    assert_eq!(known.get("rd-001"), Some("2026-01-22"));
}

#[tokio::test]
async fn test_pool_degrades_to_one_worker() {
    let dir = tempfile::tempdir().unwrap();
    let portal = Portal::with(&[
        ("Roads", vec![rows(&[("RD/001", "15-Jan-2026")])]),
        ("Bridges", vec![rows(&[("BR/007", "20-Jan-2026")])]),
        ("Ports", vec![rows(&[("PT/003", "21-Jan-2026")])]),
    ]);
    let t = target(&["Roads", "Bridges", "Ports"]);
    let launcher = FakeLauncher::new(FakeRenderer {
        max_contexts: Some(1),
        ..FakeRenderer::default()
    });
    let orch = orchestrator(config(&dir), launcher, &portal);

    let summary = orch.execute(&t, &t.units, 3).await.unwrap();
    assert_eq!(summary.status, RunStatus::Completed);
    assert_eq!(summary.extracted, 3);
    assert_eq!(summary.attempted, 3);
}

#[tokio::test]
async fn test_stalled_unit_is_requeued_on_a_fresh_view() {
    let dir = tempfile::tempdir().unwrap();
    let portal = Portal::with(&[
        ("Roads", vec![Page::Hang, rows(&[("RD/001", "15-Jan-2026")])]),
        ("Bridges", vec![rows(&[("BR/007", "20-Jan-2026")])]),
    ]);
    let t = target(&["Roads", "Bridges"]);
    let renderer = FakeRenderer::default();
    let launcher = FakeLauncher::new(renderer);
    let cfg = HarvestConfig {
        interaction_timeout: Duration::from_millis(200),
        ..config(&dir)
    };
    let orch = orchestrator(cfg, launcher.clone(), &portal);

    let summary = orch.execute(&t, &t.units, 1).await.unwrap();
    assert_eq!(summary.status, RunStatus::Completed);
    assert_eq!(summary.extracted, 2);
    assert_eq!(summary.errors, 0);
    assert_eq!(portal.calls("Roads"), 2);
    // One initial view plus its replacement.
    assert_eq!(launcher.renderer.created.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_silent_worker_is_flagged_by_watchdog_and_requeued() {
    let dir = tempfile::tempdir().unwrap();
    let portal = Portal::with(&[
        ("Roads", vec![Page::Hang, rows(&[("RD/001", "15-Jan-2026")])]),
        ("Bridges", vec![rows(&[("BR/007", "20-Jan-2026")])]),
    ]);
    let t = target(&["Roads", "Bridges"]);
    let launcher = FakeLauncher::new(FakeRenderer::default());
    // Only the watchdog can end the hang in time.
    let cfg = HarvestConfig {
        interaction_timeout: Duration::from_secs(30),
        stall_timeout: Duration::from_millis(100),
        ..config(&dir)
    };
    let orch = orchestrator(cfg, launcher.clone(), &portal);

    let started = std::time::Instant::now();
    let summary = orch.execute(&t, &t.units, 1).await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(10));

    assert_eq!(summary.status, RunStatus::Completed);
    assert_eq!(summary.extracted, 2);
    assert_eq!(summary.errors, 0);
    assert_eq!(portal.calls("Roads"), 2);
    assert_eq!(launcher.renderer.created.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_session_lost_after_one_reacquisition_ends_in_error() {
    let dir = tempfile::tempdir().unwrap();
    let portal = Portal::with(&[
        ("Roads", vec![rows(&[("RD/001", "15-Jan-2026")])]),
        ("Bridges", vec![Page::Hang]),
    ]);
    let t = target(&["Roads", "Bridges"]);
    // The session hands out one view and refuses every later one, including
    // after it is re-launched.
    let launcher = FakeLauncher::new(FakeRenderer {
        max_contexts: Some(1),
        ..FakeRenderer::default()
    });
    let cfg = HarvestConfig {
        interaction_timeout: Duration::from_millis(200),
        max_session_reacquisitions: 1,
        ..config(&dir)
    };
    let orch = orchestrator(cfg, launcher.clone(), &portal);

    let summary = orch.execute(&t, &t.units, 1).await.unwrap();
    assert_eq!(summary.status, RunStatus::Error);
    assert!(summary.failure.is_some());
    assert_eq!(summary.extracted, 1);
    // Initial launch plus exactly one re-acquisition.
    assert_eq!(launcher.launches.load(Ordering::SeqCst), 2);

    let run = orch.store().get_run(summary.run_id).unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Error);
    let seed = orch.checkpoints().load(&t.name).expect("checkpoint kept");
    assert!(seed.processed_units.contains("Roads"));
    assert!(!seed.processed_units.contains("Bridges"));
}

#[tokio::test]
async fn test_unit_failures_only_count_errors() {
    let dir = tempfile::tempdir().unwrap();
    let portal = Portal::with(&[
        ("Roads", vec![Page::Broken]),
        ("Bridges", vec![rows(&[("BR/007", "20-Jan-2026"), ("nan", "20-Jan-2026")])]),
    ]);
    let t = target(&["Roads", "Bridges"]);
    let orch = orchestrator(config(&dir), FakeLauncher::new(FakeRenderer::default()), &portal);

    let summary = orch.execute(&t, &t.units, 2).await.unwrap();
    assert_eq!(summary.status, RunStatus::Completed);
    assert_eq!(summary.errors, 1);
    assert_eq!(summary.extracted, 1);
    assert_eq!(orch.store().count_records(&t.name).unwrap(), 1);
}

#[tokio::test]
async fn test_quick_and_full_verification_agree() {
    let script = || {
        vec![
            (
                "Roads",
                vec![
                    rows(&[("RD/001", "15-Jan-2026")]),
                    rows(&[("RD/001", "15-Jan-2026"), ("RD/002", "18-Jan-2026")]),
                ],
            ),
            (
                "Bridges",
                vec![rows(&[("BR/007", "20-Jan-2026")])],
            ),
            (
                "Ports",
                vec![rows(&[("PT/003", "21-Jan-2026")]), Page::Gone],
            ),
        ]
    };
    let t = target(&["Roads", "Bridges", "Ports"]);

    let mut outcomes = Vec::new();
    for mode in [VerifyMode::Quick, VerifyMode::Full] {
        let dir = tempfile::tempdir().unwrap();
        let portal = Portal::with(&script());
        let cfg = HarvestConfig {
            verify_mode: mode,
            ..config(&dir)
        };
        let orch = orchestrator(cfg, FakeLauncher::new(FakeRenderer::default()), &portal);
        let summary = orch.execute(&t, &t.units, 2).await.unwrap();

        assert_eq!(summary.status, RunStatus::Completed, "{mode:?}");
        assert_eq!(summary.missing_units, vec!["Ports".to_string()], "{mode:?}");
        assert!(summary.requeued_units.contains(&"Roads".to_string()), "{mode:?}");
        // Records of a delisted unit are kept.
        let known = orch.store().known_snapshot(&t.name).unwrap();
        assert!(known.get("pt-003").is_some());

        let mut ids: Vec<String> = orch
            .store()
            .records_for_run(&t.name, summary.run_id)
            .unwrap()
            .into_iter()
            .map(|r| r.canonical_id)
            .collect();
        ids.sort();
        outcomes.push((summary.extracted, ids));
    }

    assert_eq!(outcomes[0], outcomes[1]);
    assert_eq!(outcomes[0].0, 4);
}

#[tokio::test]
async fn test_session_launch_failure_ends_run_in_error() {
    let dir = tempfile::tempdir().unwrap();
    let portal = Portal::with(&[("Roads", vec![rows(&[("RD/001", "15-Jan-2026")])])]);
    let t = target(&["Roads"]);
    let launcher = Arc::new(FakeLauncher {
        renderer: Arc::new(FakeRenderer::default()),
        fail: true,
        launches: AtomicUsize::new(0),
    });
    let orch = orchestrator(config(&dir), launcher, &portal);

    let summary = orch.execute(&t, &t.units, 1).await.unwrap();
    assert_eq!(summary.status, RunStatus::Error);
    assert!(summary.failure.is_some());
    let run = orch.store().get_run(summary.run_id).unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Error);
    assert!(run.completed_at.is_some());
}

#[tokio::test]
async fn test_cancelled_run_keeps_checkpoint() {
    let dir = tempfile::tempdir().unwrap();
    let portal = Portal::with(&[
        ("Roads", vec![rows(&[("RD/001", "15-Jan-2026")])]),
        ("Bridges", vec![Page::Hang]),
    ]);
    let t = target(&["Roads", "Bridges"]);
    let (tx, mut done) = mpsc::unbounded_channel();
    // Cancellation waits for the in-flight interaction, so the hang has to
    // end on its own.
    let cfg = HarvestConfig {
        interaction_timeout: Duration::from_millis(300),
        ..config(&dir)
    };
    let orch = Arc::new(
        orchestrator(cfg, FakeLauncher::new(FakeRenderer::default()), &portal)
            .with_observer(Arc::new(DoneFeed(tx))),
    );

    let cancel = CancellationToken::new();
    let task = {
        let orch = orch.clone();
        let cancel = cancel.clone();
        let t = t.clone();
        tokio::spawn(async move { orch.execute_with_cancel(&t, &t.units, 1, cancel).await })
    };
    assert_eq!(done.recv().await.unwrap(), "Roads");
    cancel.cancel();
    let summary = task.await.unwrap().unwrap();

    assert_eq!(summary.status, RunStatus::Cancelled);
    assert_eq!(summary.extracted, 1);
    let seed = orch.checkpoints().load(&t.name).unwrap();
    assert!(seed.processed_units.contains("Roads"));
    assert!(!seed.processed_units.contains("Bridges"));
}

#[tokio::test]
async fn test_completed_run_sweeps_backups() {
    let dir = tempfile::tempdir().unwrap();
    let portal = Portal::with(&[("Roads", vec![rows(&[("RD/001", "15-Jan-2026")])])]);
    let t = target(&["Roads"]);
    let cfg = HarvestConfig {
        backups_enabled: true,
        ..config(&dir)
    };
    let backup_dir = cfg.backup_dir();
    let orch = orchestrator(cfg, FakeLauncher::new(FakeRenderer::default()), &portal);

    orch.execute(&t, &t.units, 1).await.unwrap();
    let artifacts = tender_harvest::backup::list_artifacts(&backup_dir).unwrap();
    assert_eq!(artifacts.len(), 4);
}
