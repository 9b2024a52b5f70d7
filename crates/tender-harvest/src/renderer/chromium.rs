//! Chromium-based rendering session using chromiumoxide.

use super::{Launcher, NavigationResult, RenderContext, Renderer};
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::page::Page;
use futures::StreamExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

/// Executables looked up on `PATH`, in order.
const PATH_NAMES: &[&str] = &["google-chrome", "chromium", "chromium-browser", "chrome"];

/// Locate a browser: `HARVEST_CHROMIUM_PATH`, then a bundled build under
/// `~/.tender-harvest/chromium`, then `PATH`.
pub fn find_chromium() -> Option<PathBuf> {
    if let Some(path) = std::env::var_os("HARVEST_CHROMIUM_PATH").map(PathBuf::from) {
        if path.exists() {
            return Some(path);
        }
        tracing::warn!(path = %path.display(), "HARVEST_CHROMIUM_PATH does not exist; searching");
    }

    dirs::home_dir()
        .map(|home| bundled_candidates(&home.join(".tender-harvest/chromium")))
        .unwrap_or_default()
        .into_iter()
        .find(|p| p.exists())
        .or_else(|| PATH_NAMES.iter().find_map(|name| which::which(name).ok()))
}

fn bundled_candidates(root: &Path) -> Vec<PathBuf> {
    let testing_app = "Google Chrome for Testing.app/Contents/MacOS/Google Chrome for Testing";
    if cfg!(target_os = "macos") {
        vec![
            root.join("chrome-mac-arm64").join(testing_app),
            root.join("chrome-mac-x64").join(testing_app),
            root.join("chrome"),
        ]
    } else if cfg!(target_os = "windows") {
        vec![root.join("chrome-win64/chrome.exe")]
    } else {
        vec![root.join("chrome-linux64/chrome"), root.join("chrome")]
    }
}

/// Launches headless (or headed) Chromium sessions.
#[derive(Debug, Clone)]
pub struct ChromiumLauncher {
    /// Explicit executable; falls back to [`find_chromium`].
    pub executable: Option<PathBuf>,
    pub headless: bool,
}

impl Default for ChromiumLauncher {
    fn default() -> Self {
        Self {
            executable: None,
            headless: true,
        }
    }
}

#[async_trait]
impl Launcher for ChromiumLauncher {
    async fn launch(&self) -> Result<Arc<dyn Renderer>> {
        let renderer = ChromiumRenderer::new(self).await?;
        Ok(Arc::new(renderer))
    }
}

/// One Chromium process shared by every worker.
pub struct ChromiumRenderer {
    browser: Mutex<Browser>,
    handler: JoinHandle<()>,
    active_count: Arc<AtomicUsize>,
}

impl ChromiumRenderer {
    /// Launch a Chromium instance.
    pub async fn new(opts: &ChromiumLauncher) -> Result<Self> {
        let chrome_path = match &opts.executable {
            Some(path) => path.clone(),
            None => find_chromium()
                .context("Chromium not found. Set HARVEST_CHROMIUM_PATH or install Chrome.")?,
        };

        let mut builder = BrowserConfig::builder()
            .chrome_executable(chrome_path)
            .arg("--disable-gpu")
            .arg("--no-sandbox")
            .arg("--disable-dev-shm-usage")
            .arg("--disable-extensions")
            .arg("--disable-background-networking");
        if opts.headless {
            builder = builder.arg("--headless=new");
        } else {
            builder = builder.with_head();
        }
        let config = builder
            .build()
            .map_err(|e| anyhow::anyhow!("failed to build browser config: {e}"))?;

        let (browser, mut handler) = Browser::launch(config)
            .await
            .context("failed to launch Chromium")?;

        let handler = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(e) = event {
                    tracing::debug!("chromium handler event error: {e}");
                }
            }
            tracing::debug!("chromium handler exited");
        });

        tracing::info!("chromium session launched");
        Ok(Self {
            browser: Mutex::new(browser),
            handler,
            active_count: Arc::new(AtomicUsize::new(0)),
        })
    }
}

#[async_trait]
impl Renderer for ChromiumRenderer {
    async fn new_context(&self) -> Result<Box<dyn RenderContext>> {
        if self.handler.is_finished() {
            bail!("chromium session is gone");
        }
        let page = self
            .browser
            .lock()
            .await
            .new_page("about:blank")
            .await
            .context("failed to create new page")?;

        self.active_count.fetch_add(1, Ordering::Relaxed);

        Ok(Box::new(ChromiumContext {
            page,
            active_count: Arc::clone(&self.active_count),
        }))
    }

    async fn shutdown(&self) -> Result<()> {
        let mut browser = self.browser.lock().await;
        if let Err(e) = browser.close().await {
            tracing::debug!("chromium close failed: {e}");
        }
        let _ = browser.wait().await;
        self.handler.abort();
        Ok(())
    }

    fn active_contexts(&self) -> usize {
        self.active_count.load(Ordering::Relaxed)
    }
}

/// A single Chromium tab.
pub struct ChromiumContext {
    page: Page,
    active_count: Arc<AtomicUsize>,
}

#[async_trait]
impl RenderContext for ChromiumContext {
    async fn activate(&mut self) -> Result<()> {
        self.page
            .bring_to_front()
            .await
            .context("failed to activate tab")?;
        Ok(())
    }

    async fn navigate(&mut self, url: &str, timeout_ms: u64) -> Result<NavigationResult> {
        let start = Instant::now();
        tokio::time::timeout(Duration::from_millis(timeout_ms), self.page.goto(url))
            .await
            .map_err(|_| anyhow::anyhow!("navigation to {url} timed out after {timeout_ms}ms"))?
            .with_context(|| format!("navigation to {url} failed"))?;

        // Listing portals often redirect through a session URL.
        let final_url = match self.page.url().await {
            Ok(Some(current)) => current,
            _ => url.to_string(),
        };
        Ok(NavigationResult {
            final_url,
            load_time_ms: start.elapsed().as_millis() as u64,
        })
    }

    async fn execute_js(&self, script: &str) -> Result<serde_json::Value> {
        let result = self
            .page
            .evaluate(script)
            .await
            .context("JS execution failed")?;

        result
            .into_value()
            .map_err(|e| anyhow::anyhow!("failed to convert JS result: {e:?}"))
    }

    async fn close(self: Box<Self>) -> Result<()> {
        self.active_count.fetch_sub(1, Ordering::Relaxed);
        let _ = self.page.close().await;
        Ok(())
    }
}
