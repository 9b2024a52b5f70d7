//! Rendering-session abstraction.
//!
//! A [`Renderer`] is the one shared session (a browser process); each
//! [`RenderContext`] is a view inside it (a tab). The session can service
//! only one interaction at a time, which the
//! [`SessionCoordinator`](crate::coordinator::SessionCoordinator) enforces.
//! A [`Launcher`] starts sessions, so a lost session can be re-acquired.

#[cfg(feature = "chromium")]
pub mod chromium;

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Result of navigating to a URL.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NavigationResult {
    /// The final URL after any redirects.
    pub final_url: String,
    /// Time taken to load the page in milliseconds.
    pub load_time_ms: u64,
}

/// A rendering session that can create view contexts.
#[async_trait]
pub trait Renderer: Send + Sync {
    /// Create a new view context.
    async fn new_context(&self) -> Result<Box<dyn RenderContext>>;
    /// Shut down the session.
    async fn shutdown(&self) -> Result<()>;
    /// Number of currently open contexts.
    fn active_contexts(&self) -> usize;
}

/// A single view within the session.
#[async_trait]
pub trait RenderContext: Send + Sync {
    /// Make this view the one the session is interacting with.
    async fn activate(&mut self) -> Result<()>;
    /// Navigate to a URL with a timeout.
    async fn navigate(&mut self, url: &str, timeout_ms: u64) -> Result<NavigationResult>;
    /// Execute JavaScript in the page and return the result.
    async fn execute_js(&self, script: &str) -> Result<serde_json::Value>;
    /// Close this view.
    async fn close(self: Box<Self>) -> Result<()>;
}

/// Starts rendering sessions.
#[async_trait]
pub trait Launcher: Send + Sync {
    async fn launch(&self) -> Result<Arc<dyn Renderer>>;
}

/// A renderer that cannot create contexts. Used when no browser is
/// available; any run against it fails at pool acquisition.
pub struct NoopRenderer;

#[async_trait]
impl Renderer for NoopRenderer {
    async fn new_context(&self) -> Result<Box<dyn RenderContext>> {
        Err(anyhow::anyhow!("no rendering session available"))
    }
    async fn shutdown(&self) -> Result<()> {
        Ok(())
    }
    fn active_contexts(&self) -> usize {
        0
    }
}

/// Launcher for [`NoopRenderer`].
pub struct NoopLauncher;

#[async_trait]
impl Launcher for NoopLauncher {
    async fn launch(&self) -> Result<Arc<dyn Renderer>> {
        Ok(Arc::new(NoopRenderer))
    }
}

/// Launcher used by the CLI: Chromium when compiled in, otherwise no-op.
pub fn default_launcher() -> Arc<dyn Launcher> {
    #[cfg(feature = "chromium")]
    {
        Arc::new(chromium::ChromiumLauncher::default())
    }
    #[cfg(not(feature = "chromium"))]
    {
        Arc::new(NoopLauncher)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_noop_renderer_refuses_contexts() {
        let renderer = NoopLauncher.launch().await.unwrap();
        assert!(renderer.new_context().await.is_err());
        assert_eq!(renderer.active_contexts(), 0);
        renderer.shutdown().await.unwrap();
    }
}
